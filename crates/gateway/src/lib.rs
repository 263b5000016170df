//! Acoustic channel emulator.
//!
//! Every TCP connection is served as an Evologics-style modem. Instant messages sent by one
//! node travel over a shared emulated medium and come out of the other nodes' modems after
//! air time and propagation delay, unless the loss model eats them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{info, warn};
use seabridge_core::NodeAddr;
use seabridge_modem::framing::FramingError;
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};

pub mod channel;
pub mod session;
pub mod status;

pub use channel::{AirFrame, ChannelConfig};
pub use session::{parse_command, run_session, AtCommand};

const FRAME_QUEUE: usize = 100_000;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("invalid channel config: {0}")]
    Config(String),

    #[error("address {0} already taken")]
    AddressInUse(NodeAddr),

    #[error("channel task stopped")]
    ChannelClosed,
}

#[derive(Debug)]
pub(crate) struct NodeEntry {
    pub(crate) outbox: mpsc::Sender<Bytes>,
    pub(crate) promiscuous: bool,
    /// An acknowledged message is still on its way.
    pub(crate) delivering: bool,
    pub(crate) last_propagation: Option<Duration>,
    pub(crate) peer: String,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) frames: AtomicU64,
    pub(crate) bytes: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) overflowed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub connected_nodes: usize,
    pub queued_frames: u64,
    pub frames_carried: u64,
    pub bytes_carried: u64,
    pub frames_dropped: u64,
    pub deliveries_confirmed: u64,
    /// Output a session could not take because it was not reading.
    pub frames_overflowed: u64,
}

pub struct ChannelEmulator {
    config: ChannelConfig,
    pub(crate) nodes: RwLock<HashMap<NodeAddr, NodeEntry>>,
    frames: mpsc::Sender<AirFrame>,
    pub(crate) queue_depth: AtomicU64,
    pub(crate) counters: Counters,
}

impl ChannelEmulator {
    /// Validates `config` and starts the channel task. Must be called inside a runtime.
    pub fn start(config: ChannelConfig) -> Result<Arc<Self>, GatewayError> {
        config.validate()?;
        let (frames, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let emulator = Arc::new(Self {
            config,
            nodes: RwLock::new(HashMap::new()),
            frames,
            queue_depth: AtomicU64::new(0),
            counters: Counters::default(),
        });
        tokio::spawn(channel::process_frames(frame_rx, emulator.clone()));
        Ok(emulator)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Addresses of the registered nodes, ascending.
    pub async fn nodes(&self) -> Vec<NodeAddr> {
        let mut addrs: Vec<NodeAddr> = self.nodes.read().await.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    pub async fn peers(&self) -> Vec<(NodeAddr, String)> {
        let mut peers: Vec<_> = self
            .nodes
            .read()
            .await
            .iter()
            .map(|(&addr, node)| (addr, node.peer.clone()))
            .collect();
        peers.sort_unstable();
        peers
    }

    pub async fn stats(&self) -> ChannelStats {
        ChannelStats {
            connected_nodes: self.nodes.read().await.len(),
            queued_frames: self.queue_depth.load(Ordering::Relaxed),
            frames_carried: self.counters.frames.load(Ordering::Relaxed),
            bytes_carried: self.counters.bytes.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            deliveries_confirmed: self.counters.delivered.load(Ordering::Relaxed),
            frames_overflowed: self.counters.overflowed.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn register(
        &self,
        addr: NodeAddr,
        outbox: mpsc::Sender<Bytes>,
        promiscuous: bool,
        peer: &str,
    ) -> Result<(), GatewayError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&addr) {
            return Err(GatewayError::AddressInUse(addr));
        }
        nodes.insert(
            addr,
            NodeEntry {
                outbox,
                promiscuous,
                delivering: false,
                last_propagation: None,
                peer: peer.to_string(),
            },
        );
        info!("node {} registered from {}", addr, peer);
        Ok(())
    }

    pub(crate) async fn unregister(&self, addr: NodeAddr) {
        if self.nodes.write().await.remove(&addr).is_some() {
            info!("node {} disconnected", addr);
        }
    }

    /// Forgets nodes whose session went away, unless their address has been taken again.
    pub(crate) async fn prune(&self, gone: Vec<(NodeAddr, mpsc::Sender<Bytes>)>) {
        if gone.is_empty() {
            return;
        }
        let mut nodes = self.nodes.write().await;
        for (addr, outbox) in gone {
            if nodes.get(&addr).is_some_and(|node| node.outbox.same_channel(&outbox)) {
                nodes.remove(&addr);
                info!("node {} dropped, its session is gone", addr);
            }
        }
    }

    /// Runs `f` on a registered node, `None` when there is no such node.
    pub(crate) async fn update<T>(&self, addr: NodeAddr, f: impl FnOnce(&mut NodeEntry) -> T) -> Option<T> {
        self.nodes.write().await.get_mut(&addr).map(f)
    }

    pub(crate) async fn transmit(&self, frame: AirFrame) -> Result<(), GatewayError> {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        if self.frames.send(frame).await.is_err() {
            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(GatewayError::ChannelClosed);
        }
        Ok(())
    }

    /// Accepts modem connections until the listener fails.
    pub async fn serve_modems(self: Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        info!("modem port listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return Err(e.into());
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: nodelay: {}", peer, e);
            }
            let (reader, writer) = stream.into_split();
            tokio::spawn(session::run_session(self.clone(), reader, writer, peer.to_string()));
        }
    }
}
