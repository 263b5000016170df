//! One emulated Evologics modem per TCP connection.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use log::{debug, info, warn};
use seabridge_core::NodeAddr;
use seabridge_modem::framing::EvologicsCodec;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use crate::channel::AirFrame;
use crate::{ChannelEmulator, GatewayError};

const OUTBOX_CAPACITY: usize = 1000;

/// Highest source level the emulated modem accepts.
const MAX_POWER: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    SetAddress(NodeAddr),
    SetPower(u8),
    SetPromiscuous(bool),
    SendIm { dst: NodeAddr, ack: bool, payload: Bytes },
    DeliveryStatus,
    PropagationTime,
    Unknown(String),
}

fn numeric<T: std::str::FromStr>(text: &str, prefix: &str) -> Option<T> {
    text.strip_prefix(prefix)?.trim().parse().ok()
}

fn parse_sendim(frame: &Bytes) -> Option<AtCommand> {
    let mut offset = 0;
    let mut fields = Vec::with_capacity(4);
    for _ in 0..4 {
        let comma = frame[offset..].iter().position(|&b| b == b',')?;
        fields.push(std::str::from_utf8(&frame[offset..offset + comma]).ok()?.trim());
        offset += comma + 1;
    }
    let len: usize = fields[1].parse().ok()?;
    let dst: NodeAddr = fields[2].parse().ok()?;
    let ack = match fields[3] {
        "ack" => true,
        "noack" => false,
        _ => return None,
    };
    let payload = frame.slice(offset..);
    (payload.len() == len).then_some(AtCommand::SendIm { dst, ack, payload })
}

pub fn parse_command(frame: &Bytes) -> AtCommand {
    let unknown = || AtCommand::Unknown(String::from_utf8_lossy(frame).into_owned());
    if frame.starts_with(b"AT*SENDIM,") {
        return parse_sendim(frame).unwrap_or_else(unknown);
    }
    let Ok(text) = std::str::from_utf8(frame) else {
        return unknown();
    };
    let text = text.trim();
    let parsed = if text.starts_with("AT!AL") {
        numeric(text, "AT!AL").map(AtCommand::SetAddress)
    } else if text.starts_with("AT!L") {
        numeric(text, "AT!L").map(AtCommand::SetPower)
    } else if text.starts_with("AT@ZU") {
        match numeric::<u8>(text, "AT@ZU") {
            Some(0) => Some(AtCommand::SetPromiscuous(false)),
            Some(1) => Some(AtCommand::SetPromiscuous(true)),
            _ => None,
        }
    } else if text == "AT?DI" {
        Some(AtCommand::DeliveryStatus)
    } else if text == "AT?T" {
        Some(AtCommand::PropagationTime)
    } else {
        None
    };
    parsed.unwrap_or_else(unknown)
}

struct Session {
    emulator: Arc<ChannelEmulator>,
    outbox: mpsc::Sender<Bytes>,
    address: Option<NodeAddr>,
    promiscuous: bool,
    peer: String,
}

impl Session {
    async fn reply(&self, line: &str) {
        let mut bytes = line.as_bytes().to_vec();
        bytes.extend_from_slice(b"\r\n");
        if self.outbox.send(Bytes::from(bytes)).await.is_err() {
            debug!("{}: writer gone, reply dropped", self.peer);
        }
    }

    async fn handle(&mut self, command: AtCommand) {
        match command {
            AtCommand::SetAddress(addr) => {
                if self.address == Some(addr) {
                    return self.reply("OK").await;
                }
                if addr >= self.emulator.config().broadcast_address {
                    return self.reply("ERROR WRONG ADDRESS").await;
                }
                match self
                    .emulator
                    .register(addr, self.outbox.clone(), self.promiscuous, &self.peer)
                    .await
                {
                    Ok(()) => {
                        if let Some(old) = self.address.replace(addr) {
                            self.emulator.unregister(old).await;
                        }
                        self.reply("OK").await
                    }
                    Err(e) => {
                        warn!("{}: {}", self.peer, e);
                        self.reply("ERROR ADDRESS IN USE").await
                    }
                }
            }
            AtCommand::SetPower(level) if level <= MAX_POWER => self.reply("OK").await,
            AtCommand::SetPower(_) => self.reply("ERROR OUT OF RANGE").await,
            AtCommand::SetPromiscuous(on) => {
                self.promiscuous = on;
                if let Some(addr) = self.address {
                    self.emulator.update(addr, |node| node.promiscuous = on).await;
                }
                self.reply("OK").await
            }
            AtCommand::SendIm { dst, ack, payload } => self.send_im(dst, ack, payload).await,
            AtCommand::DeliveryStatus => {
                let delivering = match self.address {
                    Some(addr) => self.emulator.update(addr, |node| node.delivering).await,
                    None => None,
                };
                let status = if delivering == Some(true) { "DELIVERING" } else { "EMPTY" };
                self.reply(status).await
            }
            AtCommand::PropagationTime => {
                let last = match self.address {
                    Some(addr) => self.emulator.update(addr, |node| node.last_propagation).await.flatten(),
                    None => None,
                };
                match last {
                    Some(t) => self.reply(&t.as_micros().to_string()).await,
                    None => self.reply("ERROR NO DATA").await,
                }
            }
            AtCommand::Unknown(text) => {
                debug!("{}: unknown command `{}`", self.peer, text.trim());
                self.reply("ERROR WRONG FORMAT").await
            }
        }
    }

    async fn send_im(&mut self, dst: NodeAddr, ack: bool, payload: Bytes) {
        let Some(from) = self.address else {
            return self.reply("ERROR NOT CONFIGURED").await;
        };
        if payload.len() > self.emulator.config().mtu {
            return self.reply("ERROR BUFFER OVERFLOW").await;
        }
        let busy = self
            .emulator
            .update(from, |node| {
                let busy = node.delivering;
                if !busy {
                    node.delivering = ack;
                }
                busy
            })
            .await;
        if busy != Some(false) {
            return self.reply("BUSY DELIVERING").await;
        }
        let frame = AirFrame {
            from,
            to: dst,
            payload,
            ack,
        };
        match self.emulator.transmit(frame).await {
            Ok(()) => self.reply("OK").await,
            Err(e) => {
                warn!("{}: {}", self.peer, e);
                self.reply("ERROR INTERNAL").await
            }
        }
    }
}

/// Serves one modem connection until the peer hangs up.
pub async fn run_session<R, W>(emulator: Arc<ChannelEmulator>, reader: R, mut writer: W, peer: String)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox, mut rx) = mpsc::channel::<Bytes>(OUTBOX_CAPACITY);
    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    info!("modem session from {}", peer);
    let mut session = Session {
        emulator: emulator.clone(),
        outbox,
        address: None,
        promiscuous: false,
        peer,
    };
    let mut frames = FramedRead::new(reader, EvologicsCodec);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(frame) => session.handle(parse_command(&frame)).await,
            Err(e) => {
                warn!("{}: {}", session.peer, GatewayError::from(e));
                break;
            }
        }
    }

    if let Some(addr) = session.address {
        emulator.unregister(addr).await;
    }
    info!("modem session from {} closed", session.peer);
    drop(session);
    let _ = writer_task.await;
}
