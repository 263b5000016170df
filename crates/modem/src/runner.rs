//! Event loop around a [`ModemDriver`]: multiplexes link input, commands from the layer
//! above and the timer queue, and carries out what the driver asks for.

use std::future::pending;
use std::sync::Arc;

use log::{debug, info, warn};
use seabridge_core::{NodeAddr, Packet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::connection::{Connection, Connector, RxChunk};
use crate::driver::{DriverOutput, DriverStats, ModemDriver, PhyNotification, Scheduler};
use crate::protocol::ModemProtocol;
use crate::scheduler::ClockMode;
use crate::ModemError;

const COMMAND_CAPACITY: usize = 64;

#[derive(Debug)]
pub enum ModemCommand {
    Send(Packet),
    SendMini { dst: NodeAddr, subtype: u8 },
    Range(NodeAddr),
    Shutdown,
}

/// Owner's side of a running driver task.
pub struct ModemHandle {
    commands: mpsc::Sender<ModemCommand>,
    notifications: mpsc::UnboundedReceiver<PhyNotification>,
    task: JoinHandle<DriverStats>,
}

impl ModemHandle {
    pub fn spawn<P: ModemProtocol>(driver: ModemDriver<P>, connector: Arc<dyn Connector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(driver, connector, cmd_rx, note_tx));
        Self {
            commands: cmd_tx,
            notifications: note_rx,
            task,
        }
    }

    async fn command(&self, cmd: ModemCommand) -> Result<(), ModemError> {
        self.commands.send(cmd).await.map_err(|_| ModemError::Stopped)
    }

    pub async fn send(&self, packet: Packet) -> Result<(), ModemError> {
        self.command(ModemCommand::Send(packet)).await
    }

    pub async fn send_mini(&self, dst: NodeAddr, subtype: u8) -> Result<(), ModemError> {
        self.command(ModemCommand::SendMini { dst, subtype }).await
    }

    pub async fn request_range(&self, peer: NodeAddr) -> Result<(), ModemError> {
        self.command(ModemCommand::Range(peer)).await
    }

    pub async fn next_notification(&mut self) -> Option<PhyNotification> {
        self.notifications.recv().await
    }

    pub fn try_notification(&mut self) -> Option<PhyNotification> {
        self.notifications.try_recv().ok()
    }

    /// Stops the task and returns its final counters.
    pub async fn shutdown(self) -> Result<DriverStats, ModemError> {
        // the task may already be gone; its stats are still in the join handle
        if self.commands.send(ModemCommand::Shutdown).await.is_err() {
            debug!("driver task already stopped");
        }
        self.task.await.map_err(|_| ModemError::Stopped)
    }
}

async fn connect<P: ModemProtocol>(
    connector: &dyn Connector,
    driver: &mut ModemDriver<P>,
    sched: &mut Scheduler,
) -> Option<Connection> {
    match Connection::open(connector, driver.config().rx_channel_capacity).await {
        Ok(conn) => {
            driver.on_connected(sched);
            Some(conn)
        }
        Err(e) => {
            driver.on_connect_failed(&e.to_string(), sched);
            None
        }
    }
}

async fn next_chunk(link: &mut Option<Connection>) -> RxChunk {
    match link {
        Some(conn) => conn.recv().await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// Carries out queued driver outputs until the driver has nothing more to say.
async fn flush<P: ModemProtocol>(
    driver: &mut ModemDriver<P>,
    mut link: Option<Connection>,
    connector: &dyn Connector,
    sched: &mut Scheduler,
    notify: &mpsc::UnboundedSender<PhyNotification>,
) -> Option<Connection> {
    loop {
        let outputs = driver.drain_outputs();
        if outputs.is_empty() {
            return link;
        }
        for out in outputs {
            match out {
                DriverOutput::Write(bytes) => {
                    let Some(conn) = link.as_mut() else {
                        debug!("no link, dropping {} byte write", bytes.len());
                        continue;
                    };
                    if let Err(e) = conn.write(&bytes).await {
                        warn!("write failed: {}", e);
                        if let Some(conn) = link.take() {
                            conn.close().await;
                        }
                        driver.on_connection_lost(sched);
                    }
                }
                DriverOutput::Notify(note) => {
                    if notify.send(note).is_err() {
                        debug!("notification dropped, nobody listening");
                    }
                }
                DriverOutput::Reconnect => {
                    if let Some(conn) = link.take() {
                        conn.close().await;
                    }
                    link = connect(connector, driver, sched).await;
                }
            }
        }
    }
}

/// Virtual clocks advance one event per turn, after the link and the command queue have
/// been polled, which suits emulated links; real modems want [`ClockMode::WallClock`].
async fn run<P: ModemProtocol>(
    mut driver: ModemDriver<P>,
    connector: Arc<dyn Connector>,
    mut commands: mpsc::Receiver<ModemCommand>,
    notify: mpsc::UnboundedSender<PhyNotification>,
) -> DriverStats {
    let mut sched = Scheduler::new(driver.config().clock);
    let virtual_clock = sched.mode() == ClockMode::Virtual;
    info!("driver for node {} starting on {}", driver.config().address, connector.describe());
    let mut link = connect(connector.as_ref(), &mut driver, &mut sched).await;

    loop {
        link = flush(&mut driver, link, connector.as_ref(), &mut sched, &notify).await;
        let deadline = sched.next_deadline();
        let wake = deadline.map(|d| sched.instant_of(d));

        tokio::select! {
            biased;
            chunk = next_chunk(&mut link) => match chunk {
                RxChunk::Data(bytes) => driver.on_bytes(&bytes, &mut sched),
                other => {
                    if let RxChunk::Failed(e) = other {
                        warn!("link read failed: {}", e);
                    }
                    if let Some(conn) = link.take() {
                        conn.close().await;
                    }
                    driver.on_connection_lost(&mut sched);
                }
            },
            cmd = commands.recv() => match cmd {
                Some(ModemCommand::Send(packet)) => driver.send_packet(packet, &mut sched),
                Some(ModemCommand::SendMini { dst, subtype }) => {
                    if let Err(e) = driver.send_mini(dst, subtype, &mut sched) {
                        warn!("mini-packet to {} not sent: {}", dst, e);
                    }
                }
                Some(ModemCommand::Range(peer)) => {
                    if let Err(e) = driver.request_range(peer, &mut sched) {
                        debug!("range request to {} refused: {}", peer, e);
                        if notify.send(PhyNotification::RangingFailed { peer }).is_err() {
                            debug!("notification dropped, nobody listening");
                        }
                    }
                }
                Some(ModemCommand::Shutdown) | None => break,
            },
            _ = wait_until(wake), if !virtual_clock && wake.is_some() => {
                while let Some((handle, kind)) = sched.pop_due() {
                    driver.on_timer(handle, kind, &mut sched);
                }
            }
            _ = tokio::task::yield_now(), if virtual_clock && deadline.is_some() => {
                if let Some((handle, kind)) = sched.advance() {
                    driver.on_timer(handle, kind, &mut sched);
                }
            }
        }
    }

    let link = flush(&mut driver, link, connector.as_ref(), &mut sched, &notify).await;
    if let Some(conn) = link {
        conn.close().await;
    }
    let stats = driver.stats();
    info!("driver for node {} stopped: {:?}", driver.config().address, stats);
    stats
}
