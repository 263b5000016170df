//! Simulation scenarios: a ring of drivers exchanging CBR traffic through the channel emulator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rand::Rng;
use seabridge_core::{CbrHeader, ConverterFields, FieldWidths, MacFrameType, MacHeader, NodeAddr, Packet, PacketCodec, PacketType};
use seabridge_gateway::{ChannelConfig, ChannelEmulator, ChannelStats};
use seabridge_modem::{AbortReason, DriverStats, Evologics, ModemDriver, ModemHandle, PhyNotification, TcpConnector};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout, timeout_at, Instant};

use crate::SimulationPresets;

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub nodes: u32,
    pub packets_per_node: u32,
    pub payload_bytes: usize,
    /// Pause between one packet's outcome and the next send.
    pub interval: Duration,
    /// Each node asks for the range to its peer once traffic is done.
    pub range_after: bool,
    pub progress: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            nodes: 4,
            packets_per_node: 5,
            payload_bytes: 16,
            interval: Duration::ZERO,
            range_after: true,
            progress: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeReport {
    pub address: NodeAddr,
    pub sent: u32,
    pub delivered: u32,
    pub aborted: u32,
    /// Delivery attempts over all packets, successful or not.
    pub attempts: u32,
    pub received: u32,
    pub rx_errors: u32,
    pub range_m: Option<f64>,
    pub driver: DriverStats,
}

impl NodeReport {
    fn observe(&mut self, note: PhyNotification) {
        match note {
            PhyNotification::PacketReceived(p) if p.is_erroneous() => self.rx_errors += 1,
            PhyNotification::PacketReceived(_) => self.received += 1,
            PhyNotification::RangeMeasured { propagation, .. } => {
                self.range_m = Some(propagation.as_secs_f64() * seabridge_modem::ranging::SOUND_SPEED)
            }
            other => debug!("node {}: {:?}", self.address, other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub nodes: Vec<NodeReport>,
    pub channel: ChannelStats,
    /// Until the last node had an outcome for its last packet.
    pub elapsed: Duration,
    pub payload_bytes: usize,
}

impl ScenarioReport {
    pub fn sent(&self) -> u32 {
        self.nodes.iter().map(|n| n.sent).sum()
    }

    pub fn delivered(&self) -> u32 {
        self.nodes.iter().map(|n| n.delivered).sum()
    }

    pub fn delivery_ratio(&self) -> f64 {
        match self.sent() {
            0 => 0.0,
            sent => f64::from(self.delivered()) / f64::from(sent),
        }
    }

    pub fn mean_attempts(&self) -> f64 {
        match self.sent() {
            0 => 0.0,
            sent => f64::from(self.nodes.iter().map(|n| n.attempts).sum::<u32>()) / f64::from(sent),
        }
    }

    /// Application bits delivered per second.
    pub fn goodput_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (f64::from(self.delivered()) * (self.payload_bytes * 8) as f64) / secs
    }
}

fn codec() -> Result<PacketCodec> {
    let mut codec = PacketCodec::standard(FieldWidths::default(), ConverterFields::default())?;
    // receivers must know the type before the first frame names it
    codec.wire_type_id(PacketType::CBR)?;
    Ok(codec)
}

fn cbr_packet(src: NodeAddr, dst: NodeAddr, seq: u64, payload_bytes: usize) -> Packet {
    let mut data = vec![0u8; payload_bytes];
    rand::rng().fill(&mut data[..]);
    Packet::new(PacketType::CBR)
        .with_mac(MacHeader {
            frame_type: MacFrameType::Data,
            subtype: 0,
            src,
            dst,
            packet_id: None,
            tx_time: None,
        })
        .with_cbr(CbrHeader {
            seq,
            rftt: None,
            payload: Some(Bytes::from(data)),
        })
}

async fn connect_node(channel: &ChannelConfig, address: NodeAddr, gateway: &str) -> Result<ModemHandle> {
    let config = SimulationPresets::modem_for(channel, address);
    let driver = ModemDriver::new(config, Evologics, codec()?)?;
    let mut handle = ModemHandle::spawn(driver, Arc::new(TcpConnector::new(gateway)));
    match timeout(READY_TIMEOUT, handle.next_notification()).await {
        Ok(Some(PhyNotification::Ready)) => Ok(handle),
        Ok(other) => bail!("node {address}: expected Ready, got {other:?}"),
        Err(_) => bail!("node {address}: modem not ready after {READY_TIMEOUT:?}"),
    }
}

struct NodeRun {
    handle: ModemHandle,
    report: NodeReport,
    peer: NodeAddr,
}

impl NodeRun {
    async fn next(&mut self) -> Result<PhyNotification> {
        self.handle
            .next_notification()
            .await
            .with_context(|| format!("node {}: driver stopped", self.report.address))
    }

    /// Sends one packet and waits for its outcome, noting everything else that arrives.
    async fn send_one(&mut self, seq: u64, payload_bytes: usize) -> Result<()> {
        let address = self.report.address;
        self.handle.send(cbr_packet(address, self.peer, seq, payload_bytes)).await?;
        self.report.sent += 1;
        loop {
            match self.next().await? {
                PhyNotification::TxCompleted { attempts, .. } => {
                    self.report.delivered += 1;
                    self.report.attempts += attempts;
                    return Ok(());
                }
                PhyNotification::TxAborted { reason, .. } => {
                    debug!("node {}: packet {} aborted: {:?}", address, seq, reason);
                    self.report.aborted += 1;
                    self.report.attempts += match reason {
                        AbortReason::DeliveryFailed { attempts } => attempts,
                        _ => 1,
                    };
                    return Ok(());
                }
                other => self.report.observe(other),
            }
        }
    }

    async fn range(&mut self) -> Result<()> {
        self.handle.request_range(self.peer).await?;
        loop {
            match self.next().await? {
                note @ PhyNotification::RangeMeasured { .. } => {
                    self.report.observe(note);
                    return Ok(());
                }
                PhyNotification::RangingFailed { peer } => {
                    debug!("node {}: no range to {}", self.report.address, peer);
                    return Ok(());
                }
                other => self.report.observe(other),
            }
        }
    }
}

async fn run_node(
    mut run: NodeRun,
    scenario: Scenario,
    barrier: Arc<Barrier>,
    progress: ProgressBar,
    settle: Duration,
) -> Result<(NodeReport, Duration)> {
    let started = Instant::now();
    for seq in 0..u64::from(scenario.packets_per_node) {
        run.send_one(seq, scenario.payload_bytes).await?;
        progress.inc(1);
        if !scenario.interval.is_zero() {
            sleep(scenario.interval).await;
        }
    }
    let sending = started.elapsed();

    // nothing is sent after this point, so the settle window catches every reception
    barrier.wait().await;
    if scenario.range_after {
        run.range().await?;
    }
    let deadline = Instant::now() + settle;
    while let Ok(Some(note)) = timeout_at(deadline, run.handle.next_notification()).await {
        run.report.observe(note);
    }

    let mut report = run.report;
    report.driver = run.handle.shutdown().await?;
    Ok((report, sending))
}

fn progress_bar(scenario: &Scenario) -> ProgressBar {
    if !scenario.progress {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(u64::from(scenario.nodes * scenario.packets_per_node));
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} packets") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

/// Starts an emulator with `channel`, connects `scenario.nodes` drivers to it and has
/// every node send to the next one in a ring.
pub async fn cbr_exchange(channel: ChannelConfig, scenario: &Scenario) -> Result<ScenarioReport> {
    if scenario.nodes < 2 {
        bail!("a scenario needs at least two nodes");
    }
    let settle = ((channel.air_time(channel.mtu) + channel.latency + channel.latency_jitter * 4) * 2)
        .max(MIN_SETTLE);
    let emulator = ChannelEmulator::start(channel.clone())?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let gateway = listener.local_addr()?.to_string();
    tokio::spawn(emulator.clone().serve_modems(listener));

    let barrier = Arc::new(Barrier::new(scenario.nodes as usize));
    let progress = progress_bar(scenario);
    let mut tasks = JoinSet::new();
    for address in 1..=scenario.nodes {
        let handle = connect_node(&channel, address, &gateway).await?;
        let run = NodeRun {
            handle,
            report: NodeReport {
                address,
                ..Default::default()
            },
            peer: address % scenario.nodes + 1,
        };
        info!("node {} up, sending to {}", address, run.peer);
        tasks.spawn(run_node(run, scenario.clone(), barrier.clone(), progress.clone(), settle));
    }

    let mut nodes = Vec::new();
    let mut elapsed = Duration::ZERO;
    while let Some(joined) = tasks.join_next().await {
        let (report, sending) = joined??;
        elapsed = elapsed.max(sending);
        nodes.push(report);
    }
    progress.finish_and_clear();
    nodes.sort_by_key(|n| n.address);

    Ok(ScenarioReport {
        nodes,
        channel: emulator.stats().await,
        elapsed,
        payload_bytes: scenario.payload_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(delivered: u32, aborted: u32, attempts: u32) -> ScenarioReport {
        ScenarioReport {
            nodes: vec![NodeReport {
                address: 1,
                sent: delivered + aborted,
                delivered,
                aborted,
                attempts,
                ..Default::default()
            }],
            channel: ChannelStats::default(),
            elapsed: Duration::from_secs(2),
            payload_bytes: 10,
        }
    }

    #[test]
    fn ratios() {
        let r = report(3, 1, 8);
        assert_eq!(r.delivery_ratio(), 0.75);
        assert_eq!(r.mean_attempts(), 2.0);
        assert_eq!(r.goodput_bps(), 120.0);

        let empty = report(0, 0, 0);
        assert_eq!(empty.delivery_ratio(), 0.0);
        assert_eq!(empty.mean_attempts(), 0.0);
    }

    #[tokio::test]
    async fn one_node_is_not_a_network() {
        let scenario = Scenario {
            nodes: 1,
            ..Default::default()
        };
        assert!(cbr_exchange(ChannelConfig::default(), &scenario).await.is_err());
    }
}
