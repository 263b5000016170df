//! The modem state machine.
//!
//! The driver never touches I/O. Callers feed it received bytes, fired timers and
//! requests from the layer above; it answers by queueing [`DriverOutput`]s (bytes to
//! write, notifications, reconnect requests) that the caller drains.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, info, trace, warn};
use seabridge_core::{CodecError, EncodedBuffer, NodeAddr, Packet, PacketCodec};
use serde::Serialize;

use crate::framing::FrameAssembler;
use crate::protocol::{Capabilities, Duplex, ModemProtocol, ModemResponse};
use crate::ranging::{RangeEstimate, RoundTripTable};
use crate::scheduler::{RealTimeScheduler, TimerHandle};
use crate::timer::Timer;
use crate::{ModemConfig, ModemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModemState {
    Idle,
    /// Pushing configuration commands after a connect.
    Setting,
    TransmitData,
    /// Transmission done, waiting for the far end's acknowledgement.
    WaitAck,
    Receiving,
    Ranging,
    /// Link or configuration failure; a reconnect is pending.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Setting,
    TxDone,
    Delivery,
    RxWatchdog,
    Ranging,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    Encoding(CodecError),
    TooLarge { len: usize, max: usize },
    /// Half-duplex modem busy receiving.
    Collision,
    QueueFull,
    Rejected(String),
    DeliveryFailed { attempts: u32 },
    LinkLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhyNotification {
    /// Configuration finished; the modem takes traffic.
    Ready,
    TxCompleted { packet: Packet, attempts: u32 },
    TxAborted { packet: Packet, reason: AbortReason },
    /// Receive failures arrive here too, as packets marked erroneous.
    PacketReceived(Packet),
    RangeMeasured { peer: NodeAddr, propagation: Duration },
    RangingFailed { peer: NodeAddr },
    ConfigurationFailed(String),
    /// Reconnection gave up.
    LinkDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverOutput {
    Write(Vec<u8>),
    Notify(PhyNotification),
    /// Drop the current link, if any, and open a new one.
    Reconnect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub frames_sent: u64,
    pub tx_completed: u64,
    pub tx_aborted: u64,
    pub delivery_retries: u64,
    pub packets_received: u64,
    pub rx_errors: u64,
    pub rx_filtered: u64,
    /// Replies that failed checksum or parsing.
    pub frames_rejected: u64,
    pub setting_retries: u64,
    pub reconnects: u64,
}

#[derive(Debug)]
struct Outgoing {
    packet: Packet,
    /// Subtype of a mini-packet built by the codec.
    mini: Option<u8>,
}

#[derive(Debug)]
struct PendingTransmission {
    packet: Packet,
    dst: NodeAddr,
    command: Vec<u8>,
    ack: bool,
    /// Failed delivery attempts so far.
    failures: u32,
    air_time: Duration,
}

#[derive(Debug, Default)]
struct Timers {
    setting: Timer,
    tx: Timer,
    delivery: Timer,
    rx: Timer,
    ranging: Timer,
    reconnect: Timer,
}

impl Timers {
    fn get(&mut self, kind: TimerKind) -> &mut Timer {
        match kind {
            TimerKind::Setting => &mut self.setting,
            TimerKind::TxDone => &mut self.tx,
            TimerKind::Delivery => &mut self.delivery,
            TimerKind::RxWatchdog => &mut self.rx,
            TimerKind::Ranging => &mut self.ranging,
            TimerKind::Reconnect => &mut self.reconnect,
        }
    }

    fn cancel_all(&mut self, sched: &mut RealTimeScheduler<TimerKind>) {
        for t in [
            &mut self.setting,
            &mut self.tx,
            &mut self.delivery,
            &mut self.rx,
            &mut self.ranging,
            &mut self.reconnect,
        ] {
            t.cancel(sched);
        }
    }
}

pub type Scheduler = RealTimeScheduler<TimerKind>;

pub struct ModemDriver<P: ModemProtocol> {
    config: ModemConfig,
    protocol: P,
    caps: Capabilities,
    codec: PacketCodec,
    broadcast: NodeAddr,

    state: ModemState,
    /// A reception overlays `Idle` or `TransmitData`.
    receiving: bool,
    connected: bool,
    link_down: bool,

    assembler: FrameAssembler<P::Codec>,
    setting_script: Vec<Vec<u8>>,
    settings: VecDeque<Vec<u8>>,
    setting_failures: u32,

    pending: Option<PendingTransmission>,
    queue: VecDeque<Outgoing>,
    ranging_peer: Option<NodeAddr>,
    /// Destination of the last acknowledged frame since the modem was configured.
    last_delivered: Option<NodeAddr>,
    ranges: RoundTripTable,

    timers: Timers,
    reconnect_attempts: u32,
    outputs: Vec<DriverOutput>,
    stats: DriverStats,
}

impl<P: ModemProtocol> ModemDriver<P> {
    pub fn new(config: ModemConfig, protocol: P, codec: PacketCodec) -> Result<Self, ModemError> {
        config.validate(codec.widths().address_bits)?;
        let setting_script = protocol.setting_commands(&config)?;
        let caps = protocol.capabilities();
        info!(
            "{} driver for node {} ({:?} duplex, {} byte frames)",
            protocol.name(),
            config.address,
            caps.duplex,
            caps.max_payload
        );
        Ok(Self {
            broadcast: codec.widths().broadcast_address(),
            ranges: RoundTripTable::new(config.range_max_age),
            config,
            protocol,
            caps,
            codec,
            state: ModemState::Idle,
            receiving: false,
            connected: false,
            link_down: false,
            assembler: FrameAssembler::new(P::Codec::default()),
            setting_script,
            settings: VecDeque::new(),
            setting_failures: 0,
            pending: None,
            queue: VecDeque::new(),
            ranging_peer: None,
            last_delivered: None,
            timers: Timers::default(),
            reconnect_attempts: 0,
            outputs: Vec::new(),
            stats: DriverStats::default(),
        })
    }

    pub fn state(&self) -> ModemState {
        match self.state {
            ModemState::Idle | ModemState::TransmitData if self.receiving => ModemState::Receiving,
            s => s,
        }
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn range_to(&self, peer: NodeAddr, now: Duration) -> Option<RangeEstimate> {
        self.ranges.get(peer, now)
    }

    pub fn ranges_mut(&mut self) -> &mut RoundTripTable {
        &mut self.ranges
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    pub fn drain_outputs(&mut self) -> Vec<DriverOutput> {
        std::mem::take(&mut self.outputs)
    }

    fn write(&mut self, bytes: Vec<u8>) {
        trace!("-> {}", String::from_utf8_lossy(&bytes).trim_end());
        self.outputs.push(DriverOutput::Write(bytes));
    }

    fn notify(&mut self, notification: PhyNotification) {
        self.outputs.push(DriverOutput::Notify(notification));
    }

    // connection lifecycle

    pub fn on_connected(&mut self, sched: &mut Scheduler) {
        info!("node {}: link up, configuring modem", self.config.address);
        self.connected = true;
        self.link_down = false;
        self.receiving = false;
        self.assembler.clear();
        self.timers.reconnect.cancel(sched);
        self.settings = self.setting_script.iter().cloned().collect();
        self.setting_failures = 0;
        self.last_delivered = None;
        self.state = ModemState::Setting;
        self.send_setting(sched);
    }

    pub fn on_connect_failed(&mut self, reason: &str, sched: &mut Scheduler) {
        warn!("node {}: connect failed: {}", self.config.address, reason);
        self.connected = false;
        self.state = ModemState::Error;
        self.schedule_reconnect(sched);
    }

    pub fn on_connection_lost(&mut self, sched: &mut Scheduler) {
        if !self.connected {
            return;
        }
        warn!("node {}: link lost in {:?}", self.config.address, self.state());
        self.connected = false;
        self.receiving = false;
        self.timers.cancel_all(sched);
        self.abort_pending(AbortReason::LinkLost);
        if let Some(peer) = self.ranging_peer.take() {
            self.notify(PhyNotification::RangingFailed { peer });
        }
        self.state = ModemState::Error;
        self.schedule_reconnect(sched);
    }

    fn schedule_reconnect(&mut self, sched: &mut Scheduler) {
        if let Some(max) = self.config.max_reconnect_attempts {
            if self.reconnect_attempts >= max {
                warn!("node {}: giving up after {} reconnects", self.config.address, max);
                self.link_down = true;
                while let Some(out) = self.queue.pop_front() {
                    self.abort(out.packet, AbortReason::LinkLost);
                }
                self.notify(PhyNotification::LinkDown);
                return;
            }
        }
        let factor = 1u32 << self.reconnect_attempts.min(16);
        let delay = self
            .config
            .reconnect_initial
            .saturating_mul(factor)
            .min(self.config.reconnect_max);
        self.reconnect_attempts += 1;
        debug!("reconnect {} in {:?}", self.reconnect_attempts, delay);
        self.timers.reconnect.arm(sched, TimerKind::Reconnect, delay);
    }

    // configuration

    fn send_setting(&mut self, sched: &mut Scheduler) {
        match self.settings.front().cloned() {
            Some(cmd) => {
                self.write(cmd);
                self.timers
                    .setting
                    .arm(sched, TimerKind::Setting, self.config.setting_timeout);
            }
            None => {
                self.timers.setting.cancel(sched);
                self.state = ModemState::Idle;
                self.reconnect_attempts = 0;
                info!("node {}: modem ready", self.config.address);
                self.notify(PhyNotification::Ready);
                self.drain_queue(sched);
            }
        }
    }

    fn setting_failed(&mut self, why: &str, sched: &mut Scheduler) {
        self.setting_failures += 1;
        if self.setting_failures > self.config.setting_retries {
            warn!("node {}: configuration failed: {}", self.config.address, why);
            self.timers.setting.cancel(sched);
            self.state = ModemState::Error;
            self.notify(PhyNotification::ConfigurationFailed(why.to_string()));
            self.schedule_reconnect(sched);
            return;
        }
        self.stats.setting_retries += 1;
        debug!("setting command failed ({}), retry {}", why, self.setting_failures);
        self.send_setting(sched);
    }

    // transmission

    pub fn send_packet(&mut self, packet: Packet, sched: &mut Scheduler) {
        self.enqueue(Outgoing { packet, mini: None }, sched);
    }

    /// Sends a mini-packet built by the codec's mini-capable converter.
    pub fn send_mini(&mut self, dst: NodeAddr, subtype: u8, sched: &mut Scheduler) -> Result<(), ModemError> {
        let packet = self
            .codec
            .create_mini_packet(self.config.address, dst, subtype)
            .ok_or(CodecError::NoMiniPacketConverter)?;
        self.enqueue(
            Outgoing {
                packet,
                mini: Some(subtype),
            },
            sched,
        );
        Ok(())
    }

    fn enqueue(&mut self, out: Outgoing, sched: &mut Scheduler) {
        match self.state() {
            ModemState::Idle if self.connected && self.pending.is_none() => {
                self.start_transmission(out, sched);
                self.drain_queue(sched);
            }
            ModemState::Receiving if self.caps.duplex == Duplex::Half => {
                self.abort(out.packet, AbortReason::Collision);
            }
            _ if self.link_down => self.abort(out.packet, AbortReason::LinkLost),
            state => {
                if self.queue.len() >= self.config.tx_queue_limit {
                    self.abort(out.packet, AbortReason::QueueFull);
                } else {
                    trace!("queued while {:?}", state);
                    self.queue.push_back(out);
                }
            }
        }
    }

    fn drain_queue(&mut self, sched: &mut Scheduler) {
        while self.state() == ModemState::Idle && self.connected && self.pending.is_none() {
            let Some(out) = self.queue.pop_front() else {
                break;
            };
            self.start_transmission(out, sched);
        }
    }

    fn start_transmission(&mut self, out: Outgoing, sched: &mut Scheduler) {
        let src = self.config.address;
        let (dst, encoded) = match out.mini {
            Some(subtype) => {
                let dst = out.packet.mac_dst().unwrap_or(self.broadcast);
                (dst, self.codec.encode_mini(src, dst, subtype))
            }
            None => (
                out.packet.mac_dst().unwrap_or(self.broadcast),
                self.codec.encode(&out.packet),
            ),
        };
        let encoded = match encoded {
            Ok(e) => e,
            Err(e) => {
                self.abort(out.packet, AbortReason::Encoding(e));
                return;
            }
        };
        if encoded.len() > self.caps.max_payload {
            let reason = AbortReason::TooLarge {
                len: encoded.len(),
                max: self.caps.max_payload,
            };
            self.abort(out.packet, reason);
            return;
        }

        let vendor_mini = out
            .mini
            .and_then(|_| self.protocol.mini_command(src, dst, &encoded.bytes));
        let (command, ack) = match vendor_mini {
            Some(cmd) => (cmd, false),
            None => {
                let ack = self.caps.delivery_reports && dst != self.broadcast;
                (self.protocol.data_command(src, dst, &encoded.bytes, ack), ack)
            }
        };
        let air_time = self.config.air_time(encoded.len());
        debug!(
            "node {}: sending {} bytes to {} (ack {}, air {:?})",
            src,
            encoded.len(),
            dst,
            ack,
            air_time
        );
        self.write(command.clone());
        self.stats.frames_sent += 1;
        self.pending = Some(PendingTransmission {
            packet: out.packet,
            dst,
            command,
            ack,
            failures: 0,
            air_time,
        });
        self.state = ModemState::TransmitData;
        self.timers.tx.arm(sched, TimerKind::TxDone, air_time);
    }

    fn abort(&mut self, packet: Packet, reason: AbortReason) {
        debug!("node {}: transmission aborted: {:?}", self.config.address, reason);
        self.stats.tx_aborted += 1;
        self.notify(PhyNotification::TxAborted { packet, reason });
    }

    fn abort_pending(&mut self, reason: AbortReason) {
        if let Some(p) = self.pending.take() {
            self.abort(p.packet, reason);
        }
    }

    fn finish_transmission(&mut self, sched: &mut Scheduler) {
        self.timers.tx.cancel(sched);
        self.timers.delivery.cancel(sched);
        self.state = ModemState::Idle;
        self.drain_queue(sched);
    }

    fn complete(&mut self, sched: &mut Scheduler) {
        if let Some(p) = self.pending.take() {
            self.stats.tx_completed += 1;
            if p.ack && p.dst != self.broadcast {
                self.last_delivered = Some(p.dst);
            }
            self.notify(PhyNotification::TxCompleted {
                packet: p.packet,
                attempts: p.failures + 1,
            });
        }
        self.finish_transmission(sched);
    }

    fn await_delivery(&mut self, sched: &mut Scheduler) {
        self.state = ModemState::WaitAck;
        if let Some(query) = self.protocol.delivery_query() {
            self.write(query);
        }
        self.timers
            .delivery
            .arm(sched, TimerKind::Delivery, self.config.delivery_timeout);
    }

    /// Counts a failed attempt. `resend` repeats the data command rather than the query.
    fn delivery_failed(&mut self, resend: bool, sched: &mut Scheduler) {
        let max = self.config.max_delivery_retries;
        let Some(p) = self.pending.as_mut() else {
            return;
        };
        p.failures += 1;
        let failures = p.failures;
        if failures >= max {
            self.abort_pending(AbortReason::DeliveryFailed { attempts: failures });
            self.finish_transmission(sched);
            return;
        }
        self.stats.delivery_retries += 1;
        let resend = resend || self.protocol.delivery_query().is_none();
        if resend {
            let (command, air_time) = (p.command.clone(), p.air_time);
            debug!("delivery attempt {} failed, sending again", failures);
            self.timers.delivery.cancel(sched);
            self.write(command);
            self.stats.frames_sent += 1;
            self.state = ModemState::TransmitData;
            self.timers.tx.arm(sched, TimerKind::TxDone, air_time);
        } else {
            debug!("delivery attempt {} unanswered, asking again", failures);
            self.await_delivery(sched);
        }
    }

    // ranging

    pub fn request_range(&mut self, peer: NodeAddr, sched: &mut Scheduler) -> Result<(), ModemError> {
        let state = self.state();
        if state != ModemState::Idle || !self.connected || self.pending.is_some() {
            return Err(ModemError::Busy(state));
        }
        if self.protocol.ranges_last_delivery() && self.last_delivered != Some(peer) {
            return Err(ModemError::NoRangeTo(peer));
        }
        let cmd = self
            .protocol
            .ranging_command(self.config.address, peer)
            .ok_or(ModemError::Unsupported(self.protocol.name()))?;
        self.write(cmd);
        self.ranging_peer = Some(peer);
        self.state = ModemState::Ranging;
        self.timers
            .ranging
            .arm(sched, TimerKind::Ranging, self.config.ranging_timeout);
        Ok(())
    }

    fn end_ranging(&mut self, sched: &mut Scheduler) {
        self.ranging_peer = None;
        self.timers.ranging.cancel(sched);
        self.state = ModemState::Idle;
        self.drain_queue(sched);
    }

    // reception

    fn end_reception(&mut self, sched: &mut Scheduler) {
        self.receiving = false;
        self.timers.rx.cancel(sched);
    }

    fn accepts(&mut self, dst: NodeAddr) -> bool {
        if self.config.promiscuous || dst == self.config.address || dst == self.broadcast {
            return true;
        }
        trace!("dropping frame for {}", dst);
        self.stats.rx_filtered += 1;
        false
    }

    fn deliver_up(&mut self, packet: Packet) {
        if packet.is_erroneous() {
            self.stats.rx_errors += 1;
        } else {
            self.stats.packets_received += 1;
        }
        self.notify(PhyNotification::PacketReceived(packet));
    }

    fn reception_failed(&mut self, why: &str) {
        debug!("node {}: reception failed: {}", self.config.address, why);
        let mut lost = Packet::default();
        lost.mark_erroneous();
        self.deliver_up(lost);
    }

    fn decode_mini(&self, payload: Vec<u8>) -> Packet {
        let buf = EncodedBuffer::from_wire(payload);
        let rebuilt = self
            .codec
            .extract_header(&buf)
            .and_then(|h| self.codec.create_mini_packet(h.src, h.dst, h.subtype));
        rebuilt.unwrap_or_else(|| {
            let mut packet = self.codec.decode(&buf);
            packet.mark_erroneous();
            packet
        })
    }

    // input

    pub fn on_bytes(&mut self, chunk: &[u8], sched: &mut Scheduler) {
        for frame in self.assembler.push(chunk) {
            trace!("<- {}", String::from_utf8_lossy(&frame));
            let response = self.protocol.parse(&frame, self.state());
            self.handle_response(response, sched);
        }
    }

    fn handle_response(&mut self, response: ModemResponse, sched: &mut Scheduler) {
        match response {
            ModemResponse::Ok => {
                if self.state == ModemState::Setting {
                    self.settings.pop_front();
                    self.setting_failures = 0;
                    self.send_setting(sched);
                }
            }
            ModemResponse::Rejected(why) => match self.state {
                ModemState::Setting => self.setting_failed(&why, sched),
                ModemState::TransmitData => {
                    self.abort_pending(AbortReason::Rejected(why));
                    self.finish_transmission(sched);
                }
                ModemState::Ranging => {
                    if let Some(peer) = self.ranging_peer {
                        self.notify(PhyNotification::RangingFailed { peer });
                    }
                    self.end_ranging(sched);
                }
                state => warn!("modem rejected a command while {:?}: {}", state, why),
            },
            ModemResponse::Delivered(dst) => {
                let matches = self
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.ack && dst.map_or(true, |d| d == p.dst));
                let waiting = matches!(self.state, ModemState::TransmitData | ModemState::WaitAck);
                if matches && waiting {
                    self.complete(sched);
                }
            }
            ModemResponse::DeliveryPending => trace!("delivery still pending"),
            ModemResponse::DeliveryFailed(dst) => {
                let matches = self
                    .pending
                    .as_ref()
                    .is_some_and(|p| p.ack && dst.map_or(true, |d| d == p.dst));
                if matches && self.state == ModemState::WaitAck {
                    self.timers.delivery.cancel(sched);
                    self.delivery_failed(true, sched);
                } else if matches && self.state == ModemState::TransmitData {
                    self.timers.tx.cancel(sched);
                    self.delivery_failed(true, sched);
                }
            }
            ModemResponse::ReceptionStarted => {
                if matches!(self.state, ModemState::Idle | ModemState::TransmitData) {
                    self.receiving = true;
                    self.timers
                        .rx
                        .arm(sched, TimerKind::RxWatchdog, self.config.rx_timeout);
                }
            }
            ModemResponse::ReceptionFailed(why) => {
                self.end_reception(sched);
                self.reception_failed(&why);
                self.drain_queue(sched);
            }
            ModemResponse::Received { src, dst, payload } => {
                self.end_reception(sched);
                if self.accepts(dst) {
                    trace!("{} bytes from {}", payload.len(), src);
                    let packet = self.codec.decode(&EncodedBuffer::from_wire(payload));
                    self.deliver_up(packet);
                }
                self.drain_queue(sched);
            }
            ModemResponse::MiniReceived { src, dst, payload } => {
                self.end_reception(sched);
                if self.accepts(dst) {
                    trace!("mini-packet from {}", src);
                    let packet = self.decode_mini(payload);
                    self.deliver_up(packet);
                }
                self.drain_queue(sched);
            }
            ModemResponse::Range { peer, propagation } => {
                if self.state != ModemState::Ranging {
                    return;
                }
                if let Some(peer) = peer.or(self.ranging_peer) {
                    self.ranges.update(peer, propagation, sched.clock());
                    self.notify(PhyNotification::RangeMeasured { peer, propagation });
                }
                self.end_ranging(sched);
            }
            ModemResponse::Ignored => {}
            ModemResponse::Malformed(why) => {
                warn!("node {}: rejected frame: {}", self.config.address, why);
                self.stats.frames_rejected += 1;
            }
        }
    }

    pub fn on_timer(&mut self, handle: TimerHandle, kind: TimerKind, sched: &mut Scheduler) {
        if !self.timers.get(kind).fired(handle) {
            trace!("stale {:?} timer", kind);
            return;
        }
        match kind {
            TimerKind::Setting => self.setting_failed("no answer", sched),
            TimerKind::TxDone => match self.pending.as_ref().map(|p| p.ack) {
                Some(true) => self.await_delivery(sched),
                Some(false) => self.complete(sched),
                None => {}
            },
            TimerKind::Delivery => self.delivery_failed(false, sched),
            TimerKind::RxWatchdog => {
                self.receiving = false;
                self.reception_failed("reception never finished");
                self.drain_queue(sched);
            }
            TimerKind::Ranging => {
                if let Some(peer) = self.ranging_peer {
                    debug!("no range answer from {}", peer);
                    self.notify(PhyNotification::RangingFailed { peer });
                }
                self.end_ranging(sched);
            }
            TimerKind::Reconnect => {
                self.stats.reconnects += 1;
                self.outputs.push(DriverOutput::Reconnect);
            }
        }
    }
}
