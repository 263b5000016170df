//! The shared acoustic medium: air time, propagation, jitter and loss.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use seabridge_core::NodeAddr;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{ChannelEmulator, GatewayError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest instant message the emulated modems accept.
    pub mtu: usize,
    pub bitrate_bps: u32,
    /// Base probability that a frame is lost.
    pub packet_loss: f32,
    /// One-way propagation delay between any two nodes.
    pub latency: Duration,
    /// Standard deviation of the propagation delay.
    pub latency_jitter: Duration,
    /// Loss comes in bursts instead of independently per frame.
    pub bursty_loss: bool,
    pub broadcast_address: NodeAddr,
    /// Announce receptions with `RECVSTART` and report lost frames with `RECVFAILED`.
    pub announce_reception: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mtu: 64,
            bitrate_bps: 500,
            packet_loss: 0.1,
            latency: Duration::from_millis(400),
            latency_jitter: Duration::from_millis(50),
            bursty_loss: true,
            broadcast_address: 255,
            announce_reception: true,
        }
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.bitrate_bps == 0 {
            return Err(GatewayError::Config("bitrate_bps must be positive".into()));
        }
        if self.mtu == 0 {
            return Err(GatewayError::Config("mtu must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.packet_loss) {
            return Err(GatewayError::Config(format!(
                "packet_loss {} outside 0..=1",
                self.packet_loss
            )));
        }
        Ok(())
    }

    pub fn air_time(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64((bytes * 8) as f64 / f64::from(self.bitrate_bps.max(1)))
    }

    /// Propagation delay of one frame, never below zero.
    pub fn propagation<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let sd = self.latency_jitter.as_secs_f64();
        let offset = match Normal::new(0.0, sd) {
            Ok(normal) if sd > 0.0 => normal.sample(rng),
            _ => 0.0,
        };
        Duration::from_secs_f64((self.latency.as_secs_f64() + offset).max(0.0))
    }

    /// Loss probability for one frame. Bursty channels are usually a little better than
    /// the base rate and now and then much worse.
    pub fn loss_probability<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let base = f64::from(self.packet_loss);
        if !self.bursty_loss {
            return base;
        }
        let r: f64 = rng.random();
        let factor = if r < 0.7 {
            0.8 + (r / 0.7) * 0.4
        } else if r < 0.95 {
            1.2 + ((r - 0.7) / 0.25) * 0.6
        } else {
            2.0 + ((r - 0.95) / 0.05) * 1.0
        };
        (base * factor).min(1.0)
    }
}

/// A frame on the water.
#[derive(Debug, Clone)]
pub struct AirFrame {
    pub from: NodeAddr,
    pub to: NodeAddr,
    pub payload: Bytes,
    pub ack: bool,
}

pub(crate) fn recvim(frame: &AirFrame, duration: Duration) -> Bytes {
    let flag = if frame.ack { "ack" } else { "noack" };
    let mut line = format!(
        "RECVIM,{},{},{},{},{},-52,190,0.00,",
        frame.payload.len(),
        frame.from,
        frame.to,
        flag,
        duration.as_micros()
    )
    .into_bytes();
    line.extend_from_slice(&frame.payload);
    line.extend_from_slice(b"\r\n");
    Bytes::from(line)
}

/// Hands `lines` to a session without waiting on it, stopping at the first that does not fit.
fn post(outbox: &mpsc::Sender<Bytes>, lines: impl IntoIterator<Item = Bytes>) -> Result<(), TrySendError<Bytes>> {
    lines.into_iter().try_for_each(|line| outbox.try_send(line))
}

type Gone = Vec<(NodeAddr, mpsc::Sender<Bytes>)>;

fn missed(emulator: &ChannelEmulator, addr: NodeAddr, outbox: &mpsc::Sender<Bytes>, err: TrySendError<Bytes>, gone: &mut Gone) {
    match err {
        TrySendError::Full(_) => {
            warn!("node {} is not keeping up, output lost", addr);
            emulator.counters.overflowed.fetch_add(1, Ordering::Relaxed);
        }
        TrySendError::Closed(_) => gone.push((addr, outbox.clone())),
    }
}

/// Carries frames over the medium one at a time, in the order they were sent.
pub(crate) async fn process_frames(mut frames: mpsc::Receiver<AirFrame>, emulator: Arc<ChannelEmulator>) {
    let config = emulator.config().clone();
    while let Some(frame) = frames.recv().await {
        emulator.queue_depth.fetch_sub(1, Ordering::Relaxed);
        let size = frame.payload.len();

        let air_time = config.air_time(size);
        let (propagation, loss_prob, roll) = {
            let mut rng = rand::rng();
            let propagation = config.propagation(&mut rng);
            let loss_prob = config.loss_probability(&mut rng);
            (propagation, loss_prob, rng.random::<f64>())
        };
        tokio::time::sleep(air_time + propagation).await;

        let lost = roll < loss_prob;
        let broadcast = frame.to == config.broadcast_address;
        emulator.counters.frames.fetch_add(1, Ordering::Relaxed);
        emulator.counters.bytes.fetch_add(size as u64, Ordering::Relaxed);

        if lost {
            info!("frame {} -> {} dropped with prob {:.3}", frame.from, frame.to, loss_prob);
            emulator.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }

        let hearers: Vec<(NodeAddr, mpsc::Sender<Bytes>)> = emulator
            .nodes
            .read()
            .await
            .iter()
            .filter(|&(&addr, node)| addr != frame.from && (broadcast || addr == frame.to || node.promiscuous))
            .map(|(&addr, node)| (addr, node.outbox.clone()))
            .collect();

        let mut reached = false;
        let mut gone = Gone::new();
        for (addr, outbox) in &hearers {
            let mut lines = Vec::with_capacity(2);
            if config.announce_reception {
                lines.push(Bytes::from_static(b"RECVSTART\r\n"));
            }
            if !lost {
                trace!("{} -> {}: {} bytes heard by {}", frame.from, frame.to, size, addr);
                lines.push(recvim(&frame, air_time));
            } else if config.announce_reception {
                lines.push(Bytes::from_static(b"RECVFAILED,0.00,-80,20\r\n"));
            }
            match post(outbox, lines) {
                Ok(()) => reached |= !lost && *addr == frame.to,
                Err(e) => missed(&emulator, *addr, outbox, e, &mut gone),
            }
        }
        if !lost && !broadcast && !reached {
            debug!("no node {} to hear frame from {}", frame.to, frame.from);
        }

        let sender = emulator
            .update(frame.from, |node| {
                node.delivering = false;
                if !broadcast && reached {
                    node.last_propagation = Some(propagation);
                }
                node.outbox.clone()
            })
            .await;
        if let Some(outbox) = sender.filter(|_| frame.ack && !broadcast) {
            let report = if reached {
                emulator.counters.delivered.fetch_add(1, Ordering::Relaxed);
                format!("DELIVEREDIM,{}\r\n", frame.to)
            } else {
                format!("FAILEDIM,{}\r\n", frame.to)
            };
            if let Err(e) = post(&outbox, [Bytes::from(report)]) {
                missed(&emulator, frame.from, &outbox, e, &mut gone);
            }
        }
        emulator.prune(gone).await;
    }
    debug!("channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn air_time_follows_bitrate() {
        let config = ChannelConfig {
            bitrate_bps: 400,
            ..Default::default()
        };
        assert_eq!(config.air_time(50), Duration::from_secs(1));
    }

    #[test]
    fn lossless_channel_never_drops() {
        let config = ChannelConfig {
            packet_loss: 0.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        assert!((0..1000).all(|_| config.loss_probability(&mut rng) == 0.0));
    }

    #[test]
    fn bursts_stay_within_bounds() {
        let config = ChannelConfig {
            packet_loss: 0.2,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(11);
        let samples: Vec<f64> = (0..2000).map(|_| config.loss_probability(&mut rng)).collect();
        assert!(samples.iter().all(|&p| (0.16..=0.6).contains(&p)));
        assert!(samples.iter().any(|&p| p > 0.24));

        let hopeless = ChannelConfig {
            packet_loss: 1.0,
            ..Default::default()
        };
        assert!((0..100).all(|_| hopeless.loss_probability(&mut rng) == 1.0));
    }

    #[test]
    fn propagation_is_never_negative() {
        let config = ChannelConfig {
            latency: Duration::from_millis(1),
            latency_jitter: Duration::from_millis(100),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let fixed = ChannelConfig {
            latency_jitter: Duration::ZERO,
            ..config.clone()
        };
        assert_eq!(fixed.propagation(&mut rng), Duration::from_millis(1));
        let spread: Vec<Duration> = (0..500).map(|_| config.propagation(&mut rng)).collect();
        assert!(spread.iter().any(|d| d.is_zero()));
        assert!(spread.iter().any(|d| *d > Duration::from_millis(50)));
    }

    #[test]
    fn recvim_round_trips_through_the_modem_parser() {
        use seabridge_modem::protocol::{ModemProtocol, ModemResponse};
        use seabridge_modem::{Evologics, ModemState};

        let frame = AirFrame {
            from: 3,
            to: 9,
            payload: Bytes::from_static(b"a,b\r\nc"),
            ack: true,
        };
        let mut line = recvim(&frame, Duration::from_millis(120)).to_vec();
        assert!(line.ends_with(b"\r\n"));
        line.truncate(line.len() - 2);
        assert_eq!(
            Evologics.parse(&line, ModemState::Idle),
            ModemResponse::Received {
                src: 3,
                dst: 9,
                payload: b"a,b\r\nc".to_vec()
            }
        );
    }

    #[test]
    fn invalid_configs() {
        assert!(ChannelConfig::default().validate().is_ok());
        let bad = ChannelConfig {
            packet_loss: 1.5,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn stalled_and_vanished_sessions_do_not_hold_up_the_channel() {
        let emulator = ChannelEmulator::start(ChannelConfig {
            bitrate_bps: 1_000_000,
            packet_loss: 0.0,
            latency: Duration::ZERO,
            latency_jitter: Duration::ZERO,
            bursty_loss: false,
            announce_reception: false,
            ..Default::default()
        })
        .unwrap();

        let (stalled, _stalled_rx) = mpsc::channel(1);
        stalled.try_send(Bytes::from_static(b"OK\r\n")).unwrap();
        emulator.register(1, stalled, false, "stalled").await.unwrap();
        let (vanished, vanished_rx) = mpsc::channel(4);
        drop(vanished_rx);
        emulator.register(2, vanished, false, "vanished").await.unwrap();
        let (sender, mut sender_rx) = mpsc::channel(4);
        emulator.register(3, sender, false, "sender").await.unwrap();

        let frame = |to, ack| AirFrame {
            from: 3,
            to,
            payload: Bytes::from_static(b"hi"),
            ack,
        };
        emulator.transmit(frame(255, false)).await.unwrap();
        emulator.transmit(frame(1, true)).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), sender_rx.recv()).await.unwrap();
        assert_eq!(report, Some(Bytes::from_static(b"FAILEDIM,1\r\n")));
        assert_eq!(emulator.nodes().await, vec![1, 3]);
        let stats = emulator.stats().await;
        assert_eq!(stats.frames_overflowed, 2);
        assert_eq!(stats.deliveries_confirmed, 0);
    }
}
