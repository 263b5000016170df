//! Simulation tools for SeaBridge: channel presets and multi-node scenarios run against
//! the in-process channel emulator.

pub mod scenarios;

use std::time::Duration;

use seabridge_gateway::ChannelConfig;
use seabridge_modem::{ClockMode, ModemConfig};

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn good_conditions() -> ChannelConfig {
        ChannelConfig {
            bitrate_bps: 2400,
            packet_loss: 0.02,
            latency: Duration::from_millis(200), // ~300 m
            latency_jitter: Duration::from_millis(5),
            ..Default::default()
        }
    }

    pub fn average_conditions() -> ChannelConfig {
        ChannelConfig {
            bitrate_bps: 1000,
            packet_loss: 0.10,
            latency: Duration::from_millis(670), // ~1 km
            latency_jitter: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn poor_conditions() -> ChannelConfig {
        ChannelConfig {
            bitrate_bps: 300,
            packet_loss: 0.25,
            latency: Duration::from_millis(1300), // ~2 km, multipath
            latency_jitter: Duration::from_millis(60),
            ..Default::default()
        }
    }

    /// Storm noise and a long shallow-water path.
    pub fn extreme_conditions() -> ChannelConfig {
        ChannelConfig {
            bitrate_bps: 80,
            packet_loss: 0.45,
            latency: Duration::from_millis(2000),
            latency_jitter: Duration::from_millis(150),
            ..Default::default()
        }
    }

    pub fn all() -> Vec<(&'static str, ChannelConfig)> {
        vec![
            ("Good Conditions", Self::good_conditions()),
            ("Average Conditions", Self::average_conditions()),
            ("Poor Conditions", Self::poor_conditions()),
            ("Extreme Conditions", Self::extreme_conditions()),
        ]
    }

    /// Driver settings that fit a channel: matching bitrate and timeouts long enough
    /// for a frame to cross it and be acknowledged.
    pub fn modem_for(channel: &ChannelConfig, address: u32) -> ModemConfig {
        let crossing = channel.air_time(channel.mtu) + channel.latency + channel.latency_jitter * 4;
        ModemConfig {
            address,
            tx_power: Some(1),
            bitrate_bps: channel.bitrate_bps,
            tx_guard: Duration::from_millis(50),
            delivery_timeout: crossing * 2 + Duration::from_secs(1),
            rx_timeout: crossing * 2 + Duration::from_secs(1),
            ranging_timeout: crossing * 2 + Duration::from_secs(1),
            clock: ClockMode::WallClock,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for (name, channel) in SimulationPresets::all() {
            assert!(channel.validate().is_ok(), "{name}");
            let modem = SimulationPresets::modem_for(&channel, 3);
            assert!(modem.validate(8).is_ok(), "{name}");
            assert!(modem.delivery_timeout > channel.latency * 2);
        }
    }

    #[test]
    fn presets_get_worse() {
        let all = SimulationPresets::all();
        for pair in all.windows(2) {
            let (better, worse) = (&pair[0].1, &pair[1].1);
            assert!(better.bitrate_bps > worse.bitrate_bps);
            assert!(better.packet_loss < worse.packet_loss);
            assert!(better.latency < worse.latency);
        }
    }
}
