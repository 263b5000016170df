//! Acoustic modem driver for SeaBridge.
//!
//! A [`ModemDriver`] turns simulator packets into vendor command frames and modem
//! replies back into packets. The driver itself is a synchronous state machine fed by
//! a [`runner`] task that owns the byte stream, the listener and the timer queue.

use std::time::Duration;

use seabridge_core::{CodecError, NodeAddr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod connection;
pub mod driver;
pub mod framing;
pub mod nmea;
pub mod protocol;
pub mod ranging;
pub mod runner;
pub mod scheduler;
pub mod timer;

pub use connection::{Connection, ConnectionError, Connector, OneShotConnector, RxChunk, TcpConnector};
pub use driver::{
    AbortReason, DriverOutput, DriverStats, ModemDriver, ModemState, PhyNotification, Scheduler, TimerKind,
};
pub use protocol::{evologics::Evologics, micromodem::MicroModem, Capabilities, Duplex, ModemProtocol};
pub use ranging::{RangeEstimate, RoundTripTable};
pub use runner::{ModemCommand, ModemHandle};
pub use scheduler::{ClockMode, RealTimeScheduler, TimerHandle};
pub use timer::Timer;

#[derive(Debug, Error)]
pub enum ModemError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("modem is {0:?}, request refused")]
    Busy(ModemState),

    #[error("{0} modems cannot do that")]
    Unsupported(&'static str),

    #[error("no delivered frame to {0} to take a range from")]
    NoRangeTo(NodeAddr),

    #[error("driver task is gone")]
    Stopped,
}

/// Problems found before the driver ever talks to a modem. All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no transmit power configured")]
    MissingTxPower,

    #[error("transmit power {power} outside 0..={max}")]
    TxPowerOutOfRange { power: u8, max: u8 },

    #[error("node address {address} does not fit the {bits}-bit address field")]
    AddressOutOfRange { address: u32, bits: u8 },

    #[error("acoustic bitrate must be positive")]
    ZeroBitrate,

    #[error("`{0}` must be at least 1")]
    ZeroLimit(&'static str),

    #[error("reconnect backoff starts at {initial:?} but is capped at {max:?}")]
    Backoff { initial: Duration, max: Duration },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    /// Acoustic address of this node.
    pub address: u32,
    pub promiscuous: bool,
    /// Vendor source level. Required.
    pub tx_power: Option<u8>,
    /// Acoustic bitrate, used to estimate air time.
    pub bitrate_bps: u32,
    /// Added to the air time before a transmission counts as finished.
    pub tx_guard: Duration,
    /// Extra attempts for a rejected or unanswered setting command.
    pub setting_retries: u32,
    pub setting_timeout: Duration,
    /// Total delivery attempts for a packet, counting the first one.
    pub max_delivery_retries: u32,
    pub delivery_timeout: Duration,
    /// Longest a reception may stay open before it is declared failed.
    pub rx_timeout: Duration,
    pub ranging_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    /// `None` keeps trying forever.
    pub max_reconnect_attempts: Option<u32>,
    pub tx_queue_limit: usize,
    /// Round-trip measurements older than this are ignored. `None` keeps them forever.
    pub range_max_age: Option<Duration>,
    pub rx_channel_capacity: usize,
    pub clock: ClockMode,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            address: 1,
            promiscuous: false,
            tx_power: None,
            bitrate_bps: 500,
            tx_guard: Duration::from_millis(200),
            setting_retries: 3,
            setting_timeout: Duration::from_secs(2),
            max_delivery_retries: 3,
            delivery_timeout: Duration::from_secs(5),
            rx_timeout: Duration::from_secs(10),
            ranging_timeout: Duration::from_secs(8),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            max_reconnect_attempts: None,
            tx_queue_limit: 16,
            range_max_age: Some(Duration::from_secs(300)),
            rx_channel_capacity: 64,
            clock: ClockMode::WallClock,
        }
    }
}

impl ModemConfig {
    pub fn validate(&self, address_bits: u8) -> Result<(), ConfigError> {
        if self.tx_power.is_none() {
            return Err(ConfigError::MissingTxPower);
        }
        if address_bits < 32 && u64::from(self.address) >= (1u64 << address_bits) - 1 {
            // all-ones is the broadcast address
            return Err(ConfigError::AddressOutOfRange {
                address: self.address,
                bits: address_bits,
            });
        }
        if self.bitrate_bps == 0 {
            return Err(ConfigError::ZeroBitrate);
        }
        if self.max_delivery_retries == 0 {
            return Err(ConfigError::ZeroLimit("max_delivery_retries"));
        }
        if self.tx_queue_limit == 0 {
            return Err(ConfigError::ZeroLimit("tx_queue_limit"));
        }
        if self.rx_channel_capacity == 0 {
            return Err(ConfigError::ZeroLimit("rx_channel_capacity"));
        }
        if self.reconnect_initial.is_zero() || self.reconnect_initial > self.reconnect_max {
            return Err(ConfigError::Backoff {
                initial: self.reconnect_initial,
                max: self.reconnect_max,
            });
        }
        Ok(())
    }

    /// Time the modem needs to put `bytes` on the water, guard included.
    pub fn air_time(&self, bytes: usize) -> Duration {
        let secs = (bytes * 8) as f64 / f64::from(self.bitrate_bps.max(1));
        Duration::from_secs_f64(secs) + self.tx_guard
    }
}
