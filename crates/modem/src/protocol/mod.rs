//! Vendor command dialects.
//!
//! A [`ModemProtocol`] knows how to spell commands for one family of modems and how to
//! classify what the modem sends back. It holds no state; the driver decides what a
//! reply means for the transmission in flight.

use std::time::Duration;

use bytes::Bytes;
use seabridge_core::NodeAddr;
use tokio_util::codec::Decoder;

use crate::driver::ModemState;
use crate::framing::FramingError;
use crate::{ConfigError, ModemConfig};

pub mod evologics;
pub mod micromodem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duplex {
    /// Cannot transmit while a reception is in progress.
    Half,
    /// Buffers outgoing frames while receiving.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub duplex: Duplex,
    /// Largest payload one data command can carry.
    pub max_payload: usize,
    /// Highest accepted transmit power setting.
    pub max_tx_power: u8,
    /// The modem reports whether the far end acknowledged a frame.
    pub delivery_reports: bool,
}

/// A modem reply, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemResponse {
    /// Command accepted.
    Ok,
    Rejected(String),
    /// The far end acknowledged. `None` when the modem does not say whom.
    Delivered(Option<NodeAddr>),
    /// Delivery not yet decided.
    DeliveryPending,
    DeliveryFailed(Option<NodeAddr>),
    ReceptionStarted,
    ReceptionFailed(String),
    Received {
        src: NodeAddr,
        dst: NodeAddr,
        payload: Vec<u8>,
    },
    /// A frame sent with the vendor's short-message command.
    MiniReceived {
        src: NodeAddr,
        dst: NodeAddr,
        payload: Vec<u8>,
    },
    Range {
        peer: Option<NodeAddr>,
        propagation: Duration,
    },
    /// Status chatter with no bearing on the driver.
    Ignored,
    Malformed(String),
}

pub trait ModemProtocol: Send + 'static {
    /// Frame splitter for this dialect's reply stream.
    type Codec: Decoder<Item = Bytes, Error = FramingError> + Default + Send;

    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Commands that bring a freshly connected modem to `config`, in order.
    fn setting_commands(&self, config: &ModemConfig) -> Result<Vec<Vec<u8>>, ConfigError>;

    fn data_command(&self, src: NodeAddr, dst: NodeAddr, payload: &[u8], ack: bool) -> Vec<u8>;

    /// Vendor short-message command, if the dialect has one.
    fn mini_command(&self, _src: NodeAddr, _dst: NodeAddr, _payload: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Asks the modem how the last delivery went. Without one, a failed delivery is
    /// retried by sending the frame again.
    fn delivery_query(&self) -> Option<Vec<u8>> {
        None
    }

    fn ranging_command(&self, src: NodeAddr, dst: NodeAddr) -> Option<Vec<u8>>;

    /// The range answer is the propagation time of the last delivered frame, whoever
    /// it went to, rather than a fresh measurement to `dst`.
    fn ranges_last_delivery(&self) -> bool {
        false
    }

    /// `state` lets a dialect read replies whose meaning depends on the pending request.
    fn parse(&self, frame: &[u8], state: ModemState) -> ModemResponse;
}

/// Rejects a configuration whose transmit power the modem cannot take.
pub(crate) fn checked_power(config: &ModemConfig, caps: &Capabilities) -> Result<u8, ConfigError> {
    let power = config.tx_power.ok_or(ConfigError::MissingTxPower)?;
    if power > caps.max_tx_power {
        return Err(ConfigError::TxPowerOutOfRange {
            power,
            max: caps.max_tx_power,
        });
    }
    Ok(power)
}
