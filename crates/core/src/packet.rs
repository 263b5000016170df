//! Layered packet record exchanged with the simulated protocol stack.
//!
//! Each layer owns an optional header; converters read and write exactly one of them.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub type NodeAddr = u32;

/// Simulator-side packet type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PacketType(pub u32);

impl PacketType {
    pub const UNSPECIFIED: PacketType = PacketType(0);
    pub const CBR: PacketType = PacketType(1);
    pub const MAC_CONTROL: PacketType = PacketType(2);
    pub const ROUTING: PacketType = PacketType(3);
    pub const MINI: PacketType = PacketType(4);
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pt{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommonHeader {
    pub ptype: PacketType,
    pub uid: u64,
    pub size: u32,
    pub timestamp: Duration,
    /// Set when a frame could not be fully decoded.
    pub error: bool,
}

/// Two-bit MAC frame kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MacFrameType {
    #[default]
    Data,
    Ack,
    Control,
    Mini,
}

impl MacFrameType {
    pub fn to_bits(self) -> u64 {
        match self {
            MacFrameType::Data => 0,
            MacFrameType::Ack => 1,
            MacFrameType::Control => 2,
            MacFrameType::Mini => 3,
        }
    }

    pub fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => MacFrameType::Data,
            1 => MacFrameType::Ack,
            2 => MacFrameType::Control,
            _ => MacFrameType::Mini,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacHeader {
    pub frame_type: MacFrameType,
    pub subtype: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
    pub packet_id: Option<u64>,
    pub tx_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoutingHeader {
    pub saddr: NodeAddr,
    pub daddr: NodeAddr,
    pub next_hop: Option<NodeAddr>,
    pub ttl: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentHeader {
    pub sport: u16,
    pub dport: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CbrHeader {
    pub seq: u64,
    /// Round-trip forward time measured by the sender.
    pub rftt: Option<Duration>,
    /// Application data. Cloning the packet shares this buffer.
    pub payload: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Packet {
    pub common: CommonHeader,
    pub mac: Option<MacHeader>,
    pub routing: Option<RoutingHeader>,
    pub agent: Option<AgentHeader>,
    pub cbr: Option<CbrHeader>,
}

impl Packet {
    pub fn new(ptype: PacketType) -> Self {
        Self {
            common: CommonHeader {
                ptype,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_mac(mut self, mac: MacHeader) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_routing(mut self, routing: RoutingHeader) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn with_agent(mut self, agent: AgentHeader) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_cbr(mut self, cbr: CbrHeader) -> Self {
        self.cbr = Some(cbr);
        self
    }

    pub fn is_erroneous(&self) -> bool {
        self.common.error
    }

    pub fn mark_erroneous(&mut self) {
        self.common.error = true;
    }

    /// MAC destination, if the packet carries a MAC header.
    pub fn mac_dst(&self) -> Option<NodeAddr> {
        self.mac.as_ref().map(|m| m.dst)
    }
}

/// Addressing fields readable without decoding a whole frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderSummary {
    pub frame_type: MacFrameType,
    pub subtype: u8,
    pub src: NodeAddr,
    pub dst: NodeAddr,
}
