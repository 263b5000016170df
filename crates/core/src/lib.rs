//! Packet codec for SeaBridge.
//!
//! Turns layered simulator packets into the smallest bit stream the acoustic link can
//! carry and back. Each protocol layer is handled by a [`HeaderConverter`]; the
//! [`PacketCodec`] concatenates their groups behind a short level id.

pub mod bitbuf;
pub mod codec;
pub mod context;
pub mod converter;
pub mod converters;
pub mod error;
pub mod packet;

pub use codec::{ConverterFields, EncodedBuffer, PacketCodec};
pub use context::{CodecContext, FieldWidths, WireTypeRegistry};
pub use converter::{DecodeOutcome, HeaderConverter};
pub use error::CodecError;
pub use packet::{
    AgentHeader, CbrHeader, CommonHeader, HeaderSummary, MacFrameType, MacHeader, NodeAddr, Packet,
    PacketType, RoutingHeader,
};
