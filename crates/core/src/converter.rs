//! Per-layer converter plugin contract.

use crate::bitbuf::{BitReader, BitWriter};
use crate::context::CodecContext;
use crate::error::{CodecError, Result};
use crate::packet::{HeaderSummary, NodeAddr, Packet};

/// Result of offering a bit group to a converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The level id belongs to another converter.
    Mismatch,
    /// The level id matched but the frame ends before the group does.
    Truncated,
    /// Group decoded; number of bits consumed including the level id.
    Consumed(usize),
}

/// Bit-level codec for one protocol layer.
///
/// Every group starts with the level id followed by the converter's fields in a fixed
/// order. `wire_bit_length` must match exactly what `encode` writes.
pub trait HeaderConverter: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies(&self, packet: &Packet) -> bool;

    /// Bits contributed by this converter, level id included. Zero means no group.
    fn wire_bit_length(&self, packet: &Packet, ctx: &CodecContext) -> usize;

    fn encode(
        &self,
        level_id: u8,
        packet: &Packet,
        buf: &mut [u8],
        offset: usize,
        ctx: &mut CodecContext,
    ) -> Result<usize>;

    fn decode(
        &self,
        level_id: u8,
        packet: &mut Packet,
        buf: &[u8],
        offset: usize,
        available_bits: usize,
        ctx: &CodecContext,
    ) -> Result<DecodeOutcome>;

    fn create_mini_packet(&self, _src: NodeAddr, _dst: NodeAddr, _subtype: u8) -> Option<Packet> {
        None
    }

    /// Reads addressing fields of a group without touching a packet.
    fn extract_header(
        &self,
        _level_id: u8,
        _buf: &[u8],
        _offset: usize,
        _available_bits: usize,
        _ctx: &CodecContext,
    ) -> Option<HeaderSummary> {
        None
    }

    /// Replaces any shared payload in `to` with a private copy of the one in `from`.
    fn copy_payload(&self, _from: &Packet, _to: &mut Packet) {}

    /// Drops heap payload owned by this layer.
    fn erase_payload(&self, _packet: &mut Packet) {}
}

/// Writes the level id, then lets `fields` write the rest. Returns total bits written.
pub(crate) fn encode_group<F>(
    level_id: u8,
    buf: &mut [u8],
    offset: usize,
    ctx: &CodecContext,
    fields: F,
) -> Result<usize>
where
    F: FnOnce(&mut BitWriter<'_>) -> Result<()>,
{
    let mut writer = BitWriter::new(buf, offset);
    writer.write_exact("level_id", u64::from(level_id), ctx.level_id_bits())?;
    fields(&mut writer)?;
    Ok(writer.bits_written())
}

/// Checks the level id and runs `fields`. Running out of bits anywhere is a truncation.
pub(crate) fn decode_group<F>(
    level_id: u8,
    buf: &[u8],
    offset: usize,
    available_bits: usize,
    ctx: &CodecContext,
    fields: F,
) -> Result<DecodeOutcome>
where
    F: FnOnce(&mut BitReader<'_>) -> Result<()>,
{
    let mut reader = BitReader::new(buf, offset, available_bits);
    let found = match reader.read(ctx.level_id_bits()) {
        Ok(id) => id,
        Err(CodecError::InsufficientBits { .. }) => return Ok(DecodeOutcome::Truncated),
        Err(e) => return Err(e),
    };
    if found != u64::from(level_id) {
        return Ok(DecodeOutcome::Mismatch);
    }
    match fields(&mut reader) {
        Ok(()) => Ok(DecodeOutcome::Consumed(reader.bits_read())),
        Err(CodecError::InsufficientBits { .. }) => Ok(DecodeOutcome::Truncated),
        Err(e) => Err(e),
    }
}
