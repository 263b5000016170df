use serde::{Deserialize, Serialize};

use super::{time_from_wire, time_to_wire};
use crate::context::CodecContext;
use crate::converter::{decode_group, encode_group, DecodeOutcome, HeaderConverter};
use crate::error::{CodecError, Result};
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonFields {
    pub uid: bool,
    pub size: bool,
    pub timestamp: bool,
}

impl Default for CommonFields {
    fn default() -> Self {
        Self {
            uid: true,
            size: false,
            timestamp: false,
        }
    }
}

/// Simulator common header: `ptype [uid] [size] [timestamp]`.
///
/// `ptype` travels as a wire type id allocated through the context registry.
#[derive(Debug, Clone, Default)]
pub struct CommonConverter {
    fields: CommonFields,
}

impl CommonConverter {
    pub fn new(fields: CommonFields) -> Self {
        Self { fields }
    }
}

impl HeaderConverter for CommonConverter {
    fn name(&self) -> &'static str {
        "common"
    }

    fn applies(&self, _packet: &Packet) -> bool {
        true
    }

    fn wire_bit_length(&self, _packet: &Packet, ctx: &CodecContext) -> usize {
        let w = &ctx.widths;
        let mut bits = ctx.level_id_bits() + w.type_id_bits as usize;
        if self.fields.uid {
            bits += w.packet_id_bits as usize;
        }
        if self.fields.size {
            bits += w.data_length_bits as usize;
        }
        if self.fields.timestamp {
            bits += w.time_bits as usize;
        }
        bits
    }

    fn encode(
        &self,
        level_id: u8,
        packet: &Packet,
        buf: &mut [u8],
        offset: usize,
        ctx: &mut CodecContext,
    ) -> Result<usize> {
        let wire_type = ctx.types.wire_type_id(packet.common.ptype)?;
        let w = ctx.widths;
        let common = &packet.common;
        encode_group(level_id, buf, offset, ctx, |wr| {
            wr.write_exact("common.ptype", u64::from(wire_type), w.type_id_bits as usize)?;
            if self.fields.uid {
                wr.write_wrapping(common.uid, w.packet_id_bits as usize)?;
            }
            if self.fields.size {
                wr.write_exact("common.size", u64::from(common.size), w.data_length_bits as usize)?;
            }
            if self.fields.timestamp {
                wr.write_wrapping(time_to_wire(common.timestamp), w.time_bits as usize)?;
            }
            Ok(())
        })
    }

    fn decode(
        &self,
        level_id: u8,
        packet: &mut Packet,
        buf: &[u8],
        offset: usize,
        available_bits: usize,
        ctx: &CodecContext,
    ) -> Result<DecodeOutcome> {
        let w = ctx.widths;
        decode_group(level_id, buf, offset, available_bits, ctx, |r| {
            let wire_type = r.read(w.type_id_bits as usize)? as u32;
            let ptype = ctx
                .types
                .sim_type(wire_type)
                .ok_or(CodecError::UnknownWireType(wire_type))?;
            let uid = if self.fields.uid {
                r.read(w.packet_id_bits as usize)?
            } else {
                0
            };
            let size = if self.fields.size {
                r.read(w.data_length_bits as usize)? as u32
            } else {
                0
            };
            let timestamp = if self.fields.timestamp {
                time_from_wire(r.read(w.time_bits as usize)?)
            } else {
                Default::default()
            };
            packet.common.ptype = ptype;
            packet.common.uid = uid;
            packet.common.size = size;
            packet.common.timestamp = timestamp;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitbuf::bytes_for_bits;
    use crate::context::FieldWidths;
    use crate::packet::PacketType;
    use std::time::Duration;

    #[test]
    fn every_field_combination_round_trips() {
        for mask in 0..8u8 {
            let fields = CommonFields {
                uid: mask & 1 != 0,
                size: mask & 2 != 0,
                timestamp: mask & 4 != 0,
            };
            let conv = CommonConverter::new(fields);
            let mut ctx = CodecContext::new(FieldWidths::default()).unwrap();

            let mut packet = Packet::new(PacketType::CBR);
            packet.common.uid = 777;
            packet.common.size = 125;
            packet.common.timestamp = Duration::from_millis(9_000);

            let bits = conv.wire_bit_length(&packet, &ctx);
            let mut buf = vec![0u8; bytes_for_bits(bits)];
            assert_eq!(conv.encode(1, &packet, &mut buf, 0, &mut ctx).unwrap(), bits);

            let mut out = Packet::default();
            assert_eq!(
                conv.decode(1, &mut out, &buf, 0, bits, &ctx).unwrap(),
                DecodeOutcome::Consumed(bits)
            );
            assert_eq!(out.common.ptype, PacketType::CBR);
            if fields.uid {
                assert_eq!(out.common.uid, 777);
            }
            if fields.size {
                assert_eq!(out.common.size, 125);
            }
            if fields.timestamp {
                assert_eq!(out.common.timestamp, Duration::from_millis(9_000));
            }
        }
    }

    #[test]
    fn uid_wraps_to_field_width() {
        let conv = CommonConverter::default();
        let mut ctx = CodecContext::new(FieldWidths::default()).unwrap();
        let mut packet = Packet::new(PacketType::CBR);
        packet.common.uid = 0x1_0005;
        let mut buf = [0u8; 4];
        conv.encode(1, &packet, &mut buf, 0, &mut ctx).unwrap();
        let mut out = Packet::default();
        conv.decode(1, &mut out, &buf, 0, 32, &ctx).unwrap();
        assert_eq!(out.common.uid, 5);
    }

    #[test]
    fn unregistered_wire_type_is_an_error() {
        let conv = CommonConverter::default();
        let mut sender = CodecContext::new(FieldWidths::default()).unwrap();
        sender.types.wire_type_id(PacketType::ROUTING).unwrap();
        let packet = Packet::new(PacketType::CBR);
        let mut buf = [0u8; 4];
        conv.encode(1, &packet, &mut buf, 0, &mut sender).unwrap();

        let receiver = CodecContext::new(FieldWidths::default()).unwrap();
        let mut out = Packet::default();
        assert_eq!(
            conv.decode(1, &mut out, &buf, 0, 32, &receiver),
            Err(CodecError::UnknownWireType(1))
        );
    }
}
