use serde::{Deserialize, Serialize};

use super::{time_from_wire, time_to_wire};
use crate::bitbuf::BitReader;
use crate::context::CodecContext;
use crate::converter::{decode_group, encode_group, DecodeOutcome, HeaderConverter};
use crate::error::Result;
use crate::packet::{HeaderSummary, MacFrameType, MacHeader, NodeAddr, Packet, PacketType};

pub const MAC_TYPE_BITS: usize = 2;
pub const MAC_SUBTYPE_BITS: usize = 4;

/// Optional MAC fields. Mini frames never carry them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacFields {
    pub packet_id: bool,
    pub tx_time: bool,
}

/// MAC layer: `type(2) subtype(4) src dst [packet_id] [tx_time]`.
///
/// Absent optional values are sent as zero when their field is enabled.
#[derive(Debug, Clone, Default)]
pub struct MacConverter {
    fields: MacFields,
}

impl MacConverter {
    pub fn new(fields: MacFields) -> Self {
        Self { fields }
    }

    fn compact_bits(ctx: &CodecContext) -> usize {
        ctx.level_id_bits()
            + MAC_TYPE_BITS
            + MAC_SUBTYPE_BITS
            + 2 * ctx.widths.address_bits as usize
    }

    fn read_summary(reader: &mut BitReader<'_>, ctx: &CodecContext) -> Result<HeaderSummary> {
        let addr_bits = ctx.widths.address_bits as usize;
        Ok(HeaderSummary {
            frame_type: MacFrameType::from_bits(reader.read(MAC_TYPE_BITS)?),
            subtype: reader.read(MAC_SUBTYPE_BITS)? as u8,
            src: reader.read(addr_bits)? as NodeAddr,
            dst: reader.read(addr_bits)? as NodeAddr,
        })
    }
}

impl HeaderConverter for MacConverter {
    fn name(&self) -> &'static str {
        "mac"
    }

    fn applies(&self, packet: &Packet) -> bool {
        packet.mac.is_some()
    }

    fn wire_bit_length(&self, packet: &Packet, ctx: &CodecContext) -> usize {
        let Some(mac) = packet.mac.as_ref() else {
            return 0;
        };
        let mut bits = Self::compact_bits(ctx);
        if mac.frame_type != MacFrameType::Mini {
            if self.fields.packet_id {
                bits += ctx.widths.packet_id_bits as usize;
            }
            if self.fields.tx_time {
                bits += ctx.widths.time_bits as usize;
            }
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
        let Some(mac) = packet.mac.as_ref() else {
            return Ok(0);
        };
        let widths = ctx.widths;
        let addr_bits = widths.address_bits as usize;
        encode_group(level_id, buf, offset, ctx, |w| {
            w.write_wrapping(mac.frame_type.to_bits(), MAC_TYPE_BITS)?;
            w.write_exact("mac.subtype", u64::from(mac.subtype), MAC_SUBTYPE_BITS)?;
            w.write_exact("mac.src", u64::from(mac.src), addr_bits)?;
            w.write_exact("mac.dst", u64::from(mac.dst), addr_bits)?;
            if mac.frame_type == MacFrameType::Mini {
                return Ok(());
            }
            if self.fields.packet_id {
                w.write_wrapping(mac.packet_id.unwrap_or(0), widths.packet_id_bits as usize)?;
            }
            if self.fields.tx_time {
                let t = mac.tx_time.map(time_to_wire).unwrap_or(0);
                w.write_wrapping(t, widths.time_bits as usize)?;
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
        let widths = ctx.widths;
        decode_group(level_id, buf, offset, available_bits, ctx, |r| {
            let summary = Self::read_summary(r, ctx)?;
            let mut mac = MacHeader {
                frame_type: summary.frame_type,
                subtype: summary.subtype,
                src: summary.src,
                dst: summary.dst,
                packet_id: None,
                tx_time: None,
            };
            if summary.frame_type != MacFrameType::Mini {
                if self.fields.packet_id {
                    mac.packet_id = Some(r.read(widths.packet_id_bits as usize)?);
                }
                if self.fields.tx_time {
                    mac.tx_time = Some(time_from_wire(r.read(widths.time_bits as usize)?));
                }
            }
            packet.mac = Some(mac);
            Ok(())
        })
    }

    fn create_mini_packet(&self, src: NodeAddr, dst: NodeAddr, subtype: u8) -> Option<Packet> {
        Some(Packet::new(PacketType::MINI).with_mac(MacHeader {
            frame_type: MacFrameType::Mini,
            subtype,
            src,
            dst,
            packet_id: None,
            tx_time: None,
        }))
    }

    fn extract_header(
        &self,
        level_id: u8,
        buf: &[u8],
        offset: usize,
        available_bits: usize,
        ctx: &CodecContext,
    ) -> Option<HeaderSummary> {
        let mut reader = BitReader::new(buf, offset, available_bits);
        if reader.read(ctx.level_id_bits()).ok()? != u64::from(level_id) {
            return None;
        }
        Self::read_summary(&mut reader, ctx).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitbuf::bytes_for_bits;
    use crate::context::FieldWidths;
    use std::time::Duration;

    fn ctx() -> CodecContext {
        CodecContext::new(FieldWidths::default()).unwrap()
    }

    fn round_trip(conv: &MacConverter, packet: &Packet) -> Packet {
        let mut ctx = ctx();
        let bits = conv.wire_bit_length(packet, &ctx);
        let mut buf = vec![0u8; bytes_for_bits(bits)];
        let written = conv.encode(2, packet, &mut buf, 0, &mut ctx).unwrap();
        assert_eq!(written, bits);

        let mut out = Packet::default();
        assert_eq!(
            conv.decode(2, &mut out, &buf, 0, bits, &ctx).unwrap(),
            DecodeOutcome::Consumed(bits)
        );
        out
    }

    #[test]
    fn every_field_combination_round_trips() {
        for (packet_id, tx_time) in [(false, false), (true, false), (false, true), (true, true)] {
            let conv = MacConverter::new(MacFields { packet_id, tx_time });
            let mac = MacHeader {
                frame_type: MacFrameType::Data,
                subtype: 9,
                src: 3,
                dst: 200,
                packet_id: packet_id.then_some(4242),
                tx_time: tx_time.then_some(Duration::from_millis(123_456)),
            };
            let out = round_trip(&conv, &Packet::default().with_mac(mac.clone()));
            assert_eq!(out.mac, Some(mac));
        }
    }

    #[test]
    fn mini_frames_skip_optional_fields() {
        let conv = MacConverter::new(MacFields {
            packet_id: true,
            tx_time: true,
        });
        let mini = conv.create_mini_packet(1, 2, 5).unwrap();
        assert_eq!(conv.wire_bit_length(&mini, &ctx()), 3 + 2 + 4 + 8 + 8);
        assert_eq!(round_trip(&conv, &mini).mac, mini.mac);
    }

    #[test]
    fn wrong_level_id_is_a_mismatch() {
        let conv = MacConverter::default();
        let mut ctx = ctx();
        let packet = Packet::default().with_mac(MacHeader::default());
        let mut buf = [0u8; 4];
        conv.encode(1, &packet, &mut buf, 0, &mut ctx).unwrap();
        let mut out = Packet::default();
        assert_eq!(
            conv.decode(2, &mut out, &buf, 0, 32, &ctx).unwrap(),
            DecodeOutcome::Mismatch
        );
        assert_eq!(
            conv.decode(1, &mut out, &buf, 0, 10, &ctx).unwrap(),
            DecodeOutcome::Truncated
        );
        assert!(out.mac.is_none());
    }

    #[test]
    fn oversized_address_is_refused() {
        let conv = MacConverter::default();
        let mut ctx = ctx();
        let packet = Packet::default().with_mac(MacHeader {
            dst: 256,
            ..Default::default()
        });
        let mut buf = [0u8; 4];
        assert!(conv.encode(1, &packet, &mut buf, 0, &mut ctx).is_err());
    }

    #[test]
    fn header_extraction() {
        let conv = MacConverter::default();
        let mut ctx = ctx();
        let packet = conv.create_mini_packet(17, 42, 3).unwrap();
        let mut buf = [0u8; 4];
        conv.encode(4, &packet, &mut buf, 0, &mut ctx).unwrap();
        let summary = conv.extract_header(4, &buf, 0, 32, &ctx).unwrap();
        assert_eq!(
            summary,
            HeaderSummary {
                frame_type: MacFrameType::Mini,
                subtype: 3,
                src: 17,
                dst: 42
            }
        );
        assert!(conv.extract_header(5, &buf, 0, 32, &ctx).is_none());
    }
}
