use serde::{Deserialize, Serialize};

use crate::context::CodecContext;
use crate::converter::{decode_group, encode_group, DecodeOutcome, HeaderConverter};
use crate::error::Result;
use crate::packet::{NodeAddr, Packet, RoutingHeader};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFields {
    pub next_hop: bool,
    pub ttl: bool,
}

/// Network layer: `saddr daddr [next_hop] [ttl]`.
#[derive(Debug, Clone, Default)]
pub struct RoutingConverter {
    fields: RoutingFields,
}

impl RoutingConverter {
    pub fn new(fields: RoutingFields) -> Self {
        Self { fields }
    }
}

impl HeaderConverter for RoutingConverter {
    fn name(&self) -> &'static str {
        "routing"
    }

    fn applies(&self, packet: &Packet) -> bool {
        packet.routing.is_some()
    }

    fn wire_bit_length(&self, packet: &Packet, ctx: &CodecContext) -> usize {
        if packet.routing.is_none() {
            return 0;
        }
        let addr = ctx.widths.address_bits as usize;
        let mut bits = ctx.level_id_bits() + 2 * addr;
        if self.fields.next_hop {
            bits += addr;
        }
        if self.fields.ttl {
            bits += ctx.widths.ttl_bits as usize;
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
        let Some(rt) = packet.routing.as_ref() else {
            return Ok(0);
        };
        let addr = ctx.widths.address_bits as usize;
        let ttl_bits = ctx.widths.ttl_bits as usize;
        encode_group(level_id, buf, offset, ctx, |w| {
            w.write_exact("routing.saddr", u64::from(rt.saddr), addr)?;
            w.write_exact("routing.daddr", u64::from(rt.daddr), addr)?;
            if self.fields.next_hop {
                w.write_exact("routing.next_hop", u64::from(rt.next_hop.unwrap_or(0)), addr)?;
            }
            if self.fields.ttl {
                w.write_exact("routing.ttl", u64::from(rt.ttl.unwrap_or(0)), ttl_bits)?;
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
        let addr = ctx.widths.address_bits as usize;
        let ttl_bits = ctx.widths.ttl_bits as usize;
        decode_group(level_id, buf, offset, available_bits, ctx, |r| {
            let saddr = r.read(addr)? as NodeAddr;
            let daddr = r.read(addr)? as NodeAddr;
            let next_hop = if self.fields.next_hop {
                Some(r.read(addr)? as NodeAddr)
            } else {
                None
            };
            let ttl = if self.fields.ttl {
                Some(r.read(ttl_bits)? as u8)
            } else {
                None
            };
            packet.routing = Some(RoutingHeader {
                saddr,
                daddr,
                next_hop,
                ttl,
            });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitbuf::bytes_for_bits;
    use crate::context::FieldWidths;

    #[test]
    fn every_field_combination_round_trips() {
        for (next_hop, ttl) in [(false, false), (true, false), (false, true), (true, true)] {
            let conv = RoutingConverter::new(RoutingFields { next_hop, ttl });
            let mut ctx = CodecContext::new(FieldWidths::default()).unwrap();
            let header = RoutingHeader {
                saddr: 1,
                daddr: 9,
                next_hop: next_hop.then_some(4),
                ttl: ttl.then_some(12),
            };
            let packet = Packet::default().with_routing(header.clone());
            let bits = conv.wire_bit_length(&packet, &ctx);
            // offset the group to exercise unaligned writes
            let mut buf = vec![0u8; bytes_for_bits(bits + 5)];
            assert_eq!(conv.encode(3, &packet, &mut buf, 5, &mut ctx).unwrap(), bits);

            let mut out = Packet::default();
            assert_eq!(
                conv.decode(3, &mut out, &buf, 5, bits, &ctx).unwrap(),
                DecodeOutcome::Consumed(bits)
            );
            assert_eq!(out.routing, Some(header));
        }
    }

    #[test]
    fn absent_layer_contributes_nothing() {
        let conv = RoutingConverter::default();
        let ctx = CodecContext::new(FieldWidths::default()).unwrap();
        assert!(!conv.applies(&Packet::default()));
        assert_eq!(conv.wire_bit_length(&Packet::default(), &ctx), 0);
    }
}
