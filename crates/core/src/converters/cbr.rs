use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{time_from_wire, time_to_wire};
use crate::context::CodecContext;
use crate::converter::{decode_group, encode_group, DecodeOutcome, HeaderConverter};
use crate::error::Result;
use crate::packet::{CbrHeader, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CbrFields {
    pub rftt: bool,
    pub payload: bool,
}

impl Default for CbrFields {
    fn default() -> Self {
        Self {
            rftt: false,
            payload: true,
        }
    }
}

/// Constant-bit-rate application header: `seq [rftt] [len payload]`.
///
/// `len` counts payload bytes in `data_length_bits`.
#[derive(Debug, Clone, Default)]
pub struct CbrConverter {
    fields: CbrFields,
}

impl CbrConverter {
    pub fn new(fields: CbrFields) -> Self {
        Self { fields }
    }
}

impl HeaderConverter for CbrConverter {
    fn name(&self) -> &'static str {
        "cbr"
    }

    fn applies(&self, packet: &Packet) -> bool {
        packet.cbr.is_some()
    }

    fn wire_bit_length(&self, packet: &Packet, ctx: &CodecContext) -> usize {
        let Some(cbr) = packet.cbr.as_ref() else {
            return 0;
        };
        let w = &ctx.widths;
        let mut bits = ctx.level_id_bits() + w.packet_id_bits as usize;
        if self.fields.rftt {
            bits += w.time_bits as usize;
        }
        if self.fields.payload {
            let len = cbr.payload.as_ref().map_or(0, |p| p.len());
            bits += w.data_length_bits as usize + 8 * len;
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
        let Some(cbr) = packet.cbr.as_ref() else {
            return Ok(0);
        };
        let w = ctx.widths;
        encode_group(level_id, buf, offset, ctx, |wr| {
            wr.write_wrapping(cbr.seq, w.packet_id_bits as usize)?;
            if self.fields.rftt {
                let t = cbr.rftt.map(time_to_wire).unwrap_or(0);
                wr.write_wrapping(t, w.time_bits as usize)?;
            }
            if self.fields.payload {
                let data: &[u8] = cbr.payload.as_deref().unwrap_or(&[]);
                wr.write_exact("cbr.len", data.len() as u64, w.data_length_bits as usize)?;
                wr.write_bytes(data)?;
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
            let seq = r.read(w.packet_id_bits as usize)?;
            let rftt = if self.fields.rftt {
                Some(time_from_wire(r.read(w.time_bits as usize)?))
            } else {
                None
            };
            let payload = if self.fields.payload {
                let len = r.read(w.data_length_bits as usize)? as usize;
                Some(Bytes::from(r.read_bytes(len)?))
            } else {
                None
            };
            packet.cbr = Some(CbrHeader { seq, rftt, payload });
            Ok(())
        })
    }

    fn copy_payload(&self, from: &Packet, to: &mut Packet) {
        let src = from.cbr.as_ref().and_then(|c| c.payload.as_ref());
        if let (Some(data), Some(cbr)) = (src, to.cbr.as_mut()) {
            cbr.payload = Some(Bytes::copy_from_slice(data));
        }
    }

    fn erase_payload(&self, packet: &mut Packet) {
        if let Some(cbr) = packet.cbr.as_mut() {
            cbr.payload = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitbuf::bytes_for_bits;
    use crate::context::FieldWidths;
    use std::time::Duration;

    fn header(fields: CbrFields) -> CbrHeader {
        CbrHeader {
            seq: 31,
            rftt: fields.rftt.then_some(Duration::from_millis(2_500)),
            payload: fields.payload.then(|| Bytes::from_static(b"hello, reef")),
        }
    }

    #[test]
    fn every_field_combination_round_trips() {
        for (rftt, payload) in [(false, false), (true, false), (false, true), (true, true)] {
            let fields = CbrFields { rftt, payload };
            let conv = CbrConverter::new(fields);
            let mut ctx = CodecContext::new(FieldWidths::default()).unwrap();
            let packet = Packet::default().with_cbr(header(fields));

            let bits = conv.wire_bit_length(&packet, &ctx);
            let mut buf = vec![0u8; bytes_for_bits(bits + 1)];
            assert_eq!(conv.encode(6, &packet, &mut buf, 1, &mut ctx).unwrap(), bits);

            let mut out = Packet::default();
            assert_eq!(
                conv.decode(6, &mut out, &buf, 1, bits, &ctx).unwrap(),
                DecodeOutcome::Consumed(bits)
            );
            assert_eq!(out.cbr, packet.cbr);
        }
    }

    #[test]
    fn short_payload_is_truncated() {
        let conv = CbrConverter::default();
        let mut ctx = CodecContext::new(FieldWidths::default()).unwrap();
        let packet = Packet::default().with_cbr(header(CbrFields::default()));
        let bits = conv.wire_bit_length(&packet, &ctx);
        let mut buf = vec![0u8; bytes_for_bits(bits)];
        conv.encode(6, &packet, &mut buf, 0, &mut ctx).unwrap();

        let mut out = Packet::default();
        assert_eq!(
            conv.decode(6, &mut out, &buf, 0, bits - 8, &ctx).unwrap(),
            DecodeOutcome::Truncated
        );
        assert!(out.cbr.is_none());
    }

    #[test]
    fn payload_copy_and_erase() {
        let conv = CbrConverter::default();
        let original = Packet::default().with_cbr(header(CbrFields::default()));
        let mut copy = original.clone();
        conv.copy_payload(&original, &mut copy);
        let a = original.cbr.as_ref().unwrap().payload.as_ref().unwrap();
        let b = copy.cbr.as_ref().unwrap().payload.as_ref().unwrap();
        assert_eq!(a, b);
        assert_ne!(a.as_ptr(), b.as_ptr());

        conv.erase_payload(&mut copy);
        assert!(copy.cbr.unwrap().payload.is_none());
        assert!(original.cbr.unwrap().payload.is_some());
    }
}
