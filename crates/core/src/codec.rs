//! Root codec multiplexing converter groups into one frame.
//!
//! ```text
//! | level id | converter fields ... | level id | converter fields ... | pad |
//! ```
//!
//! Groups follow registration order and are byte aligned only at the end of the frame.
//! Level id 0 is reserved so the zero padding of the last byte ends decoding.

use log::{debug, trace, warn};

use crate::bitbuf::{bytes_for_bits, get_bits};
use crate::context::{CodecContext, FieldWidths};
use crate::converter::{DecodeOutcome, HeaderConverter};
use crate::converters::{
    AgentConverter, AgentFields, CbrConverter, CbrFields, CommonConverter, CommonFields,
    MacConverter, MacFields, RoutingConverter, RoutingFields,
};
use crate::error::{CodecError, Result};
use crate::packet::{HeaderSummary, NodeAddr, Packet, PacketType};

/// Bytes of an encoded frame plus the number of meaningful bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBuffer {
    pub bytes: Vec<u8>,
    pub bit_len: usize,
}

impl EncodedBuffer {
    /// Wraps bytes received from the wire; every bit is considered meaningful.
    pub fn from_wire(bytes: Vec<u8>) -> Self {
        let bit_len = bytes.len() * 8;
        Self { bytes, bit_len }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct Registration {
    level_id: u8,
    converter: Box<dyn HeaderConverter>,
}

/// Optional field switches for the standard converter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConverterFields {
    pub common: CommonFields,
    pub mac: MacFields,
    pub routing: RoutingFields,
    pub agent: AgentFields,
    pub cbr: CbrFields,
}

pub struct PacketCodec {
    ctx: CodecContext,
    converters: Vec<Registration>,
}

impl PacketCodec {
    pub fn new(widths: FieldWidths) -> Result<Self> {
        Ok(Self {
            ctx: CodecContext::new(widths)?,
            converters: Vec::new(),
        })
    }

    /// Codec with common, MAC, routing, agent and CBR converters at ids 1 to 5.
    pub fn standard(widths: FieldWidths, fields: ConverterFields) -> Result<Self> {
        let mut codec = Self::new(widths)?;
        codec.register(Box::new(CommonConverter::new(fields.common)))?;
        codec.register(Box::new(MacConverter::new(fields.mac)))?;
        codec.register(Box::new(RoutingConverter::new(fields.routing)))?;
        codec.register(Box::new(AgentConverter::new(fields.agent)))?;
        codec.register(Box::new(CbrConverter::new(fields.cbr)))?;
        Ok(codec)
    }

    /// Registers `converter` under the next free level id and returns it.
    pub fn register(&mut self, converter: Box<dyn HeaderConverter>) -> Result<u8> {
        let max = self.ctx.widths.max_converters;
        let next = (1..=max)
            .find(|id| self.position(*id).is_none())
            .ok_or(CodecError::RegistryFull { max })?;
        self.register_with_id(next, converter)?;
        Ok(next)
    }

    pub fn register_with_id(&mut self, level_id: u8, converter: Box<dyn HeaderConverter>) -> Result<()> {
        let max = self.ctx.widths.max_converters;
        if level_id == 0 || level_id > max {
            return Err(CodecError::LevelIdOutOfRange { id: level_id, max });
        }
        if self.position(level_id).is_some() {
            return Err(CodecError::DuplicateLevelId(level_id));
        }
        debug!("converter `{}` registered at level {}", converter.name(), level_id);
        self.converters.push(Registration {
            level_id,
            converter,
        });
        Ok(())
    }

    fn position(&self, level_id: u8) -> Option<usize> {
        self.converters.iter().position(|r| r.level_id == level_id)
    }

    pub fn level_id_of(&self, name: &str) -> Option<u8> {
        self.converters
            .iter()
            .find(|r| r.converter.name() == name)
            .map(|r| r.level_id)
    }

    pub fn context(&self) -> &CodecContext {
        &self.ctx
    }

    pub fn widths(&self) -> &FieldWidths {
        &self.ctx.widths
    }

    pub fn level_id_bits(&self) -> usize {
        self.ctx.level_id_bits()
    }

    pub fn wire_type_id(&mut self, ptype: PacketType) -> Result<u32> {
        self.ctx.types.wire_type_id(ptype)
    }

    pub fn sim_type(&self, wire_id: u32) -> Option<PacketType> {
        self.ctx.types.sim_type(wire_id)
    }

    /// Bits `encode` will produce for `packet`, before byte rounding.
    pub fn encoded_bit_length(&self, packet: &Packet) -> usize {
        self.converters
            .iter()
            .filter(|r| r.converter.applies(packet))
            .map(|r| r.converter.wire_bit_length(packet, &self.ctx))
            .sum()
    }

    pub fn encode(&mut self, packet: &Packet) -> Result<EncodedBuffer> {
        let groups: Vec<(usize, usize)> = self
            .converters
            .iter()
            .enumerate()
            .filter(|(_, r)| r.converter.applies(packet))
            .map(|(i, r)| (i, r.converter.wire_bit_length(packet, &self.ctx)))
            .filter(|&(_, bits)| bits > 0)
            .collect();
        let total: usize = groups.iter().map(|&(_, bits)| bits).sum();
        let mut bytes = vec![0u8; bytes_for_bits(total)];

        let mut offset = 0;
        for (index, expected) in groups {
            let reg = &self.converters[index];
            let written = reg
                .converter
                .encode(reg.level_id, packet, &mut bytes, offset, &mut self.ctx)?;
            if written != expected {
                warn!(
                    "converter `{}` length contract broken: {} != {}",
                    reg.converter.name(),
                    written,
                    expected
                );
                return Err(CodecError::LengthMismatch {
                    converter: reg.converter.name(),
                    expected,
                    written,
                });
            }
            offset += written;
        }
        trace!("encoded uid {} into {} bits", packet.common.uid, total);
        Ok(EncodedBuffer {
            bytes,
            bit_len: total,
        })
    }

    /// Decodes a frame. Damage never fails the call; the packet comes back erroneous.
    pub fn decode(&self, buf: &EncodedBuffer) -> Packet {
        let mut packet = Packet::default();
        let level_bits = self.level_id_bits();
        let limit = buf.bit_len.min(buf.bytes.len() * 8);
        let mut offset = 0;

        while offset < limit {
            let remaining = limit - offset;
            if remaining < level_bits {
                if remaining >= 8 {
                    packet.mark_erroneous();
                }
                break;
            }
            let level_id = match get_bits(&buf.bytes, level_bits, offset) {
                Ok(id) => id as u8,
                Err(_) => {
                    packet.mark_erroneous();
                    break;
                }
            };
            if level_id == 0 && remaining < 8 {
                break;
            }
            let Some(reg) = self.converters.iter().find(|r| r.level_id == level_id) else {
                warn!("unknown level id {} at bit {}", level_id, offset);
                packet.mark_erroneous();
                break;
            };
            match reg
                .converter
                .decode(level_id, &mut packet, &buf.bytes, offset, remaining, &self.ctx)
            {
                Ok(DecodeOutcome::Consumed(bits)) if bits > 0 => offset += bits,
                Ok(outcome) => {
                    warn!(
                        "converter `{}` could not decode at bit {}: {:?}",
                        reg.converter.name(),
                        offset,
                        outcome
                    );
                    packet.mark_erroneous();
                    break;
                }
                Err(e) => {
                    warn!("converter `{}` failed: {}", reg.converter.name(), e);
                    packet.mark_erroneous();
                    break;
                }
            }
        }
        packet
    }

    /// Asks each converter in turn for a compact frame carrying only addressing.
    pub fn create_mini_packet(&self, src: NodeAddr, dst: NodeAddr, subtype: u8) -> Option<Packet> {
        self.converters
            .iter()
            .find_map(|r| r.converter.create_mini_packet(src, dst, subtype))
    }

    /// Encodes a mini-packet holding only the group of the converter that built it.
    pub fn encode_mini(&mut self, src: NodeAddr, dst: NodeAddr, subtype: u8) -> Result<EncodedBuffer> {
        let (index, packet) = self
            .converters
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.converter.create_mini_packet(src, dst, subtype).map(|p| (i, p)))
            .ok_or(CodecError::NoMiniPacketConverter)?;
        let reg = &self.converters[index];
        let expected = reg.converter.wire_bit_length(&packet, &self.ctx);
        let mut bytes = vec![0u8; bytes_for_bits(expected)];
        let written = reg
            .converter
            .encode(reg.level_id, &packet, &mut bytes, 0, &mut self.ctx)?;
        if written != expected {
            return Err(CodecError::LengthMismatch {
                converter: reg.converter.name(),
                expected,
                written,
            });
        }
        Ok(EncodedBuffer {
            bytes,
            bit_len: written,
        })
    }

    /// Addressing of a frame, decoding only the groups in front of the first converter
    /// that can summarise itself.
    pub fn extract_header(&self, buf: &EncodedBuffer) -> Option<HeaderSummary> {
        let level_bits = self.level_id_bits();
        let limit = buf.bit_len.min(buf.bytes.len() * 8);
        let mut scratch = Packet::default();
        let mut offset = 0;
        while offset + level_bits <= limit {
            let level_id = get_bits(&buf.bytes, level_bits, offset).ok()? as u8;
            let reg = self.converters.iter().find(|r| r.level_id == level_id)?;
            let remaining = limit - offset;
            if let Some(summary) =
                reg.converter
                    .extract_header(level_id, &buf.bytes, offset, remaining, &self.ctx)
            {
                return Some(summary);
            }
            match reg
                .converter
                .decode(level_id, &mut scratch, &buf.bytes, offset, remaining, &self.ctx)
            {
                Ok(DecodeOutcome::Consumed(bits)) if bits > 0 => offset += bits,
                _ => return None,
            }
        }
        None
    }

    /// Clone whose heap payloads are private to the copy.
    pub fn clone_packet(&self, packet: &Packet) -> Packet {
        let mut copy = packet.clone();
        for reg in &self.converters {
            reg.converter.copy_payload(packet, &mut copy);
        }
        copy
    }

    pub fn erase_payload(&self, packet: &mut Packet) {
        for reg in &self.converters {
            reg.converter.erase_payload(packet);
        }
    }
}
