//! Shared state handed to every converter: field widths and the wire-type registry.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};
use crate::packet::{NodeAddr, PacketType};

/// Bit widths shared by all converters, fixed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWidths {
    pub address_bits: u8,
    pub packet_id_bits: u8,
    /// Timestamps travel as milliseconds modulo `2^time_bits`.
    pub time_bits: u8,
    pub data_length_bits: u8,
    pub type_id_bits: u8,
    pub port_bits: u8,
    pub ttl_bits: u8,
    /// Upper bound on registered converters; sizes the level id field.
    pub max_converters: u8,
}

impl Default for FieldWidths {
    fn default() -> Self {
        Self {
            address_bits: 8,
            packet_id_bits: 16,
            time_bits: 24,
            data_length_bits: 10,
            type_id_bits: 4,
            port_bits: 4,
            ttl_bits: 4,
            max_converters: 7,
        }
    }
}

impl FieldWidths {
    /// `ceil(log2(max_converters + 1))`, i.e. the bit length of `max_converters`.
    pub fn level_id_bits(&self) -> usize {
        (u8::BITS - self.max_converters.leading_zeros()) as usize
    }

    /// All-ones address at the configured width.
    pub fn broadcast_address(&self) -> NodeAddr {
        crate::bitbuf::low_mask(self.address_bits as usize) as NodeAddr
    }

    pub fn validate(&self) -> Result<()> {
        let ranged = [
            ("address_bits", self.address_bits, 32),
            ("packet_id_bits", self.packet_id_bits, 64),
            ("time_bits", self.time_bits, 64),
            ("data_length_bits", self.data_length_bits, 32),
            ("type_id_bits", self.type_id_bits, 32),
            ("port_bits", self.port_bits, 16),
            ("ttl_bits", self.ttl_bits, 8),
        ];
        for (name, bits, max) in ranged {
            if bits == 0 || bits > max {
                return Err(CodecError::InvalidWidths(format!(
                    "{name} = {bits}, expected 1..={max}"
                )));
            }
        }
        if self.max_converters == 0 {
            return Err(CodecError::InvalidWidths(
                "max_converters must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Injective mapping between simulator packet types and compact wire ids.
///
/// Ids are handed out in first-use order, so both ends of a link must either
/// pre-register the same types or see them in the same order.
#[derive(Debug, Clone)]
pub struct WireTypeRegistry {
    bits: u8,
    to_wire: HashMap<PacketType, u32>,
    from_wire: Vec<PacketType>,
}

impl WireTypeRegistry {
    pub fn new(bits: u8) -> Self {
        Self {
            bits,
            to_wire: HashMap::new(),
            from_wire: Vec::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        1u64 << self.bits.min(63)
    }

    /// Returns the wire id for `ptype`, allocating one on first use.
    pub fn wire_type_id(&mut self, ptype: PacketType) -> Result<u32> {
        if let Some(&id) = self.to_wire.get(&ptype) {
            return Ok(id);
        }
        let next = self.from_wire.len() as u64;
        if next >= self.capacity() {
            return Err(CodecError::WireTypeSpaceExhausted { bits: self.bits });
        }
        let id = next as u32;
        self.to_wire.insert(ptype, id);
        self.from_wire.push(ptype);
        debug!("wire type {} assigned to {}", id, ptype);
        Ok(id)
    }

    pub fn lookup(&self, ptype: PacketType) -> Option<u32> {
        self.to_wire.get(&ptype).copied()
    }

    pub fn sim_type(&self, wire_id: u32) -> Option<PacketType> {
        self.from_wire.get(wire_id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.from_wire.len()
    }

    pub fn is_empty(&self) -> bool {
        self.from_wire.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CodecContext {
    pub widths: FieldWidths,
    pub types: WireTypeRegistry,
}

impl CodecContext {
    pub fn new(widths: FieldWidths) -> Result<Self> {
        widths.validate()?;
        Ok(Self {
            widths,
            types: WireTypeRegistry::new(widths.type_id_bits),
        })
    }

    pub fn level_id_bits(&self) -> usize {
        self.widths.level_id_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_id_bits_follow_converter_count() {
        let mut w = FieldWidths::default();
        for (max, bits) in [(1u8, 1usize), (2, 2), (3, 2), (4, 3), (7, 3), (8, 4), (15, 4)] {
            w.max_converters = max;
            assert_eq!(w.level_id_bits(), bits, "max_converters = {max}");
        }
    }

    #[test]
    fn registry_is_lazy_stable_and_capped() {
        let mut reg = WireTypeRegistry::new(1);
        assert_eq!(reg.lookup(PacketType::CBR), None);
        assert_eq!(reg.wire_type_id(PacketType::CBR).unwrap(), 0);
        assert_eq!(reg.wire_type_id(PacketType::ROUTING).unwrap(), 1);
        assert_eq!(reg.wire_type_id(PacketType::CBR).unwrap(), 0);
        assert_eq!(reg.sim_type(1), Some(PacketType::ROUTING));
        assert_eq!(
            reg.wire_type_id(PacketType::MINI),
            Err(CodecError::WireTypeSpaceExhausted { bits: 1 })
        );
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn zero_width_is_rejected() {
        let widths = FieldWidths {
            address_bits: 0,
            ..Default::default()
        };
        assert!(matches!(
            CodecContext::new(widths),
            Err(CodecError::InvalidWidths(_))
        ));
    }
}
