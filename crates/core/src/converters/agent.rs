use serde::{Deserialize, Serialize};

use crate::context::CodecContext;
use crate::converter::{decode_group, encode_group, DecodeOutcome, HeaderConverter};
use crate::error::Result;
use crate::packet::{AgentHeader, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentFields {
    pub sport: bool,
}

impl Default for AgentFields {
    fn default() -> Self {
        Self { sport: true }
    }
}

/// Transport agent ports: `[sport] dport`.
#[derive(Debug, Clone, Default)]
pub struct AgentConverter {
    fields: AgentFields,
}

impl AgentConverter {
    pub fn new(fields: AgentFields) -> Self {
        Self { fields }
    }
}

impl HeaderConverter for AgentConverter {
    fn name(&self) -> &'static str {
        "agent"
    }

    fn applies(&self, packet: &Packet) -> bool {
        packet.agent.is_some()
    }

    fn wire_bit_length(&self, packet: &Packet, ctx: &CodecContext) -> usize {
        if packet.agent.is_none() {
            return 0;
        }
        let ports = if self.fields.sport { 2 } else { 1 };
        ctx.level_id_bits() + ports * ctx.widths.port_bits as usize
    }

    fn encode(
        &self,
        level_id: u8,
        packet: &Packet,
        buf: &mut [u8],
        offset: usize,
        ctx: &mut CodecContext,
    ) -> Result<usize> {
        let Some(agent) = packet.agent.as_ref() else {
            return Ok(0);
        };
        let port_bits = ctx.widths.port_bits as usize;
        encode_group(level_id, buf, offset, ctx, |w| {
            if self.fields.sport {
                w.write_exact("agent.sport", u64::from(agent.sport), port_bits)?;
            }
            w.write_exact("agent.dport", u64::from(agent.dport), port_bits)
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
        let port_bits = ctx.widths.port_bits as usize;
        decode_group(level_id, buf, offset, available_bits, ctx, |r| {
            let sport = if self.fields.sport {
                r.read(port_bits)? as u16
            } else {
                0
            };
            let dport = r.read(port_bits)? as u16;
            packet.agent = Some(AgentHeader { sport, dport });
            Ok(())
        })
    }
}
