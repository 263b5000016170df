use std::time::Duration;

use log::debug;
use seabridge_core::NodeAddr;

use super::{checked_power, Capabilities, Duplex, ModemProtocol, ModemResponse};
use crate::driver::ModemState;
use crate::framing::EvologicsCodec;
use crate::{ConfigError, ModemConfig};

/// Instant messages are limited to 64 bytes.
pub const MAX_IM_PAYLOAD: usize = 64;

/// Line-oriented AT dialect with delivery reports and `AT?DI` polling.
#[derive(Debug, Clone, Copy, Default)]
pub struct Evologics;

fn line(cmd: String) -> Vec<u8> {
    let mut bytes = cmd.into_bytes();
    bytes.extend_from_slice(b"\r\n");
    bytes
}

fn addr(field: Option<&str>) -> Option<NodeAddr> {
    field?.trim().parse().ok()
}

/// Splits `RECVIM,<len>,<src>,<dst>,<flag>,<duration>,<rssi>,<integrity>,<velocity>,<data>`.
fn parse_recvim(frame: &[u8]) -> Result<(NodeAddr, NodeAddr, Vec<u8>), String> {
    let mut parts = frame.splitn(10, |&b| b == b',');
    let mut text = |what: &str| -> Result<String, String> {
        let raw = parts.next().ok_or_else(|| format!("RECVIM without {what}"))?;
        std::str::from_utf8(raw)
            .map(|s| s.trim().to_string())
            .map_err(|_| format!("RECVIM {what} not text"))
    };
    text("tag")?;
    let len: usize = text("length")?.parse().map_err(|_| "RECVIM bad length".to_string())?;
    let src: NodeAddr = text("source")?.parse().map_err(|_| "RECVIM bad source".to_string())?;
    let dst: NodeAddr = text("destination")?
        .parse()
        .map_err(|_| "RECVIM bad destination".to_string())?;
    for what in ["flag", "duration", "rssi", "integrity", "velocity"] {
        text(what)?;
    }
    let data = parts.next().ok_or("RECVIM without data")?;
    if data.len() != len {
        return Err(format!("RECVIM declares {len} bytes, carries {}", data.len()));
    }
    Ok((src, dst, data.to_vec()))
}

impl ModemProtocol for Evologics {
    type Codec = EvologicsCodec;

    fn name(&self) -> &'static str {
        "evologics"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            duplex: Duplex::Full,
            max_payload: MAX_IM_PAYLOAD,
            max_tx_power: 3,
            delivery_reports: true,
        }
    }

    fn setting_commands(&self, config: &ModemConfig) -> Result<Vec<Vec<u8>>, ConfigError> {
        let power = checked_power(config, &self.capabilities())?;
        Ok(vec![
            line(format!("AT!AL{}", config.address)),
            line(format!("AT!L{power}")),
            line(format!("AT@ZU{}", u8::from(config.promiscuous))),
        ])
    }

    fn data_command(&self, _src: NodeAddr, dst: NodeAddr, payload: &[u8], ack: bool) -> Vec<u8> {
        let flag = if ack { "ack" } else { "noack" };
        let mut cmd = format!("AT*SENDIM,{},{},{},", payload.len(), dst, flag).into_bytes();
        cmd.extend_from_slice(payload);
        cmd.extend_from_slice(b"\r\n");
        cmd
    }

    fn delivery_query(&self) -> Option<Vec<u8>> {
        Some(line("AT?DI".to_string()))
    }

    fn ranging_command(&self, _src: NodeAddr, _dst: NodeAddr) -> Option<Vec<u8>> {
        Some(line("AT?T".to_string()))
    }

    fn ranges_last_delivery(&self) -> bool {
        true
    }

    fn parse(&self, frame: &[u8], state: ModemState) -> ModemResponse {
        if frame.starts_with(b"RECVIM,") {
            return match parse_recvim(frame) {
                Ok((src, dst, payload)) => ModemResponse::Received { src, dst, payload },
                Err(e) => ModemResponse::Malformed(e),
            };
        }
        let Ok(text) = std::str::from_utf8(frame) else {
            return ModemResponse::Malformed("reply is not text".to_string());
        };
        let text = text.trim();
        let mut fields = text.split(',');
        let tag = fields.next().unwrap_or_default();
        match tag {
            "OK" => ModemResponse::Ok,
            "DELIVEREDIM" => ModemResponse::Delivered(addr(fields.next())),
            "FAILEDIM" | "CANCELEDIM" => ModemResponse::DeliveryFailed(addr(fields.next())),
            "DELIVERING" => ModemResponse::DeliveryPending,
            // nothing left in the transmit buffer
            "EMPTY" if state == ModemState::WaitAck => ModemResponse::Delivered(None),
            "RECVSTART" => ModemResponse::ReceptionStarted,
            "RECVFAILED" => ModemResponse::ReceptionFailed(text.to_string()),
            t if t.starts_with("ERROR") || t.starts_with("BUSY") => {
                ModemResponse::Rejected(text.to_string())
            }
            t if state == ModemState::Ranging && !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()) => {
                match t.parse::<u64>() {
                    Ok(us) => ModemResponse::Range {
                        peer: None,
                        propagation: Duration::from_micros(us),
                    },
                    Err(_) => ModemResponse::Malformed(text.to_string()),
                }
            }
            _ => {
                debug!("evologics: ignoring `{}`", text);
                ModemResponse::Ignored
            }
        }
    }
}
