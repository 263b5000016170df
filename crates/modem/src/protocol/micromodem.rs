use std::time::Duration;

use log::debug;
use seabridge_core::NodeAddr;

use super::{checked_power, Capabilities, Duplex, ModemProtocol, ModemResponse};
use crate::driver::ModemState;
use crate::framing::NmeaCodec;
use crate::nmea::{from_hex, to_hex, Sentence};
use crate::{ConfigError, ModemConfig};

/// FSK frames carry at most 32 bytes.
pub const MAX_FRAME_PAYLOAD: usize = 32;

/// NMEA dialect of the WHOI-style modems. Half duplex, no delivery polling.
#[derive(Debug, Clone, Copy, Default)]
pub struct MicroModem;

fn cmd(kind: &str, fields: Vec<String>) -> Vec<u8> {
    Sentence::new("CC", kind, fields).to_wire()
}

impl MicroModem {
    fn addressed_hex(s: &Sentence, hex_field: usize) -> Result<(NodeAddr, NodeAddr, Vec<u8>), String> {
        let src = s.field_as(0).ok_or_else(|| format!("{s}: bad source"))?;
        let dst = s.field_as(1).ok_or_else(|| format!("{s}: bad destination"))?;
        let data = s
            .field(hex_field)
            .and_then(from_hex)
            .ok_or_else(|| format!("{s}: bad hex data"))?;
        Ok((src, dst, data))
    }
}

impl ModemProtocol for MicroModem {
    type Codec = NmeaCodec;

    fn name(&self) -> &'static str {
        "micromodem"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            duplex: Duplex::Half,
            max_payload: MAX_FRAME_PAYLOAD,
            max_tx_power: 4,
            delivery_reports: true,
        }
    }

    fn setting_commands(&self, config: &ModemConfig) -> Result<Vec<Vec<u8>>, ConfigError> {
        let power = checked_power(config, &self.capabilities())?;
        Ok(vec![
            cmd("CFG", vec!["SRC".into(), config.address.to_string()]),
            cmd("CFG", vec!["TXP".into(), power.to_string()]),
            cmd("CFG", vec!["REV".into(), u8::from(config.promiscuous).to_string()]),
        ])
    }

    fn data_command(&self, src: NodeAddr, dst: NodeAddr, payload: &[u8], ack: bool) -> Vec<u8> {
        cmd(
            "TXD",
            vec![src.to_string(), dst.to_string(), u8::from(ack).to_string(), to_hex(payload)],
        )
    }

    fn mini_command(&self, src: NodeAddr, dst: NodeAddr, payload: &[u8]) -> Option<Vec<u8>> {
        Some(cmd("MUC", vec![src.to_string(), dst.to_string(), to_hex(payload)]))
    }

    fn ranging_command(&self, src: NodeAddr, dst: NodeAddr) -> Option<Vec<u8>> {
        Some(cmd("MPC", vec![src.to_string(), dst.to_string()]))
    }

    fn parse(&self, frame: &[u8], _state: ModemState) -> ModemResponse {
        let s = match Sentence::parse(frame) {
            Ok(s) => s,
            Err(e) => return ModemResponse::Malformed(e.to_string()),
        };
        if s.talker != "CA" {
            return ModemResponse::Ignored;
        }
        match s.kind.as_str() {
            // command echoes
            "CFG" | "TXD" | "MUC" | "MPC" => ModemResponse::Ok,
            "ERR" => ModemResponse::Rejected(s.fields.join(",")),
            // $CAACK,<src>,<dst>,<frame>,<ack>: our frame reached <dst>
            "ACK" => ModemResponse::Delivered(s.field_as(1)),
            // $CARXD,<src>,<dst>,<ack>,<frame>,<hex>
            "RXD" => match Self::addressed_hex(&s, 4) {
                Ok((src, dst, payload)) => ModemResponse::Received { src, dst, payload },
                Err(e) => ModemResponse::Malformed(e),
            },
            // $CAMUA,<src>,<dst>,<hex>
            "MUA" => match Self::addressed_hex(&s, 2) {
                Ok((src, dst, payload)) => ModemResponse::MiniReceived { src, dst, payload },
                Err(e) => ModemResponse::Malformed(e),
            },
            // $CAMPR,<src>,<dst>,<owtt seconds>: <src> answered our ping
            "MPR" => match s.field_as::<f64>(2) {
                Some(owtt) if owtt.is_finite() && owtt >= 0.0 => ModemResponse::Range {
                    peer: s.field_as(0),
                    propagation: Duration::from_secs_f64(owtt),
                },
                _ => ModemResponse::Malformed(s.to_string()),
            },
            "RXF" | "DQF" => ModemResponse::ReceptionFailed(s.to_string()),
            "RXP" => ModemResponse::ReceptionStarted,
            _ => {
                debug!("micromodem: ignoring {}", s);
                ModemResponse::Ignored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(kind: &str, fields: &[&str]) -> Vec<u8> {
        let mut wire = Sentence::new("CA", kind, fields.iter().map(|f| f.to_string()).collect()).to_wire();
        wire.truncate(wire.len() - 2);
        wire
    }

    #[test]
    fn settings_are_checksummed_sentences() {
        let config = ModemConfig {
            address: 3,
            tx_power: Some(4),
            ..Default::default()
        };
        let cmds = MicroModem.setting_commands(&config).unwrap();
        assert_eq!(cmds.len(), 3);
        let first = Sentence::parse(&cmds[0]).unwrap();
        assert_eq!((first.kind.as_str(), first.field(0), first.field(1)), ("CFG", Some("SRC"), Some("3")));

        let none = ModemConfig::default();
        assert_eq!(MicroModem.setting_commands(&none), Err(ConfigError::MissingTxPower));
    }

    #[test]
    fn data_goes_out_as_hex() {
        let wire = MicroModem.data_command(3, 8, &[0xCA, 0xFE], true);
        let s = Sentence::parse(&wire).unwrap();
        assert_eq!(s.fields, vec!["3", "8", "1", "CAFE"]);
    }

    #[test]
    fn receptions() {
        assert_eq!(
            MicroModem.parse(&reply("RXD", &["8", "3", "0", "1", "BEEF"]), ModemState::Idle),
            ModemResponse::Received {
                src: 8,
                dst: 3,
                payload: vec![0xBE, 0xEF]
            }
        );
        assert_eq!(
            MicroModem.parse(&reply("MUA", &["8", "3", "0F"]), ModemState::Idle),
            ModemResponse::MiniReceived {
                src: 8,
                dst: 3,
                payload: vec![0x0F]
            }
        );
        assert!(matches!(
            MicroModem.parse(&reply("RXD", &["8", "3", "0", "1", "XYZ"]), ModemState::Idle),
            ModemResponse::Malformed(_)
        ));
    }

    #[test]
    fn bad_checksum_is_malformed() {
        let mut wire = reply("ACK", &["3", "8", "1", "1"]);
        let n = wire.len();
        wire[n - 1] = if wire[n - 1] == b'0' { b'1' } else { b'0' };
        assert!(matches!(MicroModem.parse(&wire, ModemState::WaitAck), ModemResponse::Malformed(_)));
    }

    #[test]
    fn ack_range_and_errors() {
        assert_eq!(
            MicroModem.parse(&reply("ACK", &["3", "8", "1", "1"]), ModemState::WaitAck),
            ModemResponse::Delivered(Some(8))
        );
        assert_eq!(
            MicroModem.parse(&reply("MPR", &["8", "3", "0.5"]), ModemState::Ranging),
            ModemResponse::Range {
                peer: Some(8),
                propagation: Duration::from_millis(500)
            }
        );
        assert!(matches!(MicroModem.parse(&reply("ERR", &["TXD", "BUSY"]), ModemState::TransmitData), ModemResponse::Rejected(_)));
        assert_eq!(MicroModem.parse(&reply("TXD", &["3", "8", "1", "CAFE"]), ModemState::TransmitData), ModemResponse::Ok);
        assert_eq!(MicroModem.parse(&Sentence::new("CC", "TXD", vec![]).to_wire(), ModemState::Idle), ModemResponse::Ignored);
    }
}
