//! NMEA-style sentences: `$<talker><kind>,<f1>,...,<fn>*<hh>\r\n`.
//!
//! The checksum is the XOR of every byte between `$` and `*`, written as two hex digits.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NmeaError {
    #[error("sentence does not start with '$'")]
    MissingStart,

    #[error("sentence has no checksum")]
    MissingChecksum,

    #[error("malformed checksum field `{0}`")]
    BadChecksumField(String),

    #[error("checksum mismatch: sentence says {expected:02X}, computed {actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("sentence address `{0}` is too short")]
    ShortAddress(String),

    #[error("sentence is not valid ASCII")]
    NotAscii,
}

pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc ^ b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// Two-letter talker, `CC` for commands and `CA` for modem replies.
    pub talker: String,
    pub kind: String,
    pub fields: Vec<String>,
}

impl Sentence {
    pub fn new(talker: &str, kind: &str, fields: Vec<String>) -> Self {
        Self {
            talker: talker.to_string(),
            kind: kind.to_string(),
            fields,
        }
    }

    fn body(&self) -> String {
        let mut body = format!("{}{}", self.talker, self.kind);
        for f in &self.fields {
            body.push(',');
            body.push_str(f);
        }
        body
    }

    /// Full wire form including the trailing `\r\n`.
    pub fn to_wire(&self) -> Vec<u8> {
        let body = self.body();
        format!("${}*{:02X}\r\n", body, checksum(body.as_bytes())).into_bytes()
    }

    /// Parses a sentence, with or without its line terminator, validating the checksum.
    pub fn parse(raw: &[u8]) -> Result<Self, NmeaError> {
        let line = std::str::from_utf8(raw).map_err(|_| NmeaError::NotAscii)?;
        let line = line.trim_end_matches(['\r', '\n']);
        let rest = line.strip_prefix('$').ok_or(NmeaError::MissingStart)?;
        let (body, sum) = rest.rsplit_once('*').ok_or(NmeaError::MissingChecksum)?;
        if sum.len() != 2 {
            return Err(NmeaError::BadChecksumField(sum.to_string()));
        }
        let expected =
            u8::from_str_radix(sum, 16).map_err(|_| NmeaError::BadChecksumField(sum.to_string()))?;
        let actual = checksum(body.as_bytes());
        if expected != actual {
            return Err(NmeaError::ChecksumMismatch { expected, actual });
        }

        let mut parts = body.split(',');
        let address = parts.next().unwrap_or_default();
        if address.len() < 3 || !address.is_char_boundary(2) {
            return Err(NmeaError::ShortAddress(address.to_string()));
        }
        let (talker, kind) = address.split_at(2);
        Ok(Self {
            talker: talker.to_string(),
            kind: kind.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn field_as<T: std::str::FromStr>(&self, index: usize) -> Option<T> {
        self.field(index)?.trim().parse().ok()
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.body())
    }
}

pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02X}")).collect()
}

pub fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
