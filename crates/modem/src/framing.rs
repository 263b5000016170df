//! Splitting the modem byte stream into reply frames.
//!
//! Serial and TCP links hand over arbitrary chunks, so partial frames are buffered
//! until their terminator (or, for binary-carrying lines, their declared length) arrives.

use bytes::{Buf, Bytes, BytesMut};
use log::warn;
use thiserror::Error;
use tokio_util::codec::Decoder;

/// Longest text line accepted before the buffer is considered garbage.
pub const MAX_LINE: usize = 1024;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame exceeds {0} bytes without a terminator")]
    FrameTooLong(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// `$...*HH\r\n` sentences. Noise before a `$` is dropped.
#[derive(Debug, Default, Clone)]
pub struct NmeaCodec;

impl Decoder for NmeaCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        match src.iter().position(|&b| b == b'$') {
            Some(start) if start > 0 => {
                warn!("dropping {} bytes of line noise", start);
                src.advance(start);
            }
            Some(_) => {}
            None => {
                src.clear();
                return Ok(None);
            }
        }
        match find_crlf(src) {
            Some(end) => {
                let frame = src.split_to(end).freeze();
                src.advance(2);
                Ok(Some(frame))
            }
            None if src.len() > MAX_LINE => {
                let len = src.len();
                src.clear();
                Err(FramingError::FrameTooLong(len))
            }
            None => Ok(None),
        }
    }
}

/// Lines whose tail is raw binary of a declared length: prefix and the number of
/// comma-separated fields in front of the data, the first being the length.
const BINARY_LINES: &[(&[u8], usize)] = &[(b"RECVIM,", 8), (b"AT*SENDIM,", 3)];

/// AT-dialect lines terminated by `\r\n`, with length-aware handling of the
/// instant-message lines that embed binary data.
#[derive(Debug, Default, Clone)]
pub struct EvologicsCodec;

impl EvologicsCodec {
    /// Byte count of a binary-carrying frame at the front of `src`, once its header is
    /// complete. `Some(None)` means the header is there but malformed, which includes a
    /// declared length no modem would send.
    fn binary_frame_len(src: &[u8]) -> Option<Option<usize>> {
        let (prefix, fields) = BINARY_LINES
            .iter()
            .find(|(prefix, _)| src.starts_with(prefix))?;
        let rest = &src[prefix.len()..];
        let mut commas = rest.iter().enumerate().filter(|(_, &b)| b == b',').map(|(i, _)| i);
        let data_start = commas.nth(fields - 1)? + 1;
        let len = std::str::from_utf8(&rest[..rest.iter().position(|&b| b == b',')?])
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&len| len <= MAX_LINE);
        Some(len.and_then(|len| prefix.len().checked_add(data_start)?.checked_add(len)))
    }
}

impl Decoder for EvologicsCodec {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FramingError> {
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }
        if src.is_empty() {
            return Ok(None);
        }

        match Self::binary_frame_len(src) {
            Some(Some(body)) => {
                if src.len() < body.saturating_add(2) {
                    return Ok(None);
                }
                let frame = src.split_to(body).freeze();
                if src.starts_with(b"\r\n") {
                    src.advance(2);
                } else {
                    warn!("binary frame not followed by a line end");
                }
                return Ok(Some(frame));
            }
            // header present but malformed: treat it as a plain line
            Some(None) => warn!("malformed length in binary frame header"),
            None if BINARY_LINES.iter().any(|(p, _)| src.starts_with(p)) => {
                if src.len() > MAX_LINE {
                    let len = src.len();
                    src.clear();
                    return Err(FramingError::FrameTooLong(len));
                }
                return Ok(None);
            }
            None => {}
        }

        match find_crlf(src) {
            Some(end) => {
                let frame = src.split_to(end).freeze();
                src.advance(2);
                Ok(Some(frame))
            }
            None if src.len() > MAX_LINE => {
                let len = src.len();
                src.clear();
                Err(FramingError::FrameTooLong(len))
            }
            None => Ok(None),
        }
    }
}

/// Pushes received chunks through a decoder and collects the complete frames.
#[derive(Debug, Default)]
pub struct FrameAssembler<D> {
    decoder: D,
    buffer: BytesMut,
}

impl<D> FrameAssembler<D>
where
    D: Decoder<Item = Bytes, Error = FramingError>,
{
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            buffer: BytesMut::with_capacity(MAX_LINE),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.decoder.decode(&mut self.buffer) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => warn!("discarding receive buffer: {}", e),
            }
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
