//! Bit-granular access to byte buffers.
//!
//! Bit `i` of a value lands in bit `(offset + i) % 8` of byte `(offset + i) / 8`, so the
//! least significant bit of every field comes first. Fields are copied a byte boundary at
//! a time with a partial head and tail.
//!
//! The free functions check that the slice covers the whole span; [`BitWriter`] and
//! [`BitReader`] keep a running cursor on top of them.

use crate::error::{CodecError, Result};

/// Largest field the primitives move in one call.
pub const MAX_FIELD_BITS: usize = 64;

/// Number of bytes needed to hold `bits` bits.
pub fn bytes_for_bits(bits: usize) -> usize {
    bits.div_ceil(8)
}

fn check_span(len: usize, nbits: usize, offset: usize) -> Result<()> {
    if nbits > MAX_FIELD_BITS {
        return Err(CodecError::InvalidBitCount(nbits));
    }
    let required = bytes_for_bits(offset + nbits);
    if len < required {
        return Err(CodecError::BufferTooSmall {
            required,
            actual: len,
        });
    }
    Ok(())
}

/// Mask selecting the low `nbits` bits of a `u64`.
pub fn low_mask(nbits: usize) -> u64 {
    if nbits >= 64 {
        u64::MAX
    } else {
        (1u64 << nbits) - 1
    }
}

/// Writes the low `nbits` bits of `value` into `dst` starting at bit `offset`.
///
/// Bits outside the span are left untouched.
pub fn set_bits(dst: &mut [u8], value: u64, nbits: usize, offset: usize) -> Result<()> {
    check_span(dst.len(), nbits, offset)?;

    let mut done = 0;
    while done < nbits {
        let pos = offset + done;
        let byte = pos / 8;
        let shift = pos % 8;
        let take = (8 - shift).min(nbits - done);
        let mask = low_mask(take) as u8;
        let chunk = (value >> done) as u8 & mask;
        dst[byte] = (dst[byte] & !(mask << shift)) | (chunk << shift);
        done += take;
    }
    Ok(())
}

/// Reads `nbits` bits from `src` starting at bit `offset`.
pub fn get_bits(src: &[u8], nbits: usize, offset: usize) -> Result<u64> {
    check_span(src.len(), nbits, offset)?;

    let mut value = 0u64;
    let mut done = 0;
    while done < nbits {
        let pos = offset + done;
        let byte = pos / 8;
        let shift = pos % 8;
        let take = (8 - shift).min(nbits - done);
        let chunk = (src[byte] >> shift) & low_mask(take) as u8;
        value |= u64::from(chunk) << done;
        done += take;
    }
    Ok(value)
}

/// Sequential writer over a borrowed buffer.
pub struct BitWriter<'a> {
    buf: &'a mut [u8],
    start: usize,
    offset: usize,
}

impl<'a> BitWriter<'a> {
    pub fn new(buf: &'a mut [u8], offset: usize) -> Self {
        Self {
            buf,
            start: offset,
            offset,
        }
    }

    /// Writes `value` masked to `nbits`; used for counters and clocks that wrap.
    pub fn write_wrapping(&mut self, value: u64, nbits: usize) -> Result<()> {
        set_bits(self.buf, value & low_mask(nbits), nbits, self.offset)?;
        self.offset += nbits;
        Ok(())
    }

    /// Writes `value`, failing if it does not fit in `nbits`.
    pub fn write_exact(&mut self, field: &'static str, value: u64, nbits: usize) -> Result<()> {
        if value & !low_mask(nbits) != 0 {
            return Err(CodecError::FieldOverflow {
                field,
                value,
                bits: nbits,
            });
        }
        self.write_wrapping(value, nbits)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.write_wrapping(u64::from(b), 8)?;
        }
        Ok(())
    }

    pub fn bits_written(&self) -> usize {
        self.offset - self.start
    }
}

/// Sequential reader limited to a window of `available` bits.
pub struct BitReader<'a> {
    buf: &'a [u8],
    start: usize,
    offset: usize,
    limit: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(buf: &'a [u8], offset: usize, available: usize) -> Self {
        let limit = (offset + available).min(buf.len() * 8);
        Self {
            buf,
            start: offset,
            offset,
            limit,
        }
    }

    pub fn read(&mut self, nbits: usize) -> Result<u64> {
        let available = self.remaining();
        if nbits > available {
            return Err(CodecError::InsufficientBits {
                requested: nbits,
                available,
            });
        }
        let value = get_bits(self.buf, nbits, self.offset)?;
        self.offset += nbits;
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        if count * 8 > self.remaining() {
            return Err(CodecError::InsufficientBits {
                requested: count * 8,
                available: self.remaining(),
            });
        }
        (0..count).map(|_| self.read(8).map(|b| b as u8)).collect()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.offset)
    }

    pub fn bits_read(&self) -> usize {
        self.offset - self.start
    }
}
