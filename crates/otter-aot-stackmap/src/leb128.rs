//! LEB128 variable-length integers over bounds-checked slices.

use crate::error::{Result, StackMapError};

/// Append `value` as unsigned LEB128.
pub fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Append `value` as signed LEB128.
pub fn write_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Cursor over an immutable byte slice.
///
/// Every read is bounds checked; malformed input yields an error instead of
/// reading past the slice.
#[derive(Debug, Clone)]
pub struct Leb128Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Leb128Reader<'a> {
    /// Start reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Start reading at `pos`
    pub fn at(data: &'a [u8], pos: usize) -> Result<Self> {
        if pos > data.len() {
            return Err(StackMapError::OutOfSection {
                offset: pos,
                size: data.len(),
            });
        }
        Ok(Self { data, pos })
    }

    /// Current offset
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Read one raw byte
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(StackMapError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read an unsigned LEB128 value
    pub fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            let low = u64::from(byte & 0x7f);
            if shift >= 64 || (shift == 63 && low > 1) {
                return Err(StackMapError::Leb128Overflow { offset: start });
            }
            result |= low << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Read a signed LEB128 value
    pub fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.pos;
        let mut result = 0i64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(StackMapError::Leb128Overflow { offset: start });
            }
            result |= i64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
    }

    /// Read a signed LEB128 value that must fit in `i32`
    pub fn read_sleb128_i32(&mut self) -> Result<i32> {
        let start = self.pos;
        let value = self.read_sleb128()?;
        i32::try_from(value).map_err(|_| StackMapError::Leb128Overflow { offset: start })
    }
}
