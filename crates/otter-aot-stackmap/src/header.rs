//! Fixed-size headers of the stack map section.
//!
//! Layout (all little-endian):
//!
//! ```text
//! StackMapHeader   callsite_num u32 | sec_size u32
//! CallsiteHeader   pc_offset u32 | stackmap_offset u32 | stackmap_num u16
//!                  | deopt_num u16 | deopt_offset u32
//! ```

use crate::error::{Result, StackMapError};

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Section header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackMapHeader {
    /// Number of call-site headers that follow
    pub callsite_num: u32,
    /// Total section size in bytes
    pub sec_size: u32,
}

impl StackMapHeader {
    /// Encoded size
    pub const SIZE: usize = 8;

    /// Decode from the start of `bytes`
    pub fn read(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(StackMapError::Truncated {
                offset: bytes.len(),
            });
        }
        Ok(Self {
            callsite_num: read_u32(bytes, 0),
            sec_size: read_u32(bytes, 4),
        })
    }

    /// Append the encoded header
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.callsite_num.to_le_bytes());
        out.extend_from_slice(&self.sec_size.to_le_bytes());
    }
}

/// Per-call-site header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallsiteHeader {
    /// Return address offset inside the text section
    pub pc_offset: u32,
    /// Section offset of the stack map payload
    pub stackmap_offset: u32,
    /// Number of encoded locations (a plain root takes one, a derived pair two)
    pub stackmap_num: u16,
    /// Number of deopt entries
    pub deopt_num: u16,
    /// Section offset of the deopt payload
    pub deopt_offset: u32,
}

impl CallsiteHeader {
    /// Encoded size
    pub const SIZE: usize = 16;

    /// Decode the header at `at`. The caller guarantees `at + SIZE <= bytes.len()`.
    pub(crate) fn read_at(bytes: &[u8], at: usize) -> Self {
        Self {
            pc_offset: read_u32(bytes, at),
            stackmap_offset: read_u32(bytes, at + 4),
            stackmap_num: read_u16(bytes, at + 8),
            deopt_num: read_u16(bytes, at + 10),
            deopt_offset: read_u32(bytes, at + 12),
        }
    }

    /// Append the encoded header
    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pc_offset.to_le_bytes());
        out.extend_from_slice(&self.stackmap_offset.to_le_bytes());
        out.extend_from_slice(&self.stackmap_num.to_le_bytes());
        out.extend_from_slice(&self.deopt_num.to_le_bytes());
        out.extend_from_slice(&self.deopt_offset.to_le_bytes());
    }
}
