//! Snapshot file header and word-level encoding.
//!
//! Snapshots are written in host byte order: they are produced and consumed
//! on the same target.
//!
//! ```text
//! SnapshotHeader
//! root table          root_num * (tag, payload)
//! space regions       objects of each space, in space order
//! string region       (kind, ...) per string
//! embedded file       optional, at panda_file_begin
//! ```

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, SnapshotError};
use crate::heap::MAX_SNAPSHOT_SPACES;

/// File magic
pub const SNAPSHOT_MAGIC: [u8; 8] = *b"OTSNAP\0\0";

/// Format version this build reads and writes
pub const SNAPSHOT_VERSION: u32 = 3;

/// Bytes per encoded word
pub const WORD_SIZE: usize = 8;

/// Kind prefix of a flat string
pub const STRING_KIND_LINE: u64 = 0;
/// Kind prefix of a bytecode-file backed string
pub const STRING_KIND_CONSTANT: u64 = 1;

/// Fixed-layout header at the start of every snapshot
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SnapshotHeader {
    /// [`SNAPSHOT_MAGIC`]
    pub magic: [u8; 8],
    /// [`SNAPSHOT_VERSION`]
    pub version: u32,
    /// Raw [`GcMode`](crate::GcMode)
    pub gc_mode: u32,
    /// Encoded bytes per space region
    pub space_sizes: [u64; MAX_SNAPSHOT_SPACES],
    /// Objects per space region
    pub space_counts: [u32; MAX_SNAPSHOT_SPACES],
    /// Number of strings
    pub string_count: u32,
    /// Encoded bytes of the string region
    pub string_size: u64,
    /// Number of root values
    pub root_num: u32,
    /// CRC-32 of everything after the header
    pub body_checksum: u32,
    /// File offset of the embedded bytecode image, 0 if none
    pub panda_file_begin: u64,
    /// Size of the embedded bytecode image
    pub panda_file_size: u64,
}

impl SnapshotHeader {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Header bytes
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read the header from the start of `data`
    pub fn read(data: &[u8]) -> Result<Self> {
        let bytes = data
            .get(..Self::SIZE)
            .ok_or(SnapshotError::Truncated { offset: data.len() })?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }

    /// Whether an embedded bytecode image follows the strings
    pub fn has_embedded_file(&self) -> bool {
        self.panda_file_begin != 0
    }
}

/// Value tags
pub(crate) mod tag {
    pub const UNDEFINED: u64 = 0;
    pub const NULL: u64 = 1;
    pub const HOLE: u64 = 2;
    pub const FALSE: u64 = 3;
    pub const TRUE: u64 = 4;
    pub const INT: u64 = 5;
    pub const DOUBLE: u64 = 6;
    pub const OBJECT: u64 = 7;
    pub const STRING: u64 = 8;
}

/// Pack a space bucket and index within it
pub(crate) fn object_ref(bucket: usize, index: usize) -> u64 {
    ((bucket as u64) << 32) | index as u64
}

/// Inverse of [`object_ref`]
pub(crate) fn split_object_ref(payload: u64) -> (usize, usize) {
    ((payload >> 32) as usize, (payload & 0xffff_ffff) as usize)
}

/// Object header word: class, field count, raw length
pub(crate) fn object_word(class: u8, fields: usize, raw_len: usize) -> Result<u64> {
    if fields >= 1 << 24 {
        return Err(SnapshotError::TooManyFields(fields));
    }
    let raw_len = u32::try_from(raw_len).map_err(|_| SnapshotError::TooManyFields(raw_len))?;
    Ok(u64::from(class) | ((fields as u64) << 8) | (u64::from(raw_len) << 32))
}

/// Inverse of [`object_word`]
pub(crate) fn split_object_word(word: u64) -> (u8, usize, usize) {
    (
        (word & 0xff) as u8,
        ((word >> 8) & 0xff_ffff) as usize,
        (word >> 32) as usize,
    )
}

/// Round `len` up to a whole number of words
pub(crate) fn word_align(len: usize) -> usize {
    len.div_ceil(WORD_SIZE) * WORD_SIZE
}

/// Bounds-checked word cursor
pub(crate) struct WordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WordReader<'a> {
    pub(crate) fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn word(&mut self) -> Result<u64> {
        let bytes = self.bytes(WORD_SIZE)?;
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(bytes);
        Ok(u64::from_ne_bytes(word))
    }

    /// `len` bytes, then skip padding to the next word
    pub(crate) fn padded(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.pos;
        let bytes = self.bytes(len)?;
        let end = start
            .checked_add(word_align(len))
            .ok_or(SnapshotError::Truncated { offset: start })?;
        if end > self.data.len() {
            return Err(SnapshotError::Truncated { offset: start });
        }
        self.pos = end;
        Ok(bytes)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let start = self.pos;
        let bytes = start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or(SnapshotError::Truncated { offset: start })?;
        self.pos += len;
        Ok(bytes)
    }
}

pub(crate) fn push_word(out: &mut Vec<u8>, word: u64) {
    out.extend_from_slice(&word.to_ne_bytes());
}

pub(crate) fn push_padded(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
    out.resize(out.len() + word_align(bytes.len()) - bytes.len(), 0);
}
