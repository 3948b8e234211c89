//! Byte-order aware binary reader and writer.
//!
//! Containers declare their byte order in `EI_DATA`. When it matches the
//! host and the data is suitably aligned, tables are borrowed in place;
//! otherwise every record is copied out and byte-swapped field by field.

use std::borrow::Cow;

use bytemuck::Pod;

use crate::error::{ContainerError, Result};

/// Byte order of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// `ELFDATA2LSB`
    Little,
    /// `ELFDATA2MSB`
    Big,
}

impl ByteOrder {
    /// Byte order of the running process
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            Self::Little
        } else {
            Self::Big
        }
    }

    /// Whether this is the host order
    pub fn is_native(self) -> bool {
        self == Self::native()
    }

    /// Decode the `EI_DATA` identification byte
    pub fn from_ei_data(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Little),
            2 => Some(Self::Big),
            _ => None,
        }
    }

    /// `EI_DATA` identification byte
    pub fn ei_data(self) -> u8 {
        match self {
            Self::Little => 1,
            Self::Big => 2,
        }
    }
}

/// A fixed-layout value that can be read from or written to a container.
pub trait Record: Pod {
    /// The same value with every multi-byte field byte-swapped
    fn byte_swapped(self) -> Self;

    /// Convert between host order and `order`
    fn to_order(self, order: ByteOrder) -> Self {
        if order.is_native() {
            self
        } else {
            self.byte_swapped()
        }
    }
}

macro_rules! impl_record_for_int {
    ($($ty:ty),*) => {
        $(
            impl Record for $ty {
                fn byte_swapped(self) -> Self {
                    self.swap_bytes()
                }
            }
        )*
    };
}

impl_record_for_int!(u8, u16, u32, u64, i16, i32, i64);

/// Bounds-checked reader over container bytes
#[derive(Debug, Clone, Copy)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    order: ByteOrder,
}

impl<'a> BinaryReader<'a> {
    /// Reader over `data` in `order`
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self { data, order }
    }

    /// Declared byte order
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Underlying bytes
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// `len` bytes at `offset`
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(ContainerError::OutOfBounds { offset, len })
    }

    /// Read one value at `offset`, converting to host order
    pub fn read<T: Record>(&self, offset: usize) -> Result<T> {
        let bytes = self.slice(offset, std::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned::<T>(bytes).to_order(self.order))
    }

    /// Read `count` consecutive values at `offset`.
    ///
    /// Borrows in place when the order is native and the address is aligned
    /// for `T`; copies and swaps otherwise.
    pub fn read_table<T: Record>(&self, offset: usize, count: usize) -> Result<Cow<'a, [T]>> {
        let size = std::mem::size_of::<T>();
        let len = count
            .checked_mul(size)
            .ok_or(ContainerError::OutOfBounds { offset, len: usize::MAX })?;
        let bytes = self.slice(offset, len)?;
        if self.order.is_native() {
            if let Ok(table) = bytemuck::try_cast_slice::<u8, T>(bytes) {
                return Ok(Cow::Borrowed(table));
            }
        }
        Ok(Cow::Owned(
            bytes
                .chunks_exact(size)
                .map(|chunk| bytemuck::pod_read_unaligned::<T>(chunk).to_order(self.order))
                .collect(),
        ))
    }

    /// NUL-terminated UTF-8 string starting at `offset` and ending before `limit`
    pub fn c_str(&self, offset: usize, limit: usize) -> Result<&'a str> {
        let limit = limit.min(self.data.len());
        let tail = self
            .data
            .get(offset..limit)
            .ok_or(ContainerError::OutOfBounds { offset, len: 1 })?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(ContainerError::OutOfBounds {
                offset,
                len: tail.len() + 1,
            })?;
        std::str::from_utf8(&tail[..end]).map_err(|_| ContainerError::OutOfBounds {
            offset,
            len: end,
        })
    }
}

/// Growable output buffer in a fixed byte order
#[derive(Debug)]
pub struct BinaryWriter {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl BinaryWriter {
    /// Empty writer
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    /// Current length
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Append one value in the writer's order
    pub fn write<T: Record>(&mut self, value: T) {
        self.buf
            .extend_from_slice(bytemuck::bytes_of(&value.to_order(self.order)));
    }

    /// Append raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Zero-pad to a multiple of `align`
    pub fn align_to(&mut self, align: usize) {
        let padded = self.buf.len().next_multiple_of(align.max(1));
        self.buf.resize(padded, 0);
    }

    /// Zero-pad up to absolute position `offset`
    pub fn pad_to(&mut self, offset: usize) {
        if offset > self.buf.len() {
            self.buf.resize(offset, 0);
        }
    }

    /// Finished bytes
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Write `value` into `buf` at `offset` in `order`
pub(crate) fn patch<T: Record>(
    buf: &mut [u8],
    offset: usize,
    value: T,
    order: ByteOrder,
) -> Result<()> {
    let size = std::mem::size_of::<T>();
    let dst = offset
        .checked_add(size)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(ContainerError::OutOfBounds { offset, len: size })?;
    dst.copy_from_slice(bytemuck::bytes_of(&value.to_order(order)));
    Ok(())
}
