//! Intra-container relocations, resolved when the container is built.

use crate::binary::{BinaryReader, ByteOrder, patch};
use crate::error::{ContainerError, Result};

/// Relocation field kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationKind {
    /// 32-bit PC-relative displacement (`S + A - P`)
    Rel32,
    /// AArch64 `B`/`BL` 26-bit word displacement
    Call26,
    /// 64-bit absolute address (`S + A`)
    Abs64,
}

impl RelocationKind {
    /// Width of the patched field in bytes
    pub fn width(self) -> usize {
        match self {
            Self::Rel32 | Self::Call26 => 4,
            Self::Abs64 => 8,
        }
    }
}

/// A reference from a module's code to a named function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Field kind
    pub kind: RelocationKind,
    /// Offset of the field inside the module's code
    pub offset: u32,
    /// Target function symbol
    pub symbol: String,
    /// Constant added to the target address
    pub addend: i64,
}

impl Relocation {
    /// Create a relocation
    pub fn new(kind: RelocationKind, offset: u32, symbol: impl Into<String>, addend: i64) -> Self {
        Self {
            kind,
            offset,
            symbol: symbol.into(),
            addend,
        }
    }
}

const CALL26_RANGE: i64 = 1 << 27;

/// Patch one field of `text`.
///
/// `at` indexes `text`; `place` and `target` are load addresses.
pub(crate) fn apply(
    kind: RelocationKind,
    text: &mut [u8],
    at: usize,
    place: u64,
    target: u64,
    addend: i64,
    order: ByteOrder,
) -> Result<()> {
    let out_of_range = |value: i64| ContainerError::RelocationOutOfRange {
        offset: at as u64,
        value,
    };
    if at
        .checked_add(kind.width())
        .is_none_or(|end| end > text.len())
    {
        return Err(ContainerError::RegionOutOfRange {
            what: "relocation",
            offset: at as u64,
            size: kind.width() as u64,
        });
    }
    let displacement = (target as i64)
        .wrapping_add(addend)
        .wrapping_sub(place as i64);
    match kind {
        RelocationKind::Rel32 => {
            let value = i32::try_from(displacement).map_err(|_| out_of_range(displacement))?;
            patch(text, at, value, order)
        }
        RelocationKind::Call26 => {
            if displacement % 4 != 0 || !(-CALL26_RANGE..CALL26_RANGE).contains(&displacement) {
                return Err(out_of_range(displacement));
            }
            let insn: u32 = BinaryReader::new(text, order).read(at)?;
            let imm = ((displacement >> 2) as u32) & 0x03ff_ffff;
            patch(text, at, (insn & 0xfc00_0000) | imm, order)
        }
        RelocationKind::Abs64 => {
            let value = (target as i64)
                .checked_add(addend)
                .ok_or(out_of_range(addend))?;
            patch(text, at, value as u64, order)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel32() {
        let mut text = vec![0xe8, 0, 0, 0, 0];
        apply(RelocationKind::Rel32, &mut text, 1, 0x1001, 0x1100, -4, ByteOrder::Little).unwrap();
        assert_eq!(i32::from_le_bytes([text[1], text[2], text[3], text[4]]), 0xfb);
    }

    #[test]
    fn test_rel32_out_of_range() {
        let mut text = vec![0; 4];
        let err = apply(RelocationKind::Rel32, &mut text, 0, 0, 1 << 40, 0, ByteOrder::Little);
        assert!(matches!(err, Err(ContainerError::RelocationOutOfRange { .. })));
    }

    #[test]
    fn test_call26_keeps_opcode() {
        // BL #0
        let mut text = 0x9400_0000u32.to_le_bytes().to_vec();
        apply(RelocationKind::Call26, &mut text, 0, 0x2000, 0x1000, 0, ByteOrder::Little).unwrap();
        let insn = u32::from_le_bytes([text[0], text[1], text[2], text[3]]);
        assert_eq!(insn >> 26, 0x25);
        assert_eq!(insn & 0x03ff_ffff, (-0x400i32 as u32) & 0x03ff_ffff);
    }

    #[test]
    fn test_call26_limits() {
        let mut text = vec![0; 4];
        let far = apply(RelocationKind::Call26, &mut text, 0, 0, 1 << 27, 0, ByteOrder::Little);
        assert!(far.is_err());
        assert!(apply(RelocationKind::Call26, &mut text, 0, 0, 6, 0, ByteOrder::Little).is_err());
        assert!(
            apply(RelocationKind::Call26, &mut text, 0, 0, (1 << 27) - 4, 0, ByteOrder::Little)
                .is_ok()
        );
    }

    #[test]
    fn test_field_past_text() {
        let mut text = vec![0; 6];
        let err = apply(RelocationKind::Abs64, &mut text, 0, 0, 8, 0, ByteOrder::Little);
        assert!(matches!(err, Err(ContainerError::RegionOutOfRange { .. })));
    }
}
