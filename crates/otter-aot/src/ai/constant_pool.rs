//! Restored constant pools.

use serde::Serialize;
use tracing::debug;

use super::hidden_class::{HiddenClassLayout, Representation};
use super::NO_FUNC_ENTRY_VALUE;

/// AOT entry of a method referenced from a constant pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodEntry {
    /// Function entry index in the bound `.an` file
    Index(u32),
    /// Not revised yet; holds the raw method offset
    Pending {
        /// Method offset in the bytecode file
        offset: u32,
    },
    /// The method was not compiled
    NoEntry,
}

impl MethodEntry {
    /// Entry index, once known
    pub fn entry_index(self) -> Option<u32> {
        match self {
            Self::Index(index) => Some(index),
            _ => None,
        }
    }

    /// Value stored in the pool slot: the entry index, the raw method
    /// offset while pending, or [`NO_FUNC_ENTRY_VALUE`]
    pub fn raw(self) -> i64 {
        match self {
            Self::Index(index) => i64::from(index),
            Self::Pending { offset } => i64::from(offset),
            Self::NoEntry => NO_FUNC_ENTRY_VALUE,
        }
    }
}

/// Kind of a literal cache
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralKind {
    /// Class literal
    Class = 0,
    /// Object literal
    Object = 1,
    /// Array literal
    Array = 2,
}

impl LiteralKind {
    /// Kind from its serialized value
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Class),
            1 => Some(Self::Object),
            2 => Some(Self::Array),
            _ => None,
        }
    }
}

/// Offline-computed cache of one literal
///
/// The recorded hidden classes are only reachable through the `trusted_*`
/// accessors, which check them against the literal's real properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiteralInfo {
    ihc: Option<HiddenClassLayout>,
    chc: Option<HiddenClassLayout>,
    /// Entries of the literal's methods, in literal order
    pub methods: Vec<MethodEntry>,
}

impl LiteralInfo {
    pub(crate) fn new(ihc: Option<HiddenClassLayout>, chc: Option<HiddenClassLayout>) -> Self {
        Self {
            ihc,
            chc,
            methods: Vec::new(),
        }
    }

    pub fn has_ihc(&self) -> bool {
        self.ihc.is_some()
    }

    pub fn has_chc(&self) -> bool {
        self.chc.is_some()
    }

    /// Instance hidden class, if it agrees with the properties the literal
    /// actually has
    pub fn trusted_ihc(&self, actual: &[Representation]) -> Option<&HiddenClassLayout> {
        trusted(self.ihc.as_ref(), actual, "instance")
    }

    /// Constructor hidden class, if it agrees with the properties the
    /// constructor actually has
    pub fn trusted_chc(&self, actual: &[Representation]) -> Option<&HiddenClassLayout> {
        trusted(self.chc.as_ref(), actual, "constructor")
    }
}

fn trusted<'a>(
    layout: Option<&'a HiddenClassLayout>,
    actual: &[Representation],
    which: &'static str,
) -> Option<&'a HiddenClassLayout> {
    let layout = layout?;
    if layout.matches(actual) {
        Some(layout)
    } else {
        debug!(
            which,
            recorded = layout.len(),
            actual = actual.len(),
            "discarding AOT hidden class with mismatched representations"
        );
        None
    }
}

/// One constant-pool slot restored from an ai file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConstPoolSlot {
    /// Nothing cached; resolved from bytecode on use
    #[default]
    Empty,
    /// String tombstone; the string is created from bytecode on first use
    LazyString,
    /// Method with its AOT entry
    Method(MethodEntry),
    /// Class literal cache
    ClassLiteral(LiteralInfo),
    /// Object literal cache
    ObjectLiteral(LiteralInfo),
    /// Array literal cache
    ArrayLiteral(LiteralInfo),
}

impl ConstPoolSlot {
    pub(crate) fn literal(kind: LiteralKind, info: LiteralInfo) -> Self {
        match kind {
            LiteralKind::Class => Self::ClassLiteral(info),
            LiteralKind::Object => Self::ObjectLiteral(info),
            LiteralKind::Array => Self::ArrayLiteral(info),
        }
    }

    /// Literal cache held by this slot
    pub fn literal_info(&self) -> Option<&LiteralInfo> {
        match self {
            Self::ClassLiteral(info) | Self::ObjectLiteral(info) | Self::ArrayLiteral(info) => {
                Some(info)
            }
            _ => None,
        }
    }

    pub(crate) fn method_entry_mut(&mut self, method: Option<u32>) -> Option<&mut MethodEntry> {
        match (self, method) {
            (Self::Method(entry), None) => Some(entry),
            (
                Self::ClassLiteral(info) | Self::ObjectLiteral(info) | Self::ArrayLiteral(info),
                Some(index),
            ) => info.methods.get_mut(index as usize),
            _ => None,
        }
    }
}

/// A constant pool of one bytecode file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantPool {
    /// Index the compiler assigned to the bytecode file
    pub file_index: u32,
    /// Normalized bytecode file name
    pub file_name: String,
    /// Constant pool id within the file
    pub cp_id: u32,
    /// Slots by constant-pool index
    pub slots: Vec<ConstPoolSlot>,
}

impl ConstantPool {
    /// Slot `index`; empty past the end
    pub fn slot(&self, index: u32) -> &ConstPoolSlot {
        static EMPTY: ConstPoolSlot = ConstPoolSlot::Empty;
        self.slots.get(index as usize).unwrap_or(&EMPTY)
    }

    /// Number of non-empty slots
    pub fn cached_len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| !matches!(slot, ConstPoolSlot::Empty))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_entry_raw() {
        assert_eq!(MethodEntry::Index(4).raw(), 4);
        assert_eq!(MethodEntry::Pending { offset: 0x80 }.raw(), 0x80);
        assert_eq!(MethodEntry::NoEntry.raw(), NO_FUNC_ENTRY_VALUE);
        assert_eq!(MethodEntry::NoEntry.entry_index(), None);
    }

    #[test]
    fn test_untrusted_hidden_class_is_discarded() {
        let info = LiteralInfo::new(Some(HiddenClassLayout::new([Representation::Int])), None);
        assert!(info.has_ihc());
        assert!(!info.has_chc());
        assert!(info.trusted_ihc(&[Representation::Int]).is_some());
        assert!(info.trusted_ihc(&[Representation::Tagged]).is_none());
        assert!(info.trusted_chc(&[]).is_none());
    }

    #[test]
    fn test_slot_past_end_is_empty() {
        let pool = ConstantPool {
            file_index: 0,
            file_name: "a.abc".into(),
            cp_id: 0,
            slots: vec![ConstPoolSlot::Empty, ConstPoolSlot::LazyString],
        };
        assert_eq!(pool.slot(1), &ConstPoolSlot::LazyString);
        assert_eq!(pool.slot(9), &ConstPoolSlot::Empty);
        assert_eq!(pool.cached_len(), 1);
    }
}
