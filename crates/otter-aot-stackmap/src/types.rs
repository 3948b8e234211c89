//! Stack map records

use smallvec::SmallVec;

use crate::error::StackMapError;

/// DWARF register number
pub type DwarfReg = u16;

/// Number of encoded locations describing one base/derived pair
pub const GC_ENTRY_SIZE: usize = 2;

/// A register-relative stack location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// DWARF register the offset is relative to
    pub reg: DwarfReg,
    /// Byte offset from the register value
    pub offset: i32,
}

impl Location {
    /// Create a location
    pub const fn new(reg: DwarfReg, offset: i32) -> Self {
        Self { reg, offset }
    }
}

/// A GC reference slot at a call site.
///
/// `base == derived` is a plain root; otherwise `derived` is an interior
/// pointer that must move together with `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackMapEntry {
    /// Location of the object base pointer
    pub base: Location,
    /// Location of the derived pointer
    pub derived: Location,
}

impl StackMapEntry {
    /// A plain (non-derived) root
    pub const fn plain(location: Location) -> Self {
        Self {
            base: location,
            derived: location,
        }
    }

    /// An interior pointer tied to `base`
    pub const fn derived(base: Location, derived: Location) -> Self {
        Self { base, derived }
    }

    /// Whether this entry is a plain root
    pub fn is_plain(&self) -> bool {
        self.base == self.derived
    }
}

/// Deopt value kind, as stored in the encoded table
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptKind {
    /// Inline 32-bit constant
    Constant = 0,
    /// 64-bit constant
    LargeConstant = 1,
    /// Value stored at a register-relative location
    Indirect = 2,
}

impl TryFrom<u8> for DeoptKind {
    type Error = StackMapError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Constant),
            1 => Ok(Self::LargeConstant),
            2 => Ok(Self::Indirect),
            other => Err(StackMapError::UnknownDeoptKind(other)),
        }
    }
}

/// Value of a virtual register at a deopt point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptValue {
    /// Inline 32-bit constant
    Constant(i32),
    /// 64-bit constant
    LargeConstant(i64),
    /// Value stored at a register-relative location
    Indirect(Location),
}

impl DeoptValue {
    /// Kind tag of this value
    pub fn kind(&self) -> DeoptKind {
        match self {
            Self::Constant(_) => DeoptKind::Constant,
            Self::LargeConstant(_) => DeoptKind::LargeConstant,
            Self::Indirect(_) => DeoptKind::Indirect,
        }
    }
}

/// One virtual register recorded for deoptimization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptEntry {
    /// Virtual register id (negative ids are special registers)
    pub id: i32,
    /// Where the value lives
    pub value: DeoptValue,
}

impl DeoptEntry {
    /// Create a deopt entry
    pub const fn new(id: i32, value: DeoptValue) -> Self {
        Self { id, value }
    }
}

/// Everything recorded for one call site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSiteInfo {
    /// Offset of the return address inside the text section
    pub pc_offset: u32,
    /// GC reference slots live across the call
    pub stack_map: Vec<StackMapEntry>,
    /// Deopt values, sorted by id
    pub deopts: Vec<DeoptEntry>,
}

impl CallSiteInfo {
    /// Create an empty record for `pc_offset`
    pub fn new(pc_offset: u32) -> Self {
        Self {
            pc_offset,
            ..Default::default()
        }
    }

    /// Add a plain root
    pub fn with_root(mut self, location: Location) -> Self {
        self.stack_map.push(StackMapEntry::plain(location));
        self
    }

    /// Add a base/derived pair
    pub fn with_derived(mut self, base: Location, derived: Location) -> Self {
        self.stack_map.push(StackMapEntry::derived(base, derived));
        self
    }

    /// Add a deopt value
    pub fn with_deopt(mut self, id: i32, value: DeoptValue) -> Self {
        self.deopts.push(DeoptEntry::new(id, value));
        self
    }
}

/// Target architecture, for register numbering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Triple {
    /// x86-64 (DWARF: rbp = 6, rsp = 7)
    X86_64,
    /// AArch64 (DWARF: x29 = 29, sp = 31)
    Aarch64,
}

impl Triple {
    /// Architecture of the running process
    pub const fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::Aarch64
        } else {
            Self::X86_64
        }
    }

    /// Frame pointer register
    pub const fn fp_reg(self) -> DwarfReg {
        match self {
            Self::X86_64 => 6,
            Self::Aarch64 => 29,
        }
    }

    /// Stack pointer register
    pub const fn sp_reg(self) -> DwarfReg {
        match self {
            Self::X86_64 => 7,
            Self::Aarch64 => 31,
        }
    }
}

/// A callee-saved register and the fp-relative offset it was spilled to
pub type CalleeRegAndOffset = (DwarfReg, i32);

/// Callee-saved registers of one function
pub type CalleeRegAndOffsetVec = SmallVec<[CalleeRegAndOffset; 8]>;
