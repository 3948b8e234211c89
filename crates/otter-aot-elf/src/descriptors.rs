//! Module and function-entry descriptors stored in the container.

use bytemuck::{Pod, Zeroable};
use otter_aot_stackmap::CalleeRegAndOffsetVec;

use crate::binary::Record;
use crate::error::ContainerError;

/// Merged section holding machine code
pub const TEXT_SECTION: &str = ".text";
/// Merged section holding per-module stack maps
pub const STACKMAP_SECTION: &str = ".ark_stackmaps";
/// Merged string table (module names and symbol names)
pub const STRTAB_SECTION: &str = ".strtab";
/// Merged symbol table
pub const SYMTAB_SECTION: &str = ".symtab";
/// Function entry descriptors followed by the callee-saved register table
pub const FUNC_ENTRY_SECTION: &str = ".ark_funcentry";
/// Module descriptors
pub const MODULE_INFO_SECTION: &str = ".ark_moduleinfo";
/// Section name table
pub const SHSTRTAB_SECTION: &str = ".shstrtab";

/// Per-module region of one merged section
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Code
    Text = 0,
    /// Stack map sub-section
    StackMap = 1,
    /// String table
    StrTab = 2,
    /// Symbol table
    SymTab = 3,
}

impl RegionKind {
    /// All kinds in descriptor order
    pub const ALL: [RegionKind; 4] = [
        RegionKind::Text,
        RegionKind::StackMap,
        RegionKind::StrTab,
        RegionKind::SymTab,
    ];

    /// Name of the merged section the region lives in
    pub fn section_name(self) -> &'static str {
        match self {
            Self::Text => TEXT_SECTION,
            Self::StackMap => STACKMAP_SECTION,
            Self::StrTab => STRTAB_SECTION,
            Self::SymTab => SYMTAB_SECTION,
        }
    }
}

/// `(offset, size)` relative to the owning section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Region {
    /// Offset from the start of the section
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

impl Region {
    /// Create a region
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte, or `None` on overflow
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.size)
    }

    /// Whether `offset` lies inside the region
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && self.end().is_some_and(|end| offset < end)
    }

    /// Whether the region fits in a section of `section_size` bytes
    pub fn fits(&self, section_size: u64) -> bool {
        self.end().is_some_and(|end| end <= section_size)
    }
}

/// One bytecode module compiled into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSectionDes {
    /// Position in the module table
    pub module_index: u32,
    /// Bytecode file name the module was compiled from
    pub abc_name: String,
    /// Checksum of that bytecode file at compile time
    pub abc_checksum: u32,
    /// Regions indexed by [`RegionKind`]
    pub regions: [Region; 4],
}

impl ModuleSectionDes {
    /// Region of `kind`
    pub fn region(&self, kind: RegionKind) -> Region {
        self.regions[kind as usize]
    }
}

/// On-disk layout of [`ModuleSectionDes`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct ModuleSectionRecord {
    /// Position in the module table
    pub module_index: u32,
    /// `.strtab` offset of the bytecode file name
    pub abc_name: u32,
    /// Bytecode file checksum
    pub abc_checksum: u32,
    /// Zero
    pub reserved: u32,
    /// Region offsets indexed by [`RegionKind`]
    pub region_offsets: [u64; 4],
    /// Region sizes indexed by [`RegionKind`]
    pub region_sizes: [u64; 4],
}

impl Record for ModuleSectionRecord {
    fn byte_swapped(self) -> Self {
        Self {
            module_index: self.module_index.swap_bytes(),
            abc_name: self.abc_name.swap_bytes(),
            abc_checksum: self.abc_checksum.swap_bytes(),
            reserved: self.reserved.swap_bytes(),
            region_offsets: self.region_offsets.map(u64::swap_bytes),
            region_sizes: self.region_sizes.map(u64::swap_bytes),
        }
    }
}

/// What a function entry is
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncEntryKind {
    /// Runtime stub or bytecode handler
    Stub = 0,
    /// A module's main function
    Main = 1,
    /// Any other bytecode method
    Method = 2,
}

impl TryFrom<u8> for FuncEntryKind {
    type Error = ContainerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Stub),
            1 => Ok(Self::Main),
            2 => Ok(Self::Method),
            other => Err(ContainerError::BadFuncEntryKind(other)),
        }
    }
}

/// Entry point of one compiled function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncEntryDes {
    /// Stub index for stubs, bytecode method offset for methods
    pub id: u32,
    /// Entry kind
    pub kind: FuncEntryKind,
    /// Whether the function uses the fast-call convention
    pub is_fast_call: bool,
    /// Module the code belongs to
    pub module_index: u32,
    /// Offset of the first instruction from the start of `.text`
    pub code_offset: u64,
    /// Code size in bytes
    pub func_size: u32,
    /// Distance from the frame pointer to the frame's lowest slot
    pub fp_delta: i32,
    /// Callee-saved registers spilled in the prologue
    pub callee_regs: CalleeRegAndOffsetVec,
}

impl FuncEntryDes {
    /// Text range covered by this function
    pub fn text_region(&self) -> Region {
        Region::new(self.code_offset, u64::from(self.func_size))
    }
}

/// On-disk layout of [`FuncEntryDes`]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FuncEntryRecord {
    /// Stub index or method offset
    pub id: u32,
    /// [`FuncEntryKind`] byte
    pub kind: u8,
    /// 1 for fast-call functions
    pub is_fast_call: u8,
    /// Zero
    pub reserved: u16,
    /// Owning module
    pub module_index: u32,
    /// Code size
    pub func_size: u32,
    /// Offset into `.text`
    pub code_offset: u64,
    /// Frame pointer delta
    pub fp_delta: i32,
    /// First entry in the callee-saved register table
    pub callee_reg_start: u32,
    /// Number of callee-saved register entries
    pub callee_reg_num: u32,
    /// Zero
    pub reserved2: u32,
}

impl Record for FuncEntryRecord {
    fn byte_swapped(self) -> Self {
        Self {
            id: self.id.swap_bytes(),
            kind: self.kind,
            is_fast_call: self.is_fast_call,
            reserved: self.reserved.swap_bytes(),
            module_index: self.module_index.swap_bytes(),
            func_size: self.func_size.swap_bytes(),
            code_offset: self.code_offset.swap_bytes(),
            fp_delta: self.fp_delta.swap_bytes(),
            callee_reg_start: self.callee_reg_start.swap_bytes(),
            callee_reg_num: self.callee_reg_num.swap_bytes(),
            reserved2: self.reserved2.swap_bytes(),
        }
    }
}

/// One callee-saved register spill
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CalleeRegRecord {
    /// DWARF register number
    pub reg: u16,
    /// Zero
    pub reserved: u16,
    /// Spill slot offset from the frame pointer
    pub offset: i32,
}

impl Record for CalleeRegRecord {
    fn byte_swapped(self) -> Self {
        Self {
            reg: self.reg.swap_bytes(),
            reserved: self.reserved.swap_bytes(),
            offset: self.offset.swap_bytes(),
        }
    }
}

/// A defined function symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolDes {
    /// Symbol name
    pub name: String,
    /// Offset from the start of `.text`
    pub value: u64,
    /// Size in bytes
    pub size: u64,
    /// Section header index
    pub section: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<ModuleSectionRecord>(), 80);
        assert_eq!(std::mem::size_of::<FuncEntryRecord>(), 40);
        assert_eq!(std::mem::size_of::<CalleeRegRecord>(), 8);
    }

    #[test]
    fn test_region_bounds() {
        let region = Region::new(16, 16);
        assert!(region.contains(16));
        assert!(region.contains(31));
        assert!(!region.contains(32));
        assert!(region.fits(32));
        assert!(!region.fits(31));
        assert!(!Region::new(u64::MAX, 2).fits(u64::MAX));
    }
}
