//! ELF-derived container for Otter AOT code.
//!
//! A container merges the machine code, stack maps, string tables and
//! symbol tables of one or more compiled bytecode modules into single
//! sections, and records per-module regions and per-function entry points
//! in two descriptor sections:
//!
//! | section | contents |
//! |---|---|
//! | `.text` | merged machine code, page aligned, covered by a `PT_LOAD` R+X segment |
//! | `.ark_stackmaps` | one stack map sub-section per module |
//! | `.strtab` | module names and symbol names |
//! | `.symtab` | `Elf64_Sym` per function |
//! | `.ark_funcentry` | function entry descriptors, then callee-saved register spills |
//! | `.ark_moduleinfo` | module descriptors |
//! | `.shstrtab` | section names |
//!
//! The reader validates every offset before use and reports problems as a
//! typed [`ContainerError`]; callers treat a malformed file as absent.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod binary;
pub mod builder;
pub mod descriptors;
pub mod elf;
pub mod error;
pub mod reader;
pub mod reloc;

pub use binary::{BinaryReader, BinaryWriter, ByteOrder, Record};
pub use builder::{ContainerBuilder, FunctionInput, ModuleInput};
pub use descriptors::{
    FUNC_ENTRY_SECTION, FuncEntryDes, FuncEntryKind, MODULE_INFO_SECTION, ModuleSectionDes,
    Region, RegionKind, SHSTRTAB_SECTION, STACKMAP_SECTION, STRTAB_SECTION, SYMTAB_SECTION,
    SymbolDes, TEXT_SECTION,
};
pub use elf::Machine;
pub use error::{ContainerError, Result};
pub use reader::{Container, ContainerBytes, MAX_SECTION_COUNT, SectionInfo};
pub use reloc::{Relocation, RelocationKind};
