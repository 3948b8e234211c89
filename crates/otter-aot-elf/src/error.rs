//! Container errors.
//!
//! Every structural problem found while reading a container has its own
//! variant so callers can log a precise reason before treating the file as
//! absent.

use otter_aot_stackmap::StackMapError;
use thiserror::Error;

/// Errors produced while building or reading a container
#[derive(Debug, Error)]
pub enum ContainerError {
    /// File does not start with the ELF magic
    #[error("bad ELF magic")]
    BadMagic,

    /// Only 64-bit containers are produced and accepted
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),

    /// `EI_DATA` names neither little nor big endian
    #[error("bad ELF byte order {0}")]
    BadByteOrder(u8),

    /// ELF version field is not `EV_CURRENT`
    #[error("bad ELF version {0}")]
    BadVersion(u32),

    /// Machine is neither x86-64 nor AArch64
    #[error("unsupported machine {0}")]
    UnsupportedMachine(u16),

    /// File is shorter than the ELF header
    #[error("ELF header truncated ({len} bytes)")]
    HeaderTruncated {
        /// File length
        len: usize,
    },

    /// Program header table lies outside the file
    #[error("program headers out of range")]
    ProgramHeadersOutOfRange,

    /// Section header table lies outside the file or has a bad entry size
    #[error("section headers out of range")]
    SectionHeadersOutOfRange,

    /// More section headers than a container may carry
    #[error("too many sections ({0})")]
    TooManySections(u16),

    /// A section's bytes lie outside the file
    #[error("section {index} out of range")]
    SectionOutOfRange {
        /// Section header index
        index: usize,
    },

    /// A section name does not resolve in the section name table
    #[error("section {index} has an invalid name")]
    BadSectionName {
        /// Section header index
        index: usize,
    },

    /// A symbol references a section that is not declared
    #[error("symbol {symbol} references undeclared section {section}")]
    SymbolSectionInvalid {
        /// Symbol index
        symbol: usize,
        /// Referenced section index
        section: u16,
    },

    /// A required section is absent
    #[error("missing section {0}")]
    MissingSection(&'static str),

    /// A descriptor region lies outside its owning section
    #[error("{what} region [{offset:#x}, +{size:#x}) out of range")]
    RegionOutOfRange {
        /// What the region describes
        what: &'static str,
        /// Region offset
        offset: u64,
        /// Region size
        size: u64,
    },

    /// A relocation displacement does not fit its field
    #[error("relocation at {offset:#x} out of range ({value})")]
    RelocationOutOfRange {
        /// Text offset of the patched field
        offset: u64,
        /// Displacement that did not fit
        value: i64,
    },

    /// A relocation names a symbol that no module defines
    #[error("unknown relocation target {0}")]
    UnknownSymbol(String),

    /// Function entry kind byte is not a known kind
    #[error("bad function entry kind {0}")]
    BadFuncEntryKind(u8),

    /// A read ran past the end of the buffer
    #[error("read of {len} bytes at {offset:#x} out of bounds")]
    OutOfBounds {
        /// Read offset
        offset: usize,
        /// Read length
        len: usize,
    },

    /// A module's stack map region is malformed
    #[error("stack map: {0}")]
    StackMap(#[from] StackMapError),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;
