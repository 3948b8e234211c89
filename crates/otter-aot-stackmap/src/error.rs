//! Stack map errors

use thiserror::Error;

/// Errors produced while encoding or decoding a stack map section
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackMapError {
    /// A read ran past the end of the buffer
    #[error("stack map truncated at offset {offset}")]
    Truncated {
        /// Offset of the failed read
        offset: usize,
    },

    /// A LEB128 value does not fit in 64 bits
    #[error("LEB128 value overflows at offset {offset}")]
    Leb128Overflow {
        /// Offset of the first byte of the value
        offset: usize,
    },

    /// Call sites must be strictly ascending by pc offset
    #[error("call sites not sorted: {previous:#x} followed by {current:#x}")]
    UnsortedCallSites {
        /// Pc offset of the preceding call site
        previous: u32,
        /// Pc offset that broke the ordering
        current: u32,
    },

    /// Two deopt entries of one call site share a virtual register id
    #[error("duplicate deopt id {id} at call site {pc_offset:#x}")]
    DuplicateDeoptId {
        /// Call site pc offset
        pc_offset: u32,
        /// Repeated virtual register id
        id: i32,
    },

    /// Deopt kind byte is not one of the known kinds
    #[error("unknown deopt kind {0}")]
    UnknownDeoptKind(u8),

    /// A derived location was announced but the entry count ran out
    #[error("stack map at {pc_offset:#x} has an unpaired derived location")]
    UnpairedEntry {
        /// Call site pc offset
        pc_offset: u32,
    },

    /// A count or offset does not fit its fixed-width header field
    #[error("{what} ({value}) does not fit its header field")]
    FieldOverflow {
        /// Name of the field
        what: &'static str,
        /// Offending value
        value: u64,
    },

    /// A payload offset points outside the section
    #[error("offset {offset} lies outside the {size}-byte section")]
    OutOfSection {
        /// Offending offset
        offset: usize,
        /// Section size
        size: usize,
    },

    /// A resolved slot address cannot be read
    #[error("slot {address:#x} is not readable")]
    UnreadableSlot {
        /// Slot address
        address: usize,
    },

    /// A location names a register that has no stack address in the frame
    #[error("register {reg} has no stack address in this frame")]
    UnresolvableLocation {
        /// DWARF register number
        reg: u16,
    },
}

/// Result type for stack map operations
pub type Result<T> = std::result::Result<T, StackMapError>;
