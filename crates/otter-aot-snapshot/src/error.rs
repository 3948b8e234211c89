//! Snapshot errors

use thiserror::Error;

/// Errors produced while writing or restoring a heap snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A read ran past the end of the snapshot
    #[error("snapshot truncated at offset {offset}")]
    Truncated {
        /// Offset of the failed read
        offset: usize,
    },

    /// The file does not start with the snapshot magic
    #[error("not a snapshot file")]
    BadMagic,

    /// The snapshot was written by an incompatible format version
    #[error("snapshot version {found} does not match {expected}")]
    VersionMismatch {
        /// Version this build reads
        expected: u32,
        /// Version recorded in the file
        found: u32,
    },

    /// The snapshot was written for a heap with a different space layout
    #[error("snapshot gc mode {found} does not match heap gc mode {expected}")]
    GcModeMismatch {
        /// Mode of the receiving heap
        expected: u32,
        /// Mode recorded in the file
        found: u32,
    },

    /// Body checksum does not match the header
    #[error("snapshot checksum {found:#010x} does not match {expected:#010x}")]
    ChecksumMismatch {
        /// Checksum recorded in the header
        expected: u32,
        /// Checksum of the body as read
        found: u32,
    },

    /// Nothing to serialize or restore
    #[error("snapshot has no root objects")]
    NoRootObjects,

    /// Unknown object class byte
    #[error("unknown object class {0}")]
    BadClass(u8),

    /// Unknown value tag
    #[error("unknown value tag {0}")]
    BadTag(u64),

    /// An encoded reference does not name a serialized object or string
    #[error("encoded reference {0:#x} does not resolve")]
    BadReference(u64),

    /// A live value references an object the heap does not contain
    #[error("object {0} is not allocated")]
    DanglingObject(u32),

    /// String kind prefix is neither line nor constant
    #[error("unknown string kind {0}")]
    BadStringKind(u64),

    /// Line string payload is not UTF-8
    #[error("string {index} is not valid UTF-8")]
    BadString {
        /// Position in the string region
        index: usize,
    },

    /// Objects of one space did not fill the recorded region size
    #[error("space {space} holds {found} bytes, header says {expected}")]
    RegionSizeMismatch {
        /// Space bucket
        space: usize,
        /// Size recorded in the header
        expected: u64,
        /// Size consumed while reading
        found: u64,
    },

    /// An object has more fields than the encoding can hold
    #[error("object has {0} fields")]
    TooManyFields(usize),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;
