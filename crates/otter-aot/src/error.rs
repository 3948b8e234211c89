//! AOT manager errors

use std::path::PathBuf;

use otter_aot_elf::ContainerError;
use otter_aot_frames::FrameError;
use otter_aot_snapshot::SnapshotError;
use otter_aot_stackmap::StackMapError;
use thiserror::Error;

/// Errors surfaced by loading, binding and snapshot resolution.
///
/// None of these reach JS code: callers log them and run the affected
/// bytecode in the interpreter.
#[derive(Debug, Error)]
pub enum AotError {
    /// Container file failed validation
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// `.ai` snapshot failed to restore
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A stack map inside a container is malformed
    #[error("stack map error: {0}")]
    StackMap(#[from] StackMapError),

    /// A frame could not be read during a stack walk
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Requested file does not exist
    #[error("file not found: {}", path.display())]
    FileNotFound {
        /// Path that was looked up
        path: PathBuf,
    },

    /// Bytecode file changed after it was compiled
    #[error("checksum mismatch for {file}: container has {expected:#010x}, file has {found:#010x}")]
    ChecksumMismatch {
        /// Normalized bytecode file name
        file: String,
        /// Checksum recorded in the container
        expected: u32,
        /// Checksum of the loaded bytecode file
        found: u32,
    },

    /// A function entry, module or file index is absent
    #[error("missing {what} {id}")]
    MissingEntry {
        /// What was looked up
        what: &'static str,
        /// Index or id that was looked up
        id: u32,
    },

    /// A non-blocking caller found the registry locked
    #[error("registry is locked")]
    LockContended,

    /// AOT is switched off by configuration
    #[error("AOT is disabled")]
    Disabled,

    /// `.ai` snapshot restored but its roots do not have the constant-pool shape
    #[error("malformed ai file: {0}")]
    MalformedAiFile(&'static str),

    /// TOML configuration could not be parsed
    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    /// Diagnostic dump could not be serialized
    #[error("dump error: {0}")]
    Dump(#[from] serde_json::Error),
}

/// Result type for AOT manager operations
pub type Result<T> = std::result::Result<T, AotError>;
