//! Frame walker errors

use std::fmt::Display;

use otter_aot_stackmap::StackMapError;
use thiserror::Error;

use crate::frame_type::FrameType;

/// Errors produced while building or inspecting frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Stack map of the current call site could not be decoded
    #[error("stack map error: {0}")]
    StackMap(#[from] StackMapError),

    /// A frame type was pushed with the layout of another frame family
    #[error("{frame_type:?} does not use this frame layout")]
    LayoutMismatch {
        /// Offending frame type
        frame_type: FrameType,
    },

    /// The simulated stack has no room for the frame
    #[error("stack overflow while pushing {words} words")]
    StackOverflow {
        /// Words requested
        words: usize,
    },

    /// Deopt values were requested for a frame with no resolved call site
    #[error("frame at {fp:#x} has no deopt call site")]
    NoDeoptCallSite {
        /// Frame pointer
        fp: usize,
    },

    /// A slot address could not be read
    #[error("slot {address:#x} is not readable")]
    UnreadableSlot {
        /// Slot address
        address: usize,
    },
}

/// Result type for frame operations
pub type Result<T> = std::result::Result<T, FrameError>;

/// Report a broken build or runtime invariant and abort.
///
/// Release builds use `panic = "abort"`, so this terminates the process
/// after the message has been logged.
#[track_caller]
pub fn fatal(message: impl Display) -> ! {
    tracing::error!(target: "otter::aot", "FATAL: {message}");
    panic!("FATAL: {message}");
}
