//! Frame walking for threads that mix interpreter, AOT and JIT frames.
//!
//! A stopped thread is described by a [`ThreadStack`]: raw stack memory plus
//! a typed [`Frame`] for every managed activation. [`FrameIterator`] walks
//! the chain from the youngest frame outwards. During a GC walk it resolves
//! each compiled frame's call site through a [`CallSiteResolver`] (loaded
//! AOT files) or a [`JitCodeLookup`] (the JIT code heap) and reports the
//! frame's live reference slots to a [`RootVisitor`].
//!
//! # Example
//!
//! ```
//! use otter_aot_frames::{FrameIterator, FrameType, StackBuilder};
//! use otter_aot_stackmap::Triple;
//!
//! let mut builder = StackBuilder::new(Triple::X86_64, 0x10_0000, 256);
//! builder.push_entry(FrameType::InterpreterEntryFrame, &[]).unwrap();
//! builder.push_leave(FrameType::LeaveFrame, 0x4000, &[1, 2]).unwrap();
//! let stack = builder.build();
//!
//! assert_eq!(FrameIterator::new(&stack).count(), 2);
//! ```
//!
//! [`RootVisitor`]: otter_aot_stackmap::RootVisitor

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod error;
pub mod frame;
pub mod frame_type;
pub mod iterator;
pub mod resolver;
pub mod stack;

pub use error::{FrameError, Result, fatal};
pub use frame::{
    BASELINE_NATIVE_PC, BaselineBuiltinFrame, BridgeFrame, BuiltinFrame, EntryFrame, Frame,
    FrameBase, InterpretedFrame, LeaveFrame, MethodInfo, OptimizedFrame,
    OptimizedJsFunctionFrame, Slot, VALUE_HOLE, VALUE_UNDEFINED, WORD_SIZE,
};
pub use frame_type::{FrameLayout, FrameType};
pub use iterator::{FrameIterator, WalkMode};
pub use resolver::{
    BaselineCode, BaselinePcMapper, CallSiteResolution, CallSiteResolver, JitCode, JitCodeLookup,
};
pub use stack::{InterpretedState, StackBuilder, StackMemory, ThreadStack};
