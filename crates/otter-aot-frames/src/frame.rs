//! Typed frame payloads.
//!
//! Each variant of [`Frame`] starts with the shared [`FrameBase`]. Fields
//! that hold tagged values are stored as slot addresses so root visitors
//! can update them in place.

use std::ops::Range;

use crate::frame_type::{FrameLayout, FrameType};

/// Bytes per stack slot
pub const WORD_SIZE: usize = 8;

/// Stack encoding of `undefined`
pub const VALUE_UNDEFINED: u64 = 0x7FF8_0000_0000_0000;

/// Stack encoding of an array hole; also the value of an unwritten slot
pub const VALUE_HOLE: u64 = 0;

/// Interpreter `pc` value meaning "running baseline code, ask the pc mapper"
pub const BASELINE_NATIVE_PC: usize = usize::MAX;

/// Address of one stack slot
pub type Slot = usize;

/// Fields every frame has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBase {
    /// Frame type tag
    pub frame_type: FrameType,
    /// Frame pointer of the caller, 0 for the outermost frame
    pub prev_fp: usize,
}

/// The bytecode method an interpreter frame executes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    /// Method id within its bytecode file
    pub method_id: u32,
    /// Address of the method's first bytecode
    pub bytecode_base: usize,
}

/// Interpreter frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretedFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Current bytecode address, 0 while the frame is being set up
    pub pc: usize,
    /// Method being executed
    pub method: MethodInfo,
    /// Function object slot
    pub function: Slot,
    /// `this` slot
    pub this: Slot,
    /// Accumulator slot
    pub acc: Slot,
    /// Lexical environment slot
    pub env: Slot,
    /// Constant pool slot
    pub constpool: Slot,
    /// Profile type info slot
    pub profile_type_info: Slot,
    /// Virtual registers
    pub vregs: Range<Slot>,
}

/// Stub or argument adaptor frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Return address into the caller
    pub return_addr: usize,
}

/// Compiled JS function frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedJsFunctionFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Return address into the caller
    pub return_addr: usize,
    /// Function object slot
    pub function: Slot,
    /// Machine code object slot, `undefined` for AOT code
    pub machine_code: Slot,
    /// Stack arguments; empty for fast-call frames
    pub argv: Range<Slot>,
}

/// Baseline JIT calling a builtin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineBuiltinFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Return address into the baseline code
    pub return_addr: usize,
}

/// Compiled code calling into the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Return address into the compiled caller
    pub return_addr: usize,
    /// Runtime call arguments
    pub argv: Range<Slot>,
}

/// Trampoline between code generations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Return address into the caller
    pub return_addr: usize,
}

/// Native builtin frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinFrame {
    /// Shared fields
    pub base: FrameBase,
    /// Return address into the caller
    pub return_addr: usize,
    /// Builtin function slot
    pub function: Slot,
    /// Arguments, including `new.target` and `this`
    pub argv: Range<Slot>,
}

/// Transition from embedder code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFrame {
    /// Shared fields; `prev_fp` is the last managed frame before the
    /// embedder frames, or 0
    pub base: FrameBase,
    /// Arguments passed by the embedder
    pub argv: Range<Slot>,
}

/// One activation record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Interpreter frames
    Interpreted(InterpretedFrame),
    /// Stubs and argument adaptors
    Optimized(OptimizedFrame),
    /// Compiled JS functions
    OptimizedJsFunction(OptimizedJsFunctionFrame),
    /// Baseline builtin calls
    BaselineBuiltin(BaselineBuiltinFrame),
    /// Runtime calls
    Leave(LeaveFrame),
    /// Trampolines
    Bridge(BridgeFrame),
    /// Native builtins
    Builtin(BuiltinFrame),
    /// Embedder transitions
    Entry(EntryFrame),
}

impl Frame {
    /// Shared fields
    pub fn base(&self) -> &FrameBase {
        match self {
            Self::Interpreted(frame) => &frame.base,
            Self::Optimized(frame) => &frame.base,
            Self::OptimizedJsFunction(frame) => &frame.base,
            Self::BaselineBuiltin(frame) => &frame.base,
            Self::Leave(frame) => &frame.base,
            Self::Bridge(frame) => &frame.base,
            Self::Builtin(frame) => &frame.base,
            Self::Entry(frame) => &frame.base,
        }
    }

    /// Frame type tag
    pub fn frame_type(&self) -> FrameType {
        self.base().frame_type
    }

    /// Caller's frame pointer
    pub fn prev_fp(&self) -> usize {
        self.base().prev_fp
    }

    /// Layout family of the payload
    pub fn layout(&self) -> FrameLayout {
        match self {
            Self::Interpreted(_) => FrameLayout::Interpreted,
            Self::Optimized(_) => FrameLayout::Optimized,
            Self::OptimizedJsFunction(_) => FrameLayout::OptimizedJsFunction,
            Self::BaselineBuiltin(_) => FrameLayout::BaselineBuiltin,
            Self::Leave(_) => FrameLayout::Leave,
            Self::Bridge(_) => FrameLayout::Bridge,
            Self::Builtin(_) => FrameLayout::Builtin,
            Self::Entry(_) => FrameLayout::Entry,
        }
    }

    /// Address the frame returns to, if it was called from machine code
    pub fn return_addr(&self) -> Option<usize> {
        match self {
            Self::Optimized(frame) => Some(frame.return_addr),
            Self::OptimizedJsFunction(frame) => Some(frame.return_addr),
            Self::BaselineBuiltin(frame) => Some(frame.return_addr),
            Self::Leave(frame) => Some(frame.return_addr),
            Self::Bridge(frame) => Some(frame.return_addr),
            Self::Builtin(frame) => Some(frame.return_addr),
            Self::Interpreted(_) | Self::Entry(_) => None,
        }
    }

    /// Stack arguments pushed by the caller
    pub fn argv(&self) -> Option<&Range<Slot>> {
        match self {
            Self::OptimizedJsFunction(frame) => Some(&frame.argv),
            Self::Leave(frame) => Some(&frame.argv),
            Self::Builtin(frame) => Some(&frame.argv),
            Self::Entry(frame) => Some(&frame.argv),
            _ => None,
        }
    }

    /// Caller's stack pointer at the call that created this frame at `fp`.
    ///
    /// The saved frame pointer sits at `fp`, followed by the return address
    /// when the layout has one; arguments the caller pushed lie above them.
    pub fn caller_sp(&self, fp: usize) -> usize {
        let fixed = fp + self.layout().header_words() * WORD_SIZE;
        match self.argv() {
            Some(argv) if argv.end > fixed => argv.end,
            _ => fixed,
        }
    }
}
