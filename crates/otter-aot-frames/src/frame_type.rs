//! Frame type tags and their layout families.

/// Every kind of frame that can appear on a managed thread's stack
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Runtime stub compiled ahead of time
    OptimizedFrame = 0,
    /// Embedder call into AOT code
    OptimizedEntryFrame,
    /// AOT-compiled JS function
    OptimizedJsFunctionFrame,
    /// AOT-compiled JS function using the fast-call convention
    OptimizedJsFastCallFunctionFrame,
    /// Argument adaptation before an AOT call
    OptimizedJsFunctionArgsConfigFrame,
    /// Spread-argument unfolding before an AOT call
    OptimizedJsFunctionUnfoldArgvFrame,
    /// Fast JIT compiled JS function
    FastJitFunctionFrame,
    /// Fast JIT compiled JS function using the fast-call convention
    FastJitFastCallFunctionFrame,
    /// AOT code calling an assembly trampoline
    AsmBridgeFrame,
    /// Compiled code calling into the runtime
    LeaveFrame,
    /// Compiled code calling into the runtime with an argument vector
    LeaveFrameWithArgv,
    /// Compiled code calling a native builtin
    BuiltinCallLeaveFrame,
    /// Portable interpreter
    InterpreterFrame,
    /// Assembly interpreter
    AsmInterpreterFrame,
    /// Interpreter running a constructor
    InterpreterConstructorFrame,
    /// Interpreter fast path for `new`
    InterpreterFastNewFrame,
    /// Embedder call into the interpreter
    InterpreterEntryFrame,
    /// Embedder call into the assembly interpreter
    AsmInterpreterEntryFrame,
    /// Compiled code calling into the assembly interpreter
    AsmInterpreterBridgeFrame,
    /// Interpreter calling a native builtin
    InterpreterBuiltinFrame,
    /// Native builtin
    BuiltinFrame,
    /// Native builtin with an argument vector
    BuiltinFrameWithArgv,
    /// Embedder call into a native builtin
    BuiltinEntryFrame,
    /// Builtin frame pushed while reporting a stack overflow
    BuiltinFrameWithArgvStackOverflowFrame,
    /// Baseline JIT calling a builtin
    BaselineBuiltinFrame,
}

/// Frame families sharing one payload layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameLayout {
    /// Interpreter frames
    Interpreted,
    /// Stubs and argument adaptors
    Optimized,
    /// Compiled JS functions, regular and fast-call
    OptimizedJsFunction,
    /// Baseline JIT builtin calls
    BaselineBuiltin,
    /// Calls out of compiled code into the runtime
    Leave,
    /// Trampolines between code generations
    Bridge,
    /// Native builtins
    Builtin,
    /// Transitions from embedder code
    Entry,
}

impl FrameLayout {
    /// Words between `fp` and the caller's stack pointer: the saved frame
    /// pointer, plus the return address for frames entered by a call
    pub fn header_words(self) -> usize {
        match self {
            Self::Interpreted | Self::Entry => 1,
            _ => 2,
        }
    }
}

impl FrameType {
    /// All frame types
    pub const ALL: [FrameType; 25] = [
        Self::OptimizedFrame,
        Self::OptimizedEntryFrame,
        Self::OptimizedJsFunctionFrame,
        Self::OptimizedJsFastCallFunctionFrame,
        Self::OptimizedJsFunctionArgsConfigFrame,
        Self::OptimizedJsFunctionUnfoldArgvFrame,
        Self::FastJitFunctionFrame,
        Self::FastJitFastCallFunctionFrame,
        Self::AsmBridgeFrame,
        Self::LeaveFrame,
        Self::LeaveFrameWithArgv,
        Self::BuiltinCallLeaveFrame,
        Self::InterpreterFrame,
        Self::AsmInterpreterFrame,
        Self::InterpreterConstructorFrame,
        Self::InterpreterFastNewFrame,
        Self::InterpreterEntryFrame,
        Self::AsmInterpreterEntryFrame,
        Self::AsmInterpreterBridgeFrame,
        Self::InterpreterBuiltinFrame,
        Self::BuiltinFrame,
        Self::BuiltinFrameWithArgv,
        Self::BuiltinEntryFrame,
        Self::BuiltinFrameWithArgvStackOverflowFrame,
        Self::BaselineBuiltinFrame,
    ];

    /// Decode a raw tag
    pub fn from_raw(raw: u8) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    /// Layout family
    pub fn layout(self) -> FrameLayout {
        match self {
            Self::InterpreterFrame
            | Self::AsmInterpreterFrame
            | Self::InterpreterConstructorFrame
            | Self::InterpreterFastNewFrame => FrameLayout::Interpreted,
            Self::OptimizedFrame
            | Self::OptimizedJsFunctionArgsConfigFrame
            | Self::OptimizedJsFunctionUnfoldArgvFrame => FrameLayout::Optimized,
            Self::OptimizedJsFunctionFrame
            | Self::OptimizedJsFastCallFunctionFrame
            | Self::FastJitFunctionFrame
            | Self::FastJitFastCallFunctionFrame => FrameLayout::OptimizedJsFunction,
            Self::BaselineBuiltinFrame => FrameLayout::BaselineBuiltin,
            Self::LeaveFrame | Self::LeaveFrameWithArgv | Self::BuiltinCallLeaveFrame => {
                FrameLayout::Leave
            }
            Self::AsmBridgeFrame | Self::AsmInterpreterBridgeFrame => FrameLayout::Bridge,
            Self::InterpreterBuiltinFrame
            | Self::BuiltinFrame
            | Self::BuiltinFrameWithArgv
            | Self::BuiltinFrameWithArgvStackOverflowFrame => FrameLayout::Builtin,
            Self::OptimizedEntryFrame
            | Self::InterpreterEntryFrame
            | Self::AsmInterpreterEntryFrame
            | Self::BuiltinEntryFrame => FrameLayout::Entry,
        }
    }

    /// Whether the frame runs compiled code described by a stack map
    pub fn has_stack_map(self) -> bool {
        matches!(
            self,
            Self::OptimizedFrame
                | Self::OptimizedJsFunctionFrame
                | Self::OptimizedJsFastCallFunctionFrame
                | Self::FastJitFunctionFrame
                | Self::FastJitFastCallFunctionFrame
        )
    }

    /// Whether the frame uses the fast-call convention
    pub fn is_fast_call(self) -> bool {
        matches!(
            self,
            Self::OptimizedJsFastCallFunctionFrame | Self::FastJitFastCallFunctionFrame
        )
    }

    /// Whether the frame belongs to the fast JIT tier rather than an AOT file
    pub fn is_jit(self) -> bool {
        matches!(
            self,
            Self::FastJitFunctionFrame | Self::FastJitFastCallFunctionFrame
        )
    }

    /// Whether the frame is an interpreter frame
    pub fn is_interpreted(self) -> bool {
        self.layout() == FrameLayout::Interpreted
    }

    /// Whether the frame marks entry from embedder code
    pub fn is_entry(self) -> bool {
        self.layout() == FrameLayout::Entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_tags_round_trip() {
        for (raw, frame_type) in FrameType::ALL.iter().enumerate() {
            assert_eq!(*frame_type as u8 as usize, raw);
            assert_eq!(FrameType::from_raw(raw as u8), Some(*frame_type));
        }
        assert_eq!(FrameType::from_raw(25), None);
    }

    #[test]
    fn test_stack_map_frames_are_compiled() {
        for frame_type in FrameType::ALL {
            if frame_type.has_stack_map() {
                assert!(matches!(
                    frame_type.layout(),
                    FrameLayout::Optimized | FrameLayout::OptimizedJsFunction
                ));
            }
        }
    }
}
