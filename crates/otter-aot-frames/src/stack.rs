//! Stack memory and the frame table of one thread.
//!
//! The stack grows down. A frame pushed by [`StackBuilder`] looks like:
//!
//! ```text
//! higher   argv[n-1] .. argv[0]     pushed by the caller
//!          return address           frames called from machine code
//! fp ->    caller fp
//!          frame type tag
//!          fixed slots              function, this, ...
//! lower    spill slots / vregs
//! ```

use std::ops::Range;

use otter_aot_stackmap::{SlotMemory, Triple};
use rustc_hash::FxHashMap;

use crate::error::{FrameError, Result};
use crate::frame::{
    BaselineBuiltinFrame, BridgeFrame, BuiltinFrame, EntryFrame, Frame, FrameBase,
    InterpretedFrame, LeaveFrame, MethodInfo, OptimizedFrame, OptimizedJsFunctionFrame, Slot,
    VALUE_UNDEFINED, WORD_SIZE,
};
use crate::frame_type::{FrameLayout, FrameType};

/// Word-addressed memory backing one thread stack
#[derive(Debug, Clone)]
pub struct StackMemory {
    low: usize,
    words: Vec<u64>,
}

impl StackMemory {
    /// Zeroed memory covering `[top - words * WORD_SIZE, top)`
    pub fn new(top: usize, words: usize) -> Self {
        Self {
            low: top.saturating_sub(words * WORD_SIZE),
            words: vec![0; words],
        }
    }

    /// Lowest address
    pub fn low(&self) -> usize {
        self.low
    }

    /// One past the highest address
    pub fn top(&self) -> usize {
        self.low + self.words.len() * WORD_SIZE
    }

    fn index(&self, address: usize) -> Option<usize> {
        let offset = address.checked_sub(self.low)?;
        if offset % WORD_SIZE != 0 {
            return None;
        }
        let index = offset / WORD_SIZE;
        (index < self.words.len()).then_some(index)
    }

    /// Store `value` at `address`; false if the address is not a slot
    pub fn write_word(&mut self, address: usize, value: u64) -> bool {
        match self.index(address) {
            Some(index) => {
                self.words[index] = value;
                true
            }
            None => false,
        }
    }
}

impl SlotMemory for StackMemory {
    fn read_word(&self, address: usize) -> Option<u64> {
        self.index(address).map(|index| self.words[index])
    }
}

/// A stopped thread: its stack memory plus typed frames keyed by frame pointer
#[derive(Debug, Clone)]
pub struct ThreadStack {
    triple: Triple,
    memory: StackMemory,
    frames: FxHashMap<usize, Frame>,
    top_fp: usize,
}

impl ThreadStack {
    /// Register numbering of the thread's code
    pub fn triple(&self) -> Triple {
        self.triple
    }

    /// Stack memory
    pub fn memory(&self) -> &StackMemory {
        &self.memory
    }

    /// Stack memory, for root visitors that move objects
    pub fn memory_mut(&mut self) -> &mut StackMemory {
        &mut self.memory
    }

    /// Frame whose frame pointer is `fp`
    pub fn frame(&self, fp: usize) -> Option<&Frame> {
        self.frames.get(&fp)
    }

    /// Frame pointer of the youngest frame, 0 for an empty stack
    pub fn top_fp(&self) -> usize {
        self.top_fp
    }

    /// Number of managed frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether no managed frame was pushed
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Values of an interpreter frame's fixed slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpretedState {
    /// Function object
    pub function: u64,
    /// `this`
    pub this: u64,
    /// Accumulator
    pub acc: u64,
    /// Lexical environment
    pub env: u64,
    /// Constant pool
    pub constpool: u64,
    /// Profile type info
    pub profile_type_info: u64,
}

impl Default for InterpretedState {
    fn default() -> Self {
        Self {
            function: VALUE_UNDEFINED,
            this: VALUE_UNDEFINED,
            acc: VALUE_UNDEFINED,
            env: VALUE_UNDEFINED,
            constpool: VALUE_UNDEFINED,
            profile_type_info: VALUE_UNDEFINED,
        }
    }
}

/// Lays out frames oldest first, the way a thread would push them
#[derive(Debug)]
pub struct StackBuilder {
    triple: Triple,
    memory: StackMemory,
    sp: usize,
    frames: FxHashMap<usize, Frame>,
    last_fp: usize,
}

impl StackBuilder {
    /// Empty stack of `words` slots ending at `top`
    pub fn new(triple: Triple, top: usize, words: usize) -> Self {
        let memory = StackMemory::new(top, words);
        Self {
            triple,
            sp: memory.top(),
            memory,
            frames: FxHashMap::default(),
            last_fp: 0,
        }
    }

    /// Current stack pointer
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Frame pointer of the most recently pushed frame
    pub fn last_fp(&self) -> usize {
        self.last_fp
    }

    /// Overwrite a slot
    pub fn write(&mut self, slot: Slot, value: u64) -> bool {
        self.memory.write_word(slot, value)
    }

    fn push_word(&mut self, value: u64) -> Result<Slot> {
        let slot = self
            .sp
            .checked_sub(WORD_SIZE)
            .filter(|slot| *slot >= self.memory.low())
            .ok_or(FrameError::StackOverflow { words: 1 })?;
        self.sp = slot;
        self.memory.write_word(slot, value);
        Ok(slot)
    }

    /// Push `values` so that `values[0]` ends up at the lowest address
    fn push_words(&mut self, values: &[u64]) -> Result<Range<Slot>> {
        let end = self.sp;
        if end - self.memory.low() < values.len() * WORD_SIZE {
            return Err(FrameError::StackOverflow {
                words: values.len(),
            });
        }
        for &value in values.iter().rev() {
            self.push_word(value)?;
        }
        Ok(self.sp..end)
    }

    fn open(
        &mut self,
        frame_type: FrameType,
        layout: FrameLayout,
        return_addr: Option<usize>,
    ) -> Result<(usize, FrameBase)> {
        if frame_type.layout() != layout {
            return Err(FrameError::LayoutMismatch { frame_type });
        }
        if let Some(return_addr) = return_addr {
            self.push_word(return_addr as u64)?;
        }
        let fp = self.push_word(self.last_fp as u64)?;
        self.push_word(frame_type as u64)?;
        let base = FrameBase {
            frame_type,
            prev_fp: self.last_fp,
        };
        Ok((fp, base))
    }

    fn close(&mut self, fp: usize, frame: Frame) -> usize {
        self.frames.insert(fp, frame);
        self.last_fp = fp;
        fp
    }

    /// Push an interpreter frame
    pub fn push_interpreted(
        &mut self,
        frame_type: FrameType,
        method: MethodInfo,
        pc: usize,
        state: InterpretedState,
        vregs: &[u64],
    ) -> Result<usize> {
        let (fp, base) = self.open(frame_type, FrameLayout::Interpreted, None)?;
        let function = self.push_word(state.function)?;
        let this = self.push_word(state.this)?;
        let acc = self.push_word(state.acc)?;
        let env = self.push_word(state.env)?;
        let constpool = self.push_word(state.constpool)?;
        let profile_type_info = self.push_word(state.profile_type_info)?;
        let vregs = self.push_words(vregs)?;
        Ok(self.close(
            fp,
            Frame::Interpreted(InterpretedFrame {
                base,
                pc,
                method,
                function,
                this,
                acc,
                env,
                constpool,
                profile_type_info,
                vregs,
            }),
        ))
    }

    /// Push a stub or argument adaptor frame with `spill_words` zeroed spill slots
    pub fn push_optimized(
        &mut self,
        frame_type: FrameType,
        return_addr: usize,
        spill_words: usize,
    ) -> Result<usize> {
        let (fp, base) = self.open(frame_type, FrameLayout::Optimized, Some(return_addr))?;
        self.push_words(&vec![0; spill_words])?;
        Ok(self.close(fp, Frame::Optimized(OptimizedFrame { base, return_addr })))
    }

    /// Push a compiled JS function frame.
    ///
    /// Fast-call frames take no stack arguments.
    pub fn push_optimized_js(
        &mut self,
        frame_type: FrameType,
        return_addr: usize,
        function: u64,
        machine_code: u64,
        args: &[u64],
        spill_words: usize,
    ) -> Result<usize> {
        if frame_type.is_fast_call() && !args.is_empty() {
            return Err(FrameError::LayoutMismatch { frame_type });
        }
        let argv = self.push_words(args)?;
        let (fp, base) = self.open(
            frame_type,
            FrameLayout::OptimizedJsFunction,
            Some(return_addr),
        )?;
        let function = self.push_word(function)?;
        let machine_code = self.push_word(machine_code)?;
        self.push_words(&vec![0; spill_words])?;
        Ok(self.close(
            fp,
            Frame::OptimizedJsFunction(OptimizedJsFunctionFrame {
                base,
                return_addr,
                function,
                machine_code,
                argv,
            }),
        ))
    }

    /// Push a baseline builtin frame
    pub fn push_baseline_builtin(&mut self, return_addr: usize) -> Result<usize> {
        let (fp, base) = self.open(
            FrameType::BaselineBuiltinFrame,
            FrameLayout::BaselineBuiltin,
            Some(return_addr),
        )?;
        Ok(self.close(
            fp,
            Frame::BaselineBuiltin(BaselineBuiltinFrame { base, return_addr }),
        ))
    }

    /// Push a runtime call frame
    pub fn push_leave(
        &mut self,
        frame_type: FrameType,
        return_addr: usize,
        args: &[u64],
    ) -> Result<usize> {
        let argv = self.push_words(args)?;
        let (fp, base) = self.open(frame_type, FrameLayout::Leave, Some(return_addr))?;
        Ok(self.close(
            fp,
            Frame::Leave(LeaveFrame {
                base,
                return_addr,
                argv,
            }),
        ))
    }

    /// Push a trampoline frame
    pub fn push_bridge(&mut self, frame_type: FrameType, return_addr: usize) -> Result<usize> {
        let (fp, base) = self.open(frame_type, FrameLayout::Bridge, Some(return_addr))?;
        Ok(self.close(fp, Frame::Bridge(BridgeFrame { base, return_addr })))
    }

    /// Push a native builtin frame
    pub fn push_builtin(
        &mut self,
        frame_type: FrameType,
        return_addr: usize,
        function: u64,
        args: &[u64],
    ) -> Result<usize> {
        let argv = self.push_words(args)?;
        let (fp, base) = self.open(frame_type, FrameLayout::Builtin, Some(return_addr))?;
        let function = self.push_word(function)?;
        Ok(self.close(
            fp,
            Frame::Builtin(BuiltinFrame {
                base,
                return_addr,
                function,
                argv,
            }),
        ))
    }

    /// Push an entry frame linked to the last managed frame
    pub fn push_entry(&mut self, frame_type: FrameType, args: &[u64]) -> Result<usize> {
        let argv = self.push_words(args)?;
        let (fp, base) = self.open(frame_type, FrameLayout::Entry, None)?;
        Ok(self.close(fp, Frame::Entry(EntryFrame { base, argv })))
    }

    /// Push `words` slots of a foreign frame the walker does not know.
    ///
    /// The next managed frame links to it.
    pub fn push_native(&mut self, words: usize) -> Result<usize> {
        let fp = self.push_word(self.last_fp as u64)?;
        self.push_words(&vec![0; words])?;
        self.last_fp = fp;
        Ok(fp)
    }

    /// Finish; the last pushed frame is the youngest
    pub fn build(self) -> ThreadStack {
        ThreadStack {
            triple: self.triple,
            memory: self.memory,
            frames: self.frames,
            top_fp: self.last_fp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_bounds() {
        let mut memory = StackMemory::new(0x1000, 4);
        assert_eq!(memory.low(), 0x1000 - 32);
        assert!(memory.write_word(0x1000 - 8, 7));
        assert_eq!(memory.read_word(0x1000 - 8), Some(7));
        assert_eq!(memory.read_word(0x1000), None);
        assert_eq!(memory.read_word(0x1000 - 7), None);
        assert!(!memory.write_word(0x0fd0, 1));
    }

    #[test]
    fn test_frame_layout() {
        let mut builder = StackBuilder::new(Triple::X86_64, 0x8000, 64);
        let fp = builder
            .push_leave(FrameType::LeaveFrame, 0x4444, &[1, 2, 3])
            .unwrap();
        let stack = builder.build();
        let Some(Frame::Leave(frame)) = stack.frame(fp) else {
            panic!("leave frame expected");
        };
        assert_eq!(frame.argv, fp + 16..fp + 40);
        assert_eq!(stack.memory().read_word(frame.argv.start), Some(1));
        assert_eq!(stack.memory().read_word(fp + 8), Some(0x4444));
        assert_eq!(stack.memory().read_word(fp), Some(0));
        assert_eq!(
            stack.memory().read_word(fp - 8),
            Some(FrameType::LeaveFrame as u64)
        );
        assert_eq!(stack.frame(fp).unwrap().caller_sp(fp), fp + 40);
    }

    #[test]
    fn test_caller_sp_without_return_address() {
        let mut builder = StackBuilder::new(Triple::X86_64, 0x8000, 64);
        let entry = builder
            .push_entry(FrameType::InterpreterEntryFrame, &[])
            .unwrap();
        let method = MethodInfo {
            method_id: 1,
            bytecode_base: 0x7000,
        };
        let interp = builder
            .push_interpreted(
                FrameType::InterpreterFrame,
                method,
                0x7004,
                InterpretedState::default(),
                &[],
            )
            .unwrap();
        let bridge = builder
            .push_bridge(FrameType::AsmInterpreterBridgeFrame, 0x5000)
            .unwrap();
        let stack = builder.build();
        assert_eq!(entry, 0x8000 - 8);
        assert_eq!(stack.frame(entry).unwrap().caller_sp(entry), 0x8000);
        assert_eq!(stack.frame(interp).unwrap().caller_sp(interp), interp + 8);
        assert_eq!(stack.frame(bridge).unwrap().caller_sp(bridge), bridge + 16);
    }

    #[test]
    fn test_layout_mismatch() {
        let mut builder = StackBuilder::new(Triple::X86_64, 0x8000, 64);
        assert_eq!(
            builder.push_bridge(FrameType::LeaveFrame, 0),
            Err(FrameError::LayoutMismatch {
                frame_type: FrameType::LeaveFrame
            })
        );
        assert!(
            builder
                .push_optimized_js(
                    FrameType::OptimizedJsFastCallFunctionFrame,
                    0,
                    0,
                    VALUE_UNDEFINED,
                    &[1],
                    0
                )
                .is_err()
        );
    }

    #[test]
    fn test_overflow() {
        let mut builder = StackBuilder::new(Triple::X86_64, 0x8000, 4);
        assert!(matches!(
            builder.push_leave(FrameType::LeaveFrame, 0, &[0; 8]),
            Err(FrameError::StackOverflow { .. })
        ));
    }
}
