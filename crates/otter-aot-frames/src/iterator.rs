//! Frame iteration.
//!
//! [`FrameIterator::advance`] moves from a frame to its caller and records
//! the return address into the caller. In the visiting modes it also
//! records the caller's call-site stack pointer and, when the caller runs
//! compiled code, resolves the stack map of that call site so
//! [`FrameIterator::iterate_frame_roots`] can report the caller's live
//! references.

use otter_aot_stackmap::{
    DeoptValue, FrameContext, RootVisitor, SlotMemory, StackMapParser, visit_roots,
};
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::error::{FrameError, Result, fatal};
use crate::frame::{BASELINE_NATIVE_PC, Frame, VALUE_HOLE, VALUE_UNDEFINED};
use crate::frame_type::FrameType;
use crate::resolver::{BaselinePcMapper, CallSiteResolution, CallSiteResolver, JitCodeLookup};
use crate::stack::ThreadStack;

/// What a walk collects besides the frame chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WalkMode {
    /// Frame chain only
    Unwind,
    /// Collect GC roots
    GcVisit,
    /// Frame chain of a stack mixing managed and native frames; an unknown
    /// frame ends the walk
    HybridUnwind,
    /// Like `GcVisit`, resolving deopt call sites
    Deopt,
}

impl WalkMode {
    /// Whether call-site side data is computed
    pub fn visits(self) -> bool {
        matches!(self, Self::GcVisit | Self::Deopt)
    }
}

/// Iterator over the frames of one stopped thread
pub struct FrameIterator<'a> {
    stack: &'a ThreadStack,
    resolver: Option<&'a dyn CallSiteResolver>,
    jit: Option<&'a dyn JitCodeLookup>,
    current: Option<usize>,
    return_addr: Option<usize>,
    callsite_sp: usize,
    call_site: Option<CallSiteResolution>,
}

impl<'a> FrameIterator<'a> {
    /// Start at the youngest frame of `stack`
    pub fn new(stack: &'a ThreadStack) -> Self {
        Self::from_fp(stack, stack.top_fp())
    }

    /// Start at the frame whose frame pointer is `fp`
    pub fn from_fp(stack: &'a ThreadStack, fp: usize) -> Self {
        Self {
            stack,
            resolver: None,
            jit: None,
            current: (fp != 0).then_some(fp),
            return_addr: None,
            callsite_sp: 0,
            call_site: None,
        }
    }

    /// Resolve call sites in loaded AOT files through `resolver`
    pub fn with_resolver(mut self, resolver: &'a dyn CallSiteResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Fall back to JIT code objects through `jit`
    pub fn with_jit_lookup(mut self, jit: &'a dyn JitCodeLookup) -> Self {
        self.jit = Some(jit);
        self
    }

    /// Whether the walk is over
    pub fn done(&self) -> bool {
        self.current.is_none()
    }

    /// Frame pointer of the current frame
    pub fn fp(&self) -> Option<usize> {
        self.current
    }

    /// Current frame; `None` when done or when the frame is unknown
    pub fn frame(&self) -> Option<&'a Frame> {
        self.stack.frame(self.current?)
    }

    /// Current frame type
    pub fn frame_type(&self) -> Option<FrameType> {
        self.frame().map(Frame::frame_type)
    }

    /// Return address into the current frame's code, recorded from its callee
    pub fn return_addr(&self) -> Option<usize> {
        self.return_addr
    }

    /// Current frame's stack pointer at the call to its callee
    pub fn callsite_sp(&self) -> usize {
        self.callsite_sp
    }

    /// Resolved call site of the current frame
    pub fn call_site(&self) -> Option<&CallSiteResolution> {
        self.call_site.as_ref()
    }

    /// Move to the caller of the current frame
    pub fn advance(&mut self, mode: WalkMode) {
        let Some(fp) = self.current else {
            return;
        };
        let stack = self.stack;
        let Some(frame) = stack.frame(fp) else {
            self.unknown_frame(fp, mode);
            return;
        };

        self.return_addr = frame.return_addr();
        self.callsite_sp = if mode.visits() {
            frame.caller_sp(fp)
        } else {
            0
        };
        self.call_site = None;

        let prev = frame.prev_fp();
        if prev == 0 {
            self.current = None;
            return;
        }
        debug_assert!(prev > fp, "frame chain not ascending: {fp:#x} -> {prev:#x}");
        let Some(prev_frame) = stack.frame(prev) else {
            self.unknown_frame(prev, mode);
            return;
        };
        self.current = Some(prev);

        if mode.visits() && prev_frame.frame_type().has_stack_map() {
            self.call_site = match self.return_addr {
                Some(return_addr) => self.resolve(return_addr, mode == WalkMode::Deopt),
                None => None,
            };
        }
    }

    fn unknown_frame(&mut self, fp: usize, mode: WalkMode) {
        if mode == WalkMode::HybridUnwind {
            trace!(fp, "hybrid walk stopped at a frame it does not know");
            self.current = None;
            return;
        }
        fatal(format_args!("unknown frame type at fp {fp:#x}"));
    }

    fn resolve(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution> {
        if let Some(site) = self
            .resolver
            .and_then(|resolver| resolver.call_site_info(return_addr, is_deopt))
        {
            return Some(site);
        }
        if let Some(site) = self
            .jit
            .and_then(|jit| jit.find_code(return_addr))
            .and_then(|code| code.resolve(return_addr, is_deopt))
        {
            return Some(site);
        }
        if cfg!(debug_assertions) {
            debug!(return_addr, "no stack map for return address; frame has no roots");
        }
        None
    }

    /// Report the live references of the current frame.
    ///
    /// `seen` deduplicates stack-map base slots across the whole walk.
    pub fn iterate_frame_roots(
        &self,
        visitor: &mut dyn RootVisitor,
        seen: &mut FxHashSet<usize>,
    ) -> Result<()> {
        let (Some(fp), Some(frame)) = (self.current, self.frame()) else {
            return Ok(());
        };
        let memory = self.stack.memory();
        match frame {
            Frame::Interpreted(frame) => {
                if !frame.vregs.is_empty() {
                    visitor.visit_range(frame.vregs.start, frame.vregs.end);
                }
                visitor.visit_root(frame.function);
                visitor.visit_root(frame.this);
                if frame.pc != 0 {
                    // a hole is not a heap reference
                    if memory.read_word(frame.acc) != Some(VALUE_HOLE) {
                        visitor.visit_root(frame.acc);
                    }
                    visitor.visit_root(frame.env);
                    visitor.visit_root(frame.constpool);
                    visitor.visit_root(frame.profile_type_info);
                }
            }
            Frame::OptimizedJsFunction(frame) => {
                visitor.visit_root(frame.function);
                if memory.read_word(frame.machine_code) != Some(VALUE_UNDEFINED) {
                    visitor.visit_root(frame.machine_code);
                }
                if !frame.argv.is_empty() {
                    visitor.visit_range(frame.argv.start, frame.argv.end);
                }
                self.visit_stack_map(fp, visitor, seen)?;
            }
            Frame::Optimized(_) => self.visit_stack_map(fp, visitor, seen)?,
            Frame::Builtin(frame) => {
                visitor.visit_root(frame.function);
                if !frame.argv.is_empty() {
                    visitor.visit_range(frame.argv.start, frame.argv.end);
                }
            }
            Frame::Leave(frame) => {
                if !frame.argv.is_empty() {
                    visitor.visit_range(frame.argv.start, frame.argv.end);
                }
            }
            Frame::Entry(frame) => {
                if !frame.argv.is_empty() {
                    visitor.visit_range(frame.argv.start, frame.argv.end);
                }
            }
            Frame::Bridge(_) | Frame::BaselineBuiltin(_) => {}
        }
        Ok(())
    }

    fn visit_stack_map(
        &self,
        fp: usize,
        visitor: &mut dyn RootVisitor,
        seen: &mut FxHashSet<usize>,
    ) -> Result<()> {
        if !self.frame_type().is_some_and(FrameType::has_stack_map) {
            return Ok(());
        }
        let Some(site) = &self.call_site else {
            return Ok(());
        };
        let parser = StackMapParser::new(&site.stack_map)?;
        let Some(header) = parser.find(site.pc_offset) else {
            if cfg!(debug_assertions) {
                debug!(
                    pc_offset = site.pc_offset,
                    "call site missing from stack map; frame has no roots"
                );
            }
            return Ok(());
        };
        let entries = parser.stack_map(&header)?;
        let ctx = FrameContext::new(self.stack.triple(), fp, self.callsite_sp)
            .with_callee_regs(&site.callee_regs);
        visit_roots(&entries, &ctx, self.stack.memory(), visitor, seen)?;
        Ok(())
    }

    /// Value of virtual register `id` at the current deopt call site
    pub fn deopt_value(&self, id: i32) -> Result<Option<u64>> {
        let (fp, site) = self.deopt_site()?;
        let parser = StackMapParser::new(&site.stack_map)?;
        let Some(header) = parser.find(site.pc_offset) else {
            return Ok(None);
        };
        match parser.deopt_value(&header, id)? {
            Some(value) => self.materialize(fp, site, value).map(Some),
            None => Ok(None),
        }
    }

    /// All `(id, value)` pairs recorded at the current deopt call site
    pub fn deopt_values(&self) -> Result<Vec<(i32, u64)>> {
        let (fp, site) = self.deopt_site()?;
        let parser = StackMapParser::new(&site.stack_map)?;
        let Some(header) = parser.find(site.pc_offset) else {
            return Ok(Vec::new());
        };
        parser
            .deopts(&header)?
            .into_iter()
            .map(|entry| Ok((entry.id, self.materialize(fp, site, entry.value)?)))
            .collect()
    }

    fn deopt_site(&self) -> Result<(usize, &CallSiteResolution)> {
        let fp = self.current.unwrap_or(0);
        match (self.current, &self.call_site) {
            (Some(fp), Some(site)) => Ok((fp, site)),
            _ => Err(FrameError::NoDeoptCallSite { fp }),
        }
    }

    fn materialize(&self, fp: usize, site: &CallSiteResolution, value: DeoptValue) -> Result<u64> {
        Ok(match value {
            DeoptValue::Constant(value) => value as i64 as u64,
            DeoptValue::LargeConstant(value) => value as u64,
            DeoptValue::Indirect(location) => {
                let ctx = FrameContext::new(self.stack.triple(), fp, self.callsite_sp)
                    .with_callee_regs(&site.callee_regs);
                let address = ctx.slot_address(location, self.stack.memory())?;
                self.stack
                    .memory()
                    .read_word(address)
                    .ok_or(FrameError::UnreadableSlot { address })?
            }
        })
    }

    /// Bytecode offset the current interpreter frame is executing.
    ///
    /// Frames running baseline code store [`BASELINE_NATIVE_PC`] instead of
    /// a bytecode pc; their offset is recovered from the native return
    /// address recorded while advancing from the callee.
    pub fn bytecode_offset(&self, mapper: &BaselinePcMapper) -> Option<u32> {
        let Some(Frame::Interpreted(frame)) = self.frame() else {
            return None;
        };
        match frame.pc {
            0 => None,
            BASELINE_NATIVE_PC => mapper.bytecode_offset(frame.method.method_id, self.return_addr?),
            pc => u32::try_from(pc.checked_sub(frame.method.bytecode_base)?).ok(),
        }
    }
}

impl Iterator for FrameIterator<'_> {
    type Item = usize;

    /// Frame pointers in strict unwind order
    fn next(&mut self) -> Option<usize> {
        let fp = self.current?;
        self.advance(WalkMode::Unwind);
        Some(fp)
    }
}
