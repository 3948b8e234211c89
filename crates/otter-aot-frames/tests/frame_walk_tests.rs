//! Frame walk tests
//!
//! Chain traversal, per-frame root reporting, call-site resolution through
//! AOT and JIT owners, deopt value recovery and baseline pc mapping over
//! stacks laid out by `StackBuilder`.

use std::cell::Cell;
use std::sync::Arc;

use otter_aot_frames::{
    BASELINE_NATIVE_PC, BaselineCode, BaselinePcMapper, CallSiteResolution, CallSiteResolver,
    FrameError, FrameIterator, FrameType, InterpretedState, JitCode, JitCodeLookup, MethodInfo,
    StackBuilder, ThreadStack, VALUE_HOLE, VALUE_UNDEFINED, WalkMode,
};
use otter_aot_stackmap::{
    CallSiteInfo, CalleeRegAndOffsetVec, DeoptValue, Location, RootVisitor, StackMapBuilder,
    Triple,
};
use rustc_hash::FxHashSet;

const FP: u16 = 6;
const SP: u16 = 7;
const STACK_TOP: usize = 0x10_0000;
const TEXT_START: usize = 0x40_0000;
const TEXT_SIZE: usize = 0x100;
const FUNCTION: u64 = 0x0001_0000_0000_1000;
const OBJECT: u64 = 0x0001_0000_0000_2000;

#[derive(Default)]
struct Recorder {
    roots: Vec<usize>,
    ranges: Vec<(usize, usize)>,
    derived: Vec<(usize, usize, u64)>,
}

impl RootVisitor for Recorder {
    fn visit_root(&mut self, slot: usize) {
        self.roots.push(slot);
    }

    fn visit_range(&mut self, start: usize, end: usize) {
        self.ranges.push((start, end));
    }

    fn visit_derived(&mut self, base_slot: usize, derived_slot: usize, base_value: u64) {
        self.derived.push((base_slot, derived_slot, base_value));
    }
}

/// One loaded AOT text section with its stack map
struct AotText {
    stack_map: Arc<[u8]>,
    deopt_lookups: Cell<u32>,
}

impl AotText {
    fn new(stack_map: Vec<u8>) -> Self {
        Self {
            stack_map: Arc::from(stack_map),
            deopt_lookups: Cell::new(0),
        }
    }
}

impl CallSiteResolver for AotText {
    fn call_site_info(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution> {
        if is_deopt {
            self.deopt_lookups.set(self.deopt_lookups.get() + 1);
        }
        let lookup_pc = if is_deopt {
            return_addr
        } else {
            return_addr.checked_sub(1)?
        };
        if !(TEXT_START..TEXT_START + TEXT_SIZE).contains(&lookup_pc) {
            return None;
        }
        Some(CallSiteResolution {
            stack_map: Arc::clone(&self.stack_map),
            pc_offset: (return_addr - TEXT_START) as u32,
            fp_delta: 0,
            callee_regs: CalleeRegAndOffsetVec::new(),
        })
    }
}

struct NoAotCode;

impl CallSiteResolver for NoAotCode {
    fn call_site_info(&self, _return_addr: usize, _is_deopt: bool) -> Option<CallSiteResolution> {
        None
    }
}

struct JitHeap(JitCode);

impl JitCodeLookup for JitHeap {
    fn find_code(&self, pc: usize) -> Option<JitCode> {
        let code = &self.0;
        (pc >= code.text_start && pc <= code.text_start + code.text_size).then(|| code.clone())
    }
}

fn method(method_id: u32) -> MethodInfo {
    MethodInfo {
        method_id,
        bytecode_base: 0x7000,
    }
}

fn call_site_table() -> Vec<u8> {
    let mut builder = StackMapBuilder::new();
    builder
        .push(
            CallSiteInfo::new(0x10)
                .with_root(Location::new(FP, -32))
                .with_deopt(1, DeoptValue::Constant(-5))
                .with_deopt(2, DeoptValue::Indirect(Location::new(FP, -40)))
                .with_deopt(3, DeoptValue::LargeConstant(1 << 40)),
        )
        .push(CallSiteInfo::new(0x30).with_root(Location::new(SP, 0)));
    builder.build().unwrap()
}

/// Entry frame, a compiled JS function, and a runtime call out of it
/// returning to `TEXT_START + pc_offset`. The compiled frame keeps `OBJECT`
/// in its first spill slot and `99` in its second.
fn compiled_caller(frame_type: FrameType, pc_offset: usize) -> (ThreadStack, usize, usize) {
    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    builder
        .push_entry(FrameType::OptimizedEntryFrame, &[])
        .unwrap();
    let caller = builder
        .push_optimized_js(frame_type, 0x1234, FUNCTION, VALUE_UNDEFINED, &[], 2)
        .unwrap();
    builder.write(caller - 32, OBJECT);
    builder.write(caller - 40, 99);
    let callee = builder
        .push_leave(FrameType::LeaveFrame, TEXT_START + pc_offset, &[])
        .unwrap();
    (builder.build(), caller, callee)
}

fn compiled_caller_roots(iter: &mut FrameIterator<'_>) -> Recorder {
    let mut seen = FxHashSet::default();
    let mut callee_roots = Recorder::default();
    iter.iterate_frame_roots(&mut callee_roots, &mut seen).unwrap();
    iter.advance(WalkMode::GcVisit);
    let mut recorder = Recorder::default();
    iter.iterate_frame_roots(&mut recorder, &mut seen).unwrap();
    recorder
}

#[test]
fn test_walk_terminates_after_chain_length_steps() {
    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    let entry = builder
        .push_entry(FrameType::InterpreterEntryFrame, &[])
        .unwrap();
    let interp = builder
        .push_interpreted(
            FrameType::AsmInterpreterFrame,
            method(1),
            0x7004,
            InterpretedState::default(),
            &[1, 2],
        )
        .unwrap();
    let bridge = builder
        .push_bridge(FrameType::AsmInterpreterBridgeFrame, 0x5000)
        .unwrap();
    let compiled = builder
        .push_optimized_js(
            FrameType::OptimizedJsFunctionFrame,
            0x5100,
            FUNCTION,
            VALUE_UNDEFINED,
            &[7],
            1,
        )
        .unwrap();
    let leave = builder
        .push_leave(FrameType::LeaveFrameWithArgv, TEXT_START + 0x10, &[3])
        .unwrap();
    let stack = builder.build();

    let fps: Vec<usize> = FrameIterator::new(&stack).collect();
    assert_eq!(fps, vec![leave, compiled, bridge, interp, entry]);
    assert!(fps.windows(2).all(|pair| pair[0] < pair[1]));

    let mut iter = FrameIterator::new(&stack);
    let mut steps = 0;
    while !iter.done() {
        iter.advance(WalkMode::GcVisit);
        steps += 1;
    }
    assert_eq!(steps, stack.len());
}

#[test]
fn test_empty_stack_is_done() {
    let stack = StackBuilder::new(Triple::Aarch64, STACK_TOP, 16).build();
    let mut iter = FrameIterator::new(&stack);
    assert!(iter.done());
    assert!(iter.frame().is_none());
    iter.advance(WalkMode::GcVisit);
    assert!(iter.done());
}

#[test]
fn test_js_function_frame_roots() {
    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    let aot = builder
        .push_optimized_js(
            FrameType::OptimizedJsFunctionFrame,
            0x1000,
            FUNCTION,
            VALUE_UNDEFINED,
            &[10, 11, 12],
            0,
        )
        .unwrap();
    let jit = builder
        .push_optimized_js(
            FrameType::FastJitFunctionFrame,
            0x2000,
            FUNCTION,
            OBJECT,
            &[20],
            0,
        )
        .unwrap();
    let stack = builder.build();
    let mut seen = FxHashSet::default();

    let mut recorder = Recorder::default();
    FrameIterator::from_fp(&stack, aot)
        .iterate_frame_roots(&mut recorder, &mut seen)
        .unwrap();
    // machine code slot holds undefined for AOT code
    assert_eq!(recorder.roots, vec![aot - 16]);
    assert_eq!(recorder.ranges, vec![(aot + 16, aot + 40)]);

    let mut recorder = Recorder::default();
    FrameIterator::from_fp(&stack, jit)
        .iterate_frame_roots(&mut recorder, &mut seen)
        .unwrap();
    assert_eq!(recorder.roots, vec![jit - 16, jit - 24]);
    assert_eq!(recorder.ranges, vec![(jit + 16, jit + 24)]);
}

#[test]
fn test_interpreter_roots_depend_on_pc() {
    let state = InterpretedState {
        function: FUNCTION,
        acc: OBJECT,
        ..InterpretedState::default()
    };
    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    let setup = builder
        .push_interpreted(FrameType::InterpreterFrame, method(1), 0, state, &[1, 2, 3])
        .unwrap();
    let running = builder
        .push_interpreted(FrameType::InterpreterFrame, method(1), 0x7010, state, &[4])
        .unwrap();
    let hole_acc = builder
        .push_interpreted(
            FrameType::AsmInterpreterFrame,
            method(2),
            0x7010,
            InterpretedState {
                acc: VALUE_HOLE,
                ..state
            },
            &[],
        )
        .unwrap();
    let stack = builder.build();
    let mut seen = FxHashSet::default();

    let mut recorder = Recorder::default();
    FrameIterator::from_fp(&stack, setup)
        .iterate_frame_roots(&mut recorder, &mut seen)
        .unwrap();
    assert_eq!(recorder.roots, vec![setup - 16, setup - 24]);
    assert_eq!(recorder.ranges.len(), 1);
    let (start, end) = recorder.ranges[0];
    assert_eq!((end - start) / 8, 3);

    let mut recorder = Recorder::default();
    FrameIterator::from_fp(&stack, running)
        .iterate_frame_roots(&mut recorder, &mut seen)
        .unwrap();
    assert_eq!(recorder.roots.len(), 6);
    assert!(recorder.roots.contains(&(running - 32)));

    let mut recorder = Recorder::default();
    FrameIterator::from_fp(&stack, hole_acc)
        .iterate_frame_roots(&mut recorder, &mut seen)
        .unwrap();
    assert_eq!(recorder.roots.len(), 5);
    assert!(!recorder.roots.contains(&(hole_acc - 32)));
    assert!(recorder.ranges.is_empty());
}

#[test]
fn test_stack_map_roots_through_resolver() {
    let (stack, caller, callee) = compiled_caller(FrameType::OptimizedJsFunctionFrame, 0x10);
    let aot = AotText::new(call_site_table());
    let mut iter = FrameIterator::new(&stack).with_resolver(&aot);
    assert_eq!(iter.fp(), Some(callee));

    let recorder = compiled_caller_roots(&mut iter);
    assert_eq!(iter.fp(), Some(caller));
    assert_eq!(iter.return_addr(), Some(TEXT_START + 0x10));
    assert_eq!(iter.call_site().map(|site| site.pc_offset), Some(0x10));
    assert_eq!(recorder.roots, vec![caller - 16, caller - 32]);
    assert!(recorder.derived.is_empty());
    assert_eq!(aot.deopt_lookups.get(), 0);
}

#[test]
fn test_sp_relative_root_uses_callee_frame_top() {
    let (stack, caller, _) = compiled_caller(FrameType::OptimizedJsFunctionFrame, 0x30);
    let aot = AotText::new(call_site_table());
    let mut iter = FrameIterator::new(&stack).with_resolver(&aot);

    let recorder = compiled_caller_roots(&mut iter);
    // the runtime call pushed no arguments, so sp points at the last spill
    assert_eq!(iter.callsite_sp(), caller - 40);
    assert_eq!(recorder.roots, vec![caller - 16, caller - 40]);
}

#[test]
fn test_jit_fallback_when_no_aot_file_owns_the_pc() {
    let (stack, caller, _) = compiled_caller(FrameType::FastJitFunctionFrame, 0x10);
    let heap = JitHeap(JitCode {
        text_start: TEXT_START,
        text_size: TEXT_SIZE,
        stack_map: Arc::from(call_site_table()),
        fp_delta: 0,
        callee_regs: CalleeRegAndOffsetVec::new(),
    });
    let mut iter = FrameIterator::new(&stack)
        .with_resolver(&NoAotCode)
        .with_jit_lookup(&heap);

    let recorder = compiled_caller_roots(&mut iter);
    assert_eq!(recorder.roots, vec![caller - 16, caller - 32]);
}

#[test]
fn test_unresolved_call_site_reports_no_stack_map_roots() {
    let (stack, caller, _) = compiled_caller(FrameType::OptimizedJsFunctionFrame, 0x20);
    let aot = AotText::new(call_site_table());
    let mut iter = FrameIterator::new(&stack).with_resolver(&aot);

    let recorder = compiled_caller_roots(&mut iter);
    assert!(iter.call_site().is_some());
    assert_eq!(recorder.roots, vec![caller - 16]);

    let mut iter = FrameIterator::new(&stack);
    let recorder = compiled_caller_roots(&mut iter);
    assert!(iter.call_site().is_none());
    assert_eq!(recorder.roots, vec![caller - 16]);
}

#[test]
fn test_unwind_skips_call_site_resolution() {
    let (stack, caller, _) = compiled_caller(FrameType::OptimizedJsFunctionFrame, 0x10);
    let aot = AotText::new(call_site_table());
    let mut iter = FrameIterator::new(&stack).with_resolver(&aot);
    iter.advance(WalkMode::Unwind);
    assert_eq!(iter.fp(), Some(caller));
    assert_eq!(iter.return_addr(), Some(TEXT_START + 0x10));
    assert_eq!(iter.callsite_sp(), 0);
    assert!(iter.call_site().is_none());
}

#[test]
fn test_deopt_values_at_call_site() {
    let (stack, caller, callee) = compiled_caller(FrameType::OptimizedJsFunctionFrame, 0x10);
    let aot = AotText::new(call_site_table());
    let mut iter = FrameIterator::new(&stack).with_resolver(&aot);
    assert_eq!(
        iter.deopt_value(1),
        Err(FrameError::NoDeoptCallSite { fp: callee })
    );

    iter.advance(WalkMode::Deopt);
    assert_eq!(iter.fp(), Some(caller));
    assert_eq!(aot.deopt_lookups.get(), 1);
    assert_eq!(iter.deopt_value(1), Ok(Some(-5i64 as u64)));
    assert_eq!(iter.deopt_value(2), Ok(Some(99)));
    assert_eq!(iter.deopt_value(3), Ok(Some(1 << 40)));
    assert_eq!(iter.deopt_value(4), Ok(None));
    assert_eq!(
        iter.deopt_values(),
        Ok(vec![(1, -5i64 as u64), (2, 99), (3, 1 << 40)])
    );
}

#[test]
fn test_hybrid_walk_stops_at_native_frame() {
    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    builder
        .push_entry(FrameType::InterpreterEntryFrame, &[])
        .unwrap();
    builder.push_native(4).unwrap();
    let leave = builder
        .push_leave(FrameType::LeaveFrame, 0x9000, &[])
        .unwrap();
    let stack = builder.build();

    let mut iter = FrameIterator::new(&stack);
    let mut visited = Vec::new();
    while let Some(fp) = iter.fp() {
        visited.push(fp);
        iter.advance(WalkMode::HybridUnwind);
    }
    assert_eq!(visited, vec![leave]);
}

#[test]
#[should_panic(expected = "unknown frame type")]
fn test_strict_walk_rejects_unknown_frame() {
    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    builder
        .push_entry(FrameType::InterpreterEntryFrame, &[])
        .unwrap();
    builder.push_native(4).unwrap();
    builder
        .push_leave(FrameType::LeaveFrame, 0x9000, &[])
        .unwrap();
    let stack = builder.build();

    let _ = FrameIterator::new(&stack).collect::<Vec<_>>();
}

#[test]
fn test_bytecode_offset_of_interpreter_frames() {
    let mut mapper = BaselinePcMapper::new();
    mapper.insert(
        7,
        BaselineCode {
            native_start: 0x2000,
            pc_table: vec![(0x10, 0), (0x24, 2), (0x40, 5)],
        },
    );

    let mut builder = StackBuilder::new(Triple::X86_64, STACK_TOP, 512);
    let interpreted = builder
        .push_interpreted(
            FrameType::InterpreterFrame,
            method(3),
            0x700c,
            InterpretedState::default(),
            &[],
        )
        .unwrap();
    let baseline = builder
        .push_interpreted(
            FrameType::AsmInterpreterFrame,
            method(7),
            BASELINE_NATIVE_PC,
            InterpretedState::default(),
            &[],
        )
        .unwrap();
    builder.push_baseline_builtin(0x2011).unwrap();
    let stack = builder.build();

    let mut iter = FrameIterator::new(&stack);
    assert_eq!(iter.bytecode_offset(&mapper), None);
    iter.advance(WalkMode::Unwind);
    assert_eq!(iter.fp(), Some(baseline));
    assert_eq!(iter.bytecode_offset(&mapper), Some(2));
    iter.advance(WalkMode::Unwind);
    assert_eq!(iter.fp(), Some(interpreted));
    assert_eq!(iter.bytecode_offset(&mapper), Some(12));

    let setup = FrameIterator::from_fp(&stack, interpreted);
    assert_eq!(setup.frame_type(), Some(FrameType::InterpreterFrame));
}
