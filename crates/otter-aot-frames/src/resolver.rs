//! Seams to the code owners: AOT files, the JIT code heap and the baseline
//! compiler.

use std::sync::Arc;

use otter_aot_stackmap::CalleeRegAndOffsetVec;
use rustc_hash::FxHashMap;

/// Stack-map context of one return address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteResolution {
    /// Stack-map section covering the code
    pub stack_map: Arc<[u8]>,
    /// Return address relative to the start of the code the stack map describes
    pub pc_offset: u32,
    /// Frame pointer delta of the function holding the call site
    pub fp_delta: i32,
    /// Callee-saved registers spilled by that function
    pub callee_regs: CalleeRegAndOffsetVec,
}

/// Maps return addresses in loaded AOT files to stack maps
pub trait CallSiteResolver {
    /// Call-site context of `return_addr`, or `None` when no loaded AOT
    /// function contains it.
    ///
    /// Deopt lookups use the address as is; ordinary lookups search for
    /// `return_addr - 1` so a call in the last instruction of a function
    /// still resolves to that function.
    fn call_site_info(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution>;
}

/// A machine code object produced by the JIT and never written to a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitCode {
    /// First instruction address
    pub text_start: usize,
    /// Code size in bytes
    pub text_size: usize,
    /// Embedded stack map, pc offsets relative to `text_start`
    pub stack_map: Arc<[u8]>,
    /// Frame pointer delta
    pub fp_delta: i32,
    /// Callee-saved registers spilled in the prologue
    pub callee_regs: CalleeRegAndOffsetVec,
}

impl JitCode {
    /// Call-site context of `return_addr` inside this object
    pub fn resolve(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution> {
        let lookup_pc = if is_deopt {
            return_addr
        } else {
            return_addr.checked_sub(1)?
        };
        if lookup_pc < self.text_start || lookup_pc - self.text_start >= self.text_size {
            return None;
        }
        Some(CallSiteResolution {
            stack_map: Arc::clone(&self.stack_map),
            pc_offset: u32::try_from(return_addr - self.text_start).ok()?,
            fp_delta: self.fp_delta,
            callee_regs: self.callee_regs.clone(),
        })
    }
}

/// The heap's "which code object contains this address" query
pub trait JitCodeLookup {
    /// Code object containing `pc`
    fn find_code(&self, pc: usize) -> Option<JitCode>;
}

/// Native code of one baseline-compiled method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaselineCode {
    /// First instruction address
    pub native_start: usize,
    /// `(native offset, bytecode offset)`, ascending by native offset; each
    /// native offset is the end of the code emitted for that bytecode
    pub pc_table: Vec<(u32, u32)>,
}

/// Side table turning baseline native pcs back into bytecode offsets
#[derive(Debug, Default)]
pub struct BaselinePcMapper {
    methods: FxHashMap<u32, BaselineCode>,
}

impl BaselinePcMapper {
    /// Empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Register baseline code for `method_id`
    pub fn insert(&mut self, method_id: u32, code: BaselineCode) {
        self.methods.insert(method_id, code);
    }

    /// Bytecode offset executing at `native_pc` in `method_id`'s baseline code
    pub fn bytecode_offset(&self, method_id: u32, native_pc: usize) -> Option<u32> {
        let code = self.methods.get(&method_id)?;
        let offset = u32::try_from(native_pc.checked_sub(code.native_start)?).ok()?;
        let index = code
            .pc_table
            .partition_point(|&(native_end, _)| native_end < offset);
        code.pc_table
            .get(index)
            .map(|&(_, bytecode_offset)| bytecode_offset)
    }
}
