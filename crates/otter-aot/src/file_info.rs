//! A validated, loaded container.

use std::path::Path;
use std::sync::Arc;

use otter_aot_elf::{Container, FuncEntryDes, FuncEntryKind, ModuleSectionDes, RegionKind};
use otter_aot_frames::CallSiteResolution;
use otter_aot_stackmap::StackMapParser;
use serde::Serialize;

use crate::error::Result;

/// What a container holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AotFileKind {
    /// Runtime stubs and bytecode handlers
    Stub,
    /// Compiled application modules
    An,
}

/// A container whose stack maps have been checked, plus the address its
/// text is visible at
#[derive(Debug)]
pub struct AotFileInfo {
    kind: AotFileKind,
    container: Container,
    text_base: usize,
    text_size: usize,
    stack_maps: Vec<Arc<[u8]>>,
}

impl AotFileInfo {
    /// Validate every module stack map of `container`
    pub fn from_container(kind: AotFileKind, container: Container) -> Result<Self> {
        let stack_maps = container
            .modules()
            .iter()
            .map(|module| -> Result<Arc<[u8]>> {
                let data = container.module_stack_map(module);
                if !data.is_empty() {
                    StackMapParser::new(data)?.validate()?;
                }
                Ok(Arc::from(data))
            })
            .collect::<Result<Vec<_>>>()?;
        let text = container.text();
        let text_base = text.as_ptr() as usize;
        let text_size = text.len();
        Ok(Self {
            kind,
            container,
            text_base,
            text_size,
            stack_maps,
        })
    }

    /// Open and validate the container at `path`
    pub fn open(path: &Path, kind: AotFileKind, use_mmap: bool) -> Result<Self> {
        Self::from_container(kind, Container::open(path, use_mmap)?)
    }

    /// Container kind
    pub fn kind(&self) -> AotFileKind {
        self.kind
    }

    /// Underlying container
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Address of the first byte of `.text`
    pub fn text_base(&self) -> usize {
        self.text_base
    }

    /// Size of `.text`
    pub fn text_size(&self) -> usize {
        self.text_size
    }

    /// Whether `pc` lies in this container's text
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.text_base && pc - self.text_base < self.text_size
    }

    /// Module descriptors
    pub fn modules(&self) -> &[ModuleSectionDes] {
        self.container.modules()
    }

    /// Module compiled from the normalized bytecode file `abc_name`
    pub fn module_by_name(&self, abc_name: &str) -> Option<&ModuleSectionDes> {
        self.container.module_by_name(abc_name)
    }

    /// Function entry `index`
    pub fn entry(&self, index: u32) -> Option<&FuncEntryDes> {
        self.container.func_entries().get(index as usize)
    }

    /// Address of `entry`'s first instruction
    pub fn code_address(&self, entry: &FuncEntryDes) -> usize {
        self.text_base + entry.code_offset as usize
    }

    /// Entry index of `module_index`'s main function
    pub fn main_entry_index(&self, module_index: u32) -> Option<u32> {
        self.container
            .module_func_entries(module_index)
            .find(|(_, entry)| entry.kind == FuncEntryKind::Main)
            .and_then(|(index, _)| u32::try_from(index).ok())
    }

    /// Entry index of the method at `method_offset` in `module_index`
    pub fn method_entry_index(&self, module_index: u32, method_offset: u32) -> Option<u32> {
        self.container
            .module_func_entries(module_index)
            .find(|(_, entry)| entry.kind != FuncEntryKind::Stub && entry.id == method_offset)
            .and_then(|(index, _)| u32::try_from(index).ok())
    }

    /// Stub entries keyed by stub id
    pub fn stub_entries(&self) -> impl Iterator<Item = (u32, &FuncEntryDes)> + '_ {
        self.container
            .func_entries()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.kind == FuncEntryKind::Stub)
            .filter_map(|(index, entry)| Some((u32::try_from(index).ok()?, entry)))
    }

    /// Stack-map context of a return address into this container.
    ///
    /// The function is found by the address itself for deopt lookups and by
    /// `return_addr - 1` otherwise, so a call that is the last instruction
    /// of a function still resolves to that function. Stack-map pc offsets
    /// are relative to the owning module's text region.
    pub fn call_site_info(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution> {
        let lookup_pc = if is_deopt {
            return_addr
        } else {
            return_addr.checked_sub(1)?
        };
        if !self.contains(lookup_pc) {
            return None;
        }
        let entry = self
            .container
            .func_entry_for_text_offset((lookup_pc - self.text_base) as u64)?;
        let module = self.container.module(entry.module_index)?;
        let text_offset = (return_addr - self.text_base) as u64;
        let pc_offset = text_offset.checked_sub(module.region(RegionKind::Text).offset)?;
        Some(CallSiteResolution {
            stack_map: Arc::clone(self.stack_maps.get(entry.module_index as usize)?),
            pc_offset: u32::try_from(pc_offset).ok()?,
            fp_delta: entry.fp_delta,
            callee_regs: entry.callee_regs.clone(),
        })
    }
}
