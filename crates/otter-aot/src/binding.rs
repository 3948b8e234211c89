//! Attaching native entry points to bytecode methods.
//!
//! Application files degrade quietly: a file that is not in the container,
//! has a changed checksum or lacks an entry simply runs interpreted. The
//! stub file and the main entry of a bound module are build invariants, and
//! a container that contradicts them is fatal.

use std::sync::Arc;

use otter_aot_elf::{FuncEntryDes, FuncEntryKind};
use otter_aot_frames::fatal;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::bytecode::{BytecodeFile, JsFunction, MethodBinding, MethodLiteral};
use crate::error::AotError;
use crate::file_info::AotFileInfo;
use crate::registry::AotFileRegistry;

/// Final entry index of every bound method, keyed by
/// `(normalized file name, method offset)`
pub type MethodEntryIndexMap = FxHashMap<(String, u32), u32>;

fn binding_for(
    info: &AotFileInfo,
    file_index: u32,
    entry_index: u32,
    entry: &FuncEntryDes,
) -> MethodBinding {
    MethodBinding {
        code_entry: info.code_address(entry),
        is_fast_call: entry.is_fast_call,
        fp_delta: entry.fp_delta,
        file_index,
        entry_index,
    }
}

/// Binds methods of bytecode files to code in loaded `.an` files
#[derive(Debug, Clone, Copy)]
pub struct AotBinder<'a> {
    registry: &'a AotFileRegistry,
    verify_checksum: bool,
}

impl<'a> AotBinder<'a> {
    /// Binder over `registry`, verifying checksums
    pub fn new(registry: &'a AotFileRegistry) -> Self {
        Self {
            registry,
            verify_checksum: true,
        }
    }

    /// Enable or disable the checksum comparison
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Associate `file` with the `.an` container whose path without
    /// extension is `base_name`.
    ///
    /// Returns false, leaving `file` unbound, when the container is not
    /// loaded, does not contain the file, or recorded a different checksum.
    pub fn bind_panda_file_to_container(&self, base_name: &str, file: &BytecodeFile) -> bool {
        if file.is_loaded_aot() {
            return true;
        }
        let Some(file_index) = self.registry.find_by_base_name(base_name) else {
            debug!(
                container = base_name,
                file = file.name(),
                "no AOT file loaded for base name"
            );
            return false;
        };
        let Some(info) = self.registry.file_info(file_index) else {
            return false;
        };
        let Some(module) = info.module_by_name(file.name()) else {
            debug!(
                container = base_name,
                file = file.name(),
                "bytecode file is not compiled into AOT file"
            );
            return false;
        };
        if self.verify_checksum && module.abc_checksum != file.checksum() {
            let err = AotError::ChecksumMismatch {
                file: file.name().to_owned(),
                expected: module.abc_checksum,
                found: file.checksum(),
            };
            warn!(container = base_name, %err, "bytecode file will run interpreted");
            return false;
        }
        file.set_aot_file_info_index(file_index);
        info!(
            container = base_name,
            file = file.name(),
            index = file_index,
            "bound bytecode file to AOT file"
        );
        true
    }

    fn bound_module(&self, file: &BytecodeFile) -> Option<(u32, Arc<AotFileInfo>, u32)> {
        let file_index = file.aot_file_info_index()?;
        let Some(info) = self.registry.file_info(file_index) else {
            warn!(file = file.name(), index = file_index, "bound AOT file is no longer loaded");
            return None;
        };
        let Some(module_index) = info.module_by_name(file.name()).map(|m| m.module_index) else {
            warn!(file = file.name(), index = file_index, "bound AOT file lost its module");
            return None;
        };
        Some((file_index, info, module_index))
    }

    /// Bind `function`, the module function of `file`, to the module's main
    /// entry.
    ///
    /// Returns false when `file` is not bound. A bound module without a
    /// main entry, or whose main entry belongs to another method, is fatal.
    pub fn bind_main_entry(&self, function: &JsFunction, file: &BytecodeFile) -> bool {
        let Some((file_index, info, module_index)) = self.bound_module(file) else {
            return false;
        };
        let method = function.method();
        let Some(entry_index) = info.main_entry_index(module_index) else {
            fatal(format_args!("AOT file has no main entry for {}", file.name()));
        };
        let Some(entry) = info.entry(entry_index) else {
            fatal(format_args!("main entry {entry_index} of {} is out of range", file.name()));
        };
        if entry.id != method.method_offset() {
            fatal(format_args!(
                "main entry of {} is method {:#x}, expected {:#x}",
                file.name(),
                entry.id,
                method.method_offset()
            ));
        }
        let binding = binding_for(&info, file_index, entry_index, entry);
        method.set_binding(binding);
        function.set_binding(*method.binding().unwrap_or(&binding));
        debug!(
            file = file.name(),
            entry = entry_index,
            code = format_args!("{:#x}", binding.code_entry),
            "bound main entry"
        );
        true
    }

    /// Bind `method` (and `function`, when given) to function entry
    /// `entry_index` of the container `file` is bound to.
    ///
    /// A method that already has code keeps it; only the function picks up
    /// the existing binding. Misses are logged and leave both unbound.
    pub fn bind_method_entry(
        &self,
        file: &BytecodeFile,
        function: Option<&JsFunction>,
        method: &MethodLiteral,
        entry_index: u32,
    ) -> bool {
        if let Some(existing) = method.binding() {
            if let Some(function) = function {
                function.set_binding(*existing);
            }
            trace!(method = method.method_offset(), "method already bound");
            return true;
        }
        let Some((file_index, info, module_index)) = self.bound_module(file) else {
            return false;
        };
        let Some(entry) = info.entry(entry_index) else {
            warn!(file = file.name(), entry = entry_index, "AOT entry index out of range");
            return false;
        };
        if entry.kind == FuncEntryKind::Stub
            || entry.module_index != module_index
            || entry.id != method.method_offset()
        {
            warn!(
                file = file.name(),
                entry = entry_index,
                method = format_args!("{:#x}", method.method_offset()),
                "AOT entry belongs to another method"
            );
            return false;
        }
        let binding = binding_for(&info, file_index, entry_index, entry);
        method.set_binding(binding);
        if let Some(function) = function {
            function.set_binding(*method.binding().unwrap_or(&binding));
        }
        trace!(file = file.name(), entry = entry_index, "bound method entry");
        true
    }

    /// Bind `method` to whichever entry of `file`'s module was compiled from it
    pub fn bind_method(
        &self,
        file: &BytecodeFile,
        function: Option<&JsFunction>,
        method: &MethodLiteral,
    ) -> bool {
        if let Some(existing) = method.binding() {
            if let Some(function) = function {
                function.set_binding(*existing);
            }
            return true;
        }
        let Some((_, info, module_index)) = self.bound_module(file) else {
            return false;
        };
        match info.method_entry_index(module_index, method.method_offset()) {
            Some(entry_index) => self.bind_method_entry(file, function, method, entry_index),
            None => {
                debug!(
                    file = file.name(),
                    method = format_args!("{:#x}", method.method_offset()),
                    "method was not compiled"
                );
                false
            }
        }
    }

    /// Entry index of every compiled method of the bound `files`
    pub fn method_entry_index_map<'f>(
        &self,
        files: impl IntoIterator<Item = &'f BytecodeFile>,
    ) -> MethodEntryIndexMap {
        let mut map = MethodEntryIndexMap::default();
        for file in files {
            let Some((_, info, module_index)) = self.bound_module(file) else {
                continue;
            };
            for (index, entry) in info.container().module_func_entries(module_index) {
                if entry.kind == FuncEntryKind::Stub {
                    continue;
                }
                if let Ok(index) = u32::try_from(index) {
                    map.insert((file.name().to_owned(), entry.id), index);
                }
            }
        }
        map
    }
}

/// A runtime stub resolved from the stub file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubEntry {
    /// Stub id
    pub id: u32,
    /// Address of the first instruction
    pub address: usize,
    /// Frame pointer delta
    pub fp_delta: i32,
    /// Fast-call convention
    pub is_fast_call: bool,
}

/// Stub id to entry point, filled once at VM start
#[derive(Debug, Clone, Default)]
pub struct StubEntryTable {
    entries: FxHashMap<u32, StubEntry>,
}

impl StubEntryTable {
    /// Collect the stub entries of `info`.
    ///
    /// Every id in `required` must be present; a missing one means the stub
    /// file and the VM were built from different sources, which is fatal.
    pub fn bind(info: &AotFileInfo, required: &[u32]) -> Self {
        let entries: FxHashMap<u32, StubEntry> = info
            .stub_entries()
            .map(|(_, entry)| {
                (
                    entry.id,
                    StubEntry {
                        id: entry.id,
                        address: info.code_address(entry),
                        fp_delta: entry.fp_delta,
                        is_fast_call: entry.is_fast_call,
                    },
                )
            })
            .collect();
        for id in required {
            if !entries.contains_key(id) {
                fatal(format_args!("stub file has no descriptor for stub {id}"));
            }
        }
        info!(stubs = entries.len(), "bound runtime stubs");
        Self { entries }
    }

    /// Entry of stub `id`
    pub fn get(&self, id: u32) -> Option<&StubEntry> {
        self.entries.get(&id)
    }

    /// Number of stubs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no stubs are bound
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::AotFileKind;
    use otter_aot_elf::{Container, ContainerBuilder, FunctionInput, Machine, ModuleInput};

    fn stub_info() -> AotFileInfo {
        let mut builder = ContainerBuilder::new(Machine::X86_64);
        builder.add_module(
            ModuleInput::new("stubs", 0, vec![0xcc; 0x40])
                .with_function(FunctionInput::new(
                    "CallRuntime",
                    FuncEntryKind::Stub,
                    0,
                    0,
                    0x20,
                ))
                .with_function(
                    FunctionInput::new("JsCall", FuncEntryKind::Stub, 1, 0x20, 0x20)
                        .with_fp_delta(16)
                        .with_fast_call(true),
                ),
        );
        let container = Container::parse(builder.build().unwrap()).unwrap();
        AotFileInfo::from_container(AotFileKind::Stub, container).unwrap()
    }

    #[test]
    fn test_stub_table() {
        let info = stub_info();
        let table = StubEntryTable::bind(&info, &[0, 1]);
        assert_eq!(table.len(), 2);
        let call = table.get(1).unwrap();
        assert_eq!(call.address, info.text_base() + 0x20);
        assert_eq!(call.fp_delta, 16);
        assert!(call.is_fast_call);
        assert!(table.get(2).is_none());
    }

    #[test]
    #[should_panic(expected = "no descriptor for stub 7")]
    fn test_missing_required_stub_is_fatal() {
        StubEntryTable::bind(&stub_info(), &[0, 7]);
    }

    #[test]
    fn test_unbound_file_binds_nothing() {
        let registry = AotFileRegistry::new();
        let binder = AotBinder::new(&registry);
        let file = BytecodeFile::with_checksum("a.abc", 1);
        let method = MethodLiteral::new(0x10);
        assert!(!binder.bind_panda_file_to_container("/missing/a", &file));
        assert!(!binder.bind_method_entry(&file, None, &method, 0));
        assert!(!method.is_aot_code());
        assert!(binder.method_entry_index_map([&file]).is_empty());
    }
}
