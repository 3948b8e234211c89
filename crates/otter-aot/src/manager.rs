//! The VM-facing entry point.
//!
//! One [`AotFileManager`] is owned by each VM instance. It holds the file
//! registry, the stub table, the restored constant pools and the profiler's
//! task map, and answers the queries the bootstrap code, the bytecode
//! loader, the GC and the profiler make.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use otter_aot_frames::{
    CallSiteResolution, CallSiteResolver, FrameIterator, JitCodeLookup, ThreadStack, WalkMode,
};
use otter_aot_snapshot::{Deserializer, GcMode, Heap};
use otter_aot_stackmap::RootVisitor;
use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::ai::{ConstantPool, FrameworkPatchHook, SnapshotResolver};
use crate::binding::{AotBinder, MethodEntryIndexMap, StubEntry, StubEntryTable};
use crate::bytecode::BytecodeFile;
use crate::config::AotConfig;
use crate::error::{AotError, Result};
use crate::file_info::AotFileKind;
use crate::registry::{AotFileRegistry, CodeRange};
use crate::sampler::{Sample, SampleRegistry};

/// Extension of compiled application containers
pub const AN_EXTENSION: &str = "an";
/// Extension of constant-pool snapshots
pub const AI_EXTENSION: &str = "ai";

/// AOT state of one VM instance
pub struct AotFileManager {
    config: AotConfig,
    registry: Arc<AotFileRegistry>,
    stubs: OnceLock<StubEntryTable>,
    snapshots: RwLock<SnapshotResolver>,
    sampler: SampleRegistry,
}

impl std::fmt::Debug for AotFileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotFileManager")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("stubs", &self.stubs.get().map(StubEntryTable::len))
            .field("snapshots", &*self.snapshots.read())
            .finish_non_exhaustive()
    }
}

impl AotFileManager {
    /// Manager configured by `config`
    pub fn new(config: AotConfig) -> Self {
        let registry = AotFileRegistry::new().with_mmap(config.use_mmap);
        let snapshots = SnapshotResolver::new()
            .with_framework_files(config.framework_abc_names.iter().cloned());
        Self {
            config,
            registry: Arc::new(registry),
            stubs: OnceLock::new(),
            snapshots: RwLock::new(snapshots),
            sampler: SampleRegistry::new(),
        }
    }

    /// Hand every framework constant pool to `hook` after the revise pass
    pub fn with_patch_hook(mut self, hook: FrameworkPatchHook) -> Self {
        let snapshots = std::mem::take(self.snapshots.get_mut());
        *self.snapshots.get_mut() = snapshots.with_patch_hook(hook);
        self
    }

    /// Active configuration
    pub fn config(&self) -> &AotConfig {
        &self.config
    }

    /// Shared file registry
    pub fn registry(&self) -> &Arc<AotFileRegistry> {
        &self.registry
    }

    /// Profiler task map
    pub fn sampler(&self) -> &SampleRegistry {
        &self.sampler
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.config.enable_aot {
            Ok(())
        } else {
            Err(AotError::Disabled)
        }
    }

    /// Load the stub container at `path` and bind its stubs.
    ///
    /// Every stub id in `required` must be present in the file; a missing
    /// one is fatal.
    pub fn load_stub_file(&self, path: impl AsRef<Path>, required: &[u32]) -> Result<u32> {
        self.ensure_enabled()?;
        let file_index = self.registry.load(path.as_ref(), AotFileKind::Stub)?;
        let info = self
            .registry
            .file_info(file_index)
            .ok_or(AotError::MissingEntry {
                what: "AOT file",
                id: file_index,
            })?;
        if self.stubs.set(StubEntryTable::bind(&info, required)).is_err() {
            debug!(path = %path.as_ref().display(), "stub table already bound");
        }
        Ok(file_index)
    }

    /// Load `<base>.an`
    pub fn load_an_file(&self, base: &str) -> Result<u32> {
        self.ensure_enabled()?;
        self.registry
            .load(format!("{base}.{AN_EXTENSION}"), AotFileKind::An)
    }

    /// Load `<base>.ai` and restore its constant pools.
    ///
    /// Returns the number of pools restored. A rejected snapshot leaves the
    /// previously restored pools untouched.
    pub fn load_ai_file(&self, base: &str) -> Result<usize> {
        self.ensure_enabled()?;
        let path = format!("{base}.{AI_EXTENSION}");
        if !Path::new(&path).exists() {
            return Err(AotError::FileNotFound { path: path.into() });
        }
        let mut heap = Heap::new(GcMode::Regions);
        let image = Deserializer::new(&mut heap).deserialize_file(&path, self.config.use_mmap)?;
        let count = self
            .snapshots
            .write()
            .deserialize(&heap, &image)
            .inspect_err(|err| warn!(path = %path, %err, "ai file rejected"))?;
        info!(path = %path, pools = count, "loaded ai file");
        Ok(count)
    }

    /// Load whatever the configuration names: the stub file, then the
    /// `.an`/`.ai` pair.
    ///
    /// Failures are logged; the affected code runs interpreted. Returns
    /// whether an `.an` file is loaded afterwards.
    pub fn bootstrap(&self, required_stubs: &[u32]) -> bool {
        if !self.config.enable_aot {
            info!("AOT disabled; running interpreted");
            return false;
        }
        if let Some(stub_file) = &self.config.stub_file {
            if let Err(err) = self.load_stub_file(stub_file, required_stubs) {
                warn!(path = %stub_file.display(), %err, "stub file not loaded");
            }
        }
        let Some(base) = &self.config.aot_file_base else {
            return false;
        };
        if let Err(err) = self.load_an_file(base) {
            warn!(base = %base, %err, "AOT file not loaded");
            return false;
        }
        if let Err(err) = self.load_ai_file(base) {
            warn!(base = %base, %err, "ai file not loaded");
        }
        true
    }

    /// Bound stub `id`
    pub fn stub(&self, id: u32) -> Option<StubEntry> {
        self.stubs.get()?.get(id).copied()
    }

    /// Binder honoring the configured checksum policy
    pub fn binder(&self) -> AotBinder<'_> {
        AotBinder::new(&self.registry).with_checksum_verification(self.config.verify_checksum)
    }

    /// Bind `file` to the configured `.an` file
    pub fn bind_panda_file(&self, file: &BytecodeFile) -> bool {
        if !self.config.enable_aot {
            return false;
        }
        match &self.config.aot_file_base {
            Some(base) => self.binder().bind_panda_file_to_container(base, file),
            None => false,
        }
    }

    /// Whether `pc` is inside a loaded stub file
    pub fn inside_stub(&self, pc: usize) -> bool {
        self.registry.inside_stub(pc)
    }

    /// Whether `pc` is inside a loaded `.an` file
    pub fn inside_aot(&self, pc: usize) -> bool {
        self.registry.inside_aot(pc)
    }

    /// Non-blocking [`Self::inside_aot`] for signal handlers
    pub fn try_inside_aot(&self, pc: usize) -> Option<bool> {
        self.registry.try_inside_aot(pc)
    }

    /// Stack-map context of `return_addr`
    pub fn cal_call_site_info(
        &self,
        return_addr: usize,
        is_deopt: bool,
    ) -> Option<CallSiteResolution> {
        self.registry.call_site_info(return_addr, is_deopt)
    }

    /// Restored constant pool `cp_id` of `file`
    pub fn get_deserialized_constant_pool(
        &self,
        file: &BytecodeFile,
        cp_id: u32,
    ) -> Option<ConstantPool> {
        self.snapshots.read().constant_pool(file.name(), cp_id).cloned()
    }

    /// Resolve every method placeholder of the restored pools from the
    /// bindings of `files`. Call once all of them are bound.
    pub fn revise_after_binding<'f>(
        &self,
        files: impl IntoIterator<Item = &'f BytecodeFile>,
    ) -> usize {
        let map = self.binder().method_entry_index_map(files);
        self.revise_with_map(&map)
    }

    /// Resolve every method placeholder from `map`
    pub fn revise_with_map(&self, map: &MethodEntryIndexMap) -> usize {
        self.snapshots.write().finalize(map)
    }

    /// Frame walker over `stack` resolving call sites through the loaded
    /// files, then through `jit`
    pub fn frames<'a>(
        &'a self,
        stack: &'a ThreadStack,
        jit: Option<&'a dyn JitCodeLookup>,
    ) -> FrameIterator<'a> {
        let iter = FrameIterator::new(stack).with_resolver(self);
        match jit {
            Some(jit) => iter.with_jit_lookup(jit),
            None => iter,
        }
    }

    /// Walk mode for plain unwinding under the configured policy
    pub fn unwind_mode(&self) -> WalkMode {
        if self.config.strict_frame_walk {
            WalkMode::Unwind
        } else {
            WalkMode::HybridUnwind
        }
    }

    /// Report the roots of every frame on `stack`; returns the frame count
    pub fn visit_stack_roots(
        &self,
        stack: &ThreadStack,
        jit: Option<&dyn JitCodeLookup>,
        visitor: &mut dyn RootVisitor,
    ) -> Result<usize> {
        let mut iter = self.frames(stack, jit);
        let mut seen = FxHashSet::default();
        let mut frames = 0;
        while !iter.done() {
            iter.iterate_frame_roots(visitor, &mut seen)?;
            iter.advance(WalkMode::GcVisit);
            frames += 1;
        }
        Ok(frames)
    }

    /// Classify a profiler sample without blocking
    pub fn sample(&self, thread_id: u64, pc: usize) -> Option<Sample> {
        self.sampler.sample(thread_id, pc, &self.registry)
    }

    /// JSON description of the loaded files, stubs and pools
    pub fn dump_aot_info(&self) -> Result<String> {
        let files = self
            .registry
            .entries()
            .into_iter()
            .map(|entry| FileDump {
                index: entry.file_index,
                path: entry.path.display().to_string(),
                kind: entry.kind,
                ref_count: entry.ref_count,
                text_size: entry.info.text_size(),
                modules: entry
                    .info
                    .modules()
                    .iter()
                    .map(|module| ModuleDump {
                        name: module.abc_name.clone(),
                        checksum: module.abc_checksum,
                        functions: entry
                            .info
                            .container()
                            .module_func_entries(module.module_index)
                            .count(),
                    })
                    .collect(),
            })
            .collect();
        let snapshots = self.snapshots.read();
        let dump = AotInfoDump {
            enabled: self.config.enable_aot,
            files,
            code_ranges: self.registry.code_ranges(),
            stubs: self.stubs.get().map_or(0, StubEntryTable::len),
            constant_pools: snapshots.len(),
            pending_patches: snapshots.pending().len(),
            recorded_samples: self.sampler.recorded_samples(),
            dropped_samples: self.sampler.dropped_samples(),
        };
        Ok(serde_json::to_string_pretty(&dump)?)
    }
}

impl CallSiteResolver for AotFileManager {
    fn call_site_info(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution> {
        self.cal_call_site_info(return_addr, is_deopt)
    }
}

#[derive(Serialize)]
struct AotInfoDump {
    enabled: bool,
    files: Vec<FileDump>,
    code_ranges: Vec<CodeRange>,
    stubs: usize,
    constant_pools: usize,
    pending_patches: usize,
    recorded_samples: u64,
    dropped_samples: u64,
}

#[derive(Serialize)]
struct FileDump {
    index: u32,
    path: String,
    kind: AotFileKind,
    ref_count: u32,
    text_size: usize,
    modules: Vec<ModuleDump>,
}

#[derive(Serialize)]
struct ModuleDump {
    name: String,
    checksum: u32,
    functions: usize,
}
