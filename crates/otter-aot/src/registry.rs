//! Catalogue of loaded containers.
//!
//! Loads and releases take the write lock; everything else reads. The
//! text ranges of all loaded containers are kept in one list sorted by base
//! address and rebuilt only when the set of files changes, so classifying a
//! pc is a binary search. [`AotFileRegistry::try_inside_aot`] and
//! [`AotFileRegistry::try_inside_stub`] never block and are the only
//! queries a signal handler may use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use otter_aot_frames::{CallSiteResolution, CallSiteResolver};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AotError, Result};
use crate::file_info::{AotFileInfo, AotFileKind};

/// One loaded container
#[derive(Debug, Clone)]
pub struct AotFileEntry {
    /// Stable handle
    pub file_index: u32,
    /// Path the file was loaded from
    pub path: PathBuf,
    /// Container kind
    pub kind: AotFileKind,
    /// Checksum of every bytecode file compiled into the container
    pub checksums: FxHashMap<String, u32>,
    /// Parsed container
    pub info: Arc<AotFileInfo>,
    /// Number of outstanding loads
    pub ref_count: u32,
}

impl AotFileEntry {
    /// Path without its extension, the name `.an`/`.ai` pairs share
    pub fn base_name(&self) -> String {
        self.path.with_extension("").to_string_lossy().into_owned()
    }
}

/// Text range of one loaded container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CodeRange {
    /// First byte
    pub base: usize,
    /// Size in bytes
    pub size: usize,
    /// Owning file
    pub file_index: u32,
    /// Owning file's kind
    pub kind: AotFileKind,
}

impl CodeRange {
    fn contains(&self, pc: usize) -> bool {
        pc >= self.base && pc - self.base < self.size
    }
}

fn find_range(ranges: &[CodeRange], pc: usize) -> Option<&CodeRange> {
    let index = ranges.partition_point(|range| range.base <= pc);
    ranges
        .get(index.checked_sub(1)?)
        .filter(|range| range.contains(pc))
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: Vec<Option<AotFileEntry>>,
    by_path: FxHashMap<PathBuf, u32>,
    ranges: Vec<CodeRange>,
}

impl RegistryState {
    fn rebuild_ranges(&mut self) {
        self.ranges = self
            .entries
            .iter()
            .flatten()
            .filter(|entry| entry.info.text_size() > 0)
            .map(|entry| CodeRange {
                base: entry.info.text_base(),
                size: entry.info.text_size(),
                file_index: entry.file_index,
                kind: entry.kind,
            })
            .collect();
        self.ranges.sort_by_key(|range| range.base);
    }

    fn entry(&self, file_index: u32) -> Option<&AotFileEntry> {
        self.entries.get(file_index as usize)?.as_ref()
    }

    fn bump(&mut self, path: &Path) -> Option<u32> {
        let index = *self.by_path.get(path)?;
        let entry = self.entries.get_mut(index as usize)?.as_mut()?;
        entry.ref_count += 1;
        debug!(
            path = %path.display(),
            index,
            ref_count = entry.ref_count,
            "AOT file already loaded"
        );
        Some(index)
    }

    fn classify(&self, pc: usize) -> Option<AotFileKind> {
        find_range(&self.ranges, pc).map(|range| range.kind)
    }
}

/// Process-wide set of loaded containers
#[derive(Debug, Default)]
pub struct AotFileRegistry {
    state: RwLock<RegistryState>,
    use_mmap: bool,
}

impl AotFileRegistry {
    /// Empty registry reading files into memory
    pub fn new() -> Self {
        Self::default()
    }

    /// Memory-map files instead of reading them
    pub fn with_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Load the container at `path`, or find it if it is already loaded.
    ///
    /// Returns the file's stable index. The entry is published only after
    /// the whole file validated.
    pub fn load(&self, path: impl AsRef<Path>, kind: AotFileKind) -> Result<u32> {
        let path = path.as_ref();
        if let Some(index) = self.state.write().bump(path) {
            return Ok(index);
        }
        if !path.exists() {
            warn!(path = %path.display(), "AOT file not found");
            return Err(AotError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let info = AotFileInfo::open(path, kind, self.use_mmap).inspect_err(|err| {
            warn!(path = %path.display(), %err, "AOT file rejected");
        })?;
        Ok(self.insert(path, info))
    }

    /// Publish an already validated container under `path`
    pub fn insert(&self, path: impl AsRef<Path>, info: AotFileInfo) -> u32 {
        let path = path.as_ref();
        let mut state = self.state.write();
        // another thread may have won the race while the file was parsed
        if let Some(index) = state.bump(path) {
            return index;
        }
        let file_index = state.entries.len() as u32;
        let checksums = info
            .modules()
            .iter()
            .map(|module| (module.abc_name.clone(), module.abc_checksum))
            .collect();
        info!(
            path = %path.display(),
            index = file_index,
            kind = ?info.kind(),
            modules = info.modules().len(),
            text_size = info.text_size(),
            "loaded AOT file"
        );
        state.entries.push(Some(AotFileEntry {
            file_index,
            path: path.to_path_buf(),
            kind: info.kind(),
            checksums,
            info: Arc::new(info),
            ref_count: 1,
        }));
        state.by_path.insert(path.to_path_buf(), file_index);
        state.rebuild_ranges();
        file_index
    }

    /// Drop one reference to `file_index`; the file is unloaded with the last.
    ///
    /// Returns false for an unknown index.
    pub fn release(&self, file_index: u32) -> bool {
        let mut state = self.state.write();
        let Some(slot) = state.entries.get_mut(file_index as usize) else {
            return false;
        };
        let Some(entry) = slot.as_mut() else {
            return false;
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return true;
        }
        let path = entry.path.clone();
        *slot = None;
        state.by_path.remove(&path);
        state.rebuild_ranges();
        info!(path = %path.display(), index = file_index, "unloaded AOT file");
        true
    }

    /// Loaded container `file_index`
    pub fn file_info(&self, file_index: u32) -> Option<Arc<AotFileInfo>> {
        self.state
            .read()
            .entry(file_index)
            .map(|entry| Arc::clone(&entry.info))
    }

    /// Registry entry `file_index`
    pub fn entry(&self, file_index: u32) -> Option<AotFileEntry> {
        self.state.read().entry(file_index).cloned()
    }

    /// Index of the loaded `.an` file whose path without extension is `base_name`
    pub fn find_by_base_name(&self, base_name: &str) -> Option<u32> {
        self.state
            .read()
            .entries
            .iter()
            .flatten()
            .find(|entry| entry.kind == AotFileKind::An && entry.base_name() == base_name)
            .map(|entry| entry.file_index)
    }

    /// Whether some loaded `.an` file was compiled from `abc_name` with
    /// exactly `checksum`
    pub fn check_checksum(&self, abc_name: &str, checksum: u32) -> bool {
        let state = self.state.read();
        let mut seen = false;
        for entry in state.entries.iter().flatten() {
            match entry.checksums.get(abc_name) {
                Some(&expected) if expected == checksum => return true,
                Some(&expected) => {
                    seen = true;
                    warn!(
                        file = abc_name,
                        expected = format_args!("{expected:#010x}"),
                        found = format_args!("{checksum:#010x}"),
                        container = %entry.path.display(),
                        "bytecode file changed since AOT compilation"
                    );
                }
                None => {}
            }
        }
        if !seen {
            debug!(file = abc_name, "bytecode file is not compiled into any loaded AOT file");
        }
        false
    }

    /// Whether `pc` lies in a loaded stub container
    pub fn inside_stub(&self, pc: usize) -> bool {
        self.state.read().classify(pc) == Some(AotFileKind::Stub)
    }

    /// Whether `pc` lies in a loaded `.an` container
    pub fn inside_aot(&self, pc: usize) -> bool {
        self.state.read().classify(pc) == Some(AotFileKind::An)
    }

    /// Non-blocking [`Self::inside_stub`]; `None` while a load holds the lock
    pub fn try_inside_stub(&self, pc: usize) -> Option<bool> {
        let state = self.state.try_read()?;
        Some(state.classify(pc) == Some(AotFileKind::Stub))
    }

    /// Non-blocking [`Self::inside_aot`]; `None` while a load holds the lock
    pub fn try_inside_aot(&self, pc: usize) -> Option<bool> {
        let state = self.state.try_read()?;
        Some(state.classify(pc) == Some(AotFileKind::An))
    }

    /// Non-blocking classification of `pc`
    pub fn try_classify(&self, pc: usize) -> Result<Option<AotFileKind>> {
        let state = self.state.try_read().ok_or(AotError::LockContended)?;
        Ok(state.classify(pc))
    }

    /// Text ranges of all loaded files, sorted by base address
    pub fn code_ranges(&self) -> Vec<CodeRange> {
        self.state.read().ranges.clone()
    }

    /// All loaded entries, by index
    pub fn entries(&self) -> Vec<AotFileEntry> {
        self.state.read().entries.iter().flatten().cloned().collect()
    }

    /// Number of loaded files
    pub fn len(&self) -> usize {
        self.state.read().entries.iter().flatten().count()
    }

    /// Whether nothing is loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn hold_write_lock(&self) -> impl Sized + '_ {
        self.state.write()
    }
}

impl CallSiteResolver for AotFileRegistry {
    fn call_site_info(&self, return_addr: usize, is_deopt: bool) -> Option<CallSiteResolution> {
        let lookup_pc = if is_deopt {
            return_addr
        } else {
            return_addr.checked_sub(1)?
        };
        let info = {
            let state = self.state.read();
            let range = find_range(&state.ranges, lookup_pc)?;
            Arc::clone(&state.entry(range.file_index)?.info)
        };
        info.call_site_info(return_addr, is_deopt)
    }
}
