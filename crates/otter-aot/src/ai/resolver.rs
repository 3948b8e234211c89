//! Restoring constant pools from ai snapshots, and the revise pass.

use std::sync::Arc;

use otter_aot_snapshot::{Heap, ObjectClass, SnapshotImage, TaggedValue};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use super::constant_pool::{ConstPoolSlot, ConstantPool, LiteralInfo, LiteralKind, MethodEntry};
use super::hidden_class::{HiddenClassLayout, Representation};
use super::{NO_FUNC_ENTRY_VALUE, SNAPSHOT_CP_ARRAY_ITEM_SIZE, SNAPSHOT_DATA_ITEM_SIZE};
use crate::binding::MethodEntryIndexMap;
use crate::error::{AotError, Result};

/// Called once for every constant pool of a framework file after the revise
/// pass, so the framework can take over patching it
pub type FrameworkPatchHook = Arc<dyn Fn(&ConstantPool) + Send + Sync>;

/// Where a method placeholder lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchLocation {
    /// Constant pool id
    pub cp_id: u32,
    /// Slot inside the pool
    pub slot: u32,
    /// Method index inside a literal slot; `None` for a method slot
    pub method: Option<u32>,
}

/// A method placeholder waiting for its entry index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingPatch {
    /// Placeholder position
    pub location: PatchLocation,
    /// `(normalized file name, method offset)`
    pub key: (String, u32),
}

type PoolKey = (String, u32);

#[derive(Default)]
struct Restored {
    pools: Vec<ConstantPool>,
    pending: Vec<PendingPatch>,
}

/// Constant pools restored from ai files, keyed by file name and pool id
#[derive(Default)]
pub struct SnapshotResolver {
    pools: FxHashMap<PoolKey, ConstantPool>,
    pending: Vec<PendingPatch>,
    framework_files: FxHashSet<String>,
    patch_hook: Option<FrameworkPatchHook>,
    revised: bool,
}

impl std::fmt::Debug for SnapshotResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotResolver")
            .field("pools", &self.pools.len())
            .field("pending", &self.pending.len())
            .field("framework_files", &self.framework_files)
            .field("revised", &self.revised)
            .finish_non_exhaustive()
    }
}

impl SnapshotResolver {
    /// Resolver with no pools
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `names` as framework files
    pub fn with_framework_files(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.framework_files
            .extend(names.into_iter().map(|name| name.into()));
        self
    }

    /// Register the callback framework files are handed to
    pub fn with_patch_hook(mut self, hook: FrameworkPatchHook) -> Self {
        self.patch_hook = Some(hook);
        self
    }

    /// Restore the constant pools of `image`, which was deserialized into
    /// `heap`.
    ///
    /// Nothing is published unless the whole image has the expected shape.
    /// Returns the number of pools restored.
    pub fn deserialize(&mut self, heap: &Heap, image: &SnapshotImage) -> Result<usize> {
        let [root] = image.roots.as_slice() else {
            return Err(AotError::MalformedAiFile("expected exactly one root"));
        };
        let restored = restore(heap, *root)?;
        let count = restored.pools.len();
        for pool in restored.pools {
            if self.framework_files.contains(&pool.file_name) {
                debug!(
                    file = %pool.file_name,
                    cp = pool.cp_id,
                    "framework constant pool registered for patching"
                );
            }
            let key = (pool.file_name.clone(), pool.cp_id);
            if let Some(replaced) = self.pools.insert(key, pool) {
                // placeholders of the replaced pool must not reach the new one
                let before = self.pending.len();
                self.pending.retain(|patch| {
                    patch.location.cp_id != replaced.cp_id || patch.key.0 != replaced.file_name
                });
                debug!(
                    file = %replaced.file_name,
                    cp = replaced.cp_id,
                    dropped = before - self.pending.len(),
                    "constant pool replaced by a later ai file"
                );
            }
        }
        self.pending.extend(restored.pending);
        self.revised = false;
        info!(
            pools = count,
            pending = self.pending.len(),
            "restored AOT constant pools"
        );
        Ok(count)
    }

    /// Overwrite every method placeholder with its entry index from `map`;
    /// methods missing from `map` get no entry. Entries that are no longer
    /// placeholders are left alone.
    ///
    /// Must run after binding. Returns the number of placeholders that
    /// received an entry index.
    pub fn finalize(&mut self, map: &MethodEntryIndexMap) -> usize {
        let mut patched = 0;
        let mut missed = 0;
        for patch in self.pending.drain(..) {
            let pool_key = (patch.key.0.clone(), patch.location.cp_id);
            let Some(entry) = self
                .pools
                .get_mut(&pool_key)
                .and_then(|pool| pool.slots.get_mut(patch.location.slot as usize))
                .and_then(|slot| slot.method_entry_mut(patch.location.method))
            else {
                warn!(
                    file = %patch.key.0,
                    cp = patch.location.cp_id,
                    slot = patch.location.slot,
                    "revise target vanished"
                );
                continue;
            };
            if *entry != (MethodEntry::Pending { offset: patch.key.1 }) {
                debug!(
                    file = %patch.key.0,
                    cp = patch.location.cp_id,
                    slot = patch.location.slot,
                    "revise target already resolved"
                );
                continue;
            }
            *entry = match map.get(&patch.key) {
                Some(&index) => {
                    patched += 1;
                    MethodEntry::Index(index)
                }
                None => {
                    missed += 1;
                    MethodEntry::NoEntry
                }
            };
        }
        self.revised = true;
        if let Some(hook) = &self.patch_hook {
            for pool in self.pools.values() {
                if self.framework_files.contains(&pool.file_name) {
                    hook(pool);
                }
            }
        }
        info!(patched, missed, "revised AOT method entries");
        patched
    }

    /// Restored pool `cp_id` of `file_name`
    pub fn constant_pool(&self, file_name: &str, cp_id: u32) -> Option<&ConstantPool> {
        self.pools.get(&(file_name.to_owned(), cp_id))
    }

    /// All restored pools
    pub fn constant_pools(&self) -> impl Iterator<Item = &ConstantPool> + '_ {
        self.pools.values()
    }

    /// Placeholders still waiting for [`Self::finalize`]
    pub fn pending(&self) -> &[PendingPatch] {
        &self.pending
    }

    /// Whether every placeholder has been revised
    pub fn is_revised(&self) -> bool {
        self.revised && self.pending.is_empty()
    }

    /// Number of restored pools
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pools were restored
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

fn array<'a>(heap: &'a Heap, value: TaggedValue, what: &'static str) -> Result<&'a [TaggedValue]> {
    value
        .as_object()
        .and_then(|id| heap.get(id))
        .filter(|object| object.class == ObjectClass::TaggedArray)
        .map(|object| object.fields.as_slice())
        .ok_or(AotError::MalformedAiFile(what))
}

fn int(value: TaggedValue, what: &'static str) -> Result<i32> {
    value.as_int().ok_or(AotError::MalformedAiFile(what))
}

fn index(value: TaggedValue, what: &'static str) -> Result<u32> {
    u32::try_from(int(value, what)?).map_err(|_| AotError::MalformedAiFile(what))
}

fn restore(heap: &Heap, root: TaggedValue) -> Result<Restored> {
    let items = array(heap, root, "top item array")?;
    if items.len() % SNAPSHOT_DATA_ITEM_SIZE != 0 {
        return Err(AotError::MalformedAiFile("top item array has a partial item"));
    }
    let mut restored = Restored::default();
    for item in items.chunks_exact(SNAPSHOT_DATA_ITEM_SIZE) {
        let file_info = array(heap, item[0], "file info")?;
        let [file_index, file_name] = file_info else {
            return Err(AotError::MalformedAiFile("file info"));
        };
        let file_index = index(*file_index, "file index")?;
        let file_name = file_name
            .as_object()
            .and_then(|id| heap.string_value(id))
            .ok_or(AotError::MalformedAiFile("file name"))?;

        let cp_array = array(heap, item[1], "constant pool array")?;
        if cp_array.len() % SNAPSHOT_CP_ARRAY_ITEM_SIZE != 0 {
            return Err(AotError::MalformedAiFile("constant pool array has a partial item"));
        }
        for pair in cp_array.chunks_exact(SNAPSHOT_CP_ARRAY_ITEM_SIZE) {
            let cp_id = index(pair[0], "constant pool id")?;
            let pool = restore_pool(
                heap,
                pair[1],
                file_index,
                file_name,
                cp_id,
                &mut restored.pending,
            )?;
            restored.pools.push(pool);
        }
        debug!(
            file = file_name,
            index = file_index,
            pools = cp_array.len() / SNAPSHOT_CP_ARRAY_ITEM_SIZE,
            "restored file constant pools"
        );
    }
    Ok(restored)
}

fn restore_pool(
    heap: &Heap,
    value: TaggedValue,
    file_index: u32,
    file_name: &str,
    cp_id: u32,
    pending: &mut Vec<PendingPatch>,
) -> Result<ConstantPool> {
    let pairs = array(heap, value, "constant pool")?;
    if pairs.len() % 2 != 0 {
        return Err(AotError::MalformedAiFile("constant pool has a partial slot"));
    }
    let mut pool = ConstantPool {
        file_index,
        file_name: file_name.to_owned(),
        cp_id,
        slots: Vec::new(),
    };
    for pair in pairs.chunks_exact(2) {
        let slot_index = index(pair[0], "constant pool index")?;
        let mut patch = |method: Option<u32>, offset: u32| {
            pending.push(PendingPatch {
                location: PatchLocation {
                    cp_id,
                    slot: slot_index,
                    method,
                },
                key: (file_name.to_owned(), offset),
            });
        };
        let slot = restore_slot(heap, pair[1], &mut patch)?;
        let at = slot_index as usize;
        if pool.slots.len() <= at {
            pool.slots.resize(at + 1, ConstPoolSlot::Empty);
        }
        pool.slots[at] = slot;
    }
    Ok(pool)
}

fn restore_slot(
    heap: &Heap,
    value: TaggedValue,
    patch: &mut dyn FnMut(Option<u32>, u32),
) -> Result<ConstPoolSlot> {
    let Some(object) = value.as_object().and_then(|id| heap.get(id)) else {
        return Ok(ConstPoolSlot::Empty);
    };
    match object.class {
        ObjectClass::LineString | ObjectClass::ConstantString => Ok(ConstPoolSlot::LazyString),
        ObjectClass::AotMethodInfo => {
            let entry = restore_method(&object.fields, &mut |offset| patch(None, offset))?;
            Ok(ConstPoolSlot::Method(entry))
        }
        ObjectClass::AotLiteralInfo => {
            let [kind, ihc, chc, methods] = object.fields.as_slice() else {
                return Err(AotError::MalformedAiFile("literal info"));
            };
            let kind = LiteralKind::from_raw(int(*kind, "literal kind")?)
                .ok_or(AotError::MalformedAiFile("literal kind"))?;
            let mut info = LiteralInfo::new(
                restore_hidden_class(heap, *ihc)?,
                restore_hidden_class(heap, *chc)?,
            );
            let methods = array(heap, *methods, "literal methods")?;
            for (position, method) in methods.iter().enumerate() {
                let fields = method
                    .as_object()
                    .and_then(|id| heap.get(id))
                    .filter(|object| object.class == ObjectClass::AotMethodInfo)
                    .map(|object| object.fields.as_slice())
                    .ok_or(AotError::MalformedAiFile("literal method"))?;
                let position = position as u32;
                info.methods
                    .push(restore_method(fields, &mut |offset| patch(Some(position), offset))?);
            }
            Ok(ConstPoolSlot::literal(kind, info))
        }
        _ => Err(AotError::MalformedAiFile("unexpected constant pool item")),
    }
}

fn restore_method(fields: &[TaggedValue], pending: &mut dyn FnMut(u32)) -> Result<MethodEntry> {
    let [offset, entry] = fields else {
        return Err(AotError::MalformedAiFile("method info"));
    };
    let offset = index(*offset, "method offset")?;
    let entry = int(*entry, "method entry")?;
    if i64::from(entry) == NO_FUNC_ENTRY_VALUE {
        pending(offset);
        return Ok(MethodEntry::Pending { offset });
    }
    u32::try_from(entry)
        .map(MethodEntry::Index)
        .map_err(|_| AotError::MalformedAiFile("method entry"))
}

fn restore_hidden_class(heap: &Heap, value: TaggedValue) -> Result<Option<HiddenClassLayout>> {
    let Some(id) = value.as_object() else {
        return Ok(None);
    };
    let object = heap
        .get(id)
        .filter(|object| object.class == ObjectClass::HiddenClass)
        .ok_or(AotError::MalformedAiFile("hidden class"))?;
    let representations = object
        .fields
        .iter()
        .map(|field| Representation::try_from(int(*field, "property representation")?))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(HiddenClassLayout::new(representations)))
}
