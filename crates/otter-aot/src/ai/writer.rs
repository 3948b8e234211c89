//! Writing ai files, the compiler side of [`super::SnapshotResolver`].

use std::path::Path;

use otter_aot_snapshot::{
    GcMode, Heap, HeapObject, ObjectClass, ObjectId, Serializer, Space, TaggedValue,
};

use super::constant_pool::LiteralKind;
use super::hidden_class::Representation;
use super::{NO_FUNC_ENTRY_VALUE, SNAPSHOT_CP_ARRAY_ITEM_SIZE, SNAPSHOT_DATA_ITEM_SIZE};
use crate::error::Result;

/// A method reference as the compiler knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AiMethod {
    /// Method offset in the bytecode file
    pub offset: u32,
    /// Entry index when already known; otherwise revised after binding
    pub entry: Option<u32>,
}

impl AiMethod {
    /// Method whose entry index is not known yet
    pub fn pending(offset: u32) -> Self {
        Self { offset, entry: None }
    }

    /// Method with a known entry index
    pub fn bound(offset: u32, entry: u32) -> Self {
        Self {
            offset,
            entry: Some(entry),
        }
    }
}

/// One cached constant-pool item
#[derive(Debug, Clone, PartialEq)]
pub enum AiItem {
    /// String constant, restored lazily
    String(String),
    /// Method
    Method(AiMethod),
    /// Literal cache
    Literal {
        /// Literal kind
        kind: LiteralKind,
        /// Instance hidden class
        ihc: Option<Vec<Representation>>,
        /// Constructor hidden class
        chc: Option<Vec<Representation>>,
        /// Methods of the literal
        methods: Vec<AiMethod>,
    },
}

#[derive(Debug, Clone)]
struct AiFileInput {
    file_index: u32,
    name: String,
    pools: Vec<(u32, Vec<(u32, AiItem)>)>,
}

/// Builds an ai file from per-file constant pools
#[derive(Debug, Clone)]
pub struct AiFileBuilder {
    gc_mode: GcMode,
    files: Vec<AiFileInput>,
}

impl Default for AiFileBuilder {
    fn default() -> Self {
        Self::new(GcMode::Regions)
    }
}

impl AiFileBuilder {
    /// Empty ai file for a heap in `gc_mode`
    pub fn new(gc_mode: GcMode) -> Self {
        Self {
            gc_mode,
            files: Vec::new(),
        }
    }

    /// Add pool `cp_id` of bytecode file `name`, whose items are keyed by
    /// constant-pool index
    pub fn add_constant_pool(
        &mut self,
        file_index: u32,
        name: &str,
        cp_id: u32,
        items: Vec<(u32, AiItem)>,
    ) -> &mut Self {
        let position = match self.files.iter().position(|file| file.name == name) {
            Some(position) => position,
            None => {
                self.files.push(AiFileInput {
                    file_index,
                    name: name.to_owned(),
                    pools: Vec::new(),
                });
                self.files.len() - 1
            }
        };
        self.files[position].pools.push((cp_id, items));
        self
    }

    /// Serialize to snapshot bytes
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut heap = Heap::new(self.gc_mode);
        let root = self.populate(&mut heap);
        Ok(Serializer::new(&heap).serialize(&[TaggedValue::Object(root)])?)
    }

    /// Serialize to `path`
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut heap = Heap::new(self.gc_mode);
        let root = self.populate(&mut heap);
        Ok(Serializer::new(&heap).write_to(&[TaggedValue::Object(root)], path)?)
    }

    fn populate(&self, heap: &mut Heap) -> ObjectId {
        let mut top = Vec::with_capacity(self.files.len() * SNAPSHOT_DATA_ITEM_SIZE);
        for file in &self.files {
            let name = heap.intern(&file.name);
            let info = heap.alloc_array([int(file.file_index), TaggedValue::Object(name)]);
            let mut cp_array = Vec::with_capacity(file.pools.len() * SNAPSHOT_CP_ARRAY_ITEM_SIZE);
            for (cp_id, items) in &file.pools {
                let mut pairs = Vec::with_capacity(items.len() * 2);
                for (index, item) in items {
                    pairs.push(int(*index));
                    pairs.push(TaggedValue::Object(alloc_item(heap, item)));
                }
                let pool = heap.alloc_array(pairs);
                cp_array.push(int(*cp_id));
                cp_array.push(TaggedValue::Object(pool));
            }
            let cp_array = heap.alloc_array(cp_array);
            top.push(TaggedValue::Object(info));
            top.push(TaggedValue::Object(cp_array));
        }
        heap.alloc_array(top)
    }
}

fn int(value: u32) -> TaggedValue {
    TaggedValue::Int(value as i32)
}

fn alloc_method(heap: &mut Heap, method: AiMethod) -> ObjectId {
    let entry = match method.entry {
        Some(entry) => entry as i32,
        None => NO_FUNC_ENTRY_VALUE as i32,
    };
    heap.alloc(
        HeapObject::new(ObjectClass::AotMethodInfo, Space::Old)
            .with_fields([int(method.offset), TaggedValue::Int(entry)]),
    )
}

fn alloc_hidden_class(heap: &mut Heap, layout: Option<&[Representation]>) -> TaggedValue {
    match layout {
        Some(layout) => {
            let fields: Vec<TaggedValue> = layout
                .iter()
                .map(|representation| TaggedValue::Int(*representation as i32))
                .collect();
            TaggedValue::Object(heap.alloc(
                HeapObject::new(ObjectClass::HiddenClass, Space::NonMovable).with_fields(fields),
            ))
        }
        None => TaggedValue::Undefined,
    }
}

fn alloc_item(heap: &mut Heap, item: &AiItem) -> ObjectId {
    match item {
        AiItem::String(value) => heap.intern(value),
        AiItem::Method(method) => alloc_method(heap, *method),
        AiItem::Literal {
            kind,
            ihc,
            chc,
            methods,
        } => {
            let ihc = alloc_hidden_class(heap, ihc.as_deref());
            let chc = alloc_hidden_class(heap, chc.as_deref());
            let methods: Vec<TaggedValue> = methods
                .iter()
                .map(|method| TaggedValue::Object(alloc_method(heap, *method)))
                .collect();
            let methods = heap.alloc_array(methods);
            heap.alloc(
                HeapObject::new(ObjectClass::AotLiteralInfo, Space::Old).with_fields([
                    TaggedValue::Int(*kind as i32),
                    ihc,
                    chc,
                    TaggedValue::Object(methods),
                ]),
            )
        }
    }
}
