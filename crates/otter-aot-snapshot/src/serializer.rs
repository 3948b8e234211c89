//! Breadth-first heap serializer.

use std::collections::VecDeque;
use std::path::Path;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{Result, SnapshotError};
use crate::header::{
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION, STRING_KIND_CONSTANT, STRING_KIND_LINE, SnapshotHeader,
    WORD_SIZE, object_ref, object_word, push_padded, push_word, tag,
};
use crate::heap::{Heap, HeapObject, ObjectClass, ObjectId, TaggedValue};

#[derive(Debug, Clone, Copy)]
enum Encoded {
    Object { bucket: usize, index: usize },
    String(usize),
}

/// Writes the subgraph reachable from a set of roots
pub struct Serializer<'h> {
    heap: &'h Heap,
    embedded_file: Option<&'h [u8]>,
}

#[derive(Default)]
struct Layout {
    encoded: FxHashMap<ObjectId, Encoded>,
    buckets: Vec<Vec<ObjectId>>,
    strings: Vec<ObjectId>,
}

impl<'h> Serializer<'h> {
    /// Serializer over `heap`
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            embedded_file: None,
        }
    }

    /// Append a bytecode file image after the string region
    pub fn with_embedded_file(mut self, image: &'h [u8]) -> Self {
        self.embedded_file = Some(image);
        self
    }

    /// Encode everything reachable from `roots`
    pub fn serialize(&self, roots: &[TaggedValue]) -> Result<Vec<u8>> {
        if roots.is_empty() {
            return Err(SnapshotError::NoRootObjects);
        }
        let layout = self.discover(roots)?;

        let mut body = Vec::new();
        for &root in roots {
            self.write_value(&mut body, root, &layout)?;
        }

        let gc_mode = self.heap.gc_mode();
        let mut header = SnapshotHeader {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            gc_mode: gc_mode as u32,
            root_num: roots.len() as u32,
            ..Default::default()
        };
        for (bucket, ids) in layout.buckets.iter().enumerate() {
            let start = body.len();
            for &id in ids {
                self.write_object(&mut body, self.object(id)?, &layout)?;
            }
            header.space_sizes[bucket] = (body.len() - start) as u64;
            header.space_counts[bucket] = ids.len() as u32;
        }

        let start = body.len();
        for &id in &layout.strings {
            write_string(&mut body, self.object(id)?);
        }
        header.string_size = (body.len() - start) as u64;
        header.string_count = layout.strings.len() as u32;

        if let Some(image) = self.embedded_file {
            header.panda_file_begin = (SnapshotHeader::SIZE + body.len()) as u64;
            header.panda_file_size = image.len() as u64;
            push_padded(&mut body, image);
        }
        header.body_checksum = crc32fast::hash(&body);

        debug!(
            roots = roots.len(),
            objects = layout.encoded.len() - layout.strings.len(),
            strings = layout.strings.len(),
            bytes = SnapshotHeader::SIZE + body.len(),
            "serialized heap snapshot"
        );

        let mut out = Vec::with_capacity(SnapshotHeader::SIZE + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Serialize and write to `path`
    pub fn write_to(&self, roots: &[TaggedValue], path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.serialize(roots)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn object(&self, id: ObjectId) -> Result<&'h HeapObject> {
        self.heap.get(id).ok_or(SnapshotError::DanglingObject(id.0))
    }

    /// Assign every reachable object a region slot, breadth first
    fn discover(&self, roots: &[TaggedValue]) -> Result<Layout> {
        let mut layout = Layout {
            buckets: vec![Vec::new(); self.heap.gc_mode().space_count()],
            ..Default::default()
        };
        let mut queue = VecDeque::new();
        for id in roots.iter().filter_map(|root| root.as_object()) {
            self.enqueue(id, &mut layout, &mut queue)?;
        }
        while let Some(id) = queue.pop_front() {
            for field in &self.object(id)?.fields {
                if let Some(child) = field.as_object() {
                    self.enqueue(child, &mut layout, &mut queue)?;
                }
            }
        }
        Ok(layout)
    }

    fn enqueue(
        &self,
        id: ObjectId,
        layout: &mut Layout,
        queue: &mut VecDeque<ObjectId>,
    ) -> Result<()> {
        if layout.encoded.contains_key(&id) {
            return Ok(());
        }
        let object = self.object(id)?;
        let encoded = if object.class.is_string() {
            layout.strings.push(id);
            Encoded::String(layout.strings.len() - 1)
        } else {
            let bucket = self
                .heap
                .gc_mode()
                .bucket(object.space, encoded_size(object));
            layout.buckets[bucket].push(id);
            queue.push_back(id);
            Encoded::Object {
                bucket,
                index: layout.buckets[bucket].len() - 1,
            }
        };
        layout.encoded.insert(id, encoded);
        Ok(())
    }

    fn write_object(&self, out: &mut Vec<u8>, object: &HeapObject, layout: &Layout) -> Result<()> {
        push_word(
            out,
            object_word(object.class as u8, object.fields.len(), object.raw.len())?,
        );
        for &field in &object.fields {
            self.write_value(out, field, layout)?;
        }
        push_padded(out, &object.raw);
        Ok(())
    }

    fn write_value(&self, out: &mut Vec<u8>, value: TaggedValue, layout: &Layout) -> Result<()> {
        let (kind, payload) = match value {
            TaggedValue::Undefined => (tag::UNDEFINED, 0),
            TaggedValue::Null => (tag::NULL, 0),
            TaggedValue::Hole => (tag::HOLE, 0),
            TaggedValue::Bool(false) => (tag::FALSE, 0),
            TaggedValue::Bool(true) => (tag::TRUE, 0),
            TaggedValue::Int(value) => (tag::INT, value as u32 as u64),
            TaggedValue::Double(value) => (tag::DOUBLE, value.to_bits()),
            TaggedValue::Object(id) => match layout.encoded.get(&id) {
                Some(Encoded::Object { bucket, index }) => {
                    (tag::OBJECT, object_ref(*bucket, *index))
                }
                Some(Encoded::String(index)) => (tag::STRING, *index as u64),
                None => return Err(SnapshotError::DanglingObject(id.0)),
            },
        };
        push_word(out, kind);
        push_word(out, payload);
        Ok(())
    }
}

fn encoded_size(object: &HeapObject) -> usize {
    WORD_SIZE + object.fields.len() * 2 * WORD_SIZE + object.raw.len()
}

fn write_string(out: &mut Vec<u8>, object: &HeapObject) {
    if object.class == ObjectClass::ConstantString {
        let mut entity = [0u8; 4];
        let len = object.raw.len().min(4);
        entity[..len].copy_from_slice(&object.raw[..len]);
        push_word(out, STRING_KIND_CONSTANT);
        push_word(out, u64::from(u32::from_le_bytes(entity)));
    } else {
        push_word(out, STRING_KIND_LINE);
        push_word(out, object.raw.len() as u64);
        push_padded(out, &object.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{GcMode, Space};

    #[test]
    fn test_shared_object_written_once() {
        let mut heap = Heap::new(GcMode::Regions);
        let leaf = heap.alloc_array([TaggedValue::Int(1)]);
        let name = heap.intern("x");
        let root = heap.alloc_array([
            TaggedValue::Object(leaf),
            TaggedValue::Object(leaf),
            TaggedValue::Object(name),
            TaggedValue::Object(name),
        ]);
        let serializer = Serializer::new(&heap);
        let layout = serializer.discover(&[TaggedValue::Object(root)]).unwrap();
        assert_eq!(layout.buckets[0], vec![root, leaf]);
        assert_eq!(layout.strings, vec![name]);
        assert_eq!(layout.encoded.len(), 3);
    }

    #[test]
    fn test_breadth_first_order() {
        let mut heap = Heap::new(GcMode::Legacy);
        let deep = heap.alloc_array([]);
        let a = heap.alloc_array([TaggedValue::Object(deep)]);
        let b = heap.alloc_array([]);
        let root = heap.alloc_array([TaggedValue::Object(a), TaggedValue::Object(b)]);
        let layout = Serializer::new(&heap)
            .discover(&[TaggedValue::Object(root)])
            .unwrap();
        assert_eq!(layout.buckets[Space::Old as usize], vec![root, a, b, deep]);
    }

    #[test]
    fn test_dangling_reference() {
        let mut heap = Heap::new(GcMode::Regions);
        let root = heap.alloc_array([TaggedValue::Object(ObjectId(99))]);
        assert!(matches!(
            Serializer::new(&heap).serialize(&[TaggedValue::Object(root)]),
            Err(SnapshotError::DanglingObject(99))
        ));
    }

    #[test]
    fn test_no_roots() {
        let heap = Heap::new(GcMode::Regions);
        assert!(matches!(
            Serializer::new(&heap).serialize(&[]),
            Err(SnapshotError::NoRootObjects)
        ));
    }
}
