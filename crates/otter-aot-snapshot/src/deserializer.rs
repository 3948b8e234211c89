//! Snapshot restore.
//!
//! Objects are allocated first with their fields still encoded, strings are
//! interned next, and a relocation pass then turns every encoded reference
//! into an [`ObjectId`]. Roots are only returned when every step succeeds;
//! objects allocated by a failed restore stay unreachable.

use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::error::{Result, SnapshotError};
use crate::header::{
    SNAPSHOT_MAGIC, SNAPSHOT_VERSION, STRING_KIND_CONSTANT, STRING_KIND_LINE, SnapshotHeader,
    WORD_SIZE, WordReader, split_object_ref, split_object_word, tag,
};
use crate::heap::{GcMode, Heap, HeapObject, ObjectClass, ObjectId, TaggedValue};

/// Result of a successful restore
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotImage {
    /// Root values, in serialization order
    pub roots: Vec<TaggedValue>,
    /// Restored non-string objects
    pub object_count: usize,
    /// Restored strings
    pub string_count: usize,
    /// Embedded bytecode file image, if the snapshot carries one
    pub embedded_file: Option<Vec<u8>>,
}

type EncodedValue = (u64, u64);

/// Restores snapshots into a heap
pub struct Deserializer<'h> {
    heap: &'h mut Heap,
}

impl<'h> Deserializer<'h> {
    /// Deserializer allocating into `heap`
    pub fn new(heap: &'h mut Heap) -> Self {
        Self { heap }
    }

    /// Restore the snapshot in `data`.
    ///
    /// Failures are logged; the caller is expected to build the state from
    /// scratch instead.
    pub fn deserialize(&mut self, data: &[u8]) -> Result<SnapshotImage> {
        match self.restore(data) {
            Ok(image) => {
                info!(
                    roots = image.roots.len(),
                    objects = image.object_count,
                    strings = image.string_count,
                    "restored heap snapshot"
                );
                Ok(image)
            }
            Err(err) => {
                warn!(%err, "heap snapshot rejected");
                Err(err)
            }
        }
    }

    /// Read `path`, memory-mapped when `use_mmap` is set, and restore it
    pub fn deserialize_file(
        &mut self,
        path: impl AsRef<Path>,
        use_mmap: bool,
    ) -> Result<SnapshotImage> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).inspect_err(|err| {
            warn!(path = %path.display(), %err, "cannot open heap snapshot");
        })?;
        debug!(path = %path.display(), use_mmap, "loading heap snapshot");
        if use_mmap {
            // SAFETY: the mapping is read-only and dropped before returning;
            // snapshot files are not modified while the VM reads them.
            let map = unsafe { Mmap::map(&file)? };
            self.deserialize(&map)
        } else {
            let bytes = std::fs::read(path)?;
            self.deserialize(&bytes)
        }
    }

    fn restore(&mut self, data: &[u8]) -> Result<SnapshotImage> {
        let header = check_header(data, self.heap.gc_mode())?;
        let gc_mode = self.heap.gc_mode();
        let mut reader = WordReader::at(data, SnapshotHeader::SIZE);

        let roots = (0..header.root_num)
            .map(|_| read_value(&mut reader))
            .collect::<Result<Vec<_>>>()?;

        // Objects, fields still encoded
        let mut pending: Vec<(ObjectId, Vec<EncodedValue>)> = Vec::new();
        let mut bucket_base = Vec::with_capacity(gc_mode.space_count());
        for bucket in 0..gc_mode.space_count() {
            let start = reader.position();
            bucket_base.push(pending.len());
            let count = header.space_counts[bucket] as usize;
            pending.reserve(count.min(data.len() / WORD_SIZE));
            for _ in 0..count {
                let (class, field_count, raw_len) = split_object_word(reader.word()?);
                let class = ObjectClass::try_from(class)?;
                let fields = (0..field_count)
                    .map(|_| read_value(&mut reader))
                    .collect::<Result<Vec<_>>>()?;
                let raw = reader.padded(raw_len)?.to_vec();
                let id = self
                    .heap
                    .alloc(HeapObject::new(class, gc_mode.bucket_space(bucket)).with_raw(raw));
                pending.push((id, fields));
            }
            let found = (reader.position() - start) as u64;
            if found != header.space_sizes[bucket] {
                return Err(SnapshotError::RegionSizeMismatch {
                    space: bucket,
                    expected: header.space_sizes[bucket],
                    found,
                });
            }
        }
        bucket_base.push(pending.len());

        let string_count = header.string_count as usize;
        let mut strings = Vec::with_capacity(string_count.min(data.len() / WORD_SIZE));
        for index in 0..string_count {
            strings.push(self.read_string(&mut reader, index)?);
        }

        // Relocation
        let resolve = |(kind, payload): EncodedValue| -> Result<TaggedValue> {
            Ok(match kind {
                tag::UNDEFINED => TaggedValue::Undefined,
                tag::NULL => TaggedValue::Null,
                tag::HOLE => TaggedValue::Hole,
                tag::FALSE => TaggedValue::Bool(false),
                tag::TRUE => TaggedValue::Bool(true),
                tag::INT => TaggedValue::Int(payload as u32 as i32),
                tag::DOUBLE => TaggedValue::Double(f64::from_bits(payload)),
                tag::OBJECT => {
                    let (bucket, index) = split_object_ref(payload);
                    let slot = match (bucket_base.get(bucket), bucket_base.get(bucket + 1)) {
                        (Some(&base), Some(&end)) if base + index < end => base + index,
                        _ => return Err(SnapshotError::BadReference(payload)),
                    };
                    TaggedValue::Object(pending[slot].0)
                }
                tag::STRING => strings
                    .get(payload as usize)
                    .map(|&id| TaggedValue::Object(id))
                    .ok_or(SnapshotError::BadReference(payload))?,
                other => return Err(SnapshotError::BadTag(other)),
            })
        };
        let mut relocated = Vec::with_capacity(pending.len());
        for (id, fields) in &pending {
            let fields = fields
                .iter()
                .map(|&field| resolve(field))
                .collect::<Result<Vec<_>>>()?;
            relocated.push((*id, fields));
        }
        let roots = roots
            .into_iter()
            .map(resolve)
            .collect::<Result<Vec<_>>>()?;
        for (id, fields) in relocated {
            if let Some(object) = self.heap.get_mut(id) {
                object.fields = fields;
            }
        }

        let embedded_file = if header.has_embedded_file() {
            let begin = header.panda_file_begin as usize;
            let image = begin
                .checked_add(header.panda_file_size as usize)
                .and_then(|end| data.get(begin..end))
                .ok_or(SnapshotError::Truncated { offset: begin })?;
            Some(image.to_vec())
        } else {
            None
        };

        Ok(SnapshotImage {
            roots,
            object_count: pending.len(),
            string_count: strings.len(),
            embedded_file,
        })
    }

    fn read_string(&mut self, reader: &mut WordReader<'_>, index: usize) -> Result<ObjectId> {
        match reader.word()? {
            STRING_KIND_LINE => {
                let len = reader.word()? as usize;
                let bytes = reader.padded(len)?;
                let value =
                    std::str::from_utf8(bytes).map_err(|_| SnapshotError::BadString { index })?;
                Ok(self.heap.intern(value))
            }
            STRING_KIND_CONSTANT => {
                let entity = reader.word()?;
                let entity = u32::try_from(entity).map_err(|_| SnapshotError::BadString { index })?;
                Ok(self.heap.alloc_constant_string(entity))
            }
            other => Err(SnapshotError::BadStringKind(other)),
        }
    }
}

fn check_header(data: &[u8], gc_mode: GcMode) -> Result<SnapshotHeader> {
    let header = SnapshotHeader::read(data)?;
    if header.magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    if header.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found: header.version,
        });
    }
    if header.gc_mode != gc_mode as u32 {
        return Err(SnapshotError::GcModeMismatch {
            expected: gc_mode as u32,
            found: header.gc_mode,
        });
    }
    if header.root_num == 0 {
        return Err(SnapshotError::NoRootObjects);
    }
    let found = crc32fast::hash(&data[SnapshotHeader::SIZE..]);
    if found != header.body_checksum {
        return Err(SnapshotError::ChecksumMismatch {
            expected: header.body_checksum,
            found,
        });
    }
    Ok(header)
}

fn read_value(reader: &mut WordReader<'_>) -> Result<EncodedValue> {
    Ok((reader.word()?, reader.word()?))
}
