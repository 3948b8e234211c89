//! Arena heap model the serializer reads from and restores into.
//!
//! Objects live in one `Vec` and refer to each other through [`ObjectId`].
//! Every object carries the space it was allocated for, which decides the
//! snapshot region it is written to.

use rustc_hash::FxHashMap;

use crate::error::{Result, SnapshotError};

/// Largest object placed in a regular region; bigger objects go to the huge space
pub const MAX_REGULAR_OBJECT_SIZE: usize = 128 * 1024;

/// Index of an object in its [`Heap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Position in the arena
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A tagged JS value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaggedValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Array hole
    Hole,
    /// Boolean
    Bool(bool),
    /// Small integer
    Int(i32),
    /// Heap number
    Double(f64),
    /// Heap object reference
    Object(ObjectId),
}

impl TaggedValue {
    /// Referenced object, if any
    pub fn as_object(self) -> Option<ObjectId> {
        match self {
            Self::Object(id) => Some(id),
            _ => None,
        }
    }

    /// Integer payload, if any
    pub fn as_int(self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the value is `undefined`
    pub fn is_undefined(self) -> bool {
        matches!(self, Self::Undefined)
    }
}

/// Object layout class
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    /// Plain object with tagged fields
    Ordinary = 0,
    /// Fixed-length array of tagged values
    TaggedArray = 1,
    /// Flat string, UTF-8 payload in `raw`
    LineString = 2,
    /// String whose characters live in a bytecode file; `raw` holds the entity id
    ConstantString = 3,
    /// Hidden class; each field is the `Int` representation of one property
    HiddenClass = 4,
    /// Compiled code; instructions in `raw`
    MachineCode = 5,
    /// `[Int(method offset), Int(entry index)]`
    AotMethodInfo = 6,
    /// `[Int(literal type), ihc, chc, methods]`
    AotLiteralInfo = 7,
}

impl ObjectClass {
    /// Whether objects of this class go to the string region
    pub fn is_string(self) -> bool {
        matches!(self, Self::LineString | Self::ConstantString)
    }
}

impl TryFrom<u8> for ObjectClass {
    type Error = SnapshotError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Ordinary,
            1 => Self::TaggedArray,
            2 => Self::LineString,
            3 => Self::ConstantString,
            4 => Self::HiddenClass,
            5 => Self::MachineCode,
            6 => Self::AotMethodInfo,
            7 => Self::AotLiteralInfo,
            other => return Err(SnapshotError::BadClass(other)),
        })
    }
}

/// Space an object is allocated in
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    /// Movable old generation
    Old = 0,
    /// Never moved
    NonMovable = 1,
    /// Executable code
    MachineCode = 2,
    /// Read-mostly objects restored from snapshots
    Snapshot = 3,
    /// One object per region
    Huge = 4,
}

impl Space {
    /// All spaces in legacy region order
    pub const ALL: [Space; 5] = [
        Space::Old,
        Space::NonMovable,
        Space::MachineCode,
        Space::Snapshot,
        Space::Huge,
    ];
}

/// How the heap groups spaces into snapshot regions
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcMode {
    /// Regular, pinned and large regions
    Regions = 0,
    /// Old, non-movable, machine-code, snapshot and huge spaces
    Legacy = 1,
}

/// Upper bound on [`GcMode::space_count`]
pub const MAX_SNAPSHOT_SPACES: usize = 5;

const REGION_SPACES: [Space; 3] = [Space::Old, Space::NonMovable, Space::Huge];

impl GcMode {
    /// Number of snapshot regions
    pub fn space_count(self) -> usize {
        match self {
            Self::Regions => REGION_SPACES.len(),
            Self::Legacy => Space::ALL.len(),
        }
    }

    /// Region an object of `space` and `size` bytes is written to
    pub fn bucket(self, space: Space, size: usize) -> usize {
        let space = if size > MAX_REGULAR_OBJECT_SIZE {
            Space::Huge
        } else {
            space
        };
        match self {
            Self::Legacy => space as usize,
            Self::Regions => match space {
                Space::Old | Space::Snapshot => 0,
                Space::NonMovable | Space::MachineCode => 1,
                Space::Huge => 2,
            },
        }
    }

    /// Space objects restored from region `bucket` are allocated in
    pub fn bucket_space(self, bucket: usize) -> Space {
        match self {
            Self::Legacy => Space::ALL[bucket],
            Self::Regions => REGION_SPACES[bucket],
        }
    }

    /// Decode a header value
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Regions),
            1 => Some(Self::Legacy),
            _ => None,
        }
    }
}

/// One heap object
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    /// Layout class
    pub class: ObjectClass,
    /// Allocation space
    pub space: Space,
    /// Tagged fields
    pub fields: Vec<TaggedValue>,
    /// Untagged payload
    pub raw: Vec<u8>,
}

impl HeapObject {
    /// An object with no fields and no payload
    pub fn new(class: ObjectClass, space: Space) -> Self {
        Self {
            class,
            space,
            fields: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// Set the tagged fields
    pub fn with_fields(mut self, fields: impl Into<Vec<TaggedValue>>) -> Self {
        self.fields = fields.into();
        self
    }

    /// Set the untagged payload
    pub fn with_raw(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Field `index`, or `undefined` past the end
    pub fn field(&self, index: usize) -> TaggedValue {
        self.fields
            .get(index)
            .copied()
            .unwrap_or(TaggedValue::Undefined)
    }
}

/// Object arena with a string table
#[derive(Debug)]
pub struct Heap {
    gc_mode: GcMode,
    objects: Vec<HeapObject>,
    strings: FxHashMap<String, ObjectId>,
}

impl Heap {
    /// Empty heap
    pub fn new(gc_mode: GcMode) -> Self {
        Self {
            gc_mode,
            objects: Vec::new(),
            strings: FxHashMap::default(),
        }
    }

    /// Space grouping used for snapshots
    pub fn gc_mode(&self) -> GcMode {
        self.gc_mode
    }

    /// Number of allocated objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing has been allocated
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Allocate `object`
    pub fn alloc(&mut self, object: HeapObject) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    /// Allocate a tagged array in the old space
    pub fn alloc_array(&mut self, fields: impl Into<Vec<TaggedValue>>) -> ObjectId {
        self.alloc(HeapObject::new(ObjectClass::TaggedArray, Space::Old).with_fields(fields))
    }

    /// Return the interned line string for `value`, allocating it once
    pub fn intern(&mut self, value: &str) -> ObjectId {
        if let Some(&id) = self.strings.get(value) {
            return id;
        }
        let id = self.alloc(
            HeapObject::new(ObjectClass::LineString, Space::Old).with_raw(value.as_bytes()),
        );
        self.strings.insert(value.to_owned(), id);
        id
    }

    /// Allocate a string backed by bytecode-file entity `entity_id`
    pub fn alloc_constant_string(&mut self, entity_id: u32) -> ObjectId {
        self.alloc(
            HeapObject::new(ObjectClass::ConstantString, Space::Old)
                .with_raw(entity_id.to_le_bytes()),
        )
    }

    /// Object `id`
    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.objects.get(id.index())
    }

    /// Object `id`, mutably
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.get_mut(id.index())
    }

    /// Contents of line string `id`
    pub fn string_value(&self, id: ObjectId) -> Option<&str> {
        let object = self.get(id)?;
        if object.class != ObjectClass::LineString {
            return None;
        }
        std::str::from_utf8(&object.raw).ok()
    }

    /// Entity id of constant string `id`
    pub fn constant_string_entity(&self, id: ObjectId) -> Option<u32> {
        let object = self.get(id)?;
        if object.class != ObjectClass::ConstantString {
            return None;
        }
        let bytes: [u8; 4] = object.raw.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Field `index` of object `id`
    pub fn field(&self, id: ObjectId, index: usize) -> Option<TaggedValue> {
        self.get(id)?.fields.get(index).copied()
    }

    /// Overwrite field `index` of object `id`; false if either is missing
    pub fn set_field(&mut self, id: ObjectId, index: usize, value: TaggedValue) -> bool {
        match self
            .get_mut(id)
            .and_then(|object| object.fields.get_mut(index))
        {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_same_object() {
        let mut heap = Heap::new(GcMode::Regions);
        let a = heap.intern("name");
        let b = heap.intern("name");
        assert_eq!(a, b);
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.string_value(a), Some("name"));
    }

    #[test]
    fn test_bucket_mapping() {
        assert_eq!(GcMode::Regions.bucket(Space::Snapshot, 64), 0);
        assert_eq!(GcMode::Regions.bucket(Space::MachineCode, 64), 1);
        assert_eq!(GcMode::Regions.bucket(Space::Old, MAX_REGULAR_OBJECT_SIZE + 1), 2);
        assert_eq!(GcMode::Legacy.bucket(Space::MachineCode, 64), 2);
        assert_eq!(GcMode::Legacy.bucket_space(3), Space::Snapshot);
        assert_eq!(GcMode::Regions.bucket_space(1), Space::NonMovable);
    }

    #[test]
    fn test_set_field() {
        let mut heap = Heap::new(GcMode::Legacy);
        let array = heap.alloc_array([TaggedValue::Undefined]);
        assert!(heap.set_field(array, 0, TaggedValue::Int(7)));
        assert!(!heap.set_field(array, 1, TaggedValue::Int(7)));
        assert_eq!(heap.field(array, 0), Some(TaggedValue::Int(7)));
    }

    #[test]
    fn test_constant_string_entity() {
        let mut heap = Heap::new(GcMode::Regions);
        let id = heap.alloc_constant_string(0x1234);
        assert_eq!(heap.constant_string_entity(id), Some(0x1234));
        assert_eq!(heap.string_value(id), None);
    }
}
