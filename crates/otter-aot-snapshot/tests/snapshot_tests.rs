//! Snapshot save/restore tests

use otter_aot_snapshot::{
    Deserializer, GcMode, Heap, HeapObject, MAX_REGULAR_OBJECT_SIZE, ObjectClass, Serializer,
    SnapshotError, SnapshotHeader, SnapshotImage, Space, TaggedValue,
};

const VERSION_OFFSET: usize = 8;
const ROOT_NUM_OFFSET: usize = 88;
const CHECKSUM_OFFSET: usize = 92;

fn reseal(bytes: &mut [u8]) {
    let checksum = crc32fast::hash(&bytes[SnapshotHeader::SIZE..]);
    bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_ne_bytes());
}

fn sample(mode: GcMode) -> (Heap, TaggedValue) {
    let mut heap = Heap::new(mode);
    let code = heap.alloc(
        HeapObject::new(ObjectClass::MachineCode, Space::MachineCode).with_raw([0xc3; 5]),
    );
    let pinned = heap.alloc(
        HeapObject::new(ObjectClass::Ordinary, Space::NonMovable)
            .with_fields([TaggedValue::Object(code)]),
    );
    let huge = heap.alloc(
        HeapObject::new(ObjectClass::Ordinary, Space::Old)
            .with_raw(vec![7; MAX_REGULAR_OBJECT_SIZE + 1]),
    );
    let name = heap.intern("answer");
    let constant = heap.alloc_constant_string(0x40);
    let root = heap.alloc_array([
        TaggedValue::Object(pinned),
        TaggedValue::Object(huge),
        TaggedValue::Object(name),
        TaggedValue::Object(constant),
        TaggedValue::Int(-42),
        TaggedValue::Bool(true),
        TaggedValue::Null,
        TaggedValue::Hole,
    ]);
    // cycle back to the root
    heap.get_mut(pinned)
        .unwrap()
        .fields
        .push(TaggedValue::Object(root));
    (heap, TaggedValue::Object(root))
}

fn restore(mode: GcMode, bytes: &[u8]) -> (Heap, otter_aot_snapshot::Result<SnapshotImage>) {
    let mut heap = Heap::new(mode);
    let image = Deserializer::new(&mut heap).deserialize(bytes);
    (heap, image)
}

fn check_restored(heap: &Heap, root: TaggedValue) {
    let root = root.as_object().unwrap();
    let root_object = heap.get(root).unwrap();
    assert_eq!(root_object.class, ObjectClass::TaggedArray);
    assert_eq!(root_object.fields.len(), 8);
    assert_eq!(root_object.field(4), TaggedValue::Int(-42));
    assert_eq!(root_object.field(5), TaggedValue::Bool(true));
    assert_eq!(root_object.field(6), TaggedValue::Null);
    assert_eq!(root_object.field(7), TaggedValue::Hole);

    let pinned = heap.get(root_object.field(0).as_object().unwrap()).unwrap();
    assert_eq!(pinned.space, Space::NonMovable);
    assert_eq!(pinned.field(1), TaggedValue::Object(root));
    let code = heap.get(pinned.field(0).as_object().unwrap()).unwrap();
    assert_eq!(code.class, ObjectClass::MachineCode);
    assert_eq!(code.raw, vec![0xc3; 5]);

    let huge = heap.get(root_object.field(1).as_object().unwrap()).unwrap();
    assert_eq!(huge.space, Space::Huge);
    assert_eq!(huge.raw.len(), MAX_REGULAR_OBJECT_SIZE + 1);

    let name = root_object.field(2).as_object().unwrap();
    assert_eq!(heap.string_value(name), Some("answer"));
    let constant = root_object.field(3).as_object().unwrap();
    assert_eq!(heap.constant_string_entity(constant), Some(0x40));
}

#[test]
fn test_round_trip_region_spaces() {
    let (heap, root) = sample(GcMode::Regions);
    let bytes = Serializer::new(&heap).serialize(&[root]).unwrap();
    let (restored, image) = restore(GcMode::Regions, &bytes);
    let image = image.unwrap();
    assert_eq!(image.object_count, 4);
    assert_eq!(image.string_count, 2);
    assert!(image.embedded_file.is_none());
    check_restored(&restored, image.roots[0]);

    let header = SnapshotHeader::read(&bytes).unwrap();
    assert_eq!(header.space_counts[..3], [1, 2, 1]);
    assert_eq!(header.string_count, 2);
}

#[test]
fn test_round_trip_legacy_spaces() {
    let (heap, root) = sample(GcMode::Legacy);
    let bytes = Serializer::new(&heap).serialize(&[root]).unwrap();
    let header = SnapshotHeader::read(&bytes).unwrap();
    // old, non-movable, machine-code, snapshot, huge
    assert_eq!(header.space_counts, [1, 1, 1, 0, 1]);
    assert_eq!(header.space_sizes[3], 0);

    let (restored, image) = restore(GcMode::Legacy, &bytes);
    let image = image.unwrap();
    check_restored(&restored, image.roots[0]);
    let pinned = restored
        .field(image.roots[0].as_object().unwrap(), 0)
        .and_then(TaggedValue::as_object)
        .unwrap();
    let code = restored.field(pinned, 0).and_then(TaggedValue::as_object).unwrap();
    assert_eq!(restored.get(code).unwrap().space, Space::MachineCode);
}

#[test]
fn test_primitive_roots() {
    let heap = Heap::new(GcMode::Regions);
    let roots = [TaggedValue::Int(1), TaggedValue::Double(-0.5), TaggedValue::Undefined];
    let bytes = Serializer::new(&heap).serialize(&roots).unwrap();
    let (_, image) = restore(GcMode::Regions, &bytes);
    let image = image.unwrap();
    assert_eq!(image.roots, roots);
    assert_eq!(image.object_count, 0);
}

#[test]
fn test_embedded_file() {
    let (heap, root) = sample(GcMode::Regions);
    let image_bytes = b"PANDA\0\0\0abc".to_vec();
    let bytes = Serializer::new(&heap)
        .with_embedded_file(&image_bytes)
        .serialize(&[root])
        .unwrap();
    let header = SnapshotHeader::read(&bytes).unwrap();
    assert!(header.has_embedded_file());
    assert_eq!(header.panda_file_size, image_bytes.len() as u64);

    let (_, image) = restore(GcMode::Regions, &bytes);
    assert_eq!(image.unwrap().embedded_file, Some(image_bytes));
}

#[test]
fn test_version_mismatch_is_load_failure() {
    let (heap, root) = sample(GcMode::Regions);
    let mut bytes = Serializer::new(&heap).serialize(&[root]).unwrap();
    bytes[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&99u32.to_ne_bytes());
    let (restored, image) = restore(GcMode::Regions, &bytes);
    assert!(matches!(
        image,
        Err(SnapshotError::VersionMismatch { found: 99, .. })
    ));
    assert!(restored.is_empty());
}

#[test]
fn test_zero_roots_is_load_failure() {
    let (heap, root) = sample(GcMode::Regions);
    let mut bytes = Serializer::new(&heap).serialize(&[root]).unwrap();
    bytes[ROOT_NUM_OFFSET..ROOT_NUM_OFFSET + 4].copy_from_slice(&0u32.to_ne_bytes());
    let (restored, image) = restore(GcMode::Regions, &bytes);
    assert!(matches!(image, Err(SnapshotError::NoRootObjects)));
    assert!(restored.is_empty());
}

#[test]
fn test_bad_magic_and_truncation() {
    let (heap, root) = sample(GcMode::Regions);
    let bytes = Serializer::new(&heap).serialize(&[root]).unwrap();

    let mut bad = bytes.clone();
    bad[0] = b'X';
    assert!(matches!(restore(GcMode::Regions, &bad).1, Err(SnapshotError::BadMagic)));

    let mut short = bytes[..bytes.len() - 16].to_vec();
    reseal(&mut short);
    assert!(matches!(
        restore(GcMode::Regions, &short).1,
        Err(SnapshotError::Truncated { .. })
    ));
}

#[test]
fn test_bad_string_kind() {
    let mut heap = Heap::new(GcMode::Regions);
    let name = heap.intern("s");
    let bytes = Serializer::new(&heap)
        .serialize(&[TaggedValue::Object(name)])
        .unwrap();
    // header, one root (tag, payload), then the string kind word
    let kind_at = SnapshotHeader::SIZE + 16;
    let mut bad = bytes.clone();
    bad[kind_at..kind_at + 8].copy_from_slice(&5u64.to_ne_bytes());
    reseal(&mut bad);
    assert!(matches!(
        restore(GcMode::Regions, &bad).1,
        Err(SnapshotError::BadStringKind(5))
    ));
}

#[test]
fn test_bad_reference() {
    let mut heap = Heap::new(GcMode::Regions);
    let leaf = heap.alloc_array([]);
    let root = heap.alloc_array([TaggedValue::Object(leaf)]);
    let mut bytes = Serializer::new(&heap)
        .serialize(&[TaggedValue::Object(root)])
        .unwrap();
    // root object: header word, then field 0 (tag, payload)
    let payload_at = SnapshotHeader::SIZE + 16 + 8 + 8;
    bytes[payload_at..payload_at + 8].copy_from_slice(&9u64.to_ne_bytes());
    reseal(&mut bytes);
    assert!(matches!(
        restore(GcMode::Regions, &bytes).1,
        Err(SnapshotError::BadReference(9))
    ));
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.ai");
    let (heap, root) = sample(GcMode::Regions);
    Serializer::new(&heap).write_to(&[root], &path).unwrap();

    for use_mmap in [true, false] {
        let mut restored = Heap::new(GcMode::Regions);
        let image = Deserializer::new(&mut restored)
            .deserialize_file(&path, use_mmap)
            .unwrap();
        check_restored(&restored, image.roots[0]);
    }

    let mut heap = Heap::new(GcMode::Regions);
    assert!(matches!(
        Deserializer::new(&mut heap).deserialize_file(dir.path().join("missing.ai"), false),
        Err(SnapshotError::Io(_))
    ));
}
