//! Container build/read tests
//!
//! Covers the merged layout, relocation resolution, both byte orders and
//! the reader's rejection of each class of malformed input.

use otter_aot_elf::{
    ByteOrder, Container, ContainerBuilder, ContainerError, FuncEntryKind, FunctionInput,
    MODULE_INFO_SECTION, Machine, ModuleInput, RegionKind, Relocation, RelocationKind,
};
use otter_aot_stackmap::{CallSiteInfo, DeoptValue, Location, StackMapEntry, StackMapParser};

fn app_module() -> ModuleInput {
    ModuleInput::new("app.abc", 0x1234, vec![0x90; 64])
        .with_function(
            FunctionInput::new("app_main", FuncEntryKind::Main, 0, 0, 32)
                .with_fp_delta(16)
                .with_callee_regs([(3, -8), (12, -16)]),
        )
        .with_function(
            FunctionInput::new("app_foo", FuncEntryKind::Method, 0x44, 32, 32).with_fast_call(true),
        )
        .with_call_site(CallSiteInfo::new(0x30).with_deopt(3, DeoptValue::Constant(42)))
        .with_call_site(CallSiteInfo::new(0x10).with_root(Location::new(6, -40)))
}

fn lib_module() -> ModuleInput {
    let mut text = vec![0x90; 32];
    text[0] = 0xe8;
    ModuleInput::new("lib.abc", 0x5678, text)
        .with_function(FunctionInput::new("lib_bar", FuncEntryKind::Method, 0x20, 0, 32))
        .with_relocation(Relocation::new(RelocationKind::Rel32, 1, "app_foo", -4))
}

fn build(order: ByteOrder) -> Vec<u8> {
    let mut builder = ContainerBuilder::new(Machine::X86_64).with_byte_order(order);
    assert_eq!(builder.add_module(app_module()), 0);
    assert_eq!(builder.add_module(lib_module()), 1);
    builder.build().unwrap()
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn write_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn section_header_at(bytes: &[u8], index: usize) -> usize {
    read_u64(bytes, 40) as usize + index * 64
}

fn section_offset(bytes: &[u8], index: usize) -> usize {
    read_u64(bytes, section_header_at(bytes, index) + 24) as usize
}

fn check_container(container: &Container) {
    assert_eq!(container.machine(), Machine::X86_64);
    assert_eq!(container.text_file_offset() % 4096, 0);

    let modules = container.modules();
    assert_eq!(modules.len(), 2);
    assert_eq!(modules[0].abc_name, "app.abc");
    assert_eq!(modules[0].abc_checksum, 0x1234);
    assert_eq!(modules[1].abc_name, "lib.abc");
    assert_eq!(modules[1].region(RegionKind::Text).offset, 64);
    assert_eq!(modules[1].region(RegionKind::Text).size, 32);
    assert_eq!(
        container.module_by_name("lib.abc").map(|m| m.module_index),
        Some(1)
    );
    assert_eq!(
        container.module_for_text_offset(70).map(|m| m.module_index),
        Some(1)
    );

    let entries = container.func_entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].kind, FuncEntryKind::Main);
    assert_eq!(entries[0].fp_delta, 16);
    assert_eq!(entries[0].callee_regs.as_slice(), &[(3, -8), (12, -16)]);
    assert_eq!(entries[1].id, 0x44);
    assert!(entries[1].is_fast_call);
    assert_eq!(entries[1].code_offset, 32);
    assert_eq!(entries[2].module_index, 1);
    assert_eq!(entries[2].code_offset, 64);
    assert!(entries[2].callee_regs.is_empty());

    let foo = container.find_symbol("app_foo").unwrap();
    assert_eq!(foo.value, 32);
    assert_eq!(foo.size, 32);
    assert_eq!(container.symbols().len(), 3);

    let stack_map = container.module_stack_map(&modules[0]);
    let parser = StackMapParser::new(stack_map).unwrap();
    let site = parser.lookup(0x10).unwrap().unwrap();
    assert_eq!(site.stack_map, vec![StackMapEntry::plain(Location::new(6, -40))]);
    assert!(parser.lookup(0x20).unwrap().is_none());
    let lib_map = StackMapParser::new(container.module_stack_map(&modules[1])).unwrap();
    assert_eq!(lib_map.callsite_count(), 0);
}

#[test]
fn test_build_and_read_merged_modules() {
    let container = Container::parse(build(ByteOrder::Little)).unwrap();
    assert_eq!(container.byte_order(), ByteOrder::Little);
    check_container(&container);
}

#[test]
fn test_big_endian_container_loads() {
    let container = Container::parse(build(ByteOrder::Big)).unwrap();
    assert_eq!(container.byte_order(), ByteOrder::Big);
    check_container(&container);
}

#[test]
fn test_text_relocation_resolved() {
    let container = Container::parse(build(ByteOrder::Little)).unwrap();
    let text = container.text();
    // call at text offset 64, field at 65, target app_foo at 32
    let field = i32::from_le_bytes(text[65..69].try_into().unwrap());
    assert_eq!(field, 32 - 4 - 65);
    assert_eq!(text[64], 0xe8);
}

#[test]
fn test_relocation_out_of_range() {
    let mut builder = ContainerBuilder::new(Machine::X86_64);
    builder.add_module(app_module());
    builder.add_module(
        lib_module().with_relocation(Relocation::new(RelocationKind::Rel32, 8, "app_foo", 1 << 40)),
    );
    assert!(matches!(
        builder.build(),
        Err(ContainerError::RelocationOutOfRange { .. })
    ));
}

#[test]
fn test_relocation_unknown_symbol() {
    let mut builder = ContainerBuilder::new(Machine::X86_64);
    builder.add_module(lib_module().with_relocation(Relocation::new(
        RelocationKind::Abs64,
        8,
        "missing",
        0,
    )));
    assert!(matches!(
        builder.build(),
        Err(ContainerError::UnknownSymbol(name)) if name == "missing"
    ));
}

#[test]
fn test_call26_relocation_on_aarch64() {
    let mut text = Vec::new();
    text.extend_from_slice(&0xd503_201fu32.to_le_bytes()); // nop
    text.extend_from_slice(&0x9400_0000u32.to_le_bytes()); // bl
    let module = ModuleInput::new("a.abc", 1, text)
        .with_function(FunctionInput::new("a_entry", FuncEntryKind::Method, 0, 0, 8))
        .with_relocation(Relocation::new(RelocationKind::Call26, 4, "a_entry", 0));
    let mut builder = ContainerBuilder::new(Machine::Aarch64).with_byte_order(ByteOrder::Little);
    builder.add_module(module);
    let container = Container::parse(builder.build().unwrap()).unwrap();
    assert_eq!(container.machine(), Machine::Aarch64);
    let insn = u32::from_le_bytes(container.text()[4..8].try_into().unwrap());
    assert_eq!(insn, 0x9400_0000 | 0x03ff_ffff);
}

#[test]
fn test_function_outside_module_text() {
    let mut builder = ContainerBuilder::new(Machine::X86_64);
    builder.add_module(
        ModuleInput::new("x.abc", 0, vec![0; 8])
            .with_function(FunctionInput::new("x", FuncEntryKind::Method, 0, 4, 8)),
    );
    assert!(matches!(
        builder.build(),
        Err(ContainerError::RegionOutOfRange { .. })
    ));
}

fn reject(mutate: impl FnOnce(&mut Vec<u8>)) -> ContainerError {
    let mut bytes = build(ByteOrder::Little);
    mutate(&mut bytes);
    Container::parse(bytes).unwrap_err()
}

#[test]
fn test_rejects_bad_identification() {
    assert!(matches!(reject(|b| b[0] = 0), ContainerError::BadMagic));
    assert!(matches!(
        reject(|b| b[4] = 1),
        ContainerError::UnsupportedClass(1)
    ));
    assert!(matches!(
        reject(|b| b[5] = 3),
        ContainerError::BadByteOrder(3)
    ));
    assert!(matches!(reject(|b| b[6] = 0), ContainerError::BadVersion(0)));
    assert!(matches!(
        reject(|b| write_u16(b, 18, 3)),
        ContainerError::UnsupportedMachine(3)
    ));
    assert!(matches!(
        reject(|b| b.truncate(40)),
        ContainerError::HeaderTruncated { len: 40 }
    ));
    assert!(matches!(
        reject(|b| b.truncate(3)),
        ContainerError::BadMagic
    ));
}

#[test]
fn test_rejects_bad_section_table() {
    assert!(matches!(
        reject(|b| write_u16(b, 60, 65)),
        ContainerError::TooManySections(65)
    ));
    assert!(matches!(
        reject(|b| {
            let len = b.len() as u64;
            write_u64(b, 40, len - 8);
        }),
        ContainerError::SectionHeadersOutOfRange
    ));
    assert!(matches!(
        reject(|b| {
            let at = section_header_at(b, 2) + 32;
            write_u64(b, at, 1 << 32);
        }),
        ContainerError::SectionOutOfRange { index: 2 }
    ));
    assert!(matches!(
        reject(|b| {
            let at = section_header_at(b, 1);
            b[at..at + 4].copy_from_slice(&0xffffu32.to_le_bytes());
        }),
        ContainerError::BadSectionName { index: 1 }
    ));
}

#[test]
fn test_rejects_missing_section() {
    let err = reject(|b| {
        let name = MODULE_INFO_SECTION.as_bytes();
        let at = b
            .windows(name.len())
            .position(|w| w == name)
            .unwrap();
        b[at + 1] = b'x';
    });
    assert!(matches!(
        err,
        ContainerError::MissingSection(name) if name == MODULE_INFO_SECTION
    ));
}

#[test]
fn test_rejects_symbol_in_undeclared_section() {
    let err = reject(|b| {
        let symtab = section_offset(b, 4);
        write_u16(b, symtab + 24 + 6, 40);
    });
    assert!(matches!(
        err,
        ContainerError::SymbolSectionInvalid {
            symbol: 1,
            section: 40
        }
    ));
}

#[test]
fn test_rejects_region_outside_section() {
    let err = reject(|b| {
        let module_info = section_offset(b, 6);
        // region_sizes[Text] of the first module
        write_u64(b, module_info + 48, 1 << 20);
    });
    assert!(matches!(
        err,
        ContainerError::RegionOutOfRange { what, .. } if what == ".text"
    ));
}

#[test]
fn test_rejects_corrupt_stack_map() {
    let err = reject(|b| {
        let stack_maps = section_offset(b, 2);
        b[stack_maps] = 0xff;
    });
    assert!(matches!(err, ContainerError::StackMap(_)));
}

#[test]
fn test_open_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.an");
    let mut builder = ContainerBuilder::new(Machine::X86_64);
    builder.add_module(app_module());
    builder.add_module(lib_module());
    builder.write_to(&path).unwrap();

    let mapped = Container::open(&path, true).unwrap();
    assert!(mapped.is_mapped());
    assert_eq!(mapped.modules().len(), 2);

    let read = Container::open(&path, false).unwrap();
    assert!(!read.is_mapped());
    assert_eq!(read.bytes(), mapped.bytes());

    assert!(matches!(
        Container::open(dir.path().join("missing.an"), false),
        Err(ContainerError::Io(_))
    ));
}
