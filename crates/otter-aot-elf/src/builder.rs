//! Container builder.
//!
//! Modules are merged in four stages: per-module regions are laid out in
//! the merged text, stack map, string and symbol sections; sections are
//! assigned file offsets; relocations are resolved against the final text
//! layout; finally the ELF header, program header and section headers are
//! written.

use std::path::Path;

use otter_aot_stackmap::{CallSiteInfo, CalleeRegAndOffsetVec, StackMapBuilder};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::binary::{BinaryWriter, ByteOrder, patch};
use crate::descriptors::{
    CalleeRegRecord, FUNC_ENTRY_SECTION, FuncEntryKind, FuncEntryRecord, MODULE_INFO_SECTION,
    ModuleSectionRecord, RegionKind, SHSTRTAB_SECTION, STACKMAP_SECTION, STRTAB_SECTION,
    SYMTAB_SECTION, TEXT_SECTION,
};
use crate::elf::{
    EI_CLASS, EI_DATA, EI_VERSION, ELF_MAGIC, ELFCLASS64, ET_DYN, EV_CURRENT, Elf64Header,
    Elf64ProgramHeader, Elf64SectionHeader, Elf64Sym, Machine, PAGE_ALIGN, PF_R, PF_X, PT_LOAD,
    SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS, SHT_STRTAB, SHT_SYMTAB, STB_GLOBAL, STT_FUNC,
};
use crate::error::{ContainerError, Result};
use crate::reloc::{self, Relocation};

const TEXT_INDEX: u16 = 1;
const STACKMAP_INDEX: u16 = 2;
const STRTAB_INDEX: u16 = 3;
const SYMTAB_INDEX: u16 = 4;
const FUNC_ENTRY_INDEX: u16 = 5;
const MODULE_INFO_INDEX: u16 = 6;
const SHSTRTAB_INDEX: u16 = 7;
const SECTION_COUNT: u16 = 8;

/// A function inside a module's code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInput {
    /// Symbol name, unique within the container
    pub name: String,
    /// Entry kind
    pub kind: FuncEntryKind,
    /// Stub index or bytecode method offset
    pub id: u32,
    /// Offset inside the module's code
    pub offset: u32,
    /// Code size
    pub size: u32,
    /// Fast-call convention
    pub is_fast_call: bool,
    /// Frame pointer delta
    pub fp_delta: i32,
    /// Callee-saved register spills
    pub callee_regs: CalleeRegAndOffsetVec,
}

impl FunctionInput {
    /// A function of `kind` at `offset..offset + size`
    pub fn new(
        name: impl Into<String>,
        kind: FuncEntryKind,
        id: u32,
        offset: u32,
        size: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            id,
            offset,
            size,
            is_fast_call: false,
            fp_delta: 0,
            callee_regs: CalleeRegAndOffsetVec::new(),
        }
    }

    /// Mark as fast-call
    pub fn with_fast_call(mut self, is_fast_call: bool) -> Self {
        self.is_fast_call = is_fast_call;
        self
    }

    /// Set the frame pointer delta
    pub fn with_fp_delta(mut self, fp_delta: i32) -> Self {
        self.fp_delta = fp_delta;
        self
    }

    /// Record callee-saved register spills
    pub fn with_callee_regs(mut self, regs: impl IntoIterator<Item = (u16, i32)>) -> Self {
        self.callee_regs.extend(regs);
        self
    }
}

/// One compiled bytecode module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInput {
    /// Bytecode file the module was compiled from
    pub abc_name: String,
    /// Checksum of that file
    pub abc_checksum: u32,
    /// Machine code
    pub text: Vec<u8>,
    /// Functions inside `text`
    pub functions: Vec<FunctionInput>,
    /// Call sites, pc offsets relative to `text`
    pub call_sites: Vec<CallSiteInfo>,
    /// Fields of `text` to patch
    pub relocations: Vec<Relocation>,
}

impl ModuleInput {
    /// Module for `abc_name` with code `text`
    pub fn new(abc_name: impl Into<String>, abc_checksum: u32, text: Vec<u8>) -> Self {
        Self {
            abc_name: abc_name.into(),
            abc_checksum,
            text,
            ..Default::default()
        }
    }

    /// Add a function
    pub fn with_function(mut self, function: FunctionInput) -> Self {
        self.functions.push(function);
        self
    }

    /// Add a call site
    pub fn with_call_site(mut self, call_site: CallSiteInfo) -> Self {
        self.call_sites.push(call_site);
        self
    }

    /// Add a relocation
    pub fn with_relocation(mut self, relocation: Relocation) -> Self {
        self.relocations.push(relocation);
        self
    }
}

/// Assembles modules into container bytes
#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    machine: Machine,
    order: ByteOrder,
    modules: Vec<ModuleInput>,
}

fn to_u32(what: &'static str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| ContainerError::RegionOutOfRange {
        what,
        offset: value as u64,
        size: 0,
    })
}

fn push_str(table: &mut Vec<u8>, s: &str) -> Result<u32> {
    let offset = to_u32("string table", table.len())?;
    table.extend_from_slice(s.as_bytes());
    table.push(0);
    Ok(offset)
}

fn align_vec(buf: &mut Vec<u8>, align: usize) {
    buf.resize(buf.len().next_multiple_of(align), 0);
}

struct Merged {
    text: Vec<u8>,
    stack_maps: Vec<u8>,
    strtab: Vec<u8>,
    symbols: Vec<Elf64Sym>,
    modules: Vec<ModuleSectionRecord>,
    functions: Vec<FuncEntryRecord>,
    callee_regs: Vec<CalleeRegRecord>,
    text_starts: Vec<usize>,
    symbol_offsets: FxHashMap<String, u64>,
}

impl ContainerBuilder {
    /// Builder for `machine` in host byte order
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            order: ByteOrder::native(),
            modules: Vec::new(),
        }
    }

    /// Write the container in `order`
    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    /// Add a module, returning its module index
    pub fn add_module(&mut self, module: ModuleInput) -> u32 {
        self.modules.push(module);
        (self.modules.len() - 1) as u32
    }

    /// File offset of `.text`, fixed by the header sizes
    pub fn text_file_offset() -> usize {
        (Elf64Header::SIZE + Elf64ProgramHeader::SIZE).next_multiple_of(PAGE_ALIGN as usize)
    }

    fn merge(&self, text_vaddr: u64) -> Result<Merged> {
        let mut merged = Merged {
            text: Vec::new(),
            stack_maps: Vec::new(),
            strtab: vec![0],
            symbols: vec![Elf64Sym::default()],
            modules: Vec::with_capacity(self.modules.len()),
            functions: Vec::new(),
            callee_regs: Vec::new(),
            text_starts: Vec::with_capacity(self.modules.len()),
            symbol_offsets: FxHashMap::default(),
        };

        for (index, module) in self.modules.iter().enumerate() {
            align_vec(&mut merged.text, self.machine.text_align() as usize);
            let text_start = merged.text.len();
            merged.text.extend_from_slice(&module.text);
            merged.text_starts.push(text_start);

            let mut stack_map = StackMapBuilder::new();
            for call_site in &module.call_sites {
                stack_map.push(call_site.clone());
            }
            let stack_map = stack_map.build()?;
            align_vec(&mut merged.stack_maps, 8);
            let stack_map_start = merged.stack_maps.len();
            merged.stack_maps.extend_from_slice(&stack_map);

            let strtab_start = merged.strtab.len();
            let abc_name = push_str(&mut merged.strtab, &module.abc_name)?;
            let symtab_start = merged.symbols.len() * Elf64Sym::SIZE;

            for function in &module.functions {
                let end = u64::from(function.offset) + u64::from(function.size);
                if end > module.text.len() as u64 {
                    return Err(ContainerError::RegionOutOfRange {
                        what: "function",
                        offset: u64::from(function.offset),
                        size: u64::from(function.size),
                    });
                }
                let code_offset = (text_start + function.offset as usize) as u64;
                merged.symbols.push(Elf64Sym {
                    st_name: push_str(&mut merged.strtab, &function.name)?,
                    st_info: (STB_GLOBAL << 4) | STT_FUNC,
                    st_other: 0,
                    st_shndx: TEXT_INDEX,
                    st_value: text_vaddr + code_offset,
                    st_size: u64::from(function.size),
                });
                merged
                    .symbol_offsets
                    .insert(function.name.clone(), code_offset);

                merged.functions.push(FuncEntryRecord {
                    id: function.id,
                    kind: function.kind as u8,
                    is_fast_call: u8::from(function.is_fast_call),
                    reserved: 0,
                    module_index: index as u32,
                    func_size: function.size,
                    code_offset,
                    fp_delta: function.fp_delta,
                    callee_reg_start: to_u32("callee registers", merged.callee_regs.len())?,
                    callee_reg_num: to_u32("callee registers", function.callee_regs.len())?,
                    reserved2: 0,
                });
                merged
                    .callee_regs
                    .extend(function.callee_regs.iter().map(|&(reg, offset)| CalleeRegRecord {
                        reg,
                        reserved: 0,
                        offset,
                    }));
            }

            let mut record = ModuleSectionRecord {
                module_index: index as u32,
                abc_name,
                abc_checksum: module.abc_checksum,
                ..Default::default()
            };
            let regions = [
                (text_start, module.text.len()),
                (stack_map_start, stack_map.len()),
                (strtab_start, merged.strtab.len() - strtab_start),
                (
                    symtab_start,
                    merged.symbols.len() * Elf64Sym::SIZE - symtab_start,
                ),
            ];
            for (kind, (offset, size)) in RegionKind::ALL.iter().zip(regions) {
                record.region_offsets[*kind as usize] = offset as u64;
                record.region_sizes[*kind as usize] = size as u64;
            }
            merged.modules.push(record);
        }
        Ok(merged)
    }

    fn resolve_relocations(&self, merged: &mut Merged, text_vaddr: u64) -> Result<()> {
        for (module, &text_start) in self.modules.iter().zip(&merged.text_starts) {
            for relocation in &module.relocations {
                let target = *merged
                    .symbol_offsets
                    .get(&relocation.symbol)
                    .ok_or_else(|| ContainerError::UnknownSymbol(relocation.symbol.clone()))?;
                let field_end = relocation.offset as usize + relocation.kind.width();
                if field_end > module.text.len() {
                    return Err(ContainerError::RegionOutOfRange {
                        what: "relocation",
                        offset: u64::from(relocation.offset),
                        size: relocation.kind.width() as u64,
                    });
                }
                let at = text_start + relocation.offset as usize;
                reloc::apply(
                    relocation.kind,
                    &mut merged.text,
                    at,
                    text_vaddr + at as u64,
                    text_vaddr + target,
                    relocation.addend,
                    self.order,
                )?;
            }
        }
        Ok(())
    }

    /// Produce the container bytes
    pub fn build(&self) -> Result<Vec<u8>> {
        let text_offset = Self::text_file_offset();
        let text_vaddr = text_offset as u64;
        let mut merged = self.merge(text_vaddr)?;
        self.resolve_relocations(&mut merged, text_vaddr)?;

        let mut shstrtab = vec![0u8];
        let mut names = [0u32; SECTION_COUNT as usize];
        for (index, name) in [
            TEXT_SECTION,
            STACKMAP_SECTION,
            STRTAB_SECTION,
            SYMTAB_SECTION,
            FUNC_ENTRY_SECTION,
            MODULE_INFO_SECTION,
            SHSTRTAB_SECTION,
        ]
        .into_iter()
        .enumerate()
        {
            names[index + 1] = push_str(&mut shstrtab, name)?;
        }

        let mut w = BinaryWriter::new(self.order);
        w.pad_to(text_offset);
        w.write_bytes(&merged.text);

        w.align_to(8);
        let stack_map_offset = w.position();
        w.write_bytes(&merged.stack_maps);

        let strtab_offset = w.position();
        w.write_bytes(&merged.strtab);

        w.align_to(8);
        let symtab_offset = w.position();
        for symbol in &merged.symbols {
            w.write(*symbol);
        }

        w.align_to(8);
        let func_entry_offset = w.position();
        for function in &merged.functions {
            w.write(*function);
        }
        for reg in &merged.callee_regs {
            w.write(*reg);
        }
        let func_entry_size = w.position() - func_entry_offset;

        w.align_to(8);
        let module_info_offset = w.position();
        for module in &merged.modules {
            w.write(*module);
        }

        let shstrtab_offset = w.position();
        w.write_bytes(&shstrtab);

        w.align_to(8);
        let section_headers_offset = w.position();
        let section = |index: u16, sh_type: u32, offset: usize, size: usize| Elf64SectionHeader {
            sh_name: names[index as usize],
            sh_type,
            sh_offset: offset as u64,
            sh_size: size as u64,
            sh_addralign: 1,
            ..Default::default()
        };
        let headers = [
            Elf64SectionHeader::default(),
            Elf64SectionHeader {
                sh_flags: SHF_ALLOC | SHF_EXECINSTR,
                sh_addr: text_vaddr,
                sh_addralign: PAGE_ALIGN,
                ..section(TEXT_INDEX, SHT_PROGBITS, text_offset, merged.text.len())
            },
            Elf64SectionHeader {
                sh_addralign: 8,
                ..section(
                    STACKMAP_INDEX,
                    SHT_PROGBITS,
                    stack_map_offset,
                    merged.stack_maps.len(),
                )
            },
            section(STRTAB_INDEX, SHT_STRTAB, strtab_offset, merged.strtab.len()),
            Elf64SectionHeader {
                sh_link: u32::from(STRTAB_INDEX),
                sh_info: 1,
                sh_addralign: 8,
                sh_entsize: Elf64Sym::SIZE as u64,
                ..section(
                    SYMTAB_INDEX,
                    SHT_SYMTAB,
                    symtab_offset,
                    merged.symbols.len() * Elf64Sym::SIZE,
                )
            },
            Elf64SectionHeader {
                sh_info: to_u32("function entries", merged.functions.len())?,
                sh_addralign: 8,
                sh_entsize: std::mem::size_of::<FuncEntryRecord>() as u64,
                ..section(
                    FUNC_ENTRY_INDEX,
                    SHT_PROGBITS,
                    func_entry_offset,
                    func_entry_size,
                )
            },
            Elf64SectionHeader {
                sh_addralign: 8,
                sh_entsize: std::mem::size_of::<ModuleSectionRecord>() as u64,
                ..section(
                    MODULE_INFO_INDEX,
                    SHT_PROGBITS,
                    module_info_offset,
                    merged.modules.len() * std::mem::size_of::<ModuleSectionRecord>(),
                )
            },
            section(
                SHSTRTAB_INDEX,
                SHT_STRTAB,
                shstrtab_offset,
                shstrtab.len(),
            ),
        ];
        for header in headers {
            w.write(header);
        }

        let mut e_ident = [0u8; 16];
        e_ident[..4].copy_from_slice(&ELF_MAGIC);
        e_ident[EI_CLASS] = ELFCLASS64;
        e_ident[EI_DATA] = self.order.ei_data();
        e_ident[EI_VERSION] = EV_CURRENT;
        let header = Elf64Header {
            e_ident,
            e_type: ET_DYN,
            e_machine: self.machine.e_machine(),
            e_version: u32::from(EV_CURRENT),
            e_entry: 0,
            e_phoff: Elf64Header::SIZE as u64,
            e_shoff: section_headers_offset as u64,
            e_flags: 0,
            e_ehsize: Elf64Header::SIZE as u16,
            e_phentsize: Elf64ProgramHeader::SIZE as u16,
            e_phnum: 1,
            e_shentsize: Elf64SectionHeader::SIZE as u16,
            e_shnum: SECTION_COUNT,
            e_shstrndx: SHSTRTAB_INDEX,
        };
        let text_segment = Elf64ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: text_offset as u64,
            p_vaddr: text_vaddr,
            p_paddr: text_vaddr,
            p_filesz: merged.text.len() as u64,
            p_memsz: merged.text.len() as u64,
            p_align: PAGE_ALIGN,
        };

        let mut bytes = w.into_inner();
        patch(&mut bytes, 0, header, self.order)?;
        patch(&mut bytes, Elf64Header::SIZE, text_segment, self.order)?;

        debug!(
            modules = self.modules.len(),
            functions = merged.functions.len(),
            text = merged.text.len(),
            size = bytes.len(),
            "built AOT container"
        );
        Ok(bytes)
    }

    /// Build and write to `path`
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }
}
