//! Container reader.
//!
//! Nothing read from the file is trusted until it has been checked against
//! the file extent: identification bytes, header tables, section ranges,
//! symbol section indices, descriptor regions and each module's stack map.

use std::ops::{Deref, Range};
use std::path::Path;

use memmap2::Mmap;
use otter_aot_stackmap::{CalleeRegAndOffsetVec, StackMapParser};
use tracing::{debug, trace};

use crate::binary::{BinaryReader, ByteOrder};
use crate::descriptors::{
    CalleeRegRecord, FUNC_ENTRY_SECTION, FuncEntryDes, FuncEntryKind, FuncEntryRecord,
    MODULE_INFO_SECTION, ModuleSectionDes, ModuleSectionRecord, Region, RegionKind,
    STACKMAP_SECTION, STRTAB_SECTION, SYMTAB_SECTION, SymbolDes, TEXT_SECTION,
};
use crate::elf::{
    EI_CLASS, EI_DATA, EI_NIDENT, EI_VERSION, ELF_MAGIC, ELFCLASS64, EV_CURRENT, Elf64Header,
    Elf64ProgramHeader, Elf64SectionHeader, Elf64Sym, Machine, SHN_ABS, SHN_UNDEF, SHT_NOBITS,
};
use crate::error::{ContainerError, Result};

/// Upper bound on section headers in one container
pub const MAX_SECTION_COUNT: u16 = 64;

/// Backing storage of a loaded container
#[derive(Debug)]
pub enum ContainerBytes {
    /// Read into memory
    Owned(Vec<u8>),
    /// Memory-mapped read-only
    Mapped(Mmap),
}

impl Deref for ContainerBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

/// A named section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Section name from `.shstrtab`
    pub name: String,
    /// Section header index
    pub index: usize,
    /// Header as read (host order)
    pub header: Elf64SectionHeader,
}

impl SectionInfo {
    /// File byte range
    pub fn range(&self) -> Range<usize> {
        let start = self.header.sh_offset as usize;
        start..start.saturating_add(self.header.sh_size as usize)
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.header.sh_size
    }
}

#[derive(Debug)]
struct Layout {
    order: ByteOrder,
    machine: Machine,
    header: Elf64Header,
    sections: Vec<SectionInfo>,
    modules: Vec<ModuleSectionDes>,
    func_entries: Vec<FuncEntryDes>,
    symbols: Vec<SymbolDes>,
}

/// A validated, read-only container
#[derive(Debug)]
pub struct Container {
    bytes: ContainerBytes,
    layout: Layout,
}

impl Container {
    /// Validate container bytes
    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        Self::from_storage(ContainerBytes::Owned(bytes))
    }

    /// Open the container at `path`, memory-mapping it when `use_mmap` is set
    pub fn open(path: impl AsRef<Path>, use_mmap: bool) -> Result<Self> {
        let path = path.as_ref();
        let storage = if use_mmap {
            let file = std::fs::File::open(path)?;
            // SAFETY: the mapping is read-only and containers are never
            // modified while loaded.
            let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
            ContainerBytes::Mapped(map)
        } else {
            ContainerBytes::Owned(std::fs::read(path)?)
        };
        let container = Self::from_storage(storage)?;
        debug!(
            path = %path.display(),
            mapped = use_mmap,
            modules = container.modules().len(),
            "opened AOT container"
        );
        Ok(container)
    }

    fn from_storage(bytes: ContainerBytes) -> Result<Self> {
        let layout = parse_layout(&bytes)?;
        Ok(Self { bytes, layout })
    }

    /// Whole file
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the file is memory-mapped
    pub fn is_mapped(&self) -> bool {
        matches!(self.bytes, ContainerBytes::Mapped(_))
    }

    /// Declared byte order
    pub fn byte_order(&self) -> ByteOrder {
        self.layout.order
    }

    /// Target machine
    pub fn machine(&self) -> Machine {
        self.layout.machine
    }

    /// ELF header in host order
    pub fn header(&self) -> &Elf64Header {
        &self.layout.header
    }

    /// All named sections
    pub fn sections(&self) -> &[SectionInfo] {
        &self.layout.sections
    }

    /// Section by name
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.layout.sections.iter().find(|s| s.name == name)
    }

    /// Bytes of the section named `name`
    pub fn section_data(&self, name: &str) -> Option<&[u8]> {
        self.section(name)
            .and_then(|s| self.bytes.get(s.range()))
    }

    /// File offset of `.text`
    pub fn text_file_offset(&self) -> usize {
        self.section(TEXT_SECTION)
            .map(|s| s.header.sh_offset as usize)
            .unwrap_or_default()
    }

    /// Merged machine code
    pub fn text(&self) -> &[u8] {
        self.section_data(TEXT_SECTION).unwrap_or_default()
    }

    /// Module descriptors
    pub fn modules(&self) -> &[ModuleSectionDes] {
        &self.layout.modules
    }

    /// Module descriptor by index
    pub fn module(&self, module_index: u32) -> Option<&ModuleSectionDes> {
        self.layout.modules.get(module_index as usize)
    }

    /// Module compiled from the bytecode file `abc_name`
    pub fn module_by_name(&self, abc_name: &str) -> Option<&ModuleSectionDes> {
        self.layout.modules.iter().find(|m| m.abc_name == abc_name)
    }

    /// Module whose code contains `text_offset`
    pub fn module_for_text_offset(&self, text_offset: u64) -> Option<&ModuleSectionDes> {
        self.layout
            .modules
            .iter()
            .find(|m| m.region(RegionKind::Text).contains(text_offset))
    }

    /// Bytes of one region of a module
    pub fn region_data(&self, module: &ModuleSectionDes, kind: RegionKind) -> &[u8] {
        let region = module.region(kind);
        self.section_data(kind.section_name())
            .and_then(|data| data.get(region.offset as usize..region.end()? as usize))
            .unwrap_or_default()
    }

    /// Stack map sub-section of a module
    pub fn module_stack_map(&self, module: &ModuleSectionDes) -> &[u8] {
        self.region_data(module, RegionKind::StackMap)
    }

    /// Function entry descriptors
    pub fn func_entries(&self) -> &[FuncEntryDes] {
        &self.layout.func_entries
    }

    /// Function entries of one module
    pub fn module_func_entries(
        &self,
        module_index: u32,
    ) -> impl Iterator<Item = (usize, &FuncEntryDes)> + '_ {
        self.layout
            .func_entries
            .iter()
            .enumerate()
            .filter(move |(_, f)| f.module_index == module_index)
    }

    /// Function whose code contains `text_offset`
    pub fn func_entry_for_text_offset(&self, text_offset: u64) -> Option<&FuncEntryDes> {
        self.layout
            .func_entries
            .iter()
            .find(|f| f.text_region().contains(text_offset))
    }

    /// Defined symbols
    pub fn symbols(&self) -> &[SymbolDes] {
        &self.layout.symbols
    }

    /// Symbol by name
    pub fn find_symbol(&self, name: &str) -> Option<&SymbolDes> {
        self.layout.symbols.iter().find(|s| s.name == name)
    }
}

fn check_ident(data: &[u8]) -> Result<ByteOrder> {
    if data.len() < ELF_MAGIC.len() || data[..ELF_MAGIC.len()] != ELF_MAGIC {
        return Err(ContainerError::BadMagic);
    }
    if data.len() < EI_NIDENT {
        return Err(ContainerError::HeaderTruncated { len: data.len() });
    }
    if data[EI_CLASS] != ELFCLASS64 {
        return Err(ContainerError::UnsupportedClass(data[EI_CLASS]));
    }
    let order =
        ByteOrder::from_ei_data(data[EI_DATA]).ok_or(ContainerError::BadByteOrder(data[EI_DATA]))?;
    if data[EI_VERSION] != EV_CURRENT {
        return Err(ContainerError::BadVersion(u32::from(data[EI_VERSION])));
    }
    if data.len() < Elf64Header::SIZE {
        return Err(ContainerError::HeaderTruncated { len: data.len() });
    }
    Ok(order)
}

fn table_fits(offset: u64, count: u64, entry_size: usize, file_len: usize) -> bool {
    count
        .checked_mul(entry_size as u64)
        .and_then(|len| len.checked_add(offset))
        .is_some_and(|end| end <= file_len as u64)
}

fn required<'s>(sections: &'s [SectionInfo], name: &'static str) -> Result<&'s SectionInfo> {
    sections
        .iter()
        .find(|s| s.name == name)
        .ok_or(ContainerError::MissingSection(name))
}

fn parse_layout(data: &[u8]) -> Result<Layout> {
    let order = check_ident(data)?;
    let reader = BinaryReader::new(data, order);
    let header: Elf64Header = reader.read(0)?;
    if header.e_version != u32::from(EV_CURRENT) {
        return Err(ContainerError::BadVersion(header.e_version));
    }
    let machine = Machine::from_e_machine(header.e_machine)
        .ok_or(ContainerError::UnsupportedMachine(header.e_machine))?;

    if header.e_phnum > 0
        && (usize::from(header.e_phentsize) != Elf64ProgramHeader::SIZE
            || !table_fits(
                header.e_phoff,
                u64::from(header.e_phnum),
                Elf64ProgramHeader::SIZE,
                data.len(),
            ))
    {
        return Err(ContainerError::ProgramHeadersOutOfRange);
    }

    if header.e_shnum > MAX_SECTION_COUNT {
        return Err(ContainerError::TooManySections(header.e_shnum));
    }
    if usize::from(header.e_shentsize) != Elf64SectionHeader::SIZE
        || !table_fits(
            header.e_shoff,
            u64::from(header.e_shnum),
            Elf64SectionHeader::SIZE,
            data.len(),
        )
    {
        return Err(ContainerError::SectionHeadersOutOfRange);
    }
    let section_headers = reader
        .read_table::<Elf64SectionHeader>(header.e_shoff as usize, usize::from(header.e_shnum))?;

    for (index, sh) in section_headers.iter().enumerate() {
        if sh.sh_type != SHT_NOBITS
            && !Region::new(sh.sh_offset, sh.sh_size).fits(data.len() as u64)
        {
            return Err(ContainerError::SectionOutOfRange { index });
        }
    }

    let shstrndx = usize::from(header.e_shstrndx);
    let shstrtab = section_headers
        .get(shstrndx)
        .ok_or(ContainerError::SectionOutOfRange { index: shstrndx })?;
    let shstr_start = shstrtab.sh_offset as usize;
    let shstr_end = shstr_start + shstrtab.sh_size as usize;

    let mut sections = Vec::with_capacity(section_headers.len());
    for (index, sh) in section_headers.iter().enumerate() {
        let name = shstr_start
            .checked_add(sh.sh_name as usize)
            .filter(|&at| at < shstr_end)
            .ok_or(ContainerError::BadSectionName { index })
            .and_then(|at| {
                reader
                    .c_str(at, shstr_end)
                    .map_err(|_| ContainerError::BadSectionName { index })
            })?;
        sections.push(SectionInfo {
            name: name.to_owned(),
            index,
            header: *sh,
        });
    }

    let text = required(&sections, TEXT_SECTION)?;
    let stack_maps = required(&sections, STACKMAP_SECTION)?;
    let strtab = required(&sections, STRTAB_SECTION)?;
    let symtab = required(&sections, SYMTAB_SECTION)?;
    let func_entry = required(&sections, FUNC_ENTRY_SECTION)?;
    let module_info = required(&sections, MODULE_INFO_SECTION)?;
    let strtab_range = strtab.range();

    let symbols = read_symbols(&reader, symtab, text, strtab_range.clone(), sections.len())?;
    let modules = read_modules(&reader, module_info, strtab_range, &sections)?;
    let func_entries = read_func_entries(&reader, func_entry, text.size(), modules.len())?;

    let stack_map_data = data
        .get(stack_maps.range())
        .ok_or(ContainerError::SectionOutOfRange {
            index: stack_maps.index,
        })?;
    for module in &modules {
        let region = module.region(RegionKind::StackMap);
        let bytes = region
            .end()
            .and_then(|end| stack_map_data.get(region.offset as usize..end as usize))
            .ok_or(ContainerError::RegionOutOfRange {
                what: STACKMAP_SECTION,
                offset: region.offset,
                size: region.size,
            })?;
        StackMapParser::new(bytes)?.validate()?;
    }

    trace!(
        sections = sections.len(),
        symbols = symbols.len(),
        functions = func_entries.len(),
        "container layout validated"
    );

    Ok(Layout {
        order,
        machine,
        header,
        sections,
        modules,
        func_entries,
        symbols,
    })
}

fn read_symbols(
    reader: &BinaryReader<'_>,
    symtab: &SectionInfo,
    text: &SectionInfo,
    strtab: Range<usize>,
    section_count: usize,
) -> Result<Vec<SymbolDes>> {
    if symtab.header.sh_entsize != Elf64Sym::SIZE as u64
        || symtab.header.sh_size % Elf64Sym::SIZE as u64 != 0
    {
        return Err(ContainerError::SectionOutOfRange {
            index: symtab.index,
        });
    }
    let count = (symtab.header.sh_size / Elf64Sym::SIZE as u64) as usize;
    let table = reader.read_table::<Elf64Sym>(symtab.header.sh_offset as usize, count)?;
    let mut symbols = Vec::with_capacity(count.saturating_sub(1));
    for (index, sym) in table.iter().enumerate().skip(1) {
        let declared = sym.st_shndx == SHN_UNDEF
            || sym.st_shndx == SHN_ABS
            || usize::from(sym.st_shndx) < section_count;
        if !declared {
            return Err(ContainerError::SymbolSectionInvalid {
                symbol: index,
                section: sym.st_shndx,
            });
        }
        let name = strtab
            .start
            .checked_add(sym.st_name as usize)
            .filter(|&at| at < strtab.end)
            .ok_or(ContainerError::SymbolSectionInvalid {
                symbol: index,
                section: sym.st_shndx,
            })?;
        let name = reader.c_str(name, strtab.end)?;
        let value = if usize::from(sym.st_shndx) == text.index {
            sym.st_value
                .checked_sub(text.header.sh_addr)
                .ok_or(ContainerError::SymbolSectionInvalid {
                    symbol: index,
                    section: sym.st_shndx,
                })?
        } else {
            sym.st_value
        };
        symbols.push(SymbolDes {
            name: name.to_owned(),
            value,
            size: sym.st_size,
            section: sym.st_shndx,
        });
    }
    Ok(symbols)
}

fn read_modules(
    reader: &BinaryReader<'_>,
    module_info: &SectionInfo,
    strtab: Range<usize>,
    sections: &[SectionInfo],
) -> Result<Vec<ModuleSectionDes>> {
    let entry_size = std::mem::size_of::<ModuleSectionRecord>() as u64;
    if module_info.header.sh_size % entry_size != 0 {
        return Err(ContainerError::SectionOutOfRange {
            index: module_info.index,
        });
    }
    let count = (module_info.header.sh_size / entry_size) as usize;
    let records =
        reader.read_table::<ModuleSectionRecord>(module_info.header.sh_offset as usize, count)?;

    let mut modules = Vec::with_capacity(count);
    for record in records.iter() {
        let mut regions = [Region::default(); 4];
        for kind in RegionKind::ALL {
            let region = Region::new(
                record.region_offsets[kind as usize],
                record.region_sizes[kind as usize],
            );
            let section = required(sections, kind.section_name())?;
            if !region.fits(section.size()) {
                return Err(ContainerError::RegionOutOfRange {
                    what: kind.section_name(),
                    offset: region.offset,
                    size: region.size,
                });
            }
            regions[kind as usize] = region;
        }
        let name_at = strtab.start + record.abc_name as usize;
        if name_at >= strtab.end {
            return Err(ContainerError::RegionOutOfRange {
                what: "module name",
                offset: u64::from(record.abc_name),
                size: 0,
            });
        }
        modules.push(ModuleSectionDes {
            module_index: record.module_index,
            abc_name: reader.c_str(name_at, strtab.end)?.to_owned(),
            abc_checksum: record.abc_checksum,
            regions,
        });
    }
    Ok(modules)
}

fn read_func_entries(
    reader: &BinaryReader<'_>,
    section: &SectionInfo,
    text_size: u64,
    module_count: usize,
) -> Result<Vec<FuncEntryDes>> {
    let entry_size = std::mem::size_of::<FuncEntryRecord>();
    let reg_size = std::mem::size_of::<CalleeRegRecord>();
    let count = section.header.sh_info as usize;
    let entries_len = count as u64 * entry_size as u64;
    if entries_len > section.size() || (section.size() - entries_len) % reg_size as u64 != 0 {
        return Err(ContainerError::SectionOutOfRange {
            index: section.index,
        });
    }
    let offset = section.header.sh_offset as usize;
    let records = reader.read_table::<FuncEntryRecord>(offset, count)?;
    let reg_count = ((section.size() - entries_len) / reg_size as u64) as usize;
    let regs =
        reader.read_table::<CalleeRegRecord>(offset + entries_len as usize, reg_count)?;

    let mut entries = Vec::with_capacity(count);
    for record in records.iter() {
        let kind = FuncEntryKind::try_from(record.kind)?;
        let code = Region::new(record.code_offset, u64::from(record.func_size));
        if !code.fits(text_size) || record.module_index as usize >= module_count {
            return Err(ContainerError::RegionOutOfRange {
                what: "function code",
                offset: code.offset,
                size: code.size,
            });
        }
        let start = record.callee_reg_start as usize;
        let callee = start
            .checked_add(record.callee_reg_num as usize)
            .and_then(|end| regs.get(start..end))
            .ok_or(ContainerError::RegionOutOfRange {
                what: "callee registers",
                offset: u64::from(record.callee_reg_start),
                size: u64::from(record.callee_reg_num),
            })?;
        entries.push(FuncEntryDes {
            id: record.id,
            kind,
            is_fast_call: record.is_fast_call != 0,
            module_index: record.module_index,
            code_offset: record.code_offset,
            func_size: record.func_size,
            fp_delta: record.fp_delta,
            callee_regs: callee
                .iter()
                .map(|r| (r.reg, r.offset))
                .collect::<CalleeRegAndOffsetVec>(),
        });
    }
    Ok(entries)
}
