//! ELF64 on-disk records

use bytemuck::{Pod, Zeroable};
use otter_aot_stackmap::Triple;

use crate::binary::Record;

/// `\x7fELF`
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// Size of `e_ident`
pub const EI_NIDENT: usize = 16;
/// Index of the class byte in `e_ident`
pub const EI_CLASS: usize = 4;
/// Index of the data (byte order) byte in `e_ident`
pub const EI_DATA: usize = 5;
/// Index of the version byte in `e_ident`
pub const EI_VERSION: usize = 6;
/// 32-bit class
pub const ELFCLASS32: u8 = 1;
/// 64-bit class
pub const ELFCLASS64: u8 = 2;
/// Current ELF version
pub const EV_CURRENT: u8 = 1;
/// Shared object file type
pub const ET_DYN: u16 = 3;
/// x86-64 machine
pub const EM_X86_64: u16 = 62;
/// AArch64 machine
pub const EM_AARCH64: u16 = 183;

/// Program data section
pub const SHT_PROGBITS: u32 = 1;
/// Symbol table section
pub const SHT_SYMTAB: u32 = 2;
/// String table section
pub const SHT_STRTAB: u32 = 3;
/// Section occupies no file space
pub const SHT_NOBITS: u32 = 8;
/// Section is allocated at run time
pub const SHF_ALLOC: u64 = 0x2;
/// Section holds executable code
pub const SHF_EXECINSTR: u64 = 0x4;

/// Undefined section index
pub const SHN_UNDEF: u16 = 0;
/// Absolute symbol section index
pub const SHN_ABS: u16 = 0xfff1;

/// Loadable segment
pub const PT_LOAD: u32 = 1;
/// Executable segment
pub const PF_X: u32 = 0x1;
/// Readable segment
pub const PF_R: u32 = 0x4;

/// Function symbol type
pub const STT_FUNC: u8 = 2;
/// Global symbol binding
pub const STB_GLOBAL: u8 = 1;

/// Page alignment of the text section
pub const PAGE_ALIGN: u64 = 4096;

/// Target machine of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    /// x86-64
    X86_64,
    /// AArch64
    Aarch64,
}

impl Machine {
    /// Machine of the running process
    pub const fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Self::Aarch64
        } else {
            Self::X86_64
        }
    }

    /// Decode `e_machine`
    pub fn from_e_machine(value: u16) -> Option<Self> {
        match value {
            EM_X86_64 => Some(Self::X86_64),
            EM_AARCH64 => Some(Self::Aarch64),
            _ => None,
        }
    }

    /// `e_machine` value
    pub fn e_machine(self) -> u16 {
        match self {
            Self::X86_64 => EM_X86_64,
            Self::Aarch64 => EM_AARCH64,
        }
    }

    /// Register numbering for stack maps
    pub fn triple(self) -> Triple {
        match self {
            Self::X86_64 => Triple::X86_64,
            Self::Aarch64 => Triple::Aarch64,
        }
    }

    /// Alignment of each module's code inside the merged text
    pub fn text_align(self) -> u64 {
        16
    }
}

/// `Elf64_Ehdr`
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Elf64Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf64Header {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl Record for Elf64Header {
    fn byte_swapped(self) -> Self {
        Self {
            e_ident: self.e_ident,
            e_type: self.e_type.swap_bytes(),
            e_machine: self.e_machine.swap_bytes(),
            e_version: self.e_version.swap_bytes(),
            e_entry: self.e_entry.swap_bytes(),
            e_phoff: self.e_phoff.swap_bytes(),
            e_shoff: self.e_shoff.swap_bytes(),
            e_flags: self.e_flags.swap_bytes(),
            e_ehsize: self.e_ehsize.swap_bytes(),
            e_phentsize: self.e_phentsize.swap_bytes(),
            e_phnum: self.e_phnum.swap_bytes(),
            e_shentsize: self.e_shentsize.swap_bytes(),
            e_shnum: self.e_shnum.swap_bytes(),
            e_shstrndx: self.e_shstrndx.swap_bytes(),
        }
    }
}

/// `Elf64_Shdr`
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Elf64SectionHeader {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Elf64SectionHeader {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl Record for Elf64SectionHeader {
    fn byte_swapped(self) -> Self {
        Self {
            sh_name: self.sh_name.swap_bytes(),
            sh_type: self.sh_type.swap_bytes(),
            sh_flags: self.sh_flags.swap_bytes(),
            sh_addr: self.sh_addr.swap_bytes(),
            sh_offset: self.sh_offset.swap_bytes(),
            sh_size: self.sh_size.swap_bytes(),
            sh_link: self.sh_link.swap_bytes(),
            sh_info: self.sh_info.swap_bytes(),
            sh_addralign: self.sh_addralign.swap_bytes(),
            sh_entsize: self.sh_entsize.swap_bytes(),
        }
    }
}

/// `Elf64_Phdr`
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64ProgramHeader {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl Record for Elf64ProgramHeader {
    fn byte_swapped(self) -> Self {
        Self {
            p_type: self.p_type.swap_bytes(),
            p_flags: self.p_flags.swap_bytes(),
            p_offset: self.p_offset.swap_bytes(),
            p_vaddr: self.p_vaddr.swap_bytes(),
            p_paddr: self.p_paddr.swap_bytes(),
            p_filesz: self.p_filesz.swap_bytes(),
            p_memsz: self.p_memsz.swap_bytes(),
            p_align: self.p_align.swap_bytes(),
        }
    }
}

/// `Elf64_Sym`
#[allow(missing_docs)]
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Elf64Sym {
    /// Encoded size
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl Record for Elf64Sym {
    fn byte_swapped(self) -> Self {
        Self {
            st_name: self.st_name.swap_bytes(),
            st_info: self.st_info,
            st_other: self.st_other,
            st_shndx: self.st_shndx.swap_bytes(),
            st_value: self.st_value.swap_bytes(),
            st_size: self.st_size.swap_bytes(),
        }
    }
}
