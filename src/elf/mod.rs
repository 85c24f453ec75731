//! ELF file model: parse, edit relocation state, serialize.
//!
//! [`ElfFile`] owns a typed copy of everything the serializer needs to
//! reproduce the input: the file header, program headers, every section
//! with its payload, both symbol tables, and the ordered dynamic-tag
//! list. Section payloads stay borrowed views of the input buffer until
//! an edit replaces them.

use std::borrow::Cow;

use goblin::container::{Container, Ctx};
use goblin::elf::section_header::{SHT_NOBITS, SHT_NULL};
use goblin::elf::sym::Sym;
use goblin::elf::ProgramHeader;
use goblin::strtab::Strtab;
use scroll::Endian;

use crate::error::{Error, Result};

mod edit;
mod write;

pub use edit::RelocEntry;

/// Build a 32-bit `r_info` field from a symbol index and relocation type.
pub fn r_info32(sym: u32, r_type: u32) -> u32 {
    (sym << 8) | (r_type & 0xff)
}

/// Build a 64-bit `r_info` field from a symbol index and relocation type.
pub fn r_info64(sym: u32, r_type: u32) -> u64 {
    (u64::from(sym) << 32) | u64::from(r_type)
}

/// One entry of the dynamic section, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynTagValue {
    pub tag: u64,
    pub value: u64,
}

/// A section together with its header fields and payload.
///
/// `size` is the value written to the section header; `file_size` is the
/// number of bytes the section occupies in the file (zero for
/// `SHT_NOBITS`). They only differ for no-bits sections.
#[derive(Debug, Clone)]
pub struct ElfSection<'a> {
    pub name: String,
    /// Offset of the name inside the section header string table.
    pub sh_name: u32,
    pub sh_type: u32,
    pub flags: u64,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
    pub file_size: u64,
    pub link: u32,
    pub info: u32,
    pub addralign: u64,
    pub entsize: u64,
    data: Cow<'a, [u8]>,
}

impl<'a> ElfSection<'a> {
    /// The section payload. Borrowed from the input buffer until an edit
    /// replaces it.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn replace_data(&mut self, data: Vec<u8>) {
        self.size = data.len() as u64;
        self.file_size = data.len() as u64;
        self.data = Cow::Owned(data);
    }
}

/// A symbol table entry with its name resolved.
#[derive(Debug, Clone)]
pub struct ElfSymbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub section_index: usize,
    pub info: u8,
    pub other: u8,
}

impl ElfSymbol {
    /// Symbol type, the low nibble of `st_info`.
    pub fn sym_type(&self) -> u8 {
        self.info & 0xf
    }

    /// Symbol binding, the high nibble of `st_info`.
    pub fn binding(&self) -> u8 {
        self.info >> 4
    }
}

/// A parsed ELF file, mutable through the relocation edit verbs and
/// serializable back to bytes.
pub struct ElfFile<'a> {
    pub(crate) header: goblin::elf::header::Header,
    pub(crate) program_headers: Vec<ProgramHeader>,
    pub(crate) sections: Vec<ElfSection<'a>>,
    pub(crate) symbols: Vec<ElfSymbol>,
    pub(crate) dynamic_symbols: Vec<ElfSymbol>,
    pub(crate) dyn_tags: Vec<DynTagValue>,
    pub(crate) shstr_index: usize,
    pub(crate) ctx: Ctx,
}

impl<'a> ElfFile<'a> {
    /// Parse an ELF image. The buffer must outlive the file: unmodified
    /// section payloads stay borrowed views of it.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let elf = goblin::elf::Elf::parse(data)?;

        let container = if elf.is_64 {
            Container::Big
        } else {
            Container::Little
        };
        let le = if elf.little_endian {
            Endian::Little
        } else {
            Endian::Big
        };
        let ctx = Ctx::new(container, le);

        let mut sections = Vec::with_capacity(elf.section_headers.len());
        for sh in &elf.section_headers {
            let name = elf
                .shdr_strtab
                .get_at(sh.sh_name)
                .unwrap_or("")
                .to_string();
            let file_size = if sh.sh_type == SHT_NOBITS { 0 } else { sh.sh_size };
            let data_slice = if sh.sh_type == SHT_NULL || file_size == 0 {
                &[][..]
            } else {
                let start = sh.sh_offset as usize;
                let end = start
                    .checked_add(file_size as usize)
                    .filter(|&end| end <= data.len())
                    .ok_or_else(|| {
                        Error::Malformed(format!(
                            "section {name:?} extends past end of file"
                        ))
                    })?;
                &data[start..end]
            };
            sections.push(ElfSection {
                name,
                sh_name: sh.sh_name as u32,
                sh_type: sh.sh_type,
                flags: sh.sh_flags,
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
                file_size,
                link: sh.sh_link,
                info: sh.sh_info,
                addralign: sh.sh_addralign,
                entsize: sh.sh_entsize,
                data: Cow::Borrowed(data_slice),
            });
        }

        let symbols = collect_symbols(elf.syms.iter(), &elf.strtab);
        let dynamic_symbols = collect_symbols(elf.dynsyms.iter(), &elf.dynstrtab);

        let dyn_tags = elf
            .dynamic
            .as_ref()
            .map(|dynamic| {
                dynamic
                    .dyns
                    .iter()
                    .map(|entry| DynTagValue {
                        tag: entry.d_tag,
                        value: entry.d_val,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ElfFile {
            header: elf.header,
            program_headers: elf.program_headers,
            sections,
            symbols,
            dynamic_symbols,
            dyn_tags,
            shstr_index: elf.header.e_shstrndx as usize,
            ctx,
        })
    }

    /// Whether this is an `ELFCLASS64` file.
    pub fn is_64(&self) -> bool {
        self.ctx.container.is_big()
    }

    /// The parsed file header. `e_shoff` tracks the relocated section
    /// header table as edits move it.
    pub fn header(&self) -> &goblin::elf::header::Header {
        &self.header
    }

    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    pub fn sections(&self) -> &[ElfSection<'a>] {
        &self.sections
    }

    /// Look up a section by name.
    pub fn section(&self, name: &str) -> Option<&ElfSection<'a>> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_by_index(&self, index: usize) -> Option<&ElfSection<'a>> {
        self.sections.get(index)
    }

    /// `.symtab` entries, including the initial null symbol.
    pub fn symbols(&self) -> &[ElfSymbol] {
        &self.symbols
    }

    /// `.dynsym` entries, including the initial null symbol.
    pub fn dynamic_symbols(&self) -> &[ElfSymbol] {
        &self.dynamic_symbols
    }

    /// The dynamic section entries in file order.
    pub fn dyn_tags(&self) -> &[DynTagValue] {
        &self.dyn_tags
    }

    /// The value of a dynamic tag, if present.
    pub fn dyn_tag(&self, tag: u64) -> Option<u64> {
        self.dyn_tags
            .iter()
            .find(|entry| entry.tag == tag)
            .map(|entry| entry.value)
    }

    pub(crate) fn section_index_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }
}

fn collect_symbols(syms: impl Iterator<Item = Sym>, strtab: &Strtab) -> Vec<ElfSymbol> {
    syms.map(|sym| ElfSymbol {
        name: strtab.get_at(sym.st_name).unwrap_or("").to_string(),
        value: sym.st_value,
        size: sym.st_size,
        section_index: sym.st_shndx,
        info: sym.st_info,
        other: sym.st_other,
    })
    .collect()
}
