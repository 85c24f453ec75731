//! Mach-O file model: parse, edit relocation state, serialize.
//!
//! [`MachoFile`] keeps every load command as raw bytes (rewritten in
//! place when section or dyld-info fields change), the sections of all
//! segments flattened into one list, and the linkedit tables (symbol
//! table, indirect symbols, string table, dyld info streams, function
//! starts, data-in-code, signature block) as owned blobs at their
//! declared offsets. The dyld rebase/bind streams are derived state:
//! whenever relocation state has been edited they are regenerated from
//! the relocation lists at serialization time.

use std::borrow::Cow;
use std::collections::HashMap;

use goblin::container::{Container, Ctx};
use goblin::mach::constants::{
    SECTION_TYPE, S_GB_ZEROFILL, S_THREAD_LOCAL_ZEROFILL, S_ZEROFILL,
};
use goblin::mach::load_command::{
    DyldInfoCommand, DysymtabCommand, SegmentCommand32, SegmentCommand64, Section32, Section64,
    SymtabCommand, LC_CODE_SIGNATURE, LC_DATA_IN_CODE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY,
    LC_DYSYMTAB, LC_FUNCTION_STARTS, LC_SEGMENT, LC_SEGMENT_64, LC_SYMTAB,
};
use scroll::{Endian, Pread};

use crate::error::{Error, Result};
use crate::util::{fixed_cstr, slice_at};

mod dyld;
mod edit;
mod write;

/// A Mach-O relocation record.
///
/// `value` is a symbol index for external relocations and a section
/// index or address payload otherwise. `len` is the log2 width of the
/// patched field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachReloc {
    pub addr: u32,
    pub value: u32,
    pub r_type: u8,
    pub len: u8,
    pub pcrel: bool,
    pub external: bool,
    pub scattered: bool,
}

/// Which dyld bind stream a symbol's bindings are emitted into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindKind {
    #[default]
    Normal,
    Weak,
    Lazy,
}

/// A section within a segment, with its relocation list.
#[derive(Debug, Clone)]
pub struct MachSection<'a> {
    pub name: String,
    pub segname: String,
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub relocs: Vec<MachReloc>,
    data: Cow<'a, [u8]>,
}

impl<'a> MachSection<'a> {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn has_file_data(&self) -> bool {
        let section_type = self.flags & SECTION_TYPE;
        !self.data.is_empty()
            && section_type != S_ZEROFILL
            && section_type != S_GB_ZEROFILL
            && section_type != S_THREAD_LOCAL_ZEROFILL
    }
}

/// A segment load command's fields, kept alongside the raw command bytes.
#[derive(Debug, Clone)]
pub struct MachSegment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub nsects: u32,
    pub(crate) load_index: usize,
    pub(crate) is_64: bool,
}

/// One load command, held as raw bytes in file byte order.
#[derive(Debug, Clone)]
pub struct LoadCommand {
    pub cmd: u32,
    pub(crate) bytes: Vec<u8>,
}

/// The five dyld info streams with their declared placement.
#[derive(Debug, Clone, Default)]
pub struct DylinkInfo {
    pub rebase_off: u32,
    pub rebase_len: u32,
    pub rebase_dat: Vec<u8>,
    pub bind_off: u32,
    pub bind_len: u32,
    pub bind_dat: Vec<u8>,
    pub weak_bind_off: u32,
    pub weak_bind_len: u32,
    pub weak_bind_dat: Vec<u8>,
    pub lazy_bind_off: u32,
    pub lazy_bind_len: u32,
    pub lazy_bind_dat: Vec<u8>,
    pub export_off: u32,
    pub export_len: u32,
    pub export_dat: Vec<u8>,
}

/// An opaque linkedit blob (function starts, data-in-code, signature).
#[derive(Debug, Clone)]
pub struct LinkeditBlock {
    pub offset: u32,
    pub len: u32,
    pub(crate) data: Vec<u8>,
}

/// A symbol table entry with its name resolved.
#[derive(Debug, Clone)]
pub struct MachSymbol {
    pub name: String,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct MachSymtab {
    pub(crate) symoff: u32,
    pub(crate) stroff: u32,
    pub(crate) syms: Vec<MachSymbol>,
    pub(crate) raw_symtab: Vec<u8>,
    pub(crate) raw_strtab: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) struct MachDysymtab {
    pub(crate) indirectsymoff: u32,
    pub(crate) raw_indirect: Vec<u8>,
}

/// A parsed Mach-O file, mutable through the relocation edit verbs and
/// serializable back to bytes.
pub struct MachoFile<'a> {
    pub(crate) header: goblin::mach::header::Header,
    pub(crate) ctx: Ctx,
    pub(crate) loads: Vec<LoadCommand>,
    pub(crate) segments: Vec<MachSegment>,
    pub(crate) sections: Vec<MachSection<'a>>,
    pub(crate) symtab: Option<MachSymtab>,
    pub(crate) dysymtab: Option<MachDysymtab>,
    pub(crate) dylink_info: Option<DylinkInfo>,
    pub(crate) func_starts: Option<LinkeditBlock>,
    pub(crate) data_in_code: Option<LinkeditBlock>,
    pub(crate) sig_block: Option<LinkeditBlock>,
    pub(crate) final_seg_end: u64,
    pub(crate) dylib_ordinals: HashMap<u32, u8>,
    pub(crate) bind_kinds: HashMap<u32, BindKind>,
    pub(crate) relocs_dirty: bool,
    /// Once the streams have been regenerated their placement is owned
    /// by this library; only the pre-existing export info still bounds
    /// them from above.
    pub(crate) streams_regenerated: bool,
}

impl<'a> MachoFile<'a> {
    /// Parse a Mach-O image. The buffer must outlive the file: unmodified
    /// section payloads stay borrowed views of it.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let macho = goblin::mach::MachO::parse(data, 0)?;
        let header = macho.header;
        let is_64 = macho.is_64;
        let container = if is_64 {
            Container::Big
        } else {
            Container::Little
        };
        let endian = if macho.little_endian {
            Endian::Little
        } else {
            Endian::Big
        };
        let ctx = Ctx::new(container, endian);

        let mut file = MachoFile {
            header,
            ctx,
            loads: Vec::with_capacity(header.ncmds),
            segments: Vec::new(),
            sections: Vec::new(),
            symtab: None,
            dysymtab: None,
            dylink_info: None,
            func_starts: None,
            data_in_code: None,
            sig_block: None,
            final_seg_end: 0,
            dylib_ordinals: HashMap::new(),
            bind_kinds: HashMap::new(),
            relocs_dirty: false,
            streams_regenerated: false,
        };

        let header_size = if is_64 { 32 } else { 28 };
        let mut offset = header_size;
        for _ in 0..header.ncmds {
            let cmd: u32 = data.pread_with(offset, endian)?;
            let cmdsize: u32 = data.pread_with(offset + 4, endian)?;
            if cmdsize < 8 {
                return Err(Error::Malformed(format!(
                    "load command at {offset:#x} has size {cmdsize}"
                )));
            }
            let raw = slice_at(data, offset, cmdsize as usize, "load command")?.to_vec();
            let load_index = file.loads.len();
            file.loads.push(LoadCommand { cmd, bytes: raw });

            match cmd {
                LC_SEGMENT => file.parse_segment(data, offset, load_index, false)?,
                LC_SEGMENT_64 => file.parse_segment(data, offset, load_index, true)?,
                LC_SYMTAB => file.parse_symtab(data, offset, is_64)?,
                LC_DYSYMTAB => {
                    let cmd: DysymtabCommand = data.pread_with(offset, endian)?;
                    let raw_indirect = if cmd.indirectsymoff != 0 && cmd.nindirectsyms != 0 {
                        slice_at(
                            data,
                            cmd.indirectsymoff as usize,
                            cmd.nindirectsyms as usize * 4,
                            "indirect symbol table",
                        )?
                        .to_vec()
                    } else {
                        Vec::new()
                    };
                    file.dysymtab = Some(MachDysymtab {
                        indirectsymoff: cmd.indirectsymoff,
                        raw_indirect,
                    });
                }
                LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                    let cmd: DyldInfoCommand = data.pread_with(offset, endian)?;
                    let blob = |off: u32, len: u32, what: &str| -> Result<Vec<u8>> {
                        if off == 0 || len == 0 {
                            Ok(Vec::new())
                        } else {
                            Ok(slice_at(data, off as usize, len as usize, what)?.to_vec())
                        }
                    };
                    file.dylink_info = Some(DylinkInfo {
                        rebase_off: cmd.rebase_off,
                        rebase_len: cmd.rebase_size,
                        rebase_dat: blob(cmd.rebase_off, cmd.rebase_size, "rebase info")?,
                        bind_off: cmd.bind_off,
                        bind_len: cmd.bind_size,
                        bind_dat: blob(cmd.bind_off, cmd.bind_size, "bind info")?,
                        weak_bind_off: cmd.weak_bind_off,
                        weak_bind_len: cmd.weak_bind_size,
                        weak_bind_dat: blob(cmd.weak_bind_off, cmd.weak_bind_size, "weak bind info")?,
                        lazy_bind_off: cmd.lazy_bind_off,
                        lazy_bind_len: cmd.lazy_bind_size,
                        lazy_bind_dat: blob(cmd.lazy_bind_off, cmd.lazy_bind_size, "lazy bind info")?,
                        export_off: cmd.export_off,
                        export_len: cmd.export_size,
                        export_dat: blob(cmd.export_off, cmd.export_size, "export info")?,
                    });
                }
                LC_FUNCTION_STARTS | LC_DATA_IN_CODE | LC_CODE_SIGNATURE => {
                    let dataoff: u32 = data.pread_with(offset + 8, endian)?;
                    let datasize: u32 = data.pread_with(offset + 12, endian)?;
                    let block = LinkeditBlock {
                        offset: dataoff,
                        len: datasize,
                        data: slice_at(data, dataoff as usize, datasize as usize, "linkedit data")?
                            .to_vec(),
                    };
                    match cmd {
                        LC_FUNCTION_STARTS => file.func_starts = Some(block),
                        LC_DATA_IN_CODE => file.data_in_code = Some(block),
                        _ => file.sig_block = Some(block),
                    }
                }
                _ => {}
            }
            offset += cmdsize as usize;
        }

        file.final_seg_end = file
            .segments
            .iter()
            .map(|s| s.fileoff + s.filesize)
            .max()
            .unwrap_or(0);

        Ok(file)
    }

    fn parse_segment(
        &mut self,
        data: &'a [u8],
        offset: usize,
        load_index: usize,
        is_64: bool,
    ) -> Result<()> {
        let endian = self.ctx.le;
        let (name, vmaddr, vmsize, fileoff, filesize, nsects) = if is_64 {
            let seg: SegmentCommand64 = data.pread_with(offset, endian)?;
            (
                fixed_cstr(&seg.segname),
                seg.vmaddr,
                seg.vmsize,
                seg.fileoff,
                seg.filesize,
                seg.nsects,
            )
        } else {
            let seg: SegmentCommand32 = data.pread_with(offset, endian)?;
            (
                fixed_cstr(&seg.segname),
                u64::from(seg.vmaddr),
                u64::from(seg.vmsize),
                u64::from(seg.fileoff),
                u64::from(seg.filesize),
                seg.nsects,
            )
        };
        self.segments.push(MachSegment {
            name: name.clone(),
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            nsects,
            load_index,
            is_64,
        });

        let (header_size, section_size) = if is_64 {
            (
                core::mem::size_of::<SegmentCommand64>(),
                core::mem::size_of::<Section64>(),
            )
        } else {
            (
                core::mem::size_of::<SegmentCommand32>(),
                core::mem::size_of::<Section32>(),
            )
        };
        for i in 0..nsects as usize {
            let section_offset = offset + header_size + i * section_size;
            let section = if is_64 {
                let sh: Section64 = data.pread_with(section_offset, endian)?;
                self.build_section(data, fixed_cstr(&sh.sectname), fixed_cstr(&sh.segname),
                    sh.addr, sh.size, sh.offset, sh.align, sh.reloff, sh.nreloc, sh.flags)?
            } else {
                let sh: Section32 = data.pread_with(section_offset, endian)?;
                self.build_section(data, fixed_cstr(&sh.sectname), fixed_cstr(&sh.segname),
                    u64::from(sh.addr), u64::from(sh.size), sh.offset, sh.align, sh.reloff,
                    sh.nreloc, sh.flags)?
            };
            self.sections.push(section);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_section(
        &self,
        data: &'a [u8],
        name: String,
        segname: String,
        addr: u64,
        size: u64,
        offset: u32,
        align: u32,
        reloff: u32,
        nreloc: u32,
        flags: u32,
    ) -> Result<MachSection<'a>> {
        let endian = self.ctx.le;
        let section_type = flags & SECTION_TYPE;
        let zerofill = section_type == S_ZEROFILL
            || section_type == S_GB_ZEROFILL
            || section_type == S_THREAD_LOCAL_ZEROFILL;
        let payload = if zerofill || size == 0 {
            &[][..]
        } else {
            slice_at(data, offset as usize, size as usize, &format!("section {name}"))?
        };

        let mut relocs = Vec::with_capacity(nreloc as usize);
        for i in 0..nreloc as usize {
            let entry_offset = reloff as usize + i * 8;
            let raw_addr: u32 = data.pread_with(entry_offset, endian)?;
            let raw_info: u32 = data.pread_with(entry_offset + 4, endian)?;
            relocs.push(dyld::decode_reloc(raw_addr, raw_info, endian));
        }

        Ok(MachSection {
            name,
            segname,
            addr,
            size,
            offset,
            align,
            reloff,
            nreloc,
            flags,
            relocs,
            data: Cow::Borrowed(payload),
        })
    }

    /// Whether this is a 64-bit image.
    pub fn is_64(&self) -> bool {
        self.ctx.container.is_big()
    }

    pub fn header(&self) -> &goblin::mach::header::Header {
        &self.header
    }

    pub fn segments(&self) -> &[MachSegment] {
        &self.segments
    }

    /// All sections of all segments, in load-command order.
    pub fn sections(&self) -> &[MachSection<'a>] {
        &self.sections
    }

    /// Look up a section by name (the first match across segments).
    pub fn section(&self, name: &str) -> Option<&MachSection<'a>> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn section_by_index(&self, index: usize) -> Option<&MachSection<'a>> {
        self.sections.get(index)
    }

    /// The symbol table, empty when the file carries none.
    pub fn symbols(&self) -> &[MachSymbol] {
        self.symtab.as_ref().map(|s| s.syms.as_slice()).unwrap_or(&[])
    }

    /// The dyld info streams, when an `LC_DYLD_INFO` command is present.
    pub fn dylink_info(&self) -> Option<&DylinkInfo> {
        self.dylink_info.as_ref()
    }

    fn parse_symtab(&mut self, data: &'a [u8], offset: usize, is_64: bool) -> Result<()> {
        let endian = self.ctx.le;
        let cmd: SymtabCommand = data.pread_with(offset, endian)?;
        let nlist_size = if is_64 { 16 } else { 12 };
        let raw_symtab = slice_at(
            data,
            cmd.symoff as usize,
            cmd.nsyms as usize * nlist_size,
            "symbol table",
        )?
        .to_vec();
        let raw_strtab = slice_at(
            data,
            cmd.stroff as usize,
            cmd.strsize as usize,
            "string table",
        )?
        .to_vec();

        let mut syms = Vec::with_capacity(cmd.nsyms as usize);
        for i in 0..cmd.nsyms as usize {
            let entry = i * nlist_size;
            let n_strx: u32 = raw_symtab.pread_with(entry, endian)?;
            let n_type: u8 = raw_symtab.pread_with(entry + 4, endian)?;
            let n_sect: u8 = raw_symtab.pread_with(entry + 5, endian)?;
            let n_desc: u16 = raw_symtab.pread_with(entry + 6, endian)?;
            let n_value: u64 = if is_64 {
                raw_symtab.pread_with(entry + 8, endian)?
            } else {
                u64::from(raw_symtab.pread_with::<u32>(entry + 8, endian)?)
            };
            let name = if (n_strx as usize) < raw_strtab.len() {
                fixed_cstr(&raw_strtab[n_strx as usize..])
            } else {
                String::new()
            };
            syms.push(MachSymbol {
                name,
                n_type,
                n_sect,
                n_desc,
                n_value,
            });
        }

        self.symtab = Some(MachSymtab {
            symoff: cmd.symoff,
            stroff: cmd.stroff,
            syms,
            raw_symtab,
            raw_strtab,
        });
        Ok(())
    }
}
