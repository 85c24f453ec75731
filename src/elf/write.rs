//! ELF serialization.
//!
//! Layout is computed up front: the fixed header and program headers,
//! every payload region in ascending file-offset order, the dynamic
//! section re-emitted from the ordered tag list, and the section header
//! table last. Gaps between regions are zero filled. A region that
//! starts before the running cursor is a relayout bug and surfaces as
//! `InternalOverlap`.

use std::path::Path;

use goblin::elf::dynamic::Dyn;
use goblin::elf::section_header::{SectionHeader, SHT_DYNAMIC, SHT_NOBITS, SHT_NULL};
use scroll::ctx::SizeWith;
use scroll::Pwrite;
use tracing::debug;

use crate::error::{Error, Result};

use super::ElfFile;

impl<'a> ElfFile<'a> {
    /// Serialize the file to bytes. An unmodified file reproduces the
    /// input, except that gaps between declared regions are zero filled.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let ctx = self.ctx;
        let (ehsize, phentsize, shentsize, phoff) = if self.is_64() {
            (64usize, 0x38usize, 0x40usize, 0x40u64)
        } else {
            (52usize, 0x20usize, 0x28usize, 0x34u64)
        };
        let sht_off = self.header.e_shoff;
        let dyn_size = Dyn::size_with(&ctx);

        let mut regions: Vec<(u64, u64, usize)> = Vec::new();
        for (i, s) in self.sections.iter().enumerate() {
            if s.sh_type == SHT_NULL || s.sh_type == SHT_NOBITS || s.file_size == 0 {
                continue;
            }
            if s.sh_type == SHT_DYNAMIC {
                let needed = (self.dyn_tags.len() * dyn_size) as u64;
                if needed > s.file_size {
                    return Err(Error::InternalOverlap(format!(
                        "dynamic entries spill out of section {:?}",
                        s.name
                    )));
                }
            }
            regions.push((s.offset, s.file_size, i));
        }
        regions.sort_by_key(|&(offset, _, _)| offset);

        let mut cursor = (ehsize + self.program_headers.len() * phentsize) as u64;
        for &(offset, len, i) in &regions {
            if offset < cursor {
                return Err(Error::InternalOverlap(format!(
                    "section {:?} starts at {:#x}, before the {:#x} already written",
                    self.sections[i].name, offset, cursor
                )));
            }
            cursor = offset + len;
        }
        if sht_off < cursor {
            return Err(Error::InternalOverlap(format!(
                "section header table at {sht_off:#x} overlaps data ending at {cursor:#x}"
            )));
        }

        let sht_len = (self.sections.len() * shentsize) as u64;
        let mut out = vec![0u8; (sht_off + sht_len) as usize];

        let mut header = self.header;
        header.e_phoff = phoff;
        header.e_shoff = sht_off;
        header.e_ehsize = ehsize as u16;
        header.e_phentsize = phentsize as u16;
        header.e_phnum = self.program_headers.len() as u16;
        header.e_shentsize = shentsize as u16;
        header.e_shnum = self.sections.len() as u16;
        header.e_shstrndx = self.shstr_index as u16;
        out.pwrite_with(header, 0, ctx.le)?;

        for (i, ph) in self.program_headers.iter().enumerate() {
            out.pwrite_with(ph.clone(), phoff as usize + i * phentsize, ctx)?;
        }

        for &(offset, _, i) in &regions {
            let section = &self.sections[i];
            if section.sh_type == SHT_DYNAMIC {
                // Re-emit from the ordered tag list; the rest of the
                // declared space stays zero, which reads back as DT_NULL.
                for (j, entry) in self.dyn_tags.iter().enumerate() {
                    let raw = Dyn {
                        d_tag: entry.tag,
                        d_val: entry.value,
                    };
                    out.pwrite_with(raw, offset as usize + j * dyn_size, ctx)?;
                }
            } else {
                let data = section.data();
                out[offset as usize..offset as usize + data.len()].copy_from_slice(data);
            }
        }

        for (i, s) in self.sections.iter().enumerate() {
            let mut sh = SectionHeader::default();
            sh.sh_name = s.sh_name as usize;
            sh.sh_type = s.sh_type;
            sh.sh_flags = s.flags;
            sh.sh_addr = s.addr;
            sh.sh_offset = s.offset;
            sh.sh_size = s.size;
            sh.sh_link = s.link;
            sh.sh_info = s.info;
            sh.sh_addralign = s.addralign;
            sh.sh_entsize = s.entsize;
            out.pwrite_with(sh, sht_off as usize + i * shentsize, ctx)?;
        }

        debug!(
            len = out.len(),
            sections = self.sections.len(),
            "serialized ELF image"
        );
        Ok(out)
    }

    /// Serialize and write to `path`, creating or truncating the file.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = self.bytes()?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
