//! PE relayout and serialization.
//!
//! Relayout rebuilds the base relocation payload, places (or creates)
//! the `.reloc` section past every other section on disk and in memory,
//! maintains the base-reloc data directory and the relocs-stripped
//! flag, recomputes `SizeOfImage`/`SizeOfHeaders`, packs the COFF
//! relocation blocks after the last section, and repoints the symbol
//! table. The serializer then walks every region in ascending file
//! order, zero filling gaps; the certificate table goes after the
//! string table once layout has changed.

use std::borrow::Cow;
use std::path::Path;

use goblin::pe::characteristic::IMAGE_FILE_RELOCS_STRIPPED;
use goblin::pe::section_table::{
    IMAGE_SCN_CNT_INITIALIZED_DATA, IMAGE_SCN_MEM_DISCARDABLE, IMAGE_SCN_MEM_READ,
};
use scroll::{Endian, Pwrite};
use tracing::debug;

use crate::error::{Error, Result};
use crate::util::{align_up32, push_u16, push_u32};

use super::{
    DataDirectory, OptionalHeader, PeFile, PeSection, RawSectionHeader, CERTIFICATE_TABLE,
    COFF_HEADER_SIZE, COFF_RELOC_SIZE, COFF_SYMBOL_SIZE, IMAGE_DIRECTORY_ENTRY_BASERELOC,
    IMAGE_REL_BASED_ABSOLUTE, SECTION_HEADER_SIZE,
};

impl<'a> PeFile<'a> {
    /// Restore the layout invariants after a relocation edit.
    pub(crate) fn prepare_relocation_layout(&mut self) -> Result<()> {
        let (section_align, file_align) = {
            let optional = self
                .optional
                .as_ref()
                .ok_or_else(|| Error::Malformed("optional header not available".into()))?;
            (optional.section_alignment(), optional.file_alignment())
        };

        let reloc_data = self.build_base_reloc_data()?;
        let reloc_index = self.sections.iter().position(|s| s.name == ".reloc");
        let (mut max_raw_end, mut max_virtual_end) =
            self.max_section_ends(reloc_index, section_align);

        if !reloc_data.is_empty() {
            let index = match reloc_index {
                Some(index) => index,
                None => {
                    let mut original_name = [0u8; 8];
                    original_name[..6].copy_from_slice(b".reloc");
                    self.sections.push(PeSection {
                        name: ".reloc".into(),
                        original_name,
                        virtual_size: 0,
                        virtual_address: 0,
                        size_of_raw_data: 0,
                        pointer_to_raw_data: 0,
                        pointer_to_relocations: 0,
                        pointer_to_linenumbers: 0,
                        number_of_relocations: 0,
                        number_of_linenumbers: 0,
                        characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                            | IMAGE_SCN_MEM_READ
                            | IMAGE_SCN_MEM_DISCARDABLE,
                        relocs: Vec::new(),
                        data: Cow::Owned(Vec::new()),
                    });
                    self.coff.number_of_sections = self.sections.len() as u16;
                    self.sections.len() - 1
                }
            };
            let mut padded = vec![0u8; align_up32(reloc_data.len() as u32, file_align) as usize];
            padded[..reloc_data.len()].copy_from_slice(&reloc_data);
            let section = &mut self.sections[index];
            section.virtual_size = reloc_data.len() as u32;
            section.size_of_raw_data = padded.len() as u32;
            section.pointer_to_relocations = 0;
            section.number_of_relocations = 0;
            section.pointer_to_raw_data = align_up32(max_raw_end, file_align);
            section.virtual_address = align_up32(max_virtual_end, section_align);
            section.relocs.clear();
            section.data = Cow::Owned(padded);
            max_raw_end = section.pointer_to_raw_data + section.size_of_raw_data;
            max_virtual_end =
                section.virtual_address + align_up32(section.virtual_size, section_align);
            self.directories[IMAGE_DIRECTORY_ENTRY_BASERELOC] = DataDirectory {
                virtual_address: section.virtual_address,
                size: reloc_data.len() as u32,
            };
            self.coff.characteristics &= !IMAGE_FILE_RELOCS_STRIPPED;
            debug!(
                offset = section.pointer_to_raw_data,
                rva = section.virtual_address,
                "placed .reloc section"
            );
        } else {
            self.directories[IMAGE_DIRECTORY_ENTRY_BASERELOC] = DataDirectory::default();
            // An emptied table leaves any .reloc section behind as a
            // zero-length stub so its old range cannot shadow the tables
            // packed after the last section.
            if let Some(index) = reloc_index {
                let section = &mut self.sections[index];
                section.virtual_size = 0;
                section.size_of_raw_data = 0;
                section.pointer_to_raw_data = 0;
                section.data = Cow::Owned(Vec::new());
            }
        }

        let size_of_image = align_up32(max_virtual_end, section_align);
        let size_of_headers = align_up32(self.headers_size(), file_align);
        if let Some(optional) = self.optional.as_mut() {
            optional.set_size_of_image(size_of_image);
            optional.set_size_of_headers(size_of_headers);
        }

        // COFF relocation blocks go after the last section's data,
        // 4-byte aligned per section.
        let start = if max_raw_end == 0 { file_align } else { max_raw_end };
        let mut offset = align_up32(start, file_align);
        let mut end = start;
        for section in &mut self.sections {
            if section.relocs.is_empty() {
                section.pointer_to_relocations = 0;
                section.number_of_relocations = 0;
                continue;
            }
            if section.relocs.len() > usize::from(u16::MAX) {
                return Err(Error::OutOfRange(format!(
                    "too many COFF relocations for section {:?}",
                    section.name
                )));
            }
            offset = align_up32(offset, 4);
            section.pointer_to_relocations = offset;
            section.number_of_relocations = section.relocs.len() as u16;
            offset += (section.relocs.len() * COFF_RELOC_SIZE) as u32;
            end = offset;
        }
        if !self.symbols.is_empty() {
            self.coff.pointer_to_symbol_table = align_up32(end, 4);
        } else {
            self.coff.pointer_to_symbol_table = 0;
        }
        Ok(())
    }

    /// Encode the base relocation table. Each block with an odd entry
    /// count is padded with one `IMAGE_REL_BASED_ABSOLUTE` entry so the
    /// block stays 32-bit aligned.
    fn build_base_reloc_data(&self) -> Result<Vec<u8>> {
        let Some(blocks) = &self.base_relocs else {
            return Ok(Vec::new());
        };
        let mut buf = Vec::new();
        for block in blocks {
            let mut count = block.items.len();
            let pad = count % 2 != 0;
            if pad {
                count += 1;
            }
            push_u32(&mut buf, block.virtual_address, Endian::Little)?;
            push_u32(&mut buf, 8 + count as u32 * 2, Endian::Little)?;
            for item in &block.items {
                let packed = (u16::from(item.typ) << 12) | (item.offset & 0x0fff);
                push_u16(&mut buf, packed, Endian::Little)?;
            }
            if pad {
                push_u16(
                    &mut buf,
                    u16::from(IMAGE_REL_BASED_ABSOLUTE) << 12,
                    Endian::Little,
                )?;
            }
        }
        Ok(buf)
    }

    fn max_section_ends(&self, skip: Option<usize>, section_align: u32) -> (u32, u32) {
        let mut max_raw_end = 0u32;
        let mut max_virtual_end = 0u32;
        for (i, section) in self.sections.iter().enumerate() {
            if Some(i) == skip {
                continue;
            }
            max_raw_end = max_raw_end.max(section.pointer_to_raw_data + section.size_of_raw_data);
            let virtual_size = if section.virtual_size != 0 {
                section.virtual_size
            } else {
                section.size_of_raw_data
            };
            max_virtual_end = max_virtual_end
                .max(section.virtual_address + align_up32(virtual_size, section_align));
        }
        (max_raw_end, max_virtual_end)
    }

    fn headers_size(&self) -> u32 {
        (self.pe_header_offset
            + 4
            + COFF_HEADER_SIZE
            + self.coff.size_of_optional_header as usize
            + self.sections.len() * SECTION_HEADER_SIZE) as u32
    }

    /// Serialize the file to bytes. An unmodified file reproduces the
    /// input, except that gaps between declared regions are zero filled.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let dirty = self.relocs_dirty;
        if dirty {
            self.prepare_relocation_layout()?;
        }

        let headers_len = u64::from(self.headers_size());
        let mut regions: Vec<(u64, u64, String)> = Vec::new();
        for section in &self.sections {
            if section.pointer_to_raw_data != 0 && !section.data().is_empty() {
                regions.push((
                    u64::from(section.pointer_to_raw_data),
                    section.data().len() as u64,
                    format!("section {}", section.name),
                ));
            }
            if !section.relocs.is_empty() && section.pointer_to_relocations != 0 {
                regions.push((
                    u64::from(section.pointer_to_relocations),
                    (section.relocs.len() * COFF_RELOC_SIZE) as u64,
                    format!("relocations for {}", section.name),
                ));
            }
        }
        let symtab_offset = u64::from(self.coff.pointer_to_symbol_table);
        let symtab_len = (self.symbols.len() * COFF_SYMBOL_SIZE) as u64;
        if symtab_offset != 0 && symtab_len > 0 {
            regions.push((symtab_offset, symtab_len, "symbol table".into()));
            if !self.string_table.is_empty() {
                regions.push((
                    symtab_offset + symtab_len,
                    self.string_table.len() as u64,
                    "string table".into(),
                ));
            }
        }

        let data_end = regions
            .iter()
            .map(|&(offset, len, _)| offset + len)
            .max()
            .unwrap_or(headers_len)
            .max(headers_len);
        let cert_offset = if self.cert_table.is_empty() {
            0
        } else if dirty {
            // Re-append past everything and repoint the directory entry.
            self.directories[CERTIFICATE_TABLE] = DataDirectory {
                virtual_address: data_end as u32,
                size: self.cert_table.len() as u32,
            };
            self.cert_offset = data_end as u32;
            data_end
        } else {
            u64::from(self.cert_offset)
        };
        if !self.cert_table.is_empty() {
            regions.push((
                cert_offset,
                self.cert_table.len() as u64,
                "certificate table".into(),
            ));
        }

        regions.sort_by_key(|&(offset, _, _)| offset);
        let mut cursor = headers_len;
        for (offset, len, what) in &regions {
            if *offset < cursor {
                return Err(Error::InternalOverlap(format!(
                    "{what} at {offset:#x} overlaps data ending at {cursor:#x}"
                )));
            }
            cursor = offset + len;
        }
        let mut out = vec![0u8; cursor as usize];

        out[..self.dos_stub.len()].copy_from_slice(self.dos_stub);
        let pe_offset = self.pe_header_offset;
        out[pe_offset..pe_offset + 4].copy_from_slice(b"PE\0\0");
        out.pwrite_with(self.coff, pe_offset + 4, Endian::Little)?;

        let opt_offset = pe_offset + 4 + COFF_HEADER_SIZE;
        if let Some(optional) = &self.optional {
            let dirs_offset = opt_offset + optional.base_size();
            match optional {
                OptionalHeader::Pe32(header) => {
                    out.pwrite_with(*header, opt_offset, Endian::Little)?;
                }
                OptionalHeader::Pe32Plus(header) => {
                    out.pwrite_with(*header, opt_offset, Endian::Little)?;
                }
            }
            for i in 0..self.dir_count as usize {
                out.pwrite_with(self.directories[i], dirs_offset + i * 8, Endian::Little)?;
            }
        }

        let shdr_offset = opt_offset + self.coff.size_of_optional_header as usize;
        for (i, section) in self.sections.iter().enumerate() {
            let raw = RawSectionHeader {
                name: section.original_name,
                virtual_size: section.virtual_size,
                virtual_address: section.virtual_address,
                size_of_raw_data: section.size_of_raw_data,
                pointer_to_raw_data: section.pointer_to_raw_data,
                pointer_to_relocations: section.pointer_to_relocations,
                pointer_to_linenumbers: section.pointer_to_linenumbers,
                number_of_relocations: section.number_of_relocations,
                number_of_linenumbers: section.number_of_linenumbers,
                characteristics: section.characteristics,
            };
            out.pwrite_with(raw, shdr_offset + i * SECTION_HEADER_SIZE, Endian::Little)?;
        }

        for section in &self.sections {
            if section.pointer_to_raw_data != 0 && !section.data().is_empty() {
                let start = section.pointer_to_raw_data as usize;
                out[start..start + section.data().len()].copy_from_slice(section.data());
            }
            if !section.relocs.is_empty() && section.pointer_to_relocations != 0 {
                for (j, reloc) in section.relocs.iter().enumerate() {
                    out.pwrite_with(
                        *reloc,
                        section.pointer_to_relocations as usize + j * COFF_RELOC_SIZE,
                        Endian::Little,
                    )?;
                }
            }
        }

        if symtab_offset != 0 {
            for (i, symbol) in self.symbols.iter().enumerate() {
                out.pwrite_with(
                    *symbol,
                    symtab_offset as usize + i * COFF_SYMBOL_SIZE,
                    Endian::Little,
                )?;
            }
            if !self.string_table.is_empty() {
                let start = (symtab_offset + symtab_len) as usize;
                out[start..start + self.string_table.len()].copy_from_slice(&self.string_table);
            }
        }
        if !self.cert_table.is_empty() {
            let start = cert_offset as usize;
            out[start..start + self.cert_table.len()].copy_from_slice(&self.cert_table);
        }

        self.relocs_dirty = false;
        debug!(len = out.len(), sections = self.sections.len(), "serialized PE image");
        Ok(out)
    }

    /// Serialize and write to `path`, creating or truncating the file.
    pub fn write<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let data = self.bytes()?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
