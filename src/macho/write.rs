//! Mach-O serialization.
//!
//! Regions are laid out first: header, load commands, sections in
//! ascending file-offset order, then the linkedit tables at their
//! declared offsets, zero padding to the recorded end of the final
//! segment, and relocation blocks last. When relocation state was
//! edited since parse, the dyld streams and relocation placement are
//! regenerated before layout; otherwise every region keeps its parsed
//! placement and the output reproduces the input.

use std::path::Path;

use scroll::Pwrite;
use tracing::debug;

use crate::error::{Error, Result};

use super::{dyld, MachoFile};

impl<'a> MachoFile<'a> {
    /// Serialize the file to bytes. Runs the deferred relayout (dyld
    /// info synthesis, relocation-block placement, load-command refresh)
    /// when relocation state has been edited.
    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        if self.relocs_dirty {
            self.prepare_relocation_data()?;
            self.refresh_segment_load_bytes()?;
            self.relocs_dirty = false;
        }

        let endian = self.ctx.le;
        let header_size: usize = if self.is_64() { 32 } else { 28 };
        let loads_len: usize = self.loads.iter().map(|l| l.bytes.len()).sum();
        let loads_end = (header_size + loads_len) as u64;

        // Collect every region with a declared placement and make sure
        // none of them collide before allocating the output.
        let mut regions: Vec<(u64, u64, String)> = Vec::new();
        for section in &self.sections {
            if section.has_file_data() {
                regions.push((
                    u64::from(section.offset),
                    section.size,
                    format!("section {}", section.name),
                ));
            }
            if section.nreloc > 0 {
                regions.push((
                    u64::from(section.reloff),
                    section.relocs.len() as u64 * 8,
                    format!("relocations for {}", section.name),
                ));
            }
        }
        if let Some(info) = &self.dylink_info {
            for (offset, len, what) in [
                (info.rebase_off, info.rebase_len, "rebase info"),
                (info.bind_off, info.bind_len, "bind info"),
                (info.weak_bind_off, info.weak_bind_len, "weak bind info"),
                (info.lazy_bind_off, info.lazy_bind_len, "lazy bind info"),
                (info.export_off, info.export_len, "export info"),
            ] {
                if len > 0 {
                    regions.push((u64::from(offset), u64::from(len), what.into()));
                }
            }
        }
        for (block, what) in [
            (&self.func_starts, "function starts"),
            (&self.data_in_code, "data in code"),
            (&self.sig_block, "signature block"),
        ] {
            if let Some(block) = block {
                if block.len > 0 {
                    regions.push((u64::from(block.offset), u64::from(block.len), what.into()));
                }
            }
        }
        if let Some(symtab) = &self.symtab {
            if !symtab.raw_symtab.is_empty() {
                regions.push((
                    u64::from(symtab.symoff),
                    symtab.raw_symtab.len() as u64,
                    "symbol table".into(),
                ));
            }
            if !symtab.raw_strtab.is_empty() {
                regions.push((
                    u64::from(symtab.stroff),
                    symtab.raw_strtab.len() as u64,
                    "string table".into(),
                ));
            }
        }
        if let Some(dysymtab) = &self.dysymtab {
            if !dysymtab.raw_indirect.is_empty() {
                regions.push((
                    u64::from(dysymtab.indirectsymoff),
                    dysymtab.raw_indirect.len() as u64,
                    "indirect symbol table".into(),
                ));
            }
        }

        regions.sort_by_key(|&(offset, _, _)| offset);
        let mut cursor = loads_end;
        for (offset, len, what) in &regions {
            if *offset < cursor {
                return Err(Error::InternalOverlap(format!(
                    "{what} at {offset:#x} overlaps data ending at {cursor:#x}"
                )));
            }
            cursor = offset + len;
        }
        let total = cursor.max(self.final_seg_end) as usize;
        let mut out = vec![0u8; total];

        // File header, then the load commands back to back.
        let mut offset = 0usize;
        out.gwrite_with(self.header.magic, &mut offset, endian)?;
        out.gwrite_with(self.header.cputype, &mut offset, endian)?;
        out.gwrite_with(self.header.cpusubtype, &mut offset, endian)?;
        out.gwrite_with(self.header.filetype, &mut offset, endian)?;
        out.gwrite_with(self.loads.len() as u32, &mut offset, endian)?;
        out.gwrite_with(loads_len as u32, &mut offset, endian)?;
        out.gwrite_with(self.header.flags, &mut offset, endian)?;
        if self.is_64() {
            out.gwrite_with(self.header.reserved, &mut offset, endian)?;
        }
        for load in &self.loads {
            out[offset..offset + load.bytes.len()].copy_from_slice(&load.bytes);
            offset += load.bytes.len();
        }

        for section in &self.sections {
            if section.has_file_data() {
                let start = section.offset as usize;
                out[start..start + section.data().len()].copy_from_slice(section.data());
            }
            if section.nreloc > 0 {
                let block = dyld::encode_reloc_block(&section.relocs, endian)?;
                let start = section.reloff as usize;
                out[start..start + block.len()].copy_from_slice(&block);
            }
        }

        if let Some(info) = &self.dylink_info {
            for (offset, data) in [
                (info.rebase_off, &info.rebase_dat),
                (info.bind_off, &info.bind_dat),
                (info.weak_bind_off, &info.weak_bind_dat),
                (info.lazy_bind_off, &info.lazy_bind_dat),
                (info.export_off, &info.export_dat),
            ] {
                if !data.is_empty() {
                    let start = offset as usize;
                    out[start..start + data.len()].copy_from_slice(data);
                }
            }
        }
        for block in [&self.func_starts, &self.data_in_code, &self.sig_block]
            .into_iter()
            .flatten()
        {
            if !block.data.is_empty() {
                let start = block.offset as usize;
                out[start..start + block.data.len()].copy_from_slice(&block.data);
            }
        }
        if let Some(symtab) = &self.symtab {
            let start = symtab.symoff as usize;
            out[start..start + symtab.raw_symtab.len()].copy_from_slice(&symtab.raw_symtab);
            let start = symtab.stroff as usize;
            out[start..start + symtab.raw_strtab.len()].copy_from_slice(&symtab.raw_strtab);
        }
        if let Some(dysymtab) = &self.dysymtab {
            let start = dysymtab.indirectsymoff as usize;
            out[start..start + dysymtab.raw_indirect.len()]
                .copy_from_slice(&dysymtab.raw_indirect);
        }

        debug!(len = out.len(), loads = self.loads.len(), "serialized Mach-O image");
        Ok(out)
    }

    /// Serialize and write to `path`, creating or truncating the file.
    pub fn write<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let data = self.bytes()?;
        std::fs::write(path, data)?;
        Ok(())
    }
}
