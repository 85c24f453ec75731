//! Relocation encoding and dyld info synthesis.
//!
//! The rebase/bind/weak-bind/lazy-bind streams are a pure function of
//! the per-section relocation lists, the dylib-ordinal map, and the
//! bind-kind map; they are regenerated from scratch rather than patched.
//! After regeneration the streams are packed between the end of the last
//! section and the first linkedit table, the relocation blocks are
//! packed past everything else, and the affected load commands are
//! rewritten in place.

use goblin::mach::load_command::{
    DyldInfoCommand, SegmentCommand32, SegmentCommand64, Section32, Section64, LC_DYLD_INFO,
    LC_DYLD_INFO_ONLY,
};
use scroll::{Endian, Pread, Pwrite};
use tracing::debug;

use crate::error::{Error, Result};
use crate::util::{align_up, push_u32, push_uleb128};

use super::{BindKind, MachReloc, MachSection, MachoFile};

mod opcodes {
    pub const REBASE_OPCODE_DONE: u8 = 0x00;
    pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
    pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
    pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
    pub const REBASE_TYPE_POINTER: u8 = 1;

    pub const BIND_OPCODE_DONE: u8 = 0x00;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
    pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
    pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
    pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
    pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
    pub const BIND_TYPE_POINTER: u8 = 1;
}

use opcodes::*;

/// Decode one 8-byte relocation record.
pub(crate) fn decode_reloc(raw_addr: u32, raw_info: u32, endian: Endian) -> MachReloc {
    if raw_addr & 0x8000_0000 != 0 {
        // Scattered: the address word carries the flag bits.
        return MachReloc {
            addr: raw_addr & 0x00ff_ffff,
            value: raw_info,
            r_type: ((raw_addr >> 24) & 0xf) as u8,
            len: ((raw_addr >> 28) & 0x3) as u8,
            pcrel: raw_addr & (1 << 30) != 0,
            external: false,
            scattered: true,
        };
    }
    match endian {
        Endian::Little => MachReloc {
            addr: raw_addr,
            value: raw_info & 0x00ff_ffff,
            r_type: ((raw_info >> 28) & 0xf) as u8,
            len: ((raw_info >> 25) & 0x3) as u8,
            pcrel: raw_info & (1 << 24) != 0,
            external: raw_info & (1 << 27) != 0,
            scattered: false,
        },
        Endian::Big => MachReloc {
            addr: raw_addr,
            value: raw_info >> 8,
            r_type: (raw_info & 0xf) as u8,
            len: ((raw_info >> 5) & 0x3) as u8,
            pcrel: raw_info & (1 << 7) != 0,
            external: raw_info & (1 << 4) != 0,
            scattered: false,
        },
    }
}

/// Pack one relocation into its two on-disk words.
fn encode_reloc(rel: &MachReloc, endian: Endian) -> Result<(u32, u32)> {
    if rel.scattered {
        let mut addr = rel.addr & 0x00ff_ffff;
        addr |= u32::from(rel.r_type & 0xf) << 24;
        addr |= u32::from(rel.len & 0x3) << 28;
        if rel.pcrel {
            addr |= 1 << 30;
        }
        addr |= 1 << 31;
        return Ok((addr, rel.value));
    }
    if rel.value > 0x00ff_ffff {
        return Err(Error::OutOfRange(format!(
            "relocation value {:#x} exceeds 24 bits",
            rel.value
        )));
    }
    let info = match endian {
        Endian::Little => {
            let mut info = rel.value;
            if rel.pcrel {
                info |= 1 << 24;
            }
            info |= u32::from(rel.len & 0x3) << 25;
            if rel.external {
                info |= 1 << 27;
            }
            info | (u32::from(rel.r_type & 0xf) << 28)
        }
        Endian::Big => {
            let mut info = (rel.value << 8) | u32::from(rel.r_type & 0xf);
            if rel.external {
                info |= 1 << 4;
            }
            info |= u32::from(rel.len & 0x3) << 5;
            if rel.pcrel {
                info |= 1 << 7;
            }
            info
        }
    };
    Ok((rel.addr, info))
}

/// Encode a section's relocation list into one contiguous block.
pub(crate) fn encode_reloc_block(relocs: &[MachReloc], endian: Endian) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(relocs.len() * 8);
    for rel in relocs {
        let (addr, info) = encode_reloc(rel, endian)?;
        push_u32(&mut buf, addr, endian)?;
        push_u32(&mut buf, info, endian)?;
    }
    Ok(buf)
}

impl<'a> MachoFile<'a> {
    /// Regenerate the dyld streams and assign relocation-block placement.
    /// Called from `bytes()` when relocation state has been edited.
    pub(crate) fn prepare_relocation_data(&mut self) -> Result<()> {
        self.prepare_dyld_info_from_relocs()?;

        let reloc_count: usize = self.sections.iter().map(|s| s.relocs.len()).sum();
        if reloc_count == 0 {
            for section in &mut self.sections {
                section.reloff = 0;
                section.nreloc = 0;
            }
            return Ok(());
        }

        let mut offset = align_up(self.max_file_offset(), 4);
        for section in &mut self.sections {
            if section.relocs.is_empty() {
                section.reloff = 0;
                section.nreloc = 0;
                continue;
            }
            offset = align_up(offset, 4);
            section.reloff = u32::try_from(offset).map_err(|_| {
                Error::OutOfRange(format!("relocation block offset {offset:#x} exceeds 32 bits"))
            })?;
            section.nreloc = section.relocs.len() as u32;
            offset += section.relocs.len() as u64 * 8;
        }
        debug!(count = reloc_count, "placed relocation blocks");
        Ok(())
    }

    fn prepare_dyld_info_from_relocs(&mut self) -> Result<()> {
        if self.dylink_info.is_none() {
            return Ok(());
        }
        let Some((rebase, bind, weak, lazy)) = self.encode_dyld_info()? else {
            return Ok(());
        };

        let start = align_up(self.end_of_sections(), 4);
        let limit = self.dyld_info_end_limit();
        let total = (rebase.len() + bind.len() + weak.len() + lazy.len()) as u64;
        if limit != 0 && start + total > limit {
            return Err(Error::NoRoomForDyldInfo);
        }
        debug!(start, total, limit, "placed dyld info streams");

        if let Some(info) = self.dylink_info.as_mut() {
            let mut offset = start as u32;
            info.rebase_len = rebase.len() as u32;
            info.rebase_off = offset;
            offset += rebase.len() as u32;
            info.rebase_dat = rebase;

            info.bind_len = bind.len() as u32;
            info.bind_off = offset;
            offset += bind.len() as u32;
            info.bind_dat = bind;

            info.weak_bind_len = weak.len() as u32;
            info.weak_bind_off = offset;
            offset += weak.len() as u32;
            info.weak_bind_dat = weak;

            info.lazy_bind_len = lazy.len() as u32;
            info.lazy_bind_off = offset;
            info.lazy_bind_dat = lazy;
        }
        self.streams_regenerated = true;

        self.refresh_dylink_load_bytes()
    }

    /// Build the four opcode streams from the relocation lists.
    #[allow(clippy::type_complexity)]
    fn encode_dyld_info(&self) -> Result<Option<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)>> {
        if self.segments.is_empty() {
            return Ok(None);
        }

        let mut rebase = Vec::new();
        let mut bind = Vec::new();
        let mut weak = Vec::new();
        let mut lazy = Vec::new();

        rebase.push(REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
        for stream in [&mut bind, &mut weak, &mut lazy] {
            stream.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
            stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM);
        }
        let prologue_len = 2;
        let mut bind_ordinal = 0u8;
        let mut weak_ordinal = 0u8;
        let mut lazy_ordinal = 0u8;

        for section in &self.sections {
            if section.relocs.is_empty() {
                continue;
            }
            let ordinal = self
                .segments
                .iter()
                .position(|seg| seg.name == section.segname)
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "unknown segment {:?} for section {:?}",
                        section.segname, section.name
                    ))
                })?;
            let seg = (ordinal & 0x0f) as u8;
            let seg_base = self.segment_addr(&section.segname);
            for rel in &section.relocs {
                let addr = section.addr + u64::from(rel.addr);
                if addr < seg_base {
                    return Err(Error::OutOfRange(format!(
                        "relocation at {:#x} underflows segment {:?}",
                        addr, section.segname
                    )));
                }
                let seg_offset = addr - seg_base;
                if rel.external {
                    let ordinal = self.dylib_ordinal_for_symbol(rel.value)?;
                    let (stream, current) = match self.bind_kind_for_symbol(rel.value) {
                        BindKind::Weak => (&mut weak, &mut weak_ordinal),
                        BindKind::Lazy => (&mut lazy, &mut lazy_ordinal),
                        BindKind::Normal => (&mut bind, &mut bind_ordinal),
                    };
                    if ordinal != *current {
                        stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal);
                        *current = ordinal;
                    }
                    let name = self.symbol_name(rel.value)?;
                    stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg);
                    push_uleb128(stream, seg_offset);
                    stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
                    stream.extend_from_slice(name.as_bytes());
                    stream.push(0);
                    stream.push(BIND_OPCODE_DO_BIND);
                } else {
                    rebase.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg);
                    push_uleb128(&mut rebase, seg_offset);
                    rebase.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
                }
            }
        }

        rebase.push(REBASE_OPCODE_DONE);
        for stream in [&mut bind, &mut weak, &mut lazy] {
            if stream.len() > prologue_len {
                stream.push(BIND_OPCODE_DONE);
            }
        }

        Ok(Some((rebase, bind, weak, lazy)))
    }

    fn end_of_sections(&self) -> u64 {
        self.sections
            .iter()
            .filter(|s| s.has_file_data())
            .map(|s| u64::from(s.offset) + s.size)
            .max()
            .unwrap_or(0)
    }

    /// The first offset the dyld streams must not reach: the earliest of
    /// the linkedit tables that stay in place.
    fn dyld_info_end_limit(&self) -> u64 {
        let mut limit = 0u64;
        let mut consider = |value: u64| {
            if value != 0 && (limit == 0 || value < limit) {
                limit = value;
            }
        };
        if let Some(block) = &self.func_starts {
            consider(u64::from(block.offset));
        }
        if let Some(block) = &self.data_in_code {
            consider(u64::from(block.offset));
        }
        if let Some(symtab) = &self.symtab {
            consider(u64::from(symtab.symoff));
        }
        if let Some(dysymtab) = &self.dysymtab {
            consider(u64::from(dysymtab.indirectsymoff));
        }
        if let Some(block) = &self.sig_block {
            consider(u64::from(block.offset));
        }
        if let Some(info) = &self.dylink_info {
            // Weak/lazy placements bound the streams only while they are
            // still the pre-existing ones; once regenerated they live in
            // the very region being reassigned.
            if !self.streams_regenerated {
                consider(u64::from(info.lazy_bind_off));
                consider(u64::from(info.weak_bind_off));
            }
            consider(u64::from(info.export_off));
        }
        limit
    }

    /// The end of everything currently placed in the file, including the
    /// recorded end of the final segment.
    fn max_file_offset(&self) -> u64 {
        let mut max_end = self.end_of_sections();
        let mut consider = |offset: u64, len: u64| {
            max_end = max_end.max(offset + len);
        };
        if let Some(info) = &self.dylink_info {
            consider(u64::from(info.rebase_off), u64::from(info.rebase_len));
            consider(u64::from(info.bind_off), u64::from(info.bind_len));
            consider(u64::from(info.weak_bind_off), u64::from(info.weak_bind_len));
            consider(u64::from(info.lazy_bind_off), u64::from(info.lazy_bind_len));
            consider(u64::from(info.export_off), u64::from(info.export_len));
        }
        if let Some(block) = &self.func_starts {
            consider(u64::from(block.offset), u64::from(block.len));
        }
        if let Some(block) = &self.data_in_code {
            consider(u64::from(block.offset), u64::from(block.len));
        }
        if let Some(symtab) = &self.symtab {
            consider(u64::from(symtab.symoff), symtab.raw_symtab.len() as u64);
            consider(u64::from(symtab.stroff), symtab.raw_strtab.len() as u64);
        }
        if let Some(dysymtab) = &self.dysymtab {
            consider(
                u64::from(dysymtab.indirectsymoff),
                dysymtab.raw_indirect.len() as u64,
            );
        }
        if let Some(block) = &self.sig_block {
            consider(u64::from(block.offset), u64::from(block.len));
        }
        max_end.max(self.final_seg_end)
    }

    fn segment_addr(&self, name: &str) -> u64 {
        self.segments
            .iter()
            .find(|seg| seg.name == name)
            .map(|seg| seg.vmaddr)
            .unwrap_or(0)
    }

    pub(crate) fn symbol_name(&self, index: u32) -> Result<&str> {
        let symtab = self
            .symtab
            .as_ref()
            .ok_or_else(|| Error::Malformed("symbol table not available".into()))?;
        symtab
            .syms
            .get(index as usize)
            .map(|sym| sym.name.as_str())
            .ok_or_else(|| Error::OutOfRange(format!("symbol index {index} out of range")))
    }

    fn dylib_ordinal_for_symbol(&self, index: u32) -> Result<u8> {
        let ordinal = self.dylib_ordinals.get(&index).copied().unwrap_or(0);
        if ordinal > 15 {
            return Err(Error::OutOfRange(format!(
                "dylib ordinal {ordinal} out of range"
            )));
        }
        Ok(ordinal)
    }

    fn bind_kind_for_symbol(&self, index: u32) -> BindKind {
        self.bind_kinds.get(&index).copied().unwrap_or_default()
    }

    /// Rewrite the LC_DYLD_INFO command so its offset/size pairs match
    /// the regenerated streams.
    fn refresh_dylink_load_bytes(&mut self) -> Result<()> {
        let Some(info) = &self.dylink_info else {
            return Ok(());
        };
        let updates = info.clone();
        let endian = self.ctx.le;
        for load in &mut self.loads {
            if load.cmd != LC_DYLD_INFO && load.cmd != LC_DYLD_INFO_ONLY {
                continue;
            }
            let mut cmd: DyldInfoCommand = load.bytes.pread_with(0, endian)?;
            if updates.rebase_len > 0 {
                cmd.rebase_off = updates.rebase_off;
                cmd.rebase_size = updates.rebase_len;
            }
            if updates.bind_len > 0 {
                cmd.bind_off = updates.bind_off;
                cmd.bind_size = updates.bind_len;
            }
            if updates.weak_bind_len > 0 {
                cmd.weak_bind_off = updates.weak_bind_off;
                cmd.weak_bind_size = updates.weak_bind_len;
            }
            if updates.lazy_bind_len > 0 {
                cmd.lazy_bind_off = updates.lazy_bind_off;
                cmd.lazy_bind_size = updates.lazy_bind_len;
            }
            if updates.export_len > 0 {
                cmd.export_off = updates.export_off;
                cmd.export_size = updates.export_len;
            }
            load.bytes.pwrite_with(cmd, 0, endian)?;
            return Ok(());
        }
        Ok(())
    }

    /// Regenerate each segment command's section header block so it
    /// matches the in-memory section objects. Raw and live records are
    /// matched on `(name, segment, offset, addr)` with a `(name,
    /// segment)` fallback.
    pub(crate) fn refresh_segment_load_bytes(&mut self) -> Result<()> {
        let endian = self.ctx.le;
        let MachoFile {
            loads, sections, segments, ..
        } = self;
        for segment in segments.iter() {
            let bytes = &mut loads[segment.load_index].bytes;
            if segment.is_64 {
                let header: SegmentCommand64 = bytes.pread_with(0, endian)?;
                for i in 0..header.nsects as usize {
                    let offset = core::mem::size_of::<SegmentCommand64>()
                        + i * core::mem::size_of::<Section64>();
                    let mut sh: Section64 = bytes.pread_with(offset, endian)?;
                    if let Some(live) = match_section(
                        sections,
                        &crate::util::fixed_cstr(&sh.sectname),
                        &crate::util::fixed_cstr(&sh.segname),
                        sh.offset,
                        sh.addr,
                    ) {
                        sh.reloff = live.reloff;
                        sh.nreloc = live.nreloc;
                        sh.addr = live.addr;
                        sh.size = live.size;
                        sh.offset = live.offset;
                        sh.align = live.align;
                        sh.flags = live.flags;
                    }
                    bytes.pwrite_with(sh, offset, endian)?;
                }
            } else {
                let header: SegmentCommand32 = bytes.pread_with(0, endian)?;
                for i in 0..header.nsects as usize {
                    let offset = core::mem::size_of::<SegmentCommand32>()
                        + i * core::mem::size_of::<Section32>();
                    let mut sh: Section32 = bytes.pread_with(offset, endian)?;
                    if let Some(live) = match_section(
                        sections,
                        &crate::util::fixed_cstr(&sh.sectname),
                        &crate::util::fixed_cstr(&sh.segname),
                        sh.offset,
                        u64::from(sh.addr),
                    ) {
                        sh.reloff = live.reloff;
                        sh.nreloc = live.nreloc;
                        sh.addr = live.addr as u32;
                        sh.size = live.size as u32;
                        sh.offset = live.offset;
                        sh.align = live.align;
                        sh.flags = live.flags;
                    }
                    bytes.pwrite_with(sh, offset, endian)?;
                }
            }
        }
        Ok(())
    }
}

fn match_section<'s, 'b>(
    sections: &'s [MachSection<'b>],
    name: &str,
    segname: &str,
    offset: u32,
    addr: u64,
) -> Option<&'s MachSection<'b>> {
    let mut fallback = None;
    for section in sections {
        if section.name != name || section.segname != segname {
            continue;
        }
        if section.offset == offset || section.addr == addr {
            return Some(section);
        }
        if fallback.is_none() {
            fallback = Some(section);
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reloc_roundtrip_little_endian() {
        let rel = MachReloc {
            addr: 0x100,
            value: 7,
            r_type: 2,
            len: 3,
            pcrel: true,
            external: true,
            scattered: false,
        };
        let (addr, info) = encode_reloc(&rel, Endian::Little).unwrap();
        assert_eq!(decode_reloc(addr, info, Endian::Little), rel);
    }

    #[test]
    fn reloc_roundtrip_big_endian() {
        let rel = MachReloc {
            addr: 0x20,
            value: 0x1234,
            r_type: 1,
            len: 2,
            pcrel: false,
            external: true,
            scattered: false,
        };
        let (addr, info) = encode_reloc(&rel, Endian::Big).unwrap();
        assert_eq!(decode_reloc(addr, info, Endian::Big), rel);
    }

    #[test]
    fn scattered_reloc_roundtrip() {
        let rel = MachReloc {
            addr: 0x00ab_cdef,
            value: 0xdead_beef,
            r_type: 4,
            len: 2,
            pcrel: true,
            external: false,
            scattered: true,
        };
        let (addr, info) = encode_reloc(&rel, Endian::Little).unwrap();
        assert!(addr & 0x8000_0000 != 0);
        assert_eq!(decode_reloc(addr, info, Endian::Little), rel);
    }

    #[test]
    fn oversized_value_rejected() {
        let rel = MachReloc {
            addr: 0,
            value: 0x0100_0000,
            r_type: 0,
            len: 3,
            pcrel: false,
            external: true,
            scattered: false,
        };
        assert!(matches!(
            encode_reloc(&rel, Endian::Little),
            Err(Error::OutOfRange(_))
        ));
    }
}
