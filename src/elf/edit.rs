//! Relocation edit verbs and the relayout they trigger.
//!
//! Every mutating verb validates all of its failure conditions before
//! touching the model, appends or replaces the encoded relocation bytes,
//! then restores the file invariants: non-allocated relocation sections
//! (and a grown `.shstrtab`) are repacked past the end of the fixed
//! sections, allocated relocation sections are placed inside a `PT_LOAD`
//! (growing it, or spilling past the last one), the section header table
//! offset is pushed out of the way, and the `DT_REL*`/`DT_JMPREL` family
//! of dynamic tags is rewritten to match.

use std::borrow::Cow;

use goblin::elf::dynamic::{
    DT_JMPREL, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_REL, DT_RELA, DT_RELAENT, DT_RELASZ,
    DT_RELENT, DT_RELSZ,
};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{SHF_ALLOC, SHT_NOBITS, SHT_REL, SHT_RELA};
use scroll::Endian;
use tracing::debug;

use crate::error::{Error, Result};
use crate::util::{align_up, find_subslice, push_i32, push_i64, push_u32, push_u64};

use super::{r_info32, r_info64, DynTagValue, ElfFile, ElfSection};

/// A typed relocation record, one of the four fixed-size layouts.
///
/// `Rel*` entries carry no addend and live in `SHT_REL` sections; `Rela*`
/// entries carry one and live in `SHT_RELA` sections. The two kinds never
/// mix within one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocEntry {
    Rel32 { offset: u32, info: u32 },
    Rela32 { offset: u32, info: u32, addend: i32 },
    Rel64 { offset: u64, info: u64 },
    Rela64 { offset: u64, info: u64, addend: i64 },
}

impl RelocEntry {
    /// The section type an entry of this kind is stored in.
    pub fn section_type(&self) -> u32 {
        match self {
            RelocEntry::Rel32 { .. } | RelocEntry::Rel64 { .. } => SHT_REL,
            RelocEntry::Rela32 { .. } | RelocEntry::Rela64 { .. } => SHT_RELA,
        }
    }

    /// Encoded size in bytes: 8, 12, 16, or 24.
    pub fn entry_size(&self) -> u64 {
        match self {
            RelocEntry::Rel32 { .. } => 8,
            RelocEntry::Rela32 { .. } => 12,
            RelocEntry::Rel64 { .. } => 16,
            RelocEntry::Rela64 { .. } => 24,
        }
    }

    fn is_64(&self) -> bool {
        matches!(self, RelocEntry::Rel64 { .. } | RelocEntry::Rela64 { .. })
    }

    fn encode(&self, buf: &mut Vec<u8>, endian: Endian) -> Result<()> {
        match *self {
            RelocEntry::Rel32 { offset, info } => {
                push_u32(buf, offset, endian)?;
                push_u32(buf, info, endian)
            }
            RelocEntry::Rela32 { offset, info, addend } => {
                push_u32(buf, offset, endian)?;
                push_u32(buf, info, endian)?;
                push_i32(buf, addend, endian)
            }
            RelocEntry::Rel64 { offset, info } => {
                push_u64(buf, offset, endian)?;
                push_u64(buf, info, endian)
            }
            RelocEntry::Rela64 { offset, info, addend } => {
                push_u64(buf, offset, endian)?;
                push_u64(buf, info, endian)?;
                push_i64(buf, addend, endian)
            }
        }
    }
}

fn encode_relocations(
    entries: &[RelocEntry],
    endian: Endian,
    is_64: bool,
) -> Result<(Vec<u8>, u32, u64)> {
    let first = entries
        .first()
        .ok_or_else(|| Error::Malformed("no relocation entries supplied".into()))?;
    if first.is_64() != is_64 {
        return Err(Error::TypeMismatch(format!(
            "{}-bit relocation entry in a {}-bit file",
            if first.is_64() { 64 } else { 32 },
            if is_64 { 64 } else { 32 },
        )));
    }
    let mut buf = Vec::with_capacity(entries.len() * first.entry_size() as usize);
    for entry in entries {
        if core::mem::discriminant(entry) != core::mem::discriminant(first) {
            return Err(Error::TypeMismatch(
                "mixed relocation entry kinds in one batch".into(),
            ));
        }
        entry.encode(&mut buf, endian)?;
    }
    Ok((buf, first.section_type(), first.entry_size()))
}

fn relocation_section_name(target_name: &str, rel_type: u32) -> String {
    if rel_type == SHT_RELA {
        format!(".rela{target_name}")
    } else {
        format!(".rel{target_name}")
    }
}

impl<'a> ElfFile<'a> {
    /// Append a single relocation entry to the target section.
    pub fn add_relocation(&mut self, target: &str, entry: RelocEntry) -> Result<()> {
        self.add_relocations(target, &[entry])
    }

    /// Append relocation entries to the target section, creating the
    /// `.rel<target>` / `.rela<target>` section on first use.
    pub fn add_relocations(&mut self, target: &str, entries: &[RelocEntry]) -> Result<()> {
        self.splice_relocations(target, entries, false, None)
    }

    /// Replace the relocation entries for the target section, keeping the
    /// relocation section's header if one already exists.
    pub fn replace_relocations(&mut self, target: &str, entries: &[RelocEntry]) -> Result<()> {
        self.splice_relocations(target, entries, true, None)
    }

    /// Truncate both the `SHT_REL` and `SHT_RELA` sections attached to the
    /// target to zero bytes. A target with no relocation sections is left
    /// untouched; the verb is idempotent.
    pub fn remove_relocations(&mut self, target: &str) -> Result<()> {
        let target_index = self
            .section_index_by_name(target)
            .ok_or_else(|| Error::SectionNotFound(target.into()))?;
        let rel = self.relocation_section(target_index, SHT_REL);
        let rela = self.relocation_section(target_index, SHT_RELA);
        if rel.is_none() && rela.is_none() {
            return Ok(());
        }
        if let Some(index) = rel {
            self.sections[index].replace_data(Vec::new());
        }
        if let Some(index) = rela {
            self.sections[index].replace_data(Vec::new());
        }
        self.update_dynamic_reloc_tags();
        Ok(())
    }

    /// Build and add a relocation for the named symbol, resolved against
    /// `.symtab` first and `.dynsym` second. With no addend a REL entry is
    /// synthesized, otherwise RELA.
    pub fn add_relocation_for_symbol(
        &mut self,
        section: &str,
        symbol: &str,
        offset: u64,
        r_type: u32,
        addend: Option<i64>,
    ) -> Result<()> {
        if self.section_index_by_name(section).is_none() {
            return Err(Error::SectionNotFound(section.into()));
        }
        let (sym_index, symtab_index) = self.symbol_index_by_name(symbol)?;
        self.add_relocation_entry(section, sym_index, symtab_index, offset, r_type, addend)
    }

    /// Build and add a relocation that references no symbol.
    pub fn add_relocation_for_addr(
        &mut self,
        section: &str,
        offset: u64,
        r_type: u32,
        addend: Option<i64>,
    ) -> Result<()> {
        if self.section_index_by_name(section).is_none() {
            return Err(Error::SectionNotFound(section.into()));
        }
        self.add_relocation_entry(section, 0, None, offset, r_type, addend)
    }

    /// Append entries to a pre-existing relocation section such as
    /// `.rela.dyn` or `.rela.plt`. The entry kind must match the section.
    pub fn add_relocations_to_reloc_section(
        &mut self,
        name: &str,
        entries: &[RelocEntry],
    ) -> Result<()> {
        let index = self
            .section_index_by_name(name)
            .ok_or_else(|| Error::SectionNotFound(name.into()))?;
        let sh_type = self.sections[index].sh_type;
        if sh_type != SHT_REL && sh_type != SHT_RELA {
            return Err(Error::TypeMismatch(format!(
                "section {name:?} is not a relocation section"
            )));
        }
        let (data, rel_type, ent_size) = encode_relocations(entries, self.ctx.le, self.is_64())?;
        if rel_type != sh_type {
            return Err(Error::TypeMismatch(format!(
                "relocation kind does not match section {name:?}"
            )));
        }
        if self.sections[index].flags & u64::from(SHF_ALLOC) != 0 {
            self.check_alloc_room(self.sections[index].addr)?;
        }
        self.check_shstrtab()?;

        let align = self.relocation_align();
        let mut payload = self.sections[index].data().to_vec();
        payload.extend_from_slice(&data);
        {
            let section = &mut self.sections[index];
            section.addralign = align;
            section.entsize = ent_size;
            section.replace_data(payload);
        }
        let modified = self.ensure_section_name(index)?;
        self.relayout_relocation_sections(modified);
        self.relayout_alloc_relocation_section(index)?;
        self.update_dynamic_reloc_tags();
        Ok(())
    }

    /// Truncate the named relocation section to zero bytes.
    pub fn remove_relocations_from_reloc_section(&mut self, name: &str) -> Result<()> {
        let index = self
            .section_index_by_name(name)
            .ok_or_else(|| Error::SectionNotFound(name.into()))?;
        let sh_type = self.sections[index].sh_type;
        if sh_type != SHT_REL && sh_type != SHT_RELA {
            return Err(Error::TypeMismatch(format!(
                "section {name:?} is not a relocation section"
            )));
        }
        self.sections[index].replace_data(Vec::new());
        self.update_dynamic_reloc_tags();
        Ok(())
    }

    fn add_relocation_entry(
        &mut self,
        section: &str,
        sym_index: u32,
        symtab_index: Option<usize>,
        offset: u64,
        r_type: u32,
        addend: Option<i64>,
    ) -> Result<()> {
        let entry = if self.is_64() {
            match addend {
                None => RelocEntry::Rel64 {
                    offset,
                    info: r_info64(sym_index, r_type),
                },
                Some(addend) => RelocEntry::Rela64 {
                    offset,
                    info: r_info64(sym_index, r_type),
                    addend,
                },
            }
        } else {
            if offset > u64::from(u32::MAX) {
                return Err(Error::OutOfRange(format!(
                    "relocation offset {offset:#x} overflows 32 bits"
                )));
            }
            match addend {
                None => RelocEntry::Rel32 {
                    offset: offset as u32,
                    info: r_info32(sym_index, r_type),
                },
                Some(addend) => {
                    let addend = i32::try_from(addend).map_err(|_| {
                        Error::OutOfRange(format!("addend {addend} overflows 32 bits"))
                    })?;
                    RelocEntry::Rela32 {
                        offset: offset as u32,
                        info: r_info32(sym_index, r_type),
                        addend,
                    }
                }
            }
        };
        self.splice_relocations(section, &[entry], false, symtab_index)
    }

    fn splice_relocations(
        &mut self,
        target: &str,
        entries: &[RelocEntry],
        replace: bool,
        link_override: Option<usize>,
    ) -> Result<()> {
        let target_index = self
            .section_index_by_name(target)
            .ok_or_else(|| Error::SectionNotFound(target.into()))?;
        let (data, rel_type, ent_size) = encode_relocations(entries, self.ctx.le, self.is_64())?;

        let reloc_index = self.relocation_section(target_index, rel_type);

        let existing_link = reloc_index.map(|i| self.sections[i].link).unwrap_or(0);
        let mut link_index = existing_link;
        if let Some(index) = link_override {
            link_index = index as u32;
        }
        if link_index == 0 {
            link_index = self.default_symtab_index()? as u32;
        }
        if existing_link != 0 && existing_link != link_index {
            return Err(Error::TypeMismatch(format!(
                "relocation section links to symbol table {existing_link}, want {link_index}"
            )));
        }

        // A fresh relocation section inherits the target's allocation.
        let flags = match reloc_index {
            Some(index) => self.sections[index].flags,
            None => self.sections[target_index].flags & u64::from(SHF_ALLOC),
        };
        if flags & u64::from(SHF_ALLOC) != 0 {
            let addr = reloc_index.map(|i| self.sections[i].addr).unwrap_or(0);
            self.check_alloc_room(addr)?;
        }
        self.check_shstrtab()?;

        let align = self.relocation_align();
        let mut new_section = false;
        let reloc_index = match reloc_index {
            Some(index) => index,
            None => {
                let name = relocation_section_name(&self.sections[target_index].name, rel_type);
                self.sections.push(ElfSection {
                    name,
                    sh_name: 0,
                    sh_type: rel_type,
                    flags,
                    addr: 0,
                    offset: 0,
                    size: 0,
                    file_size: 0,
                    link: 0,
                    info: target_index as u32,
                    addralign: align,
                    entsize: ent_size,
                    data: Cow::Owned(Vec::new()),
                });
                new_section = true;
                self.sections.len() - 1
            }
        };

        let old_file_size = self.sections[reloc_index].file_size;
        let payload = if replace {
            data
        } else {
            let mut existing = self.sections[reloc_index].data().to_vec();
            existing.extend_from_slice(&data);
            existing
        };
        {
            let section = &mut self.sections[reloc_index];
            section.link = link_index;
            section.info = target_index as u32;
            section.addralign = align;
            section.entsize = ent_size;
            section.replace_data(payload);
        }

        let mut shstr_modified = self.ensure_section_name(reloc_index)?;
        shstr_modified |= new_section;
        self.relayout_relocation_sections(shstr_modified);
        if self.sections[reloc_index].flags & u64::from(SHF_ALLOC) != 0
            && self.sections[reloc_index].file_size != old_file_size
        {
            self.relayout_alloc_relocation_section(reloc_index)?;
        }
        self.update_dynamic_reloc_tags();
        Ok(())
    }

    /// The relocation section attached to `target_index`, if any. The
    /// attachment is the on-disk back-reference: `sh_info` holds the
    /// target's section index.
    fn relocation_section(&self, target_index: usize, rel_type: u32) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.sh_type == rel_type && s.info == target_index as u32)
    }

    fn default_symtab_index(&self) -> Result<usize> {
        self.section_index_by_name(".symtab")
            .or_else(|| self.section_index_by_name(".dynsym"))
            .ok_or_else(|| Error::Malformed("no symbol table section found".into()))
    }

    fn symbol_index_by_name(&self, name: &str) -> Result<(u32, Option<usize>)> {
        if let Some(symtab_index) = self.section_index_by_name(".symtab") {
            if let Some(pos) = self.symbols.iter().position(|s| s.name == name) {
                return Ok((pos as u32, Some(symtab_index)));
            }
        }
        if let Some(dynsym_index) = self.section_index_by_name(".dynsym") {
            if let Some(pos) = self.dynamic_symbols.iter().position(|s| s.name == name) {
                return Ok((pos as u32, Some(dynsym_index)));
            }
        }
        Err(Error::SymbolNotFound(name.into()))
    }

    fn relocation_align(&self) -> u64 {
        if self.is_64() {
            8
        } else {
            4
        }
    }

    fn table_align(&self) -> u64 {
        if self.is_64() {
            8
        } else {
            4
        }
    }

    fn check_shstrtab(&self) -> Result<()> {
        if self.shstr_index >= self.sections.len() {
            return Err(Error::Malformed(
                "invalid section header string table index".into(),
            ));
        }
        Ok(())
    }

    fn check_alloc_room(&self, addr: u64) -> Result<()> {
        let contained = if addr == 0 {
            // A fresh section gets its address from the last PT_LOAD.
            self.program_headers.iter().any(|p| p.p_type == PT_LOAD)
        } else {
            self.program_headers.iter().any(|p| {
                p.p_type == PT_LOAD && addr >= p.p_vaddr && addr < p.p_vaddr + p.p_memsz
            })
        };
        if contained {
            Ok(())
        } else {
            Err(Error::NoRoomToGrow)
        }
    }

    /// Make sure the section's name exists in `.shstrtab` and point
    /// `sh_name` at it. Returns whether the string table grew.
    fn ensure_section_name(&mut self, section_index: usize) -> Result<bool> {
        let name = self.sections[section_index].name.clone();
        if name.is_empty() {
            return Ok(false);
        }
        self.check_shstrtab()?;
        let mut needle = name.into_bytes();
        needle.push(0);
        let existing = find_subslice(self.sections[self.shstr_index].data(), &needle);
        if let Some(pos) = existing {
            self.sections[section_index].sh_name = pos as u32;
            return Ok(false);
        }
        let mut table = self.sections[self.shstr_index].data().to_vec();
        let pos = table.len();
        table.extend_from_slice(&needle);
        self.sections[self.shstr_index].replace_data(table);
        self.sections[section_index].sh_name = pos as u32;
        Ok(true)
    }

    /// Repack every non-allocated relocation section (and a grown
    /// `.shstrtab`) past the end of the sections that stay put, then move
    /// the section header table past everything.
    fn relayout_relocation_sections(&mut self, shstr_modified: bool) {
        let mut moved: Vec<usize> = (0..self.sections.len())
            .filter(|&i| {
                self.sections[i].sh_type == SHT_REL || self.sections[i].sh_type == SHT_RELA
            })
            .collect();
        if shstr_modified && self.shstr_index < self.sections.len() {
            moved.push(self.shstr_index);
        }
        if moved.is_empty() {
            return;
        }
        let move_set: Vec<usize> = moved
            .iter()
            .copied()
            .filter(|&i| self.sections[i].flags & u64::from(SHF_ALLOC) == 0)
            .collect();

        let mut max_end = 0u64;
        for (i, s) in self.sections.iter().enumerate() {
            if move_set.contains(&i) {
                continue;
            }
            if s.sh_type == SHT_NOBITS || s.file_size == 0 {
                continue;
            }
            max_end = max_end.max(s.offset + s.file_size);
        }

        let mut offset = max_end;
        for &i in &moved {
            if self.sections[i].flags & u64::from(SHF_ALLOC) != 0 {
                continue;
            }
            offset = align_up(offset, self.sections[i].addralign.max(1));
            self.sections[i].offset = offset;
            offset += self.sections[i].file_size;
        }
        self.header.e_shoff = align_up(offset, self.table_align());
        debug!(shoff = self.header.e_shoff, "repacked relocation sections");
    }

    /// Place a grown allocated relocation section inside its `PT_LOAD`,
    /// extending the segment, or spill past the last `PT_LOAD` when the
    /// next segment is in the way.
    fn relayout_alloc_relocation_section(&mut self, index: usize) -> Result<()> {
        if self.sections[index].flags & u64::from(SHF_ALLOC) == 0 {
            return Ok(());
        }
        let addr = self.sections[index].addr;
        if addr == 0 {
            return self.relayout_alloc_new_load(index);
        }
        let prog_index = self
            .program_headers
            .iter()
            .position(|p| p.p_type == PT_LOAD && addr >= p.p_vaddr && addr < p.p_vaddr + p.p_memsz)
            .ok_or(Error::NoRoomToGrow)?;
        let (prog_off, prog_filesz, prog_vaddr) = {
            let p = &self.program_headers[prog_index];
            (p.p_offset, p.p_filesz, p.p_vaddr)
        };

        let mut next_load_off = 0u64;
        for (i, p) in self.program_headers.iter().enumerate() {
            if p.p_type != PT_LOAD || i == prog_index {
                continue;
            }
            if p.p_offset > prog_off && (next_load_off == 0 || p.p_offset < next_load_off) {
                next_load_off = p.p_offset;
            }
        }

        let align = match self.sections[index].addralign {
            0 => self.relocation_align(),
            a => a,
        };
        let new_off = align_up(prog_off + prog_filesz, align);
        let new_end = new_off + self.sections[index].file_size;
        if next_load_off != 0 && new_end > next_load_off {
            return self.relayout_alloc_new_load(index);
        }
        let new_addr = prog_vaddr + (new_off - prog_off);
        self.sections[index].offset = new_off;
        self.sections[index].addr = new_addr;
        if new_end > prog_off + prog_filesz {
            let delta = new_end - (prog_off + prog_filesz);
            let p = &mut self.program_headers[prog_index];
            p.p_filesz += delta;
            p.p_memsz += delta;
        }
        self.bump_sht_offset(new_end);
        debug!(
            section = %self.sections[index].name,
            offset = new_off,
            addr = new_addr,
            "extended containing PT_LOAD"
        );
        Ok(())
    }

    fn relayout_alloc_new_load(&mut self, index: usize) -> Result<()> {
        let align = match self.sections[index].addralign {
            0 => self.relocation_align(),
            a => a,
        };
        let mut last: Option<usize> = None;
        for (i, p) in self.program_headers.iter().enumerate() {
            if p.p_type != PT_LOAD {
                continue;
            }
            if last.map_or(true, |l| p.p_offset > self.program_headers[l].p_offset) {
                last = Some(i);
            }
        }
        let last = last.ok_or(Error::NoRoomToGrow)?;
        let (last_off, last_filesz, last_vaddr) = {
            let p = &self.program_headers[last];
            (p.p_offset, p.p_filesz, p.p_vaddr)
        };
        let base = (last_off + last_filesz).max(self.max_file_end());
        let new_off = align_up(base, align);
        let new_addr = last_vaddr + (new_off - last_off);
        self.sections[index].offset = new_off;
        self.sections[index].addr = new_addr;
        let end = new_off + self.sections[index].file_size;
        if end > last_off + last_filesz {
            let delta = end - (last_off + last_filesz);
            let p = &mut self.program_headers[last];
            p.p_filesz += delta;
            p.p_memsz += delta;
        }
        self.bump_sht_offset(end);
        debug!(
            section = %self.sections[index].name,
            offset = new_off,
            addr = new_addr,
            "placed past the last PT_LOAD"
        );
        Ok(())
    }

    fn bump_sht_offset(&mut self, end: u64) {
        if end > self.header.e_shoff {
            self.header.e_shoff = align_up(end, self.table_align());
        }
    }

    fn max_file_end(&self) -> u64 {
        let mut max_end = 0u64;
        for s in &self.sections {
            if s.sh_type == SHT_NOBITS || s.file_size == 0 {
                continue;
            }
            max_end = max_end.max(s.offset + s.file_size);
        }
        max_end.max(self.header.e_shoff)
    }

    /// Rewrite the dynamic tags that locate relocation tables so they
    /// agree with every allocated relocation section. Section names
    /// containing ".plt" map to the `DT_JMPREL` family.
    fn update_dynamic_reloc_tags(&mut self) {
        if self.dyn_tags.is_empty() {
            return;
        }
        let tagged: Vec<(u32, u64, u64, u64, bool)> = self
            .sections
            .iter()
            .filter(|s| {
                s.flags & u64::from(SHF_ALLOC) != 0
                    && (s.sh_type == SHT_REL || s.sh_type == SHT_RELA)
                    && s.addr != 0
            })
            .map(|s| {
                (
                    s.sh_type,
                    s.addr,
                    s.size,
                    s.entsize,
                    s.name.contains(".plt"),
                )
            })
            .collect();
        for (sh_type, addr, size, entsize, is_plt) in tagged {
            if sh_type == SHT_RELA {
                if is_plt {
                    self.set_dyn_tag(DT_JMPREL, addr);
                    self.set_dyn_tag(DT_PLTRELSZ, size);
                    self.set_dyn_tag(DT_PLTREL, DT_RELA);
                } else {
                    self.set_dyn_tag(DT_RELA, addr);
                    self.set_dyn_tag(DT_RELASZ, size);
                    self.set_dyn_tag(DT_RELAENT, entsize);
                }
            } else if is_plt {
                self.set_dyn_tag(DT_JMPREL, addr);
                self.set_dyn_tag(DT_PLTRELSZ, size);
                self.set_dyn_tag(DT_PLTREL, DT_REL);
            } else {
                self.set_dyn_tag(DT_REL, addr);
                self.set_dyn_tag(DT_RELSZ, size);
                self.set_dyn_tag(DT_RELENT, entsize);
            }
        }
    }

    fn set_dyn_tag(&mut self, tag: u64, value: u64) {
        if let Some(entry) = self.dyn_tags.iter_mut().find(|e| e.tag == tag) {
            entry.value = value;
            return;
        }
        // New tags go in front of the DT_NULL terminator.
        let pos = self
            .dyn_tags
            .iter()
            .position(|e| e.tag == DT_NULL)
            .unwrap_or(self.dyn_tags.len());
        self.dyn_tags.insert(pos, DynTagValue { tag, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r_info_packs_symbol_and_type() {
        assert_eq!(r_info32(2, 1), 0x201);
        assert_eq!(r_info64(1, 8), 0x0000_0001_0000_0008);
    }

    #[test]
    fn encode_rejects_mixed_kinds() {
        let entries = [
            RelocEntry::Rel64 { offset: 0, info: 0 },
            RelocEntry::Rela64 {
                offset: 8,
                info: 0,
                addend: 0,
            },
        ];
        assert!(matches!(
            encode_relocations(&entries, Endian::Little, true),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn encode_rejects_wrong_class() {
        let entries = [RelocEntry::Rel32 { offset: 0, info: 0 }];
        assert!(matches!(
            encode_relocations(&entries, Endian::Little, true),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn encode_rela64_layout() {
        let entries = [RelocEntry::Rela64 {
            offset: 0x10,
            info: r_info64(1, 8),
            addend: -1,
        }];
        let (data, sh_type, ent_size) =
            encode_relocations(&entries, Endian::Little, true).unwrap();
        assert_eq!(sh_type, SHT_RELA);
        assert_eq!(ent_size, 24);
        assert_eq!(data.len(), 24);
        assert_eq!(&data[0..8], &[0x10, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&data[8..16], &[8, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(&data[16..24], &[0xff; 8]);
    }
}
