//! Base relocation and COFF relocation edit verbs.
//!
//! Base relocations are bucketed into per-page blocks; COFF relocations
//! hang off their section. Each verb re-runs the relocation relayout so
//! the `.reloc` section, data directory, image sizes, and table pointers
//! stay consistent with the model.

use crate::error::{Error, Result};

use super::{BaseRelocBlock, BaseRelocItem, CoffReloc, PeFile};

impl<'a> PeFile<'a> {
    /// Add one base relocation to the block covering its page, creating
    /// the block if absent.
    pub fn add_base_reloc(&mut self, rva: u32, typ: u8) -> Result<()> {
        let page = rva & !0x0fff;
        let item = BaseRelocItem {
            typ,
            offset: (rva & 0x0fff) as u16,
        };
        let blocks = self.base_relocs.get_or_insert_with(Vec::new);
        if let Some(block) = blocks.iter_mut().find(|b| b.virtual_address == page) {
            block.items.push(item);
        } else {
            blocks.push(BaseRelocBlock {
                virtual_address: page,
                items: vec![item],
            });
        }
        self.relayout_after_edit()
    }

    /// Append a whole relocation block to the base relocation table.
    pub fn add_base_relocation(&mut self, block: BaseRelocBlock) -> Result<()> {
        self.base_relocs.get_or_insert_with(Vec::new).push(block);
        self.relayout_after_edit()
    }

    /// Replace the base relocation table.
    pub fn replace_base_relocations(&mut self, blocks: Vec<BaseRelocBlock>) -> Result<()> {
        self.base_relocs = Some(blocks);
        self.relayout_after_edit()
    }

    /// Drop every base relocation; the data directory entry is zeroed at
    /// relayout. Idempotent.
    pub fn remove_base_relocations(&mut self) -> Result<()> {
        self.base_relocs = Some(Vec::new());
        self.relayout_after_edit()
    }

    /// Append a COFF relocation to the named section.
    pub fn add_section_relocation(&mut self, section: &str, reloc: CoffReloc) -> Result<()> {
        let index = self.section_index(section)?;
        if self.sections[index].relocs.len() >= usize::from(u16::MAX) {
            return Err(Error::OutOfRange(format!(
                "too many COFF relocations for section {section:?}"
            )));
        }
        self.sections[index].relocs.push(reloc);
        self.relayout_after_edit()
    }

    /// Append a COFF relocation referencing the named symbol, resolved
    /// through the COFF symbol and string tables.
    pub fn add_section_relocation_for_symbol(
        &mut self,
        section: &str,
        symbol: &str,
        virtual_address: u32,
        typ: u16,
    ) -> Result<()> {
        let symbol_table_index = self.coff_symbol_index(symbol)?;
        self.add_section_relocation(
            section,
            CoffReloc {
                virtual_address,
                symbol_table_index,
                typ,
            },
        )
    }

    /// Replace the named section's COFF relocations.
    pub fn replace_section_relocations(
        &mut self,
        section: &str,
        relocs: &[CoffReloc],
    ) -> Result<()> {
        if relocs.len() > usize::from(u16::MAX) {
            return Err(Error::OutOfRange(format!(
                "too many COFF relocations for section {section:?}"
            )));
        }
        let index = self.section_index(section)?;
        let target = &mut self.sections[index];
        target.relocs.clear();
        target.relocs.extend_from_slice(relocs);
        self.relayout_after_edit()
    }

    /// Drop the named section's COFF relocations. Idempotent.
    pub fn remove_section_relocations(&mut self, section: &str) -> Result<()> {
        let index = self.section_index(section)?;
        self.sections[index].relocs.clear();
        self.relayout_after_edit()
    }

    fn section_index(&self, name: &str) -> Result<usize> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::SectionNotFound(name.into()))
    }

    /// Resolve a name to its main symbol record's index, skipping
    /// auxiliary records.
    fn coff_symbol_index(&self, name: &str) -> Result<u32> {
        let mut index = 0usize;
        while index < self.symbols.len() {
            if self.symbol_name(index).as_deref() == Some(name) {
                return Ok(index as u32);
            }
            index += 1 + self.symbols[index].number_of_aux_symbols as usize;
        }
        Err(Error::SymbolNotFound(name.into()))
    }

    fn relayout_after_edit(&mut self) -> Result<()> {
        self.relocs_dirty = true;
        if self.optional.is_some() {
            self.prepare_relocation_layout()?;
        }
        Ok(())
    }
}
