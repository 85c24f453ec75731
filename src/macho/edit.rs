//! Relocation edit verbs for Mach-O files.
//!
//! The verbs mutate the per-section relocation lists and the per-symbol
//! dylib-ordinal and bind-kind maps. Nothing is laid out here: the dyld
//! streams, relocation blocks, and load commands are refreshed when the
//! file is serialized, and only if one of these verbs ran.

use crate::error::{Error, Result};

use super::{BindKind, MachReloc, MachoFile};

impl<'a> MachoFile<'a> {
    /// Append a relocation to the named section.
    pub fn add_relocation(&mut self, section: &str, rel: MachReloc) -> Result<()> {
        let index = self.section_index(section)?;
        self.sections[index].relocs.push(rel);
        self.relocs_dirty = true;
        Ok(())
    }

    /// Append relocations to the named section.
    pub fn add_relocations(&mut self, section: &str, rels: &[MachReloc]) -> Result<()> {
        let index = self.section_index(section)?;
        self.sections[index].relocs.extend_from_slice(rels);
        self.relocs_dirty = true;
        Ok(())
    }

    /// Replace the named section's relocations.
    pub fn replace_relocations(&mut self, section: &str, rels: &[MachReloc]) -> Result<()> {
        let index = self.section_index(section)?;
        let section = &mut self.sections[index];
        section.relocs.clear();
        section.relocs.extend_from_slice(rels);
        self.relocs_dirty = true;
        Ok(())
    }

    /// Drop all relocations from the named section. Idempotent.
    pub fn remove_relocations(&mut self, section: &str) -> Result<()> {
        let index = self.section_index(section)?;
        self.sections[index].relocs.clear();
        self.relocs_dirty = true;
        Ok(())
    }

    /// Append a scattered relocation: the address word carries the type,
    /// width, and pcrel bits, and `value` carries the target address.
    pub fn add_scattered_relocation(
        &mut self,
        section: &str,
        addr: u32,
        value: u32,
        r_type: u8,
        len: u8,
        pcrel: bool,
    ) -> Result<()> {
        if addr > 0x00ff_ffff {
            return Err(Error::OutOfRange(format!(
                "scattered relocation address {addr:#x} exceeds 24 bits"
            )));
        }
        self.add_relocation(
            section,
            MachReloc {
                addr,
                value,
                r_type,
                len,
                pcrel,
                external: false,
                scattered: true,
            },
        )
    }

    /// Create a non-scattered external relocation referencing the named
    /// symbol. Equivalent to
    /// [`add_relocation_for_symbol_with_dylib_ordinal`] with ordinal 0.
    ///
    /// [`add_relocation_for_symbol_with_dylib_ordinal`]:
    /// MachoFile::add_relocation_for_symbol_with_dylib_ordinal
    pub fn add_relocation_for_symbol(
        &mut self,
        section: &str,
        symbol: &str,
        addr: u32,
        r_type: u8,
        len: u8,
        pcrel: bool,
    ) -> Result<()> {
        self.add_relocation_for_symbol_with_dylib_ordinal(
            section, symbol, addr, r_type, len, pcrel, 0,
        )
    }

    /// Create an external relocation referencing the named symbol and
    /// record the dylib ordinal (0-15) used when bind info is generated.
    #[allow(clippy::too_many_arguments)]
    pub fn add_relocation_for_symbol_with_dylib_ordinal(
        &mut self,
        section: &str,
        symbol: &str,
        addr: u32,
        r_type: u8,
        len: u8,
        pcrel: bool,
        dylib_ordinal: u8,
    ) -> Result<()> {
        if dylib_ordinal > 15 {
            return Err(Error::OutOfRange(format!(
                "dylib ordinal {dylib_ordinal} out of range"
            )));
        }
        let section_index = self.section_index(section)?;
        let sym_index = self.symbol_index(symbol)?;
        self.sections[section_index].relocs.push(MachReloc {
            addr,
            value: sym_index,
            r_type,
            len,
            pcrel,
            external: true,
            scattered: false,
        });
        self.dylib_ordinals.insert(sym_index, dylib_ordinal);
        self.relocs_dirty = true;
        Ok(())
    }

    /// Record a dylib ordinal for the named symbol.
    pub fn set_dylib_ordinal_for_symbol(&mut self, symbol: &str, ordinal: u8) -> Result<()> {
        let index = self.symbol_index(symbol)?;
        self.set_dylib_ordinal_for_symbol_index(index, ordinal)
    }

    /// Record a dylib ordinal for a symbol index.
    pub fn set_dylib_ordinal_for_symbol_index(&mut self, index: u32, ordinal: u8) -> Result<()> {
        if ordinal > 15 {
            return Err(Error::OutOfRange(format!(
                "dylib ordinal {ordinal} out of range"
            )));
        }
        self.dylib_ordinals.insert(index, ordinal);
        self.relocs_dirty = true;
        Ok(())
    }

    /// Route the named symbol's bindings into the normal, weak, or lazy
    /// stream.
    pub fn set_bind_kind_for_symbol(&mut self, symbol: &str, kind: BindKind) -> Result<()> {
        let index = self.symbol_index(symbol)?;
        self.set_bind_kind_for_symbol_index(index, kind)
    }

    /// Route a symbol index's bindings into the given stream.
    pub fn set_bind_kind_for_symbol_index(&mut self, index: u32, kind: BindKind) -> Result<()> {
        self.bind_kinds.insert(index, kind);
        self.relocs_dirty = true;
        Ok(())
    }

    fn section_index(&self, name: &str) -> Result<usize> {
        self.sections
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::SectionNotFound(name.into()))
    }

    fn symbol_index(&self, name: &str) -> Result<u32> {
        let symtab = self
            .symtab
            .as_ref()
            .ok_or_else(|| Error::Malformed("symbol table not available".into()))?;
        symtab
            .syms
            .iter()
            .position(|sym| sym.name == name)
            .map(|pos| pos as u32)
            .ok_or_else(|| Error::SymbolNotFound(name.into()))
    }
}
