//! Integration tests for ELF relocation editing.
//!
//! The fixture is a synthesized but loader-shaped x86-64 executable: two
//! PT_LOAD segments plus PT_DYNAMIC, an allocated `.rela.dyn`, dynamic
//! and static symbol tables, and a dynamic section describing them.
//! Every test serializes and re-parses the output, the way the original
//! consumers of these files would.

#![cfg(feature = "elf")]

use binedit::{r_info64, ElfFile, Error, RelocEntry};
use goblin::elf::dynamic::{DT_RELA, DT_RELAENT, DT_RELASZ};
use goblin::elf::program_header::PT_LOAD;
use goblin::elf::reloc::{R_X86_64_64, R_X86_64_RELATIVE};

fn push16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn push64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}
fn pad_to(buf: &mut Vec<u8>, offset: usize) {
    assert!(buf.len() <= offset, "fixture layout bug at {offset:#x}");
    buf.resize(offset, 0);
}

#[allow(clippy::too_many_arguments)]
fn phdr(buf: &mut Vec<u8>, p_type: u32, flags: u32, off: u64, vaddr: u64, filesz: u64, memsz: u64, align: u64) {
    push32(buf, p_type);
    push32(buf, flags);
    push64(buf, off);
    push64(buf, vaddr);
    push64(buf, vaddr);
    push64(buf, filesz);
    push64(buf, memsz);
    push64(buf, align);
}

#[allow(clippy::too_many_arguments)]
fn shdr(buf: &mut Vec<u8>, name: u32, sh_type: u32, flags: u64, addr: u64, offset: u64, size: u64, link: u32, info: u32, align: u64, entsize: u64) {
    push32(buf, name);
    push32(buf, sh_type);
    push64(buf, flags);
    push64(buf, addr);
    push64(buf, offset);
    push64(buf, size);
    push32(buf, link);
    push32(buf, info);
    push64(buf, align);
    push64(buf, entsize);
}

fn sym(buf: &mut Vec<u8>, name: u32, info: u8, shndx: u16, value: u64) {
    push32(buf, name);
    buf.push(info);
    buf.push(0);
    push16(buf, shndx);
    push64(buf, value);
    push64(buf, 0);
}

const SHT_OFF: u64 = 0x2d0;

/// A minimal dynamically-linked x86-64 executable.
fn sample_elf() -> Vec<u8> {
    let mut buf = Vec::new();

    // ELF header
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    push16(&mut buf, 2); // ET_EXEC
    push16(&mut buf, 62); // EM_X86_64
    push32(&mut buf, 1);
    push64(&mut buf, 0x400100); // entry
    push64(&mut buf, 0x40); // phoff
    push64(&mut buf, SHT_OFF); // shoff
    push32(&mut buf, 0);
    push16(&mut buf, 64);
    push16(&mut buf, 0x38);
    push16(&mut buf, 3); // phnum
    push16(&mut buf, 0x40);
    push16(&mut buf, 9); // shnum
    push16(&mut buf, 8); // shstrndx

    phdr(&mut buf, PT_LOAD, 5, 0, 0x400000, 0x140, 0x140, 0x1000);
    phdr(&mut buf, PT_LOAD, 6, 0x140, 0x600140, 0x110, 0x110, 0x1000);
    phdr(&mut buf, 2 /* PT_DYNAMIC */, 6, 0x190, 0x600190, 0xc0, 0xc0, 8);

    // .text
    pad_to(&mut buf, 0x100);
    buf.push(0xc3);
    pad_to(&mut buf, 0x120);
    // .rela.dyn: one R_X86_64_RELATIVE entry
    push64(&mut buf, 0x600150);
    push64(&mut buf, r_info64(0, R_X86_64_RELATIVE));
    push64(&mut buf, 0x400100);
    // .dynsym: null + "globalfn"
    pad_to(&mut buf, 0x140);
    sym(&mut buf, 0, 0, 0, 0);
    sym(&mut buf, 1, 0x12, 1, 0x400100);
    // .dynstr
    pad_to(&mut buf, 0x170);
    buf.extend_from_slice(b"\0globalfn\0");
    // .dynamic
    pad_to(&mut buf, 0x190);
    for (tag, value) in [
        (DT_RELA, 0x400120u64),
        (DT_RELASZ, 0x18),
        (DT_RELAENT, 0x18),
        (6 /* DT_SYMTAB */, 0x600140),
        (11 /* DT_SYMENT */, 24),
        (5 /* DT_STRTAB */, 0x600170),
        (10 /* DT_STRSZ */, 0x10),
        (0 /* DT_NULL */, 0),
    ] {
        push64(&mut buf, tag);
        push64(&mut buf, value);
    }
    // .symtab: null + "main"
    pad_to(&mut buf, 0x250);
    sym(&mut buf, 0, 0, 0, 0);
    sym(&mut buf, 1, 0x12, 1, 0x400100);
    // .strtab
    pad_to(&mut buf, 0x280);
    buf.extend_from_slice(b"\0main\0");
    // .shstrtab
    pad_to(&mut buf, 0x286);
    buf.extend_from_slice(b"\0.text\0.rela.dyn\0.dynsym\0.dynstr\0.dynamic\0.symtab\0.strtab\0.shstrtab\0");

    pad_to(&mut buf, SHT_OFF as usize);
    shdr(&mut buf, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr(&mut buf, 1, 1, 6, 0x400100, 0x100, 0x20, 0, 0, 16, 0); // .text
    shdr(&mut buf, 7, 4, 2, 0x400120, 0x120, 0x18, 3, 0, 8, 24); // .rela.dyn
    shdr(&mut buf, 17, 11, 2, 0x600140, 0x140, 0x30, 4, 1, 8, 24); // .dynsym
    shdr(&mut buf, 25, 3, 2, 0x600170, 0x170, 0x10, 0, 0, 1, 0); // .dynstr
    shdr(&mut buf, 33, 6, 3, 0x600190, 0x190, 0xc0, 4, 0, 8, 16); // .dynamic
    shdr(&mut buf, 42, 2, 0, 0, 0x250, 0x30, 7, 1, 8, 24); // .symtab
    shdr(&mut buf, 50, 3, 0, 0, 0x280, 6, 0, 0, 1, 0); // .strtab
    shdr(&mut buf, 58, 3, 0, 0, 0x286, 0x44, 0, 0, 1, 0); // .shstrtab
    buf
}

/// Re-parse output with goblin and check the loader-visible invariants.
fn verify_elf_structure(data: &[u8]) {
    let elf = goblin::elf::Elf::parse(data).expect("output must re-parse");
    for (i, ph) in elf.program_headers.iter().enumerate() {
        if ph.p_type == PT_LOAD && ph.p_align > 0 {
            assert_eq!(
                ph.p_vaddr.wrapping_sub(ph.p_offset) % ph.p_align,
                0,
                "PT_LOAD[{i}] breaks the offset/vaddr congruence"
            );
            assert!(
                (ph.p_offset + ph.p_filesz) as usize <= data.len(),
                "PT_LOAD[{i}] extends past the file"
            );
        }
    }
}

#[test]
fn unmodified_roundtrip_is_byte_identical() {
    let input = sample_elf();
    let file = ElfFile::parse(&input).unwrap();
    let output = file.bytes().unwrap();
    assert_eq!(input, output);
}

#[test]
fn add_relocation_for_symbol_creates_rela_text() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();

    let sym_name = file
        .symbols()
        .iter()
        .find(|s| !s.name.is_empty() && s.section_index != 0)
        .map(|s| s.name.clone())
        .expect("fixture has a defined symbol");
    file.add_relocation_for_symbol(".text", &sym_name, 0, R_X86_64_64, Some(0))
        .unwrap();

    let output = file.bytes().unwrap();
    verify_elf_structure(&output);
    let reparsed = ElfFile::parse(&output).unwrap();
    let rela = reparsed.section(".rela.text").expect(".rela.text missing");
    assert!(rela.size > 0);
    assert_eq!(rela.entsize, 24);
    assert_eq!(rela.size % rela.entsize, 0);
    let symtab_index = reparsed
        .sections()
        .iter()
        .position(|s| s.name == ".symtab")
        .unwrap();
    assert_eq!(rela.link as usize, symtab_index);
}

#[test]
fn growing_rela_dyn_updates_dynamic_tags() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    let old_size = file.section(".rela.dyn").unwrap().size;

    let entry = RelocEntry::Rela64 {
        offset: 0,
        info: r_info64(0, R_X86_64_RELATIVE),
        addend: 0,
    };
    file.add_relocations_to_reloc_section(".rela.dyn", &[entry])
        .unwrap();

    let output = file.bytes().unwrap();
    verify_elf_structure(&output);
    let reparsed = ElfFile::parse(&output).unwrap();
    let rela = reparsed.section(".rela.dyn").expect(".rela.dyn missing");
    assert!(rela.size > old_size);
    assert_eq!(reparsed.dyn_tag(DT_RELA), Some(rela.addr));
    assert_eq!(reparsed.dyn_tag(DT_RELASZ), Some(rela.size));
    assert_eq!(reparsed.dyn_tag(DT_RELAENT), Some(24));
}

#[test]
fn grown_section_stays_inside_a_load_segment() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    let entry = RelocEntry::Rela64 {
        offset: 0,
        info: r_info64(0, R_X86_64_RELATIVE),
        addend: 0,
    };
    file.add_relocations_to_reloc_section(".rela.dyn", &[entry])
        .unwrap();

    let output = file.bytes().unwrap();
    let reparsed = ElfFile::parse(&output).unwrap();
    let rela = reparsed.section(".rela.dyn").unwrap();
    let contained = reparsed.program_headers().iter().any(|p| {
        p.p_type == PT_LOAD
            && rela.addr >= p.p_vaddr
            && rela.addr + rela.size <= p.p_vaddr + p.p_memsz
            && rela.offset >= p.p_offset
            && rela.offset + rela.size <= p.p_offset + p.p_filesz
    });
    assert!(contained, "relocated .rela.dyn left every PT_LOAD");
}

#[test]
fn remove_relocations_truncates_and_is_idempotent() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    file.add_relocation_for_symbol(".text", "main", 0, R_X86_64_64, Some(0))
        .unwrap();
    file.remove_relocations(".text").unwrap();
    let once = file.bytes().unwrap();
    file.remove_relocations(".text").unwrap();
    let twice = file.bytes().unwrap();
    assert_eq!(once, twice);

    let reparsed = ElfFile::parse(&once).unwrap();
    let rela = reparsed.section(".rela.text").expect("section header stays");
    assert_eq!(rela.size, 0);
}

#[test]
fn rel_entry_without_addend_creates_rel_section() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    file.add_relocation_for_addr(".text", 0, R_X86_64_64, None)
        .unwrap();

    let output = file.bytes().unwrap();
    let reparsed = ElfFile::parse(&output).unwrap();
    let rel = reparsed.section(".rel.text").expect(".rel.text missing");
    assert_eq!(rel.entsize, 16);
    assert_eq!(rel.size, 16);
}

#[test]
fn add_relocation_appends() {
    // Two identical adds double the section size.
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    let entry = RelocEntry::Rela64 {
        offset: 0,
        info: r_info64(1, R_X86_64_64),
        addend: 0,
    };
    file.add_relocation(".text", entry).unwrap();
    file.add_relocation(".text", entry).unwrap();
    let output = file.bytes().unwrap();
    let reparsed = ElfFile::parse(&output).unwrap();
    assert_eq!(reparsed.section(".rela.text").unwrap().size, 48);
}

#[test]
fn replace_relocations_keeps_one_entry() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    let entry = RelocEntry::Rela64 {
        offset: 0,
        info: r_info64(1, R_X86_64_64),
        addend: 0,
    };
    file.add_relocations(".text", &[entry, entry]).unwrap();
    file.replace_relocations(".text", &[entry]).unwrap();
    let output = file.bytes().unwrap();
    let reparsed = ElfFile::parse(&output).unwrap();
    assert_eq!(reparsed.section(".rela.text").unwrap().size, 24);
}

#[test]
fn mixed_kind_batches_are_rejected() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    let err = file
        .add_relocations_to_reloc_section(
            ".rela.dyn",
            &[RelocEntry::Rel64 { offset: 0, info: 0 }],
        )
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch(_)));
    // The failed edit must not have grown the section.
    assert_eq!(file.section(".rela.dyn").unwrap().size, 0x18);
}

#[test]
fn homeless_allocated_section_cannot_grow() {
    // Point .rela.dyn's address outside every PT_LOAD; growing it then
    // has nowhere to go.
    let mut input = sample_elf();
    let rela_dyn_addr = SHT_OFF as usize + 2 * 0x40 + 0x10;
    input[rela_dyn_addr..rela_dyn_addr + 8].copy_from_slice(&0x900000u64.to_le_bytes());

    let mut file = ElfFile::parse(&input).unwrap();
    let entry = RelocEntry::Rela64 {
        offset: 0,
        info: r_info64(0, R_X86_64_RELATIVE),
        addend: 0,
    };
    assert!(matches!(
        file.add_relocations_to_reloc_section(".rela.dyn", &[entry]),
        Err(Error::NoRoomToGrow)
    ));
    // The failed edit must not have grown the section.
    assert_eq!(file.section(".rela.dyn").unwrap().size, 0x18);
}

#[test]
fn unknown_names_are_rejected() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    assert!(matches!(
        file.add_relocation_for_symbol(".nope", "main", 0, R_X86_64_64, None),
        Err(Error::SectionNotFound(_))
    ));
    assert!(matches!(
        file.add_relocation_for_symbol(".text", "missing_symbol", 0, R_X86_64_64, None),
        Err(Error::SymbolNotFound(_))
    ));
    assert!(matches!(
        file.add_relocations_to_reloc_section(".text", &[RelocEntry::Rela64 {
            offset: 0,
            info: 0,
            addend: 0
        }]),
        Err(Error::TypeMismatch(_))
    ));
}

#[allow(clippy::too_many_arguments)]
fn phdr32(buf: &mut Vec<u8>, p_type: u32, flags: u32, off: u32, vaddr: u32, filesz: u32, align: u32) {
    push32(buf, p_type);
    push32(buf, off);
    push32(buf, vaddr);
    push32(buf, vaddr);
    push32(buf, filesz);
    push32(buf, filesz);
    push32(buf, flags);
    push32(buf, align);
}

#[allow(clippy::too_many_arguments)]
fn shdr32(buf: &mut Vec<u8>, name: u32, sh_type: u32, flags: u32, addr: u32, offset: u32, size: u32, link: u32, info: u32, align: u32, entsize: u32) {
    for v in [name, sh_type, flags, addr, offset, size, link, info, align, entsize] {
        push32(buf, v);
    }
}

fn sym32(buf: &mut Vec<u8>, name: u32, value: u32, info: u8, shndx: u16) {
    push32(buf, name);
    push32(buf, value);
    push32(buf, 0);
    buf.push(info);
    buf.push(0);
    push16(buf, shndx);
}

const SHT32_OFF: u32 = 0x168;

/// A minimal statically-linked i386 executable.
fn sample_elf32() -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    push16(&mut buf, 2);
    push16(&mut buf, 3); // EM_386
    push32(&mut buf, 1);
    push32(&mut buf, 0x804_8100); // entry
    push32(&mut buf, 0x34); // phoff
    push32(&mut buf, SHT32_OFF);
    push32(&mut buf, 0);
    push16(&mut buf, 52);
    push16(&mut buf, 0x20);
    push16(&mut buf, 1); // phnum
    push16(&mut buf, 0x28);
    push16(&mut buf, 5); // shnum
    push16(&mut buf, 4); // shstrndx

    phdr32(&mut buf, PT_LOAD, 5, 0, 0x804_8000, 0x200, 0x1000);

    pad_to(&mut buf, 0x100);
    buf.push(0xc3);
    pad_to(&mut buf, 0x120);
    sym32(&mut buf, 0, 0, 0, 0);
    sym32(&mut buf, 1, 0x804_8100, 0x12, 1); // "start"
    pad_to(&mut buf, 0x140);
    buf.extend_from_slice(b"\0start\0");
    pad_to(&mut buf, 0x147);
    buf.extend_from_slice(b"\0.text\0.symtab\0.strtab\0.shstrtab\0");

    pad_to(&mut buf, SHT32_OFF as usize);
    shdr32(&mut buf, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0);
    shdr32(&mut buf, 1, 1, 6, 0x804_8100, 0x100, 0x20, 0, 0, 16, 0); // .text
    shdr32(&mut buf, 7, 2, 0, 0, 0x120, 0x20, 3, 1, 4, 16); // .symtab
    shdr32(&mut buf, 15, 3, 0, 0, 0x140, 7, 0, 0, 1, 0); // .strtab
    shdr32(&mut buf, 23, 3, 0, 0, 0x147, 0x21, 0, 0, 1, 0); // .shstrtab
    buf
}

#[test]
fn elf32_unmodified_roundtrip_is_byte_identical() {
    let input = sample_elf32();
    let file = ElfFile::parse(&input).unwrap();
    assert!(!file.is_64());
    let output = file.bytes().unwrap();
    assert_eq!(input, output);
}

#[test]
fn elf32_rel_entry_uses_the_narrow_layout() {
    let input = sample_elf32();
    let mut file = ElfFile::parse(&input).unwrap();
    // No addend: a REL entry, 8 bytes in ELFCLASS32.
    file.add_relocation_for_symbol(".text", "start", 4, 1, None)
        .unwrap();

    let output = file.bytes().unwrap();
    verify_elf_structure(&output);
    let reparsed = ElfFile::parse(&output).unwrap();
    let rel = reparsed.section(".rel.text").expect(".rel.text missing");
    assert_eq!(rel.entsize, 8);
    assert_eq!(rel.size, 8);
    assert_eq!(rel.addralign, 4);
}

#[test]
fn elf32_rejects_wide_values() {
    let input = sample_elf32();
    let mut file = ElfFile::parse(&input).unwrap();
    assert!(matches!(
        file.add_relocation_for_addr(".text", 1 << 32, 1, None),
        Err(Error::OutOfRange(_))
    ));
    assert!(matches!(
        file.add_relocation_for_symbol(".text", "start", 0, 1, Some(i64::from(i32::MAX) + 1)),
        Err(Error::OutOfRange(_))
    ));
    // A 64-bit record cannot go into a 32-bit file.
    assert!(matches!(
        file.add_relocation(".text", RelocEntry::Rel64 { offset: 0, info: 0 }),
        Err(Error::TypeMismatch(_))
    ));
}

#[test]
fn clearing_a_named_reloc_section_keeps_its_header() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    file.remove_relocations_from_reloc_section(".rela.dyn").unwrap();

    let output = file.bytes().unwrap();
    let reparsed = ElfFile::parse(&output).unwrap();
    let rela = reparsed.section(".rela.dyn").unwrap();
    assert_eq!(rela.size, 0);
    assert_eq!(reparsed.dyn_tag(DT_RELASZ), Some(0));
}

#[test]
fn write_creates_a_loadable_copy() {
    let input = sample_elf();
    let mut file = ElfFile::parse(&input).unwrap();
    file.add_relocation_for_addr(".text", 8, R_X86_64_64, Some(4))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patched");
    file.write(&path).unwrap();
    let written = std::fs::read(&path).unwrap();
    assert_eq!(written, file.bytes().unwrap());
    verify_elf_structure(&written);
}
