//! # binedit
//!
//! Round-trip editing for native executable and object files, built on
//! [goblin](https://crates.io/crates/goblin).
//!
//! A file is parsed into a mutable in-memory model, relocation state is
//! edited through small verbs, and the model is serialized back to bytes.
//! An unmodified file serializes back to its original bytes; an edited
//! file has its offsets, addresses, table sizes, directory pointers, and
//! (for Mach-O) dyld opcode streams recomputed so the OS loader still
//! accepts it.
//!
//! ## ELF Example
//!
//! ```no_run
//! use binedit::ElfFile;
//!
//! let data = std::fs::read("binary").unwrap();
//! let mut file = ElfFile::parse(&data).unwrap();
//!
//! // Attach a RELA relocation against a named symbol
//! file.add_relocation_for_symbol(".text", "main", 0, 1, Some(0)).unwrap();
//!
//! let output = file.bytes().unwrap();
//! std::fs::write("binary_modified", output).unwrap();
//! ```
//!
//! ## Mach-O Example
//!
//! ```no_run
//! use binedit::MachoFile;
//!
//! let data = std::fs::read("binary").unwrap();
//! let mut file = MachoFile::parse(&data).unwrap();
//!
//! // Bind a symbol from dylib ordinal 1; the dyld info streams are
//! // regenerated when the file is serialized.
//! file.add_relocation_for_symbol_with_dylib_ordinal("__text", "_printf", 0, 0, 3, false, 1)
//!     .unwrap();
//!
//! let output = file.bytes().unwrap();
//! std::fs::write("binary_modified", output).unwrap();
//! ```
//!
//! ## PE Example
//!
//! ```no_run
//! use binedit::{PeFile, IMAGE_REL_BASED_HIGHLOW};
//!
//! let data = std::fs::read("binary.exe").unwrap();
//! let mut file = PeFile::parse(&data).unwrap();
//!
//! file.add_base_reloc(0x1000, IMAGE_REL_BASED_HIGHLOW).unwrap();
//!
//! let output = file.bytes().unwrap();
//! std::fs::write("binary_modified.exe", output).unwrap();
//! ```

pub mod error;
mod util;

// ELF module (Linux/BSD executables and objects)
#[cfg(feature = "elf")]
pub mod elf;

// Mach-O module (macOS/iOS executables and objects)
#[cfg(feature = "mach")]
pub mod macho;

// PE/COFF module (Windows executables and objects)
#[cfg(feature = "pe")]
pub mod pe;

pub use error::{Error, Result};

#[cfg(feature = "elf")]
pub use elf::{r_info32, r_info64, DynTagValue, ElfFile, ElfSection, ElfSymbol, RelocEntry};

#[cfg(feature = "mach")]
pub use macho::{BindKind, MachReloc, MachSection, MachSymbol, MachoFile};

#[cfg(feature = "pe")]
pub use pe::{
    BaseRelocBlock, BaseRelocItem, CoffReloc, CoffSymbol, PeFile, PeSection,
    IMAGE_REL_BASED_ABSOLUTE, IMAGE_REL_BASED_DIR64, IMAGE_REL_BASED_HIGHLOW,
};
