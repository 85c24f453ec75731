//! Error types shared by all format modules.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type returned by parse, edit, and serialize operations.
///
/// Edit verbs are all-or-nothing: when one returns an error the in-memory
/// model is unchanged. `InternalOverlap` indicates a relayout bug rather
/// than bad input.
#[derive(Debug, Error)]
pub enum Error {
    /// The input bytes could not be parsed as the expected format.
    #[error("parse error: {0}")]
    Parse(#[from] goblin::error::Error),

    /// The file is structurally inconsistent in a way parsing alone
    /// cannot express (truncated table, dangling index, missing header).
    #[error("malformed file: {0}")]
    Malformed(String),

    /// An edit verb referenced a section name that does not exist.
    #[error("section {0:?} not found")]
    SectionNotFound(String),

    /// An edit verb referenced a symbol name that does not exist.
    #[error("symbol {0:?} not found")]
    SymbolNotFound(String),

    /// A relocation entry's width or kind disagrees with the section it
    /// is being written into.
    #[error("relocation type mismatch: {0}")]
    TypeMismatch(String),

    /// A numeric argument does not fit the on-disk field it encodes into.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// Relayout could not find space for grown relocation data without
    /// corrupting another region.
    #[error("no room to grow relocation data")]
    NoRoomToGrow,

    /// The regenerated dyld info streams do not fit between the last
    /// section and the first linkedit table.
    #[error("not enough room for dyld info")]
    NoRoomForDyldInfo,

    /// The serializer found two regions claiming the same file range.
    #[error("internal overlap while serializing: {0}")]
    InternalOverlap(String),

    /// A fixed-width encode or decode failed.
    #[error(transparent)]
    Encode(#[from] scroll::Error),

    /// Writing the output file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
