use thiserror::Error;

/// Errors produced while reading a SPIR-V module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpirvError {
    /// The module is shorter than the fixed 5-word header.
    #[error("module has {0} words, need at least 5 for the header")]
    Truncated(usize),
    /// The first word is not the SPIR-V magic number.
    #[error("bad magic {0:#010x}, expected 0x07230203")]
    BadMagic(u32),
    /// The byte length of a module passed as bytes is not a multiple of 4.
    #[error("byte length {0} is not a multiple of 4")]
    UnalignedLength(usize),
    /// The header declares an id bound of zero.
    #[error("id bound must be non-zero")]
    ZeroBound,
    /// An instruction declares a word count of zero.
    #[error("instruction at word {offset} has a zero word count")]
    ZeroWordCount {
        /// Word offset of the offending instruction.
        offset: usize,
    },
    /// An instruction extends past the end of the module.
    #[error("instruction at word {offset} ({word_count} words) overruns module of {len} words")]
    InstructionOverrun {
        /// Word offset of the offending instruction.
        offset: usize,
        /// Declared instruction length in words.
        word_count: usize,
        /// Total module length in words.
        len: usize,
    },
    /// A literal string operand has no terminating nul within its words.
    #[error("unterminated literal string")]
    UnterminatedString,
}
