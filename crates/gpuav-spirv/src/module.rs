use core::fmt;

use crate::error::SpirvError;
use crate::op;

/// The SPIR-V magic number in native (little-endian) word order.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;
/// Number of words in the fixed module header.
pub const SPIRV_HEADER_WORDS: usize = 5;

/// The fixed header of a SPIR-V module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpirvHeader {
    /// Encoded version word (`0x00MMmm00`).
    pub version: u32,
    /// Generator magic number.
    pub generator: u32,
    /// Upper bound (exclusive) of all result ids.
    pub bound: u32,
    /// Reserved schema word.
    pub schema: u32,
}

impl SpirvHeader {
    /// Returns `(major, minor)` decoded from [`SpirvHeader::version`].
    pub fn version_pair(&self) -> (u8, u8) {
        ((self.version >> 16) as u8, (self.version >> 8) as u8)
    }
}

/// A single instruction inside a module.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Instruction<'a> {
    /// Word offset of the instruction's first word from the start of the module.
    pub offset: usize,
    /// The instruction opcode.
    pub opcode: u16,
    /// Operand words (everything after the opcode word).
    pub operands: &'a [u32],
}

impl Instruction<'_> {
    /// Total instruction length in words, including the opcode word.
    pub fn word_count(&self) -> usize {
        self.operands.len() + 1
    }

    /// Returns the operand at `index`, if present.
    pub fn operand(&self, index: usize) -> Option<u32> {
        self.operands.get(index).copied()
    }
}

impl fmt::Debug for Instruction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instruction")
            .field("offset", &self.offset)
            .field("opcode", &self.opcode)
            .field("operand_count", &self.operands.len())
            .finish()
    }
}

/// A `DebugPrintf` extended instruction found in a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugPrintfCall {
    /// Word offset of the `OpExtInst`.
    pub offset: usize,
    /// Result id of the `OpString` holding the format string.
    pub format_string_id: u32,
    /// Number of value operands passed after the format string.
    pub argument_count: usize,
}

/// A validated SPIR-V module.
///
/// [`SpirvModule::parse`] walks the whole instruction stream once, so every later lookup can
/// iterate without re-checking bounds.
#[derive(Clone)]
pub struct SpirvModule<'a> {
    words: &'a [u32],
    header: SpirvHeader,
}

impl<'a> SpirvModule<'a> {
    /// Parses and validates a module.
    ///
    /// The input is treated as **untrusted**: every instruction length is checked against the
    /// module length and the function never panics on malformed data.
    pub fn parse(words: &'a [u32]) -> Result<SpirvModule<'a>, SpirvError> {
        if words.len() < SPIRV_HEADER_WORDS {
            return Err(SpirvError::Truncated(words.len()));
        }
        if words[0] != SPIRV_MAGIC {
            return Err(SpirvError::BadMagic(words[0]));
        }

        let header = SpirvHeader {
            version: words[1],
            generator: words[2],
            bound: words[3],
            schema: words[4],
        };
        if header.bound == 0 {
            return Err(SpirvError::ZeroBound);
        }

        let mut offset = SPIRV_HEADER_WORDS;
        while offset < words.len() {
            let word_count = (words[offset] >> 16) as usize;
            if word_count == 0 {
                return Err(SpirvError::ZeroWordCount { offset });
            }
            let end = offset + word_count;
            if end > words.len() {
                return Err(SpirvError::InstructionOverrun {
                    offset,
                    word_count,
                    len: words.len(),
                });
            }
            offset = end;
        }

        Ok(SpirvModule { words, header })
    }

    /// Returns the parsed header.
    pub fn header(&self) -> &SpirvHeader {
        &self.header
    }

    /// Returns the raw module words.
    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    /// Iterates over all instructions in module order.
    pub fn instructions(&self) -> Instructions<'a> {
        Instructions {
            words: self.words,
            offset: SPIRV_HEADER_WORDS,
        }
    }

    /// Returns the literal of the `OpString` whose result id is `id`.
    pub fn string(&self, id: u32) -> Option<String> {
        self.instructions()
            .filter(|inst| inst.opcode == op::STRING && inst.operand(0) == Some(id))
            .find_map(|inst| decode_literal_string(&inst.operands[1..]).ok())
            .map(|(s, _)| s)
    }

    /// Iterates over `(result id, name)` for every `OpExtInstImport`.
    pub fn ext_inst_imports(&self) -> impl Iterator<Item = (u32, String)> + 'a {
        self.instructions()
            .filter(|inst| inst.opcode == op::EXT_INST_IMPORT && !inst.operands.is_empty())
            .filter_map(|inst| {
                let (name, _) = decode_literal_string(&inst.operands[1..]).ok()?;
                Some((inst.operands[0], name))
            })
    }

    /// Returns the result id of the extended instruction set imported as `name`.
    pub fn ext_inst_import_id(&self, name: &str) -> Option<u32> {
        self.ext_inst_imports()
            .find(|(_, import)| import == name)
            .map(|(id, _)| id)
    }

    /// Whether the module imports `NonSemantic.DebugPrintf`.
    pub fn imports_debug_printf(&self) -> bool {
        self.ext_inst_import_id(op::DEBUG_PRINTF_IMPORT).is_some()
    }

    /// Lists every `DebugPrintf` call site in module order.
    pub fn debug_printf_calls(&self) -> Vec<DebugPrintfCall> {
        let Some(set) = self.ext_inst_import_id(op::DEBUG_PRINTF_IMPORT) else {
            return Vec::new();
        };
        self.instructions()
            .filter_map(|inst| {
                let ext = ExtInst::from_instruction(&inst)?;
                if ext.set != set || ext.instruction != op::DEBUG_PRINTF {
                    return None;
                }
                let (&format_string_id, args) = ext.operands.split_first()?;
                Some(DebugPrintfCall {
                    offset: inst.offset,
                    format_string_id,
                    argument_count: args.len(),
                })
            })
            .collect()
    }

    /// Returns the first value word of the `OpConstant` whose result id is `id`.
    pub fn constant_u32(&self, id: u32) -> Option<u32> {
        self.instructions()
            .filter(|inst| inst.opcode == op::CONSTANT && inst.operand(1) == Some(id))
            .find_map(|inst| inst.operand(2))
    }
}

impl fmt::Debug for SpirvModule<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpirvModule")
            .field("header", &self.header)
            .field("len_words", &self.words.len())
            .finish()
    }
}

/// Iterator over the instructions of a validated module.
#[derive(Debug, Clone)]
pub struct Instructions<'a> {
    words: &'a [u32],
    offset: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = *self.words.get(self.offset)?;
        let word_count = (first >> 16) as usize;
        let end = self.offset.checked_add(word_count)?;
        if word_count == 0 || end > self.words.len() {
            // Unreachable for parsed modules; stop instead of looping.
            self.offset = self.words.len();
            return None;
        }
        let inst = Instruction {
            offset: self.offset,
            opcode: (first & 0xFFFF) as u16,
            operands: &self.words[self.offset + 1..end],
        };
        self.offset = end;
        Some(inst)
    }
}

/// Operands of an `OpExtInst`, split into their fixed fields.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtInst<'a> {
    pub result_id: u32,
    pub set: u32,
    pub instruction: u32,
    pub operands: &'a [u32],
}

impl<'a> ExtInst<'a> {
    pub(crate) fn from_instruction(inst: &Instruction<'a>) -> Option<Self> {
        if inst.opcode != op::EXT_INST || inst.operands.len() < 4 {
            return None;
        }
        Some(Self {
            result_id: inst.operands[1],
            set: inst.operands[2],
            instruction: inst.operands[3],
            operands: &inst.operands[4..],
        })
    }
}

/// Decodes a nul-terminated literal string packed little-endian into words.
///
/// Returns the string and the number of words it occupied (including the word holding the
/// terminator). Invalid UTF-8 is replaced rather than rejected since the result is only used
/// for diagnostics.
pub fn decode_literal_string(words: &[u32]) -> Result<(String, usize), SpirvError> {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return Ok((String::from_utf8_lossy(&bytes).into_owned(), i + 1));
            }
            bytes.push(byte);
        }
    }
    Err(SpirvError::UnterminatedString)
}

/// Converts little-endian bytes into words.
pub fn words_from_le_bytes(bytes: &[u8]) -> Result<Vec<u32>, SpirvError> {
    if bytes.len() % 4 != 0 {
        return Err(SpirvError::UnalignedLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
