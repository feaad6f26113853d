use crate::module::{SPIRV_HEADER_WORDS, SPIRV_MAGIC};
use crate::op;

/// Packs `s` as a nul-terminated literal string.
pub fn encode_string(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Incrementally builds a structurally valid SPIR-V module.
///
/// Only the instructions the reader cares about are modelled; the result is not a module a
/// driver would accept, but it parses and carries realistic debug information.
#[derive(Debug, Clone)]
pub struct ModuleBuilder {
    words: Vec<u32>,
    next_id: u32,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    /// Starts a module with a SPIR-V 1.3 header.
    pub fn new() -> Self {
        let mut words = vec![0u32; SPIRV_HEADER_WORDS];
        words[0] = SPIRV_MAGIC;
        words[1] = 0x0001_0300;
        words[2] = 0;
        words[3] = 1;
        words[4] = 0;
        Self { words, next_id: 1 }
    }

    /// Allocates a fresh result id.
    pub fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Word offset the next instruction will be written at.
    pub fn offset(&self) -> usize {
        self.words.len()
    }

    /// Appends a raw instruction and returns its word offset.
    pub fn raw(&mut self, opcode: u16, operands: &[u32]) -> usize {
        let offset = self.words.len();
        let word_count = (operands.len() + 1) as u32;
        self.words.push((word_count << 16) | u32::from(opcode));
        self.words.extend_from_slice(operands);
        offset
    }

    /// `OpCapability Shader`.
    pub fn capability_shader(&mut self) -> usize {
        self.raw(op::CAPABILITY, &[1])
    }

    /// `OpExtInstImport` returning the import id.
    pub fn ext_inst_import(&mut self, name: &str) -> u32 {
        let id = self.id();
        let mut operands = vec![id];
        operands.extend(encode_string(name));
        self.raw(op::EXT_INST_IMPORT, &operands);
        id
    }

    /// `OpString` returning the string id.
    pub fn string(&mut self, s: &str) -> u32 {
        let id = self.id();
        let mut operands = vec![id];
        operands.extend(encode_string(s));
        self.raw(op::STRING, &operands);
        id
    }

    /// `OpSource` for GLSL 450 with an optional file and source text.
    pub fn source(&mut self, file: Option<u32>, text: Option<&str>) -> usize {
        let mut operands = vec![2, 450];
        if let Some(file) = file {
            operands.push(file);
            if let Some(text) = text {
                operands.extend(encode_string(text));
            }
        }
        self.raw(op::SOURCE, &operands)
    }

    /// `OpSourceContinued`.
    pub fn source_continued(&mut self, text: &str) -> usize {
        self.raw(op::SOURCE_CONTINUED, &encode_string(text))
    }

    /// `OpTypeVoid` returning the type id.
    pub fn type_void(&mut self) -> u32 {
        let id = self.id();
        self.raw(op::TYPE_VOID, &[id]);
        id
    }

    /// `OpTypeInt 32 0` returning the type id.
    pub fn type_uint(&mut self) -> u32 {
        let id = self.id();
        self.raw(op::TYPE_INT, &[id, 32, 0]);
        id
    }

    /// `OpConstant` returning the constant id.
    pub fn constant_u32(&mut self, ty: u32, value: u32) -> u32 {
        let id = self.id();
        self.raw(op::CONSTANT, &[ty, id, value]);
        id
    }

    /// `OpFunction` with the given return type; returns the function id.
    pub fn function(&mut self, return_type: u32) -> u32 {
        let id = self.id();
        // Function type id is not modelled; reuse the return type.
        self.raw(op::FUNCTION, &[return_type, id, 0, return_type]);
        let label = self.id();
        self.raw(op::LABEL, &[label]);
        id
    }

    /// `OpReturn` + `OpFunctionEnd`.
    pub fn function_end(&mut self) {
        self.raw(op::RETURN, &[]);
        self.raw(op::FUNCTION_END, &[]);
    }

    /// `OpLine`.
    pub fn line(&mut self, file: u32, line: u32, column: u32) -> usize {
        self.raw(op::LINE, &[file, line, column])
    }

    /// `OpNoLine`.
    pub fn no_line(&mut self) -> usize {
        self.raw(op::NO_LINE, &[])
    }

    /// `OpExtInst` returning `(word offset, result id)`.
    pub fn ext_inst(
        &mut self,
        result_type: u32,
        set: u32,
        instruction: u32,
        operands: &[u32],
    ) -> (usize, u32) {
        let id = self.id();
        let mut all = vec![result_type, id, set, instruction];
        all.extend_from_slice(operands);
        (self.raw(op::EXT_INST, &all), id)
    }

    /// A `DebugPrintf` call; returns its word offset.
    pub fn debug_printf(
        &mut self,
        void_type: u32,
        printf_set: u32,
        format_string: u32,
        args: &[u32],
    ) -> usize {
        let mut operands = vec![format_string];
        operands.extend_from_slice(args);
        self.ext_inst(void_type, printf_set, op::DEBUG_PRINTF, &operands)
            .0
    }

    /// Finishes the module, patching the id bound.
    pub fn finish(mut self) -> Vec<u32> {
        self.words[3] = self.next_id;
        self.words
    }
}

/// A small fragment shader calling `DebugPrintf` once.
///
/// Returns the module words, the word offset of the printf call, and the format string id.
pub fn printf_module(format: &str, source: &str, line: u32) -> (Vec<u32>, usize, u32) {
    let mut b = ModuleBuilder::new();
    b.capability_shader();
    let printf = b.ext_inst_import(op::DEBUG_PRINTF_IMPORT);
    let file = b.string("shader.frag");
    let fmt = b.string(format);
    b.source(Some(file), Some(source));
    let void = b.type_void();
    b.function(void);
    b.line(file, line, 5);
    let offset = b.debug_printf(void, printf, fmt, &[]);
    b.function_end();
    (b.finish(), offset, fmt)
}
