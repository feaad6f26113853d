//! Decoding output buffers into printf messages.
//!
//! Buffer layout, in 32-bit words:
//!
//! ```text
//! [0]      number of words written after this one
//! [1..]    records, back to back:
//!          size, shader id, instruction position, stage, stage word 0..=2,
//!          format string id, values...
//! ```
//!
//! `size` counts the whole record including itself. A size smaller than the header ends the walk.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use gpuav_spirv::{ExecutionModel, SpirvModule};
use tracing::warn;

use crate::format::{self, FormatSubstring, ValueCursor, RENDER_BUFFER_CAPACITY};
use crate::pipeline::PipelineKind;
use crate::registry::{ShaderId, ShaderRecord, ShaderRegistry};
use crate::report::DebugPrintfMessage;

/// Words before the values of a record.
pub const RECORD_HEADER_WORDS: usize = 8;

/// A record header as written by an instrumented shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRecordHeader {
    pub size: u32,
    pub shader_id: ShaderId,
    /// Word offset of the `DebugPrintf` instruction in the original module.
    pub instruction_position: u32,
    pub stage: u32,
    pub stage_words: [u32; 3],
    pub format_string_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputRecord<'a> {
    pub header: OutputRecordHeader,
    pub values: &'a [u32],
}

impl<'a> OutputRecord<'a> {
    /// Splits a record; `words` must hold at least [`RECORD_HEADER_WORDS`] words.
    fn from_words(words: &'a [u32]) -> Option<Self> {
        if words.len() < RECORD_HEADER_WORDS {
            return None;
        }
        let (header, values) = words.split_at(RECORD_HEADER_WORDS);
        Some(Self {
            header: OutputRecordHeader {
                size: header[0],
                shader_id: ShaderId(header[1]),
                instruction_position: header[2],
                stage: header[3],
                stage_words: [header[4], header[5], header[6]],
                format_string_id: header[7],
            },
            values,
        })
    }
}

/// The records of one buffer and how far the walk got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordWalk<'a> {
    pub records: Vec<OutputRecord<'a>>,
    /// Value of word 0.
    pub expected_words: u32,
    /// Words covered by complete records.
    pub consumed_words: u32,
    /// Words (from the start of the buffer) that must be zeroed for reuse.
    pub clear_words: usize,
}

impl RecordWalk<'_> {
    /// The shader reported more output than fits in the buffer.
    pub fn is_truncated(&self) -> bool {
        self.consumed_words != self.expected_words
    }
}

/// Walks the records of `words` without interpreting them.
pub fn walk_records(words: &[u32]) -> RecordWalk<'_> {
    let expected_words = words.first().copied().unwrap_or(0);
    let limit = (expected_words as usize)
        .saturating_add(1)
        .min(words.len());

    let mut records = Vec::new();
    let mut index = 1;
    while index < limit {
        let size = words[index] as usize;
        if size < RECORD_HEADER_WORDS || size > limit - index {
            break;
        }
        if let Some(record) = OutputRecord::from_words(&words[index..index + size]) {
            records.push(record);
        }
        index += size;
    }

    RecordWalk {
        records,
        expected_words,
        consumed_words: index.saturating_sub(1) as u32,
        clear_words: if expected_words == 0 { 0 } else { limit },
    }
}

/// Where a buffer came from; used for verbose messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordContext {
    pub queue: vk::Queue,
    pub command_buffer: vk::CommandBuffer,
    pub pipeline: vk::Pipeline,
    pub kind: PipelineKind,
    pub operation_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeReport {
    pub messages: Vec<DebugPrintfMessage>,
    pub expected_words: u32,
    pub consumed_words: u32,
    pub truncated: bool,
    /// Records naming a shader id the registry no longer knows.
    pub unknown_shaders: usize,
    /// Leading words zeroed for reuse.
    pub cleared_words: usize,
}

/// Turns records into messages using the registry's original bytecode.
pub struct OutputDecoder {
    registry: Arc<ShaderRegistry>,
    verbose: bool,
    formats: Mutex<HashMap<(ShaderId, u32), Arc<[FormatSubstring]>>>,
}

impl OutputDecoder {
    pub fn new(registry: Arc<ShaderRegistry>, verbose: bool) -> Self {
        Self {
            registry,
            verbose,
            formats: Mutex::new(HashMap::new()),
        }
    }

    /// Decodes `words` and zeroes the consumed prefix so the buffer can be reused.
    pub fn decode(&self, words: &mut [u32], context: &RecordContext) -> DecodeReport {
        let walk = walk_records(words);
        let clear_words = walk.clear_words;
        let mut report = DecodeReport {
            expected_words: walk.expected_words,
            consumed_words: walk.consumed_words,
            truncated: walk.is_truncated(),
            cleared_words: clear_words,
            ..Default::default()
        };

        for record in walk.records {
            match self.registry.get(record.header.shader_id) {
                Some(shader) => {
                    if let Some(message) = self.message(&shader, &record, context) {
                        report.messages.push(message);
                    }
                }
                None => {
                    warn!(
                        shader_id = %record.header.shader_id,
                        "debug printf record for unknown shader"
                    );
                    report.unknown_shaders += 1;
                }
            }
        }

        words[..clear_words].fill(0);
        report
    }

    /// [`OutputDecoder::decode`] over host-endian bytes, as read back from device memory.
    pub fn decode_bytes(&self, bytes: &mut [u8], context: &RecordContext) -> DecodeReport {
        let usable = bytes.len() / 4 * 4;
        let mut words: Vec<u32> = bytes[..usable]
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let report = self.decode(&mut words, context);
        bytes[..usable].copy_from_slice(bytemuck::cast_slice(&words[..]));
        report
    }

    /// Drops cached format strings of shaders the registry no longer knows.
    pub fn evict(&self, shader_ids: &[ShaderId]) {
        if shader_ids.is_empty() {
            return;
        }
        self.formats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(shader_id, _), _| !shader_ids.contains(shader_id));
    }

    /// Number of cached (shader, format string) entries.
    pub fn cached_formats(&self) -> usize {
        self.formats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn clear_cache(&self) {
        self.formats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn substrings(
        &self,
        shader_id: ShaderId,
        format_string_id: u32,
        module: &SpirvModule<'_>,
    ) -> Arc<[FormatSubstring]> {
        let mut formats = self.formats.lock().unwrap_or_else(PoisonError::into_inner);
        formats
            .entry((shader_id, format_string_id))
            .or_insert_with(|| {
                let format_string = module.string(format_string_id).unwrap_or_default();
                format::parse(&format_string).into()
            })
            .clone()
    }

    fn message(
        &self,
        shader: &ShaderRecord,
        record: &OutputRecord<'_>,
        context: &RecordContext,
    ) -> Option<DebugPrintfMessage> {
        let header = &record.header;
        let module = match SpirvModule::parse(&shader.original_bytecode) {
            Ok(module) => module,
            Err(err) => {
                warn!(shader_id = %header.shader_id, %err, "registered bytecode no longer parses");
                return None;
            }
        };

        let substrings = self.substrings(header.shader_id, header.format_string_id, &module);
        let mut printf = String::with_capacity(RENDER_BUFFER_CAPACITY);
        let mut values = ValueCursor::new(record.values);
        for substring in substrings.iter() {
            if let Err(err) = substring.render_into(&mut values, &mut printf) {
                warn!(shader_id = %header.shader_id, %err, "debug printf record is short");
                break;
            }
        }

        let stage = ExecutionModel::from_u32(header.stage);
        let location = module.line_at(header.instruction_position as usize);

        let text = if self.verbose {
            let mut text = String::new();
            let _ = write!(
                text,
                "Command buffer (0x{:x}). {} {}. Pipeline (0x{:x}). Shader Module (0x{:x}). \
                 Shader ID = {}. Shader Instruction Index = {}. {}",
                vk::Handle::as_raw(context.command_buffer),
                context.kind.operation_label(),
                context.operation_index,
                vk::Handle::as_raw(context.pipeline),
                vk::Handle::as_raw(shader.module),
                header.shader_id,
                header.instruction_position,
                stage_message(header.stage, header.stage_words),
            );
            if let Some(location) = &location {
                let file = location.file_name.as_deref().unwrap_or("<unknown>");
                let _ = write!(text, " Source: {file}:{}.", location.line);
                if let Some(line) = module.source_line(location.file_id, location.line) {
                    let _ = write!(text, "\n{}: {}", location.line, line.trim_end());
                }
            }
            let _ = write!(text, "\n{printf}");
            text
        } else {
            printf.clone()
        };

        Some(DebugPrintfMessage {
            queue: context.queue,
            command_buffer: context.command_buffer,
            shader_id: header.shader_id,
            stage,
            location,
            printf,
            text,
        })
    }
}

impl std::fmt::Debug for OutputDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputDecoder")
            .field("verbose", &self.verbose)
            .finish_non_exhaustive()
    }
}

/// Describes which invocation wrote a record.
pub fn stage_message(stage: u32, words: [u32; 3]) -> String {
    let [a, b, c] = words;
    let Some(model) = ExecutionModel::from_u32(stage) else {
        return format!("Stage = {stage}.");
    };
    let name = model.name();
    match model {
        ExecutionModel::Vertex => {
            format!("Stage = {name}. Vertex Index = {a} Instance Index = {b}.")
        }
        ExecutionModel::TessellationControl => {
            format!("Stage = {name}. Invocation ID = {a}, Primitive ID = {b}.")
        }
        ExecutionModel::TessellationEvaluation => format!(
            "Stage = {name}. Primitive ID = {a}, TessCoord (u, v) = ({:.6}, {:.6}).",
            f32::from_bits(b),
            f32::from_bits(c)
        ),
        ExecutionModel::Geometry => {
            format!("Stage = {name}. Primitive ID = {a} Invocation ID = {b}.")
        }
        ExecutionModel::Fragment => format!(
            "Stage = {name}. Fragment coord (x,y) = ({:.6}, {:.6}).",
            f32::from_bits(a),
            f32::from_bits(b)
        ),
        ExecutionModel::GlCompute
        | ExecutionModel::Kernel
        | ExecutionModel::TaskNv
        | ExecutionModel::MeshNv
        | ExecutionModel::TaskExt
        | ExecutionModel::MeshExt => {
            format!("Stage = {name}. Global invocation ID (x, y, z) = ({a}, {b}, {c}).")
        }
        ExecutionModel::RayGeneration
        | ExecutionModel::Intersection
        | ExecutionModel::AnyHit
        | ExecutionModel::ClosestHit
        | ExecutionModel::Miss
        | ExecutionModel::Callable => {
            format!("Stage = {name}. Launch ID (x, y, z) = ({a}, {b}, {c}).")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::OutputBufferBuilder;
    use ash::vk::Handle;
    use gpuav_spirv::test_utils::printf_module;
    use pretty_assertions::assert_eq;

    fn context() -> RecordContext {
        RecordContext {
            queue: vk::Queue::from_raw(0x1),
            command_buffer: vk::CommandBuffer::from_raw(0xcb),
            pipeline: vk::Pipeline::from_raw(0x99),
            kind: PipelineKind::Graphics,
            operation_index: 2,
        }
    }

    fn registry_with(format: &str) -> (Arc<ShaderRegistry>, ShaderId, u32, usize) {
        let (words, offset, fmt) = printf_module(format, "void main() {\n  printf();\n}\n", 2);
        let registry = Arc::new(ShaderRegistry::new());
        let id = registry.allocate_id();
        registry.register(id, Arc::from(words));
        (registry, id, fmt, offset)
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        let (registry, ..) = registry_with("x");
        let decoder = OutputDecoder::new(registry, false);
        let mut words = vec![0u32; 16];
        let report = decoder.decode(&mut words, &context());
        assert!(report.messages.is_empty());
        assert!(!report.truncated);
        assert_eq!(words, vec![0u32; 16]);
    }

    #[test]
    fn decodes_each_record_in_order() {
        let (registry, id, fmt, offset) = registry_with("value = %u");
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[1]);
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[2]);
        let mut words = buffer.finish(64);

        let report = decoder.decode(&mut words, &context());
        let texts: Vec<_> = report.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["value = 1", "value = 2"]);
        assert!(!report.truncated);
        assert_eq!(report.consumed_words, 18);
        assert!(words.iter().all(|&w| w == 0));
    }

    #[test]
    fn sixty_four_bit_values_take_two_words() {
        let (registry, id, fmt, offset) = registry_with("%lu %u");
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(id, offset as u32, 5, [0; 3], fmt, &[0x1, 0x0, 7]);
        let mut words = buffer.finish(32);

        let report = decoder.decode(&mut words, &context());
        assert_eq!(report.messages[0].printf, "4294967296 7");
    }

    #[test]
    fn overflowing_buffer_is_flagged_as_truncated() {
        let (registry, id, fmt, offset) = registry_with("%u");
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[1]);
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[2]);
        // Room for the count word and one record; the shader claims two.
        let mut words = buffer.finish(0);
        words.truncate(1 + 9);

        let report = decoder.decode(&mut words, &context());
        assert_eq!(report.messages.len(), 1);
        assert!(report.truncated);
        assert_eq!(report.expected_words, 18);
        assert_eq!(report.consumed_words, 9);
        assert!(words.iter().all(|&w| w == 0));
    }

    #[test]
    fn claimed_count_beyond_buffer_is_truncated_without_records() {
        let (registry, ..) = registry_with("%u");
        let decoder = OutputDecoder::new(registry, false);
        let mut words = vec![0u32; 4];
        words[0] = 1000;
        words[1] = 9;

        let report = decoder.decode(&mut words, &context());
        assert!(report.messages.is_empty());
        assert!(report.truncated);
        assert_eq!(words, vec![0; 4]);
    }

    #[test]
    fn unknown_shader_ids_are_skipped() {
        let (registry, id, fmt, offset) = registry_with("%u");
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(ShaderId(77), offset as u32, 4, [0; 3], fmt, &[1]);
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[2]);
        let mut words = buffer.finish(32);

        let report = decoder.decode(&mut words, &context());
        assert_eq!(report.unknown_shaders, 1);
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].printf, "2");
    }

    #[test]
    fn eviction_drops_only_the_named_shaders() {
        let (registry, id, fmt, offset) = registry_with("%u");
        let (words, other_offset, other_fmt) = printf_module("%d", "", 1);
        let other = registry.allocate_id();
        registry.register(other, Arc::from(words));
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[1]);
        buffer.record(other, other_offset as u32, 4, [0; 3], other_fmt, &[2]);
        let mut words = buffer.finish(32);
        decoder.decode(&mut words, &context());
        assert_eq!(decoder.cached_formats(), 2);

        decoder.evict(&[]);
        assert_eq!(decoder.cached_formats(), 2);
        decoder.evict(&[id]);
        assert_eq!(decoder.cached_formats(), 1);
        decoder.evict(&[other]);
        assert_eq!(decoder.cached_formats(), 0);
    }

    #[test]
    fn short_records_keep_what_was_rendered() {
        let (registry, id, fmt, offset) = registry_with("a=%u b=%u");
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(id, offset as u32, 4, [0; 3], fmt, &[5]);
        let mut words = buffer.finish(32);

        let report = decoder.decode(&mut words, &context());
        assert_eq!(report.messages[0].printf, "a=5 b=");
    }

    #[test]
    fn verbose_messages_carry_context_and_source() {
        let (registry, id, fmt, offset) = registry_with("v = %d");
        let module = ash::vk::ShaderModule::from_raw(0x5a);
        registry.bind_module(id, module);
        let decoder = OutputDecoder::new(registry, true);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(
            id,
            offset as u32,
            4,
            [1.5f32.to_bits(), 2.5f32.to_bits(), 0],
            fmt,
            &[3],
        );
        let mut words = buffer.finish(32);

        let report = decoder.decode(&mut words, &context());
        let message = &report.messages[0];
        assert_eq!(message.stage, Some(ExecutionModel::Fragment));
        assert_eq!(message.location.as_ref().map(|l| l.line), Some(2));
        assert_eq!(
            message.text,
            format!(
                "Command buffer (0xcb). Draw Index 2. Pipeline (0x99). Shader Module (0x5a). \
                 Shader ID = 1. Shader Instruction Index = {offset}. \
                 Stage = Fragment. Fragment coord (x,y) = (1.500000, 2.500000). \
                 Source: shader.frag:2.\n2:   printf();\nv = 3"
            )
        );
    }

    #[test]
    fn byte_buffers_are_zeroed_after_decoding() {
        let (registry, id, fmt, offset) = registry_with("%u");
        let decoder = OutputDecoder::new(registry, false);
        let mut buffer = OutputBufferBuilder::new();
        buffer.record(id, offset as u32, 5, [0; 3], fmt, &[9]);
        let words = buffer.finish(16);
        let mut bytes: Vec<u8> = bytemuck::cast_slice(&words[..]).to_vec();

        let report = decoder.decode_bytes(&mut bytes, &context());
        assert_eq!(report.messages[0].printf, "9");
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn stage_messages() {
        assert_eq!(
            stage_message(0, [3, 1, 0]),
            "Stage = Vertex. Vertex Index = 3 Instance Index = 1."
        );
        assert_eq!(
            stage_message(5, [1, 2, 3]),
            "Stage = Compute. Global invocation ID (x, y, z) = (1, 2, 3)."
        );
        assert_eq!(
            stage_message(5313, [4, 5, 6]),
            "Stage = Ray Generation. Launch ID (x, y, z) = (4, 5, 6)."
        );
        assert_eq!(stage_message(42, [0; 3]), "Stage = 42.");
    }
}
