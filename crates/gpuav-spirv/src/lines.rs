use std::collections::HashMap;

use crate::module::{decode_literal_string, ExtInst, SpirvModule};
use crate::op;

/// A source position recovered from line directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Result id of the `OpString` naming the file.
    pub file_id: u32,
    /// The file name, when the `OpString` is present.
    pub file_name: Option<String>,
    /// 1-based line number.
    pub line: u32,
    /// Column number (0 when not recorded).
    pub column: u32,
}

impl SpirvModule<'_> {
    /// Returns the location of the nearest line directive at or before word `position`.
    ///
    /// Honors `OpLine`, `OpNoLine` and function ends, as well as `DebugLine`/`DebugNoLine` from
    /// `NonSemantic.Shader.DebugInfo.100` (whose line numbers are `OpConstant` ids).
    pub fn line_at(&self, position: usize) -> Option<SourceLocation> {
        let debug_info_set = self.ext_inst_import_id(op::SHADER_DEBUG_INFO_IMPORT);

        let mut constants: HashMap<u32, u32> = HashMap::new();
        // DebugSource result id -> OpString id of its file name.
        let mut debug_sources: HashMap<u32, u32> = HashMap::new();
        let mut current: Option<(u32, u32, u32)> = None;

        for inst in self.instructions() {
            if inst.offset > position {
                break;
            }
            match inst.opcode {
                op::CONSTANT => {
                    if let (Some(id), Some(value)) = (inst.operand(1), inst.operand(2)) {
                        constants.insert(id, value);
                    }
                }
                op::LINE => {
                    if let [file, line, column, ..] = *inst.operands {
                        current = Some((file, line, column));
                    }
                }
                op::NO_LINE | op::FUNCTION_END => current = None,
                op::EXT_INST => {
                    let Some(ext) = ExtInst::from_instruction(&inst) else {
                        continue;
                    };
                    if Some(ext.set) != debug_info_set {
                        continue;
                    }
                    match ext.instruction {
                        op::DEBUG_SOURCE => {
                            if let Some(&file) = ext.operands.first() {
                                debug_sources.insert(ext.result_id, file);
                            }
                        }
                        op::DEBUG_LINE => {
                            // Source, LineStart, LineEnd, ColumnStart, ColumnEnd
                            if let [source, line_start, _, column_start, ..] = *ext.operands {
                                let file = debug_sources.get(&source).copied();
                                let line = constants.get(&line_start).copied();
                                if let (Some(file), Some(line)) = (file, line) {
                                    let column =
                                        constants.get(&column_start).copied().unwrap_or(0);
                                    current = Some((file, line, column));
                                }
                            }
                        }
                        op::DEBUG_NO_LINE => current = None,
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let (file_id, line, column) = current?;
        Some(SourceLocation {
            file_id,
            file_name: self.string(file_id),
            line,
            column,
        })
    }

    /// Returns the embedded source text for the file named by `file_id`.
    ///
    /// Looks at `OpSource` (followed by any `OpSourceContinued`) first, then at `DebugSource`
    /// (followed by any `DebugSourceContinued`).
    pub fn source_text(&self, file_id: u32) -> Option<String> {
        let mut text: Option<String> = None;
        let mut collecting = false;
        for inst in self.instructions() {
            match inst.opcode {
                op::SOURCE => {
                    collecting = false;
                    if text.is_none() && inst.operand(2) == Some(file_id) && inst.operands.len() > 3
                    {
                        if let Ok((s, _)) = decode_literal_string(&inst.operands[3..]) {
                            text = Some(s);
                            collecting = true;
                        }
                    }
                }
                op::SOURCE_CONTINUED if collecting => {
                    if let (Some(t), Ok((s, _))) =
                        (text.as_mut(), decode_literal_string(inst.operands))
                    {
                        t.push_str(&s);
                    }
                }
                _ => collecting = false,
            }
        }
        if text.is_some() {
            return text;
        }

        let debug_info_set = self.ext_inst_import_id(op::SHADER_DEBUG_INFO_IMPORT)?;
        let mut collecting = false;
        for inst in self.instructions() {
            let Some(ext) = ExtInst::from_instruction(&inst).filter(|e| e.set == debug_info_set)
            else {
                collecting = false;
                continue;
            };
            match ext.instruction {
                op::DEBUG_SOURCE => {
                    collecting = false;
                    if text.is_none() && ext.operands.first() == Some(&file_id) {
                        if let Some(s) = ext.operands.get(1).and_then(|&id| self.string(id)) {
                            text = Some(s);
                            collecting = true;
                        }
                    }
                }
                op::DEBUG_SOURCE_CONTINUED if collecting => {
                    let more = ext.operands.first().and_then(|&id| self.string(id));
                    if let (Some(t), Some(more)) = (text.as_mut(), more) {
                        t.push_str(&more);
                    }
                }
                _ => collecting = false,
            }
        }
        text
    }

    /// Returns the text of 1-based `line` in the embedded source for `file_id`.
    pub fn source_line(&self, file_id: u32, line: u32) -> Option<String> {
        let index = usize::try_from(line.checked_sub(1)?).ok()?;
        let text = self.source_text(file_id)?;
        text.lines().nth(index).map(str::to_owned)
    }
}
