//! A safe, zero-copy reader for SPIR-V shader modules.
//!
//! This crate parses **untrusted** SPIR-V word streams (application-provided shader code or
//! bytecode recovered for diagnostics) without panicking or reading out of bounds.
//!
//! In addition to header and instruction-stream validation, it provides the lookups needed to
//! turn a debug printf record back into source-level context:
//!
//! - `OpString` lookup by result id (format strings and file names).
//! - `OpExtInstImport` enumeration, including detection of `NonSemantic.DebugPrintf`.
//! - Line lookup from `OpLine`/`OpNoLine` and `NonSemantic.Shader.DebugInfo.100` line markers.
//! - Embedded source text from `OpSource`/`OpSourceContinued` and `DebugSource`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod error;
mod execution_model;
mod lines;
mod module;
/// SPIR-V opcode and extended-instruction numbers used by this crate.
pub mod op;

/// Helpers for building synthetic SPIR-V modules in tests.
///
/// This module is only available when compiling this crate's own tests, or when the
/// `test-utils` feature is enabled. It is **not** part of the stable parsing API.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;


pub use crate::error::SpirvError;
pub use crate::execution_model::ExecutionModel;
pub use crate::lines::SourceLocation;
pub use crate::module::{
    decode_literal_string, words_from_le_bytes, DebugPrintfCall, Instruction, Instructions,
    SpirvHeader, SpirvModule, SPIRV_HEADER_WORDS, SPIRV_MAGIC,
};
