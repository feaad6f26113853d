//! GPU-assisted debug printf for a Vulkan validation layer.
//!
//! Shader modules that call `debugPrintfEXT` are rewritten at creation time to append
//! structured records to a storage buffer bound at a reserved descriptor-set slot. Each
//! instrumented draw/dispatch/trace gets its own output buffer; after the application submits,
//! the queue is drained and every buffer is decoded back into printf-formatted messages.
//!
//! The crate is organised leaf-first:
//! - [`format`]: printf format-string parsing and rendering against the record's value words.
//! - [`descriptor_pool`]: chunked descriptor pools shared by all output buffers of a device.
//! - [`instrument`] + [`registry`]: the bytecode rewrite hook and the shader-id registry.
//! - [`pipeline`] + [`resources`]: pipeline-layout widening and per-command output buffers.
//! - [`submit`] + [`decode`]: queue-submit interception and record decoding.
//! - [`DebugPrintf`]: the per-device front-end a layer's entry points call into.

mod ash_dispatch;
mod config;
mod context;
mod dispatch;
mod error;
mod layer;
mod report;
mod stats;

pub mod decode;
pub mod descriptor_pool;
pub mod format;
pub mod instrument;
pub mod pipeline;
pub mod registry;
pub mod resources;
pub mod submit;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;


pub use ash::vk;

pub use ash_dispatch::AshDispatch;
pub use config::{
    DebugPrintfConfig, BUFFER_SIZE_ENV, DEFAULT_BUFFER_SIZE, DEFAULT_DESCRIPTOR_CHUNK_SIZE,
    TO_STDOUT_ENV, VERBOSE_ENV,
};
pub use context::DeviceContext;
pub use dispatch::{DescriptorBinding, DeviceDispatch};
pub use error::{FormatError, InstrumentationError, ResourceError, SetupError};
pub use layer::{
    DebugPrintf, DeviceCapabilities, PipelineCreatePlan, PipelineLayoutPlan, ShaderModulePlan,
};
pub use report::{
    DebugPrintfMessage, Diagnostic, DiagnosticKind, MessageSink, Reporter, Severity, TracingSink,
};
pub use stats::{DebugPrintfStats, DebugPrintfStatsSnapshot};
