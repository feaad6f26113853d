use std::sync::Arc;

use ash::vk;
use gpuav_spirv::{ExecutionModel, SourceLocation};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::registry::ShaderId;

/// Message id attached to everything debug printf reports.
pub const DEBUG_PRINTF_MESSAGE_ID: &str = "UNASSIGNED-DEBUG-PRINTF";

/// Tracing target used by [`TracingSink`].
pub const TRACING_TARGET: &str = "gpuav::printf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiagnosticKind {
    /// Device or setup problem; debug printf is disabled for the device.
    SetupError,
    /// A shader could not be instrumented and runs unmodified.
    InstrumentationFailure,
    /// Descriptor or memory allocation failed; debug printf is disabled for the device.
    ResourceExhaustion,
    /// An output buffer filled up before every record was written.
    TruncationWarning,
}

impl DiagnosticKind {
    pub fn severity(self) -> Severity {
        match self {
            Self::SetupError | Self::ResourceExhaustion => Severity::Error,
            Self::InstrumentationFailure | Self::TruncationWarning => Severity::Warning,
        }
    }

    /// Whether reporting this kind disables debug printf for the rest of the device's life.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::SetupError | Self::ResourceExhaustion)
    }
}

/// A problem debug printf reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// Raw handle of the object the diagnostic is about, if any.
    pub object: Option<u64>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            object: None,
        }
    }

    pub fn with_object(mut self, handle: impl vk::Handle) -> Self {
        self.object = Some(handle.as_raw());
        self
    }
}

/// One decoded printf record.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugPrintfMessage {
    pub queue: vk::Queue,
    pub command_buffer: vk::CommandBuffer,
    pub shader_id: ShaderId,
    pub stage: Option<ExecutionModel>,
    pub location: Option<SourceLocation>,
    /// The formatted printf output alone.
    pub printf: String,
    /// What gets reported: [`DebugPrintfMessage::printf`], prefixed with context when verbose.
    pub text: String,
}

/// Destination for debug printf output and diagnostics.
pub trait MessageSink: Send + Sync {
    fn printf(&self, message: &DebugPrintfMessage);
    fn diagnostic(&self, diagnostic: &Diagnostic);
}

/// Forwards everything to `tracing` under [`TRACING_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn printf(&self, message: &DebugPrintfMessage) {
        info!(
            target: TRACING_TARGET,
            message_id = DEBUG_PRINTF_MESSAGE_ID,
            shader_id = message.shader_id.0,
            "{}",
            message.text
        );
    }

    fn diagnostic(&self, diagnostic: &Diagnostic) {
        match diagnostic.kind.severity() {
            Severity::Error => error!(
                target: TRACING_TARGET,
                message_id = DEBUG_PRINTF_MESSAGE_ID,
                kind = ?diagnostic.kind,
                object = ?diagnostic.object,
                "{}",
                diagnostic.message
            ),
            Severity::Warning => warn!(
                target: TRACING_TARGET,
                message_id = DEBUG_PRINTF_MESSAGE_ID,
                kind = ?diagnostic.kind,
                object = ?diagnostic.object,
                "{}",
                diagnostic.message
            ),
        }
    }
}

/// Routes printf output either to the sink or to stdout.
#[derive(Clone)]
pub struct Reporter {
    sink: Arc<dyn MessageSink>,
    to_stdout: bool,
}

impl Reporter {
    pub fn new(sink: Arc<dyn MessageSink>, to_stdout: bool) -> Self {
        Self { sink, to_stdout }
    }

    pub fn printf(&self, message: &DebugPrintfMessage) {
        if self.to_stdout {
            println!("Debug printf: {}", message.text);
        } else {
            self.sink.printf(message);
        }
    }

    /// Diagnostics always go to the sink, even when printf output goes to stdout.
    pub fn diagnostic(&self, diagnostic: &Diagnostic) {
        self.sink.diagnostic(diagnostic);
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter")
            .field("to_stdout", &self.to_stdout)
            .finish_non_exhaustive()
    }
}
