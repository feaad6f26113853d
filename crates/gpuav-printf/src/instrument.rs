//! Shader module instrumentation.
//!
//! The bytecode rewrite itself (replacing each `DebugPrintf` call with stores into the output
//! buffer) is delegated to a [`ShaderRewriter`]. This module decides whether a module needs it,
//! hands out the shader id, checks the result and records the original bytecode for decoding.

use std::sync::Arc;

use gpuav_spirv::SpirvModule;
use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::InstrumentationError;
use crate::registry::{ShaderId, ShaderRegistry};
use crate::report::{Diagnostic, DiagnosticKind};

/// Binding of the output buffer inside the debug printf descriptor set.
pub const OUTPUT_BUFFER_BINDING: u32 = 3;

/// Inputs to one rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteRequest<'a> {
    pub bytecode: &'a [u32],
    /// Descriptor set index the output buffer will be bound at.
    pub descriptor_set: u32,
    pub binding: u32,
    /// Written into every record the rewritten shader emits.
    pub shader_id: ShaderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMessageLevel {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteMessage {
    pub level: RewriteMessageLevel,
    pub text: String,
}

/// Rewrites `DebugPrintf` calls into output-buffer stores.
///
/// Each record written by the rewritten shader must follow the layout read by
/// [`crate::decode`]: size, shader id, instruction position, stage, three stage words, format
/// string id, then the values (64-bit values high word first).
pub trait ShaderRewriter: Send + Sync {
    /// Returns the rewritten module or a reason it could not be rewritten.
    fn rewrite(
        &self,
        request: &RewriteRequest<'_>,
        messages: &mut dyn FnMut(RewriteMessage),
    ) -> Result<Vec<u32>, String>;
}

/// Result of [`InstrumentationPass::instrument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentOutcome {
    Instrumented {
        shader_id: ShaderId,
        bytecode: Vec<u32>,
    },
    /// The module never calls `DebugPrintf`.
    NotNeeded,
    /// Instrumentation failed; the original module is used unmodified.
    Fallback(InstrumentationError),
}

impl InstrumentOutcome {
    pub fn shader_id(&self) -> Option<ShaderId> {
        match self {
            Self::Instrumented { shader_id, .. } => Some(*shader_id),
            _ => None,
        }
    }

    /// The bytecode the driver should see.
    pub fn bytecode<'a>(&'a self, original: &'a [u32]) -> &'a [u32] {
        match self {
            Self::Instrumented { bytecode, .. } => bytecode,
            _ => original,
        }
    }
}

pub struct InstrumentationPass {
    ctx: Arc<DeviceContext>,
    rewriter: Arc<dyn ShaderRewriter>,
    registry: Arc<ShaderRegistry>,
}

impl InstrumentationPass {
    pub fn new(
        ctx: Arc<DeviceContext>,
        rewriter: Arc<dyn ShaderRewriter>,
        registry: Arc<ShaderRegistry>,
    ) -> Self {
        Self {
            ctx,
            rewriter,
            registry,
        }
    }

    /// Instruments `original` to write to `descriptor_set`/[`OUTPUT_BUFFER_BINDING`].
    ///
    /// Failures are reported and fall back to the original bytecode; they never fail module
    /// creation.
    pub fn instrument(&self, original: &[u32], descriptor_set: u32) -> InstrumentOutcome {
        let module = match SpirvModule::parse(original) {
            Ok(module) => module,
            Err(err) => return self.fall_back(InstrumentationError::InvalidInput(err)),
        };
        if !module.imports_debug_printf() {
            return InstrumentOutcome::NotNeeded;
        }

        let shader_id = self.registry.allocate_id();
        let request = RewriteRequest {
            bytecode: original,
            descriptor_set,
            binding: OUTPUT_BUFFER_BINDING,
            shader_id,
        };

        let mut messages = Vec::new();
        let rewritten = self
            .rewriter
            .rewrite(&request, &mut |message| messages.push(message));
        for message in messages {
            match message.level {
                RewriteMessageLevel::Error | RewriteMessageLevel::Warning => {
                    self.ctx.report(Diagnostic::new(
                        DiagnosticKind::InstrumentationFailure,
                        format!("shader instrumentation: {}", message.text),
                    ));
                }
                RewriteMessageLevel::Info => debug!(%shader_id, "{}", message.text),
            }
        }

        let bytecode = match rewritten {
            Ok(bytecode) => bytecode,
            Err(reason) => return self.fall_back(InstrumentationError::RewriteFailed(reason)),
        };
        if let Err(err) = SpirvModule::parse(&bytecode) {
            return self.fall_back(InstrumentationError::InvalidOutput(err));
        }

        self.registry.register(shader_id, Arc::from(original));
        self.ctx.stats.inc_shaders_instrumented();
        debug!(
            %shader_id,
            calls = module.debug_printf_calls().len(),
            words = bytecode.len(),
            "instrumented shader module"
        );
        InstrumentOutcome::Instrumented {
            shader_id,
            bytecode,
        }
    }

    fn fall_back(&self, err: InstrumentationError) -> InstrumentOutcome {
        warn!(%err, "using uninstrumented shader module");
        self.ctx.stats.inc_instrumentation_failures();
        self.ctx.report(Diagnostic::new(
            DiagnosticKind::InstrumentationFailure,
            format!("debug printf disabled for shader module: {err}"),
        ));
        InstrumentOutcome::Fallback(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_context, MockRewriter, RecordingSink};
    use gpuav_spirv::test_utils::{printf_module, ModuleBuilder};
    use pretty_assertions::assert_eq;

    fn pass(rewriter: MockRewriter) -> (InstrumentationPass, Arc<RecordingSink>, Arc<ShaderRegistry>) {
        let (ctx, _device, sink) = test_context();
        let registry = Arc::new(ShaderRegistry::new());
        (
            InstrumentationPass::new(ctx, Arc::new(rewriter), registry.clone()),
            sink,
            registry,
        )
    }

    #[test]
    fn modules_without_printf_are_left_alone() {
        let (pass, sink, registry) = pass(MockRewriter::appending());
        let mut b = ModuleBuilder::new();
        b.capability_shader();
        let words = b.finish();

        assert_eq!(pass.instrument(&words, 7), InstrumentOutcome::NotNeeded);
        assert!(registry.is_empty());
        assert!(sink.diagnostics().is_empty());
    }

    #[test]
    fn instrumented_modules_are_registered() {
        let rewriter = MockRewriter::appending();
        let requests = rewriter.requests();
        let (pass, _sink, registry) = pass(rewriter);
        let (words, _, _) = printf_module("x = %d", "", 1);

        let outcome = pass.instrument(&words, 7);
        let shader_id = outcome.shader_id().unwrap();
        assert_eq!(shader_id, ShaderId(1));
        assert_eq!(outcome.bytecode(&words).len(), words.len() + 1);

        let record = registry.get(shader_id).unwrap();
        assert_eq!(&record.original_bytecode[..], &words[..]);
        assert_eq!(
            requests.lock().unwrap().as_slice(),
            &[(7, OUTPUT_BUFFER_BINDING, shader_id)]
        );
    }

    #[test]
    fn rewrite_failure_falls_back_with_a_diagnostic() {
        let (pass, sink, registry) = pass(MockRewriter::failing("unsupported opcode"));
        let (words, _, _) = printf_module("x", "", 1);

        let outcome = pass.instrument(&words, 7);
        assert_eq!(
            outcome,
            InstrumentOutcome::Fallback(InstrumentationError::RewriteFailed(
                "unsupported opcode".into()
            ))
        );
        assert_eq!(outcome.bytecode(&words), &words[..]);
        assert!(registry.is_empty());

        let diagnostics = sink.diagnostics();
        // One for the rewriter's own error message, one for the fallback.
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics
            .iter()
            .all(|d| d.kind == DiagnosticKind::InstrumentationFailure));
    }

    #[test]
    fn invalid_rewrite_output_falls_back() {
        let (pass, _sink, registry) = pass(MockRewriter::corrupting());
        let (words, _, _) = printf_module("x", "", 1);

        assert!(matches!(
            pass.instrument(&words, 7),
            InstrumentOutcome::Fallback(InstrumentationError::InvalidOutput(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn invalid_input_falls_back() {
        let (pass, sink, _registry) = pass(MockRewriter::appending());
        assert!(matches!(
            pass.instrument(&[1, 2, 3], 7),
            InstrumentOutcome::Fallback(InstrumentationError::InvalidInput(_))
        ));
        assert_eq!(sink.diagnostics().len(), 1);
    }
}
