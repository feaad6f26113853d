//! The per-device debug printf object a validation layer's entry points call into.
//!
//! Hooks come in `pre_*`/`post_*` pairs around the driver call: the `pre_*` hook returns a plan
//! describing what the layer must pass down (instrumented bytecode, widened set layouts, swapped
//! shader modules), the `post_*` hook takes the plan back together with what the driver
//! returned. No hook ever fails the application's call; problems become diagnostics.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use crate::config::DebugPrintfConfig;
use crate::context::DeviceContext;
use crate::decode::OutputDecoder;
use crate::dispatch::{DescriptorBinding, DeviceDispatch};
use crate::error::SetupError;
use crate::instrument::{
    InstrumentOutcome, InstrumentationPass, ShaderRewriter, OUTPUT_BUFFER_BINDING,
};
use crate::pipeline::{
    bind_index_for, widen_set_layouts, PipelineCreateDesc, PipelineKind, PipelineLayoutState,
    PipelineState, PipelineTracker,
};
use crate::registry::{ShaderId, ShaderRegistry};
use crate::report::{Diagnostic, DiagnosticKind, MessageSink, Reporter};
use crate::resources::ResourceManager;
use crate::stats::DebugPrintfStats;
use crate::submit::{SubmissionInterceptor, SubmissionReport};

/// What debug printf needs to know about the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub api_version: u32,
    pub vertex_pipeline_stores_and_atomics: bool,
    pub fragment_stores_and_atomics: bool,
    pub max_bound_descriptor_sets: u32,
}

impl DeviceCapabilities {
    pub fn from_properties(
        properties: &vk::PhysicalDeviceProperties,
        enabled_features: &vk::PhysicalDeviceFeatures,
    ) -> Self {
        Self {
            api_version: properties.api_version,
            vertex_pipeline_stores_and_atomics: enabled_features.vertex_pipeline_stores_and_atomics
                == vk::TRUE,
            fragment_stores_and_atomics: enabled_features.fragment_stores_and_atomics == vk::TRUE,
            max_bound_descriptor_sets: properties.limits.max_bound_descriptor_sets,
        }
    }

    /// Returns the descriptor set index reserved for the output buffer.
    pub fn check(&self) -> Result<u32, SetupError> {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        if (major, minor) < (1, 1) {
            return Err(SetupError::ApiVersionTooOld { major, minor });
        }
        if !self.vertex_pipeline_stores_and_atomics || !self.fragment_stores_and_atomics {
            return Err(SetupError::MissingStoresAndAtomics);
        }
        let bind_index = bind_index_for(self.max_bound_descriptor_sets);
        if bind_index < 1 {
            return Err(SetupError::TooFewDescriptorSets(
                self.max_bound_descriptor_sets,
            ));
        }
        Ok(bind_index)
    }
}

/// Returned by [`DebugPrintf::pre_create_shader_module`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderModulePlan {
    shader_id: Option<ShaderId>,
    instrumented: Option<Vec<u32>>,
}

impl ShaderModulePlan {
    pub fn shader_id(&self) -> Option<ShaderId> {
        self.shader_id
    }

    /// The code to pass to the driver instead of `original`.
    pub fn code<'a>(&'a self, original: &'a [u32]) -> &'a [u32] {
        self.instrumented.as_deref().unwrap_or(original)
    }
}

/// Returned by [`DebugPrintf::pre_create_pipeline_layout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayoutPlan {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    app_set_count: u32,
}

impl PipelineLayoutPlan {
    /// The set layouts to create the pipeline layout with.
    pub fn set_layouts(&self) -> &[vk::DescriptorSetLayout] {
        &self.set_layouts
    }

    pub fn is_widened(&self) -> bool {
        self.set_layouts.len() as u32 != self.app_set_count
    }
}

/// Returned by [`DebugPrintf::pre_create_pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCreatePlan {
    kind: PipelineKind,
    layout: vk::PipelineLayout,
    layout_state: Option<PipelineLayoutState>,
    shader_ids: Vec<ShaderId>,
    /// Uninstrumented copies swapped into the create-info; destroyed once the pipeline exists.
    replacement_modules: Vec<vk::ShaderModule>,
}

impl PipelineCreatePlan {
    pub fn shader_ids(&self) -> &[ShaderId] {
        &self.shader_ids
    }

    pub fn replacement_modules(&self) -> &[vk::ShaderModule] {
        &self.replacement_modules
    }
}

/// Debug printf state for one `VkDevice`.
pub struct DebugPrintf {
    ctx: Arc<DeviceContext>,
    bind_index: u32,
    debug_layout: vk::DescriptorSetLayout,
    placeholder_layout: vk::DescriptorSetLayout,
    registry: Arc<ShaderRegistry>,
    decoder: Arc<OutputDecoder>,
    instrumentation: InstrumentationPass,
    pipelines: PipelineTracker,
    resources: ResourceManager,
    submissions: SubmissionInterceptor,
}

impl DebugPrintf {
    /// Sets debug printf up for a device.
    ///
    /// Unmet requirements are reported once through `sink` and leave the returned object
    /// permanently disabled; every hook then passes the application's calls through unchanged.
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        capabilities: DeviceCapabilities,
        config: DebugPrintfConfig,
        sink: Arc<dyn MessageSink>,
        rewriter: Arc<dyn ShaderRewriter>,
    ) -> Self {
        let config = config.normalized();
        let reporter = Reporter::new(sink, config.to_stdout);
        let ctx = Arc::new(DeviceContext::new(dispatch, config, reporter));

        let setup = capabilities
            .check()
            .and_then(|bind_index| create_layouts(ctx.dispatch.as_ref()).map(|l| (bind_index, l)));
        let (bind_index, (debug_layout, placeholder_layout)) = match setup {
            Ok(setup) => setup,
            Err(err) => {
                ctx.abort(Diagnostic::new(DiagnosticKind::SetupError, err.to_string()));
                (0, (vk::DescriptorSetLayout::null(), vk::DescriptorSetLayout::null()))
            }
        };
        if !ctx.is_aborted() {
            info!(
                bind_index,
                buffer_size = ctx.config.buffer_size,
                verbose = ctx.config.verbose,
                "debug printf enabled"
            );
        }

        let registry = Arc::new(ShaderRegistry::new());
        let decoder = Arc::new(OutputDecoder::new(registry.clone(), ctx.config.verbose));
        Self {
            bind_index,
            debug_layout,
            placeholder_layout,
            instrumentation: InstrumentationPass::new(ctx.clone(), rewriter, registry.clone()),
            pipelines: PipelineTracker::new(),
            resources: ResourceManager::new(ctx.clone(), debug_layout, bind_index),
            submissions: SubmissionInterceptor::new(ctx.clone(), decoder.clone()),
            registry,
            decoder,
            ctx,
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.ctx.is_aborted()
    }

    /// Descriptor set index the output buffer is bound at.
    pub fn bind_index(&self) -> u32 {
        self.bind_index
    }

    pub fn config(&self) -> &DebugPrintfConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> &DebugPrintfStats {
        &self.ctx.stats
    }

    pub fn registry(&self) -> &ShaderRegistry {
        &self.registry
    }

    pub fn decoder(&self) -> &OutputDecoder {
        &self.decoder
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn pipelines(&self) -> &PipelineTracker {
        &self.pipelines
    }

    pub fn debug_layout(&self) -> vk::DescriptorSetLayout {
        self.debug_layout
    }

    pub fn placeholder_layout(&self) -> vk::DescriptorSetLayout {
        self.placeholder_layout
    }

    // Shader modules.

    pub fn pre_create_shader_module(&self, code: &[u32]) -> ShaderModulePlan {
        if self.is_aborted() {
            return ShaderModulePlan::default();
        }
        match self.instrumentation.instrument(code, self.bind_index) {
            InstrumentOutcome::Instrumented {
                shader_id,
                bytecode,
            } => ShaderModulePlan {
                shader_id: Some(shader_id),
                instrumented: Some(bytecode),
            },
            InstrumentOutcome::NotNeeded | InstrumentOutcome::Fallback(_) => {
                ShaderModulePlan::default()
            }
        }
    }

    /// `module` is `None` when the driver failed to create it.
    pub fn post_create_shader_module(
        &self,
        plan: ShaderModulePlan,
        module: Option<vk::ShaderModule>,
    ) {
        let Some(shader_id) = plan.shader_id else {
            return;
        };
        match module {
            Some(module) => self.registry.bind_module(shader_id, module),
            None => self.registry.discard(shader_id),
        }
    }

    pub fn pre_destroy_shader_module(&self, module: vk::ShaderModule) {
        if let Some(shader_id) = self.registry.module_destroyed(module) {
            self.decoder.evict(&[shader_id]);
        }
    }

    // Pipeline layouts.

    pub fn pre_create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> PipelineLayoutPlan {
        let app_set_count = set_layouts.len() as u32;
        let passthrough = || PipelineLayoutPlan {
            set_layouts: set_layouts.to_vec(),
            app_set_count,
        };
        if self.is_aborted() {
            return passthrough();
        }

        match widen_set_layouts(
            set_layouts,
            self.bind_index,
            self.placeholder_layout,
            self.debug_layout,
        ) {
            Some(widened) => {
                debug!(
                    app_set_count,
                    total_set_count = widened.len(),
                    "widened pipeline layout for debug printf"
                );
                PipelineLayoutPlan {
                    set_layouts: widened,
                    app_set_count,
                }
            }
            None => {
                self.ctx.report(Diagnostic::new(
                    DiagnosticKind::InstrumentationFailure,
                    format!(
                        "pipeline layout uses {app_set_count} descriptor sets; set {} is \
                         reserved for debug printf, so pipelines using this layout run \
                         uninstrumented",
                        self.bind_index
                    ),
                ));
                passthrough()
            }
        }
    }

    pub fn post_create_pipeline_layout(
        &self,
        plan: &PipelineLayoutPlan,
        layout: Option<vk::PipelineLayout>,
    ) {
        let Some(layout) = layout else {
            return;
        };
        self.pipelines.insert_layout(
            layout,
            PipelineLayoutState {
                app_set_count: plan.app_set_count,
                total_set_count: plan.set_layouts.len() as u32,
            },
        );
    }

    pub fn pre_destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.pipelines.remove_layout(layout);
    }

    // Pipelines.

    /// Decides which shaders run instrumented in the pipeline described by `desc`.
    ///
    /// When the pipeline's layout cannot take the debug set, instrumented stages are pointed
    /// at uninstrumented copies of their original bytecode.
    pub fn pre_create_pipeline(&self, desc: &mut PipelineCreateDesc) -> PipelineCreatePlan {
        let layout_state = self.pipelines.layout(desc.layout);
        let mut plan = PipelineCreatePlan {
            kind: desc.stages.kind(),
            layout: desc.layout,
            layout_state,
            shader_ids: Vec::new(),
            replacement_modules: Vec::new(),
        };
        if self.is_aborted() {
            return plan;
        }

        let bindable = layout_state.is_some_and(|s| s.can_bind_debug_set(self.bind_index));
        for stage in 0..desc.stages.stage_count() {
            let Some(module) = desc.stages.module(stage) else {
                continue;
            };
            let Some(shader_id) = self.registry.shader_for_module(module) else {
                continue;
            };
            if bindable {
                if !plan.shader_ids.contains(&shader_id) {
                    plan.shader_ids.push(shader_id);
                }
                continue;
            }

            let Some(record) = self.registry.get(shader_id) else {
                continue;
            };
            match self
                .ctx
                .dispatch
                .create_shader_module(&record.original_bytecode)
            {
                Ok(copy) => {
                    desc.stages.set_module(stage, copy);
                    plan.replacement_modules.push(copy);
                    debug!(%shader_id, stage, "using uninstrumented copy of shader module");
                }
                Err(err) => {
                    warn!(%shader_id, %err, "failed to create uninstrumented shader copy");
                    plan.shader_ids.push(shader_id);
                }
            }
        }
        plan
    }

    /// `pipeline` is `None` when the driver failed to create it.
    pub fn post_create_pipeline(&self, plan: PipelineCreatePlan, pipeline: Option<vk::Pipeline>) {
        for module in &plan.replacement_modules {
            self.ctx.dispatch.destroy_shader_module(*module);
        }
        let Some(pipeline) = pipeline else {
            return;
        };
        for shader_id in &plan.shader_ids {
            self.registry.add_pipeline(*shader_id, pipeline);
        }
        self.pipelines.insert_pipeline(
            pipeline,
            PipelineState {
                kind: plan.kind,
                layout: plan.layout,
                layout_state: plan.layout_state,
                shader_ids: plan.shader_ids,
            },
        );
        self.ctx.stats.inc_pipelines_tracked();
    }

    pub fn pre_destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if let Some(state) = self.pipelines.remove_pipeline(pipeline) {
            let dropped = self.registry.pipeline_destroyed(pipeline, &state.shader_ids);
            self.decoder.evict(&dropped);
        }
    }

    // Command buffers.

    pub fn pre_begin_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.resources.reset(command_buffer);
    }

    pub fn pre_reset_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.resources.reset(command_buffer);
    }

    pub fn pre_free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        self.resources.free(command_buffers);
    }

    pub fn post_cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        if let Some(kind) = PipelineKind::from_bind_point(bind_point) {
            self.resources.bind_pipeline(command_buffer, kind, pipeline);
        }
    }

    /// Gives the next command recorded at `bind_point` its own output buffer.
    ///
    /// Must run before the command itself is recorded so the descriptor set is bound first.
    pub fn pre_record_command(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
    ) {
        if self.is_aborted() {
            return;
        }
        let Some(kind) = PipelineKind::from_bind_point(bind_point) else {
            return;
        };
        self.resources.provision(command_buffer, kind, &self.pipelines);
    }

    /// Every `vkCmdDraw*` variant.
    pub fn pre_cmd_draw(&self, command_buffer: vk::CommandBuffer) {
        self.pre_record_command(command_buffer, vk::PipelineBindPoint::GRAPHICS);
    }

    /// Every `vkCmdDispatch*` variant.
    pub fn pre_cmd_dispatch(&self, command_buffer: vk::CommandBuffer) {
        self.pre_record_command(command_buffer, vk::PipelineBindPoint::COMPUTE);
    }

    /// Every `vkCmdTraceRays*` variant.
    pub fn pre_cmd_trace_rays(&self, command_buffer: vk::CommandBuffer) {
        self.pre_record_command(command_buffer, vk::PipelineBindPoint::RAY_TRACING_KHR);
    }

    pub fn post_cmd_execute_commands(
        &self,
        primary: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        self.resources.link_secondaries(primary, secondaries);
    }

    // Queues.

    /// Reads back everything `command_buffers` wrote once the application's submit succeeded.
    ///
    /// Blocks until `queue` is idle when any of them carries output buffers.
    pub fn post_queue_submit(
        &self,
        queue: vk::Queue,
        queue_family_index: u32,
        command_buffers: &[vk::CommandBuffer],
    ) -> SubmissionReport {
        let batches = if self.is_aborted() {
            Vec::new()
        } else {
            self.resources.resources_for_submission(command_buffers)
        };
        self.submissions
            .post_submit(queue, queue_family_index, &batches)
    }

    /// Releases every object debug printf created. Call before the device is destroyed.
    pub fn destroy(&self) {
        self.submissions.destroy();
        self.resources.destroy_all();
        for layout in [self.debug_layout, self.placeholder_layout] {
            if layout != vk::DescriptorSetLayout::null() {
                self.ctx.dispatch.destroy_descriptor_set_layout(layout);
            }
        }
        self.pipelines.clear();
        self.registry.clear();
        self.decoder.clear_cache();
        debug!(stats = %self.ctx.stats.to_json(), "debug printf destroyed");
    }
}

impl std::fmt::Debug for DebugPrintf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugPrintf")
            .field("bind_index", &self.bind_index)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Creates the output buffer layout and the empty layout used to pad pipeline layouts.
fn create_layouts(
    dispatch: &dyn DeviceDispatch,
) -> Result<(vk::DescriptorSetLayout, vk::DescriptorSetLayout), SetupError> {
    let output = DescriptorBinding {
        binding: OUTPUT_BUFFER_BINDING,
        descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        count: 1,
        stages: vk::ShaderStageFlags::ALL,
    };
    let debug_layout = dispatch
        .create_descriptor_set_layout(&[output])
        .map_err(SetupError::DescriptorSetLayout)?;
    match dispatch.create_descriptor_set_layout(&[]) {
        Ok(placeholder) => Ok((debug_layout, placeholder)),
        Err(err) => {
            dispatch.destroy_descriptor_set_layout(debug_layout);
            Err(SetupError::DescriptorSetLayout(err))
        }
    }
}
