//! Output buffers for instrumented commands and the command buffers that own them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::vk;
use tracing::{debug, trace};

use crate::context::DeviceContext;
use crate::descriptor_pool::DescriptorPoolManager;
use crate::error::{ResourceError, SetupError};
use crate::instrument::OUTPUT_BUFFER_BINDING;
use crate::pipeline::{PipelineKind, PipelineTracker};
use crate::report::{Diagnostic, DiagnosticKind};

/// A host-visible storage buffer and its memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMemoryBlock {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

/// Everything one instrumented draw, dispatch or trace writes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerInvocationResource {
    pub block: OutputMemoryBlock,
    pub descriptor_set: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
    pub kind: PipelineKind,
    pub pipeline: vk::Pipeline,
    /// Index of the command among those of the same kind in its command buffer.
    pub operation_index: u32,
    /// Whether the descriptor set was actually bound for the command.
    pub bound: bool,
}

/// Per-command-buffer recording state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBufferState {
    bound_pipelines: HashMap<PipelineKind, vk::Pipeline>,
    operation_counts: HashMap<PipelineKind, u32>,
    /// Secondary command buffers executed from this one.
    pub linked: Vec<vk::CommandBuffer>,
    /// `None` until the first command needing an output buffer is recorded.
    pub debug_printf: Option<Vec<PerInvocationResource>>,
}

impl CommandBufferState {
    pub fn bound_pipeline(&self, kind: PipelineKind) -> Option<vk::Pipeline> {
        self.bound_pipelines.get(&kind).copied()
    }

    pub fn resources(&self) -> &[PerInvocationResource] {
        self.debug_printf.as_deref().unwrap_or(&[])
    }

    fn next_operation_index(&mut self, kind: PipelineKind) -> u32 {
        let count = self.operation_counts.entry(kind).or_insert(0);
        let index = *count;
        *count += 1;
        index
    }
}

/// Provisions and frees output buffers, keyed by command buffer.
pub struct ResourceManager {
    ctx: Arc<DeviceContext>,
    pools: DescriptorPoolManager,
    debug_layout: vk::DescriptorSetLayout,
    bind_index: u32,
    command_buffers: Mutex<HashMap<vk::CommandBuffer, CommandBufferState>>,
}

impl ResourceManager {
    pub fn new(
        ctx: Arc<DeviceContext>,
        debug_layout: vk::DescriptorSetLayout,
        bind_index: u32,
    ) -> Self {
        let pools = DescriptorPoolManager::new(
            ctx.dispatch.clone(),
            ctx.config.descriptor_chunk_size,
            1,
        );
        Self {
            ctx,
            pools,
            debug_layout,
            bind_index,
            command_buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn pools(&self) -> &DescriptorPoolManager {
        &self.pools
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<vk::CommandBuffer, CommandBufferState>> {
        self.command_buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferState> {
        self.lock().get(&command_buffer).cloned()
    }

    pub fn bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        kind: PipelineKind,
        pipeline: vk::Pipeline,
    ) {
        self.lock()
            .entry(command_buffer)
            .or_default()
            .bound_pipelines
            .insert(kind, pipeline);
    }

    pub fn link_secondaries(
        &self,
        primary: vk::CommandBuffer,
        secondaries: &[vk::CommandBuffer],
    ) {
        self.lock()
            .entry(primary)
            .or_default()
            .linked
            .extend_from_slice(secondaries);
    }

    /// Allocates, zeroes and binds an output buffer for the next command of `kind`.
    ///
    /// Allocation failures and a missing pipeline disable debug printf for the device. When the
    /// pipeline's layout has no room at the debug slot the buffer is still created (and later
    /// decoded, empty) but not bound.
    pub fn provision(
        &self,
        command_buffer: vk::CommandBuffer,
        kind: PipelineKind,
        pipelines: &PipelineTracker,
    ) {
        if self.ctx.is_aborted() {
            return;
        }

        let (pipeline, operation_index) = {
            let mut cbs = self.lock();
            let state = cbs.entry(command_buffer).or_default();
            let operation_index = state.next_operation_index(kind);
            (state.bound_pipeline(kind), operation_index)
        };
        let Some(pipeline) = pipeline else {
            self.ctx.abort(
                Diagnostic::new(
                    DiagnosticKind::SetupError,
                    SetupError::NoBoundPipeline(kind.bind_point()).to_string(),
                )
                .with_object(command_buffer),
            );
            return;
        };

        let (pool, descriptor_set) = match self.pools.acquire(1, self.debug_layout) {
            Ok((pool, sets)) => match sets.first() {
                Some(&set) => (pool, set),
                None => return,
            },
            Err(err) => return self.exhausted(err, command_buffer),
        };

        let block = match self.create_zeroed_block() {
            Ok(block) => block,
            Err(err) => {
                self.pools.release(pool, descriptor_set);
                return self.exhausted(err, command_buffer);
            }
        };
        self.ctx.dispatch.write_storage_buffer_descriptor(
            descriptor_set,
            OUTPUT_BUFFER_BINDING,
            block.buffer,
            block.size,
        );

        let pipeline_state = pipelines.pipeline(pipeline);
        let bindable = pipeline_state
            .as_ref()
            .and_then(|p| p.layout_state)
            .is_some_and(|layout| layout.can_bind_debug_set(self.bind_index));
        match pipeline_state {
            Some(state) if bindable => self.ctx.dispatch.cmd_bind_descriptor_sets(
                command_buffer,
                kind.bind_point(),
                state.layout,
                self.bind_index,
                &[descriptor_set],
            ),
            _ => {
                self.ctx.stats.inc_binds_skipped();
                debug!(
                    ?command_buffer,
                    ?pipeline,
                    bind_index = self.bind_index,
                    "pipeline layout has no free debug printf slot; output buffer left unbound"
                );
            }
        }

        let resource = PerInvocationResource {
            block,
            descriptor_set,
            pool,
            kind,
            pipeline,
            operation_index,
            bound: bindable,
        };
        self.ctx.stats.inc_buffers_provisioned();
        trace!(?command_buffer, ?resource, "provisioned output buffer");

        self.lock()
            .entry(command_buffer)
            .or_default()
            .debug_printf
            .get_or_insert_with(Vec::new)
            .push(resource);
    }

    fn create_zeroed_block(&self) -> Result<OutputMemoryBlock, ResourceError> {
        let size = vk::DeviceSize::from(self.ctx.config.buffer_size);
        let block = self
            .ctx
            .dispatch
            .create_output_buffer(size)
            .map_err(ResourceError::OutputBuffer)?;
        let zeros = vec![0u8; self.ctx.config.buffer_size as usize];
        if let Err(err) = self.ctx.dispatch.write_memory(block.memory, 0, &zeros) {
            self.ctx.dispatch.destroy_output_buffer(&block);
            return Err(ResourceError::MemoryAccess(err));
        }
        Ok(block)
    }

    fn exhausted(&self, err: ResourceError, command_buffer: vk::CommandBuffer) {
        self.ctx.abort(
            Diagnostic::new(DiagnosticKind::ResourceExhaustion, err.to_string())
                .with_object(command_buffer),
        );
    }

    /// Resources to read back for `command_buffers` and every secondary linked from them.
    pub fn resources_for_submission(
        &self,
        command_buffers: &[vk::CommandBuffer],
    ) -> Vec<(vk::CommandBuffer, Vec<PerInvocationResource>)> {
        let cbs = self.lock();
        let mut out = Vec::new();
        let mut pending: Vec<vk::CommandBuffer> = command_buffers.iter().rev().copied().collect();
        let mut seen = Vec::new();
        while let Some(cb) = pending.pop() {
            if seen.contains(&cb) {
                continue;
            }
            seen.push(cb);
            let Some(state) = cbs.get(&cb) else {
                continue;
            };
            if !state.resources().is_empty() {
                out.push((cb, state.resources().to_vec()));
            }
            pending.extend(state.linked.iter().rev().copied());
        }
        out
    }

    /// Frees a command buffer's resources and forgets its recording state.
    pub fn reset(&self, command_buffer: vk::CommandBuffer) {
        let state = self.lock().remove(&command_buffer);
        if let Some(state) = state {
            self.destroy_resources(state.resources());
        }
    }

    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        for &command_buffer in command_buffers {
            self.reset(command_buffer);
        }
    }

    pub fn destroy_all(&self) {
        let states: Vec<CommandBufferState> =
            self.lock().drain().map(|(_, state)| state).collect();
        for state in &states {
            self.destroy_resources(state.resources());
        }
        self.pools.destroy_all();
    }

    fn destroy_resources(&self, resources: &[PerInvocationResource]) {
        for resource in resources {
            self.destroy_resource(resource);
        }
    }

    fn destroy_resource(&self, resource: &PerInvocationResource) {
        self.ctx.dispatch.destroy_output_buffer(&resource.block);
        self.pools.release(resource.pool, resource.descriptor_set);
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("bind_index", &self.bind_index)
            .field("debug_layout", &self.debug_layout)
            .finish_non_exhaustive()
    }
}
