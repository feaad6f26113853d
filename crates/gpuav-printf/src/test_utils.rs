//! In-memory stand-ins for the driver, the rewriter and the message sink.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::config::DebugPrintfConfig;
use crate::context::DeviceContext;
use crate::dispatch::{DescriptorBinding, DeviceDispatch};
use crate::instrument::{RewriteMessage, RewriteMessageLevel, RewriteRequest, ShaderRewriter};
use crate::registry::ShaderId;
use crate::report::{DebugPrintfMessage, Diagnostic, MessageSink, Reporter};
use crate::resources::OutputMemoryBlock;

/// A `vkCmdBindDescriptorSets` call seen by [`MockDevice`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundDescriptorSets {
    pub command_buffer: vk::CommandBuffer,
    pub bind_point: vk::PipelineBindPoint,
    pub layout: vk::PipelineLayout,
    pub first_set: u32,
    pub sets: Vec<vk::DescriptorSet>,
}

#[derive(Debug)]
struct PoolState {
    max_sets: u32,
    sets: HashSet<vk::DescriptorSet>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<DescriptorBinding>>,
    pools: HashMap<vk::DescriptorPool, PoolState>,
    descriptor_writes: HashMap<(vk::DescriptorSet, u32), vk::Buffer>,
    buffers: HashMap<vk::Buffer, vk::DeviceMemory>,
    memory: HashMap<vk::DeviceMemory, Vec<u8>>,
    last_memory: Option<vk::DeviceMemory>,
    shader_modules: HashMap<vk::ShaderModule, Vec<u32>>,
    command_pools: HashSet<vk::CommandPool>,
    barriers_recorded: usize,
    bound_sets: Vec<BoundDescriptorSets>,
    submits: Vec<(vk::Queue, Vec<vk::CommandBuffer>)>,
    wait_idles: usize,

    fail_set_layouts: bool,
    fail_descriptor_pools: bool,
    fail_buffers: bool,
    fail_queue_submit: bool,
    fail_memory_reads: bool,
    fail_memory_writes: bool,
    fail_descriptor_frees: bool,
}

impl MockState {
    fn handle<T: Handle>(&mut self) -> T {
        self.next_handle += 1;
        T::from_raw(0x1000 + self.next_handle)
    }
}

/// A device that keeps every object in host memory.
#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock device lock poisoned")
    }

    /// A fresh handle to stand in for an application-created set layout.
    pub fn layout_handle(&self) -> vk::DescriptorSetLayout {
        self.state().handle()
    }

    /// A fresh handle for any other application object.
    pub fn handle<T: Handle>(&self) -> T {
        self.state().handle()
    }

    pub fn fail_descriptor_set_layouts(&self, fail: bool) {
        self.state().fail_set_layouts = fail;
    }

    pub fn fail_descriptor_pools(&self, fail: bool) {
        self.state().fail_descriptor_pools = fail;
    }

    pub fn fail_buffers(&self, fail: bool) {
        self.state().fail_buffers = fail;
    }

    pub fn fail_queue_submit(&self, fail: bool) {
        self.state().fail_queue_submit = fail;
    }

    /// Makes host reads and writes of device memory fail independently.
    pub fn fail_memory_access(&self, reads: bool, writes: bool) {
        let mut state = self.state();
        state.fail_memory_reads = reads;
        state.fail_memory_writes = writes;
    }

    pub fn fail_descriptor_frees(&self, fail: bool) {
        self.state().fail_descriptor_frees = fail;
    }

    pub fn live_descriptor_pools(&self) -> usize {
        self.state().pools.len()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state().pools.values().map(|p| p.sets.len()).sum()
    }

    pub fn live_descriptor_set_layouts(&self) -> usize {
        self.state().set_layouts.len()
    }

    pub fn set_layout_bindings(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Option<Vec<DescriptorBinding>> {
        self.state().set_layouts.get(&layout).cloned()
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_shader_modules(&self) -> usize {
        self.state().shader_modules.len()
    }

    pub fn shader_module_code(&self, module: vk::ShaderModule) -> Option<Vec<u32>> {
        self.state().shader_modules.get(&module).cloned()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state().command_pools.len()
    }

    pub fn barriers_recorded(&self) -> usize {
        self.state().barriers_recorded
    }

    pub fn bound_sets(&self) -> Vec<BoundDescriptorSets> {
        self.state().bound_sets.clone()
    }

    pub fn submits(&self) -> Vec<(vk::Queue, Vec<vk::CommandBuffer>)> {
        self.state().submits.clone()
    }

    pub fn wait_idle_count(&self) -> usize {
        self.state().wait_idles
    }

    /// The buffer written into `binding` of `set`, if any.
    pub fn descriptor_buffer(&self, set: vk::DescriptorSet, binding: u32) -> Option<vk::Buffer> {
        self.state().descriptor_writes.get(&(set, binding)).copied()
    }

    /// Memory of the most recently created output buffer.
    pub fn last_output_memory(&self) -> Option<vk::DeviceMemory> {
        self.state().last_memory
    }

    /// Plays the shader: stores `words` at the start of `memory`.
    pub fn write_words(&self, memory: vk::DeviceMemory, words: &[u32]) {
        let mut state = self.state();
        let bytes = state.memory.get_mut(&memory).expect("unknown device memory");
        let src: &[u8] = bytemuck::cast_slice(words);
        bytes[..src.len()].copy_from_slice(src);
    }

    pub fn read_words(&self, memory: vk::DeviceMemory) -> Vec<u32> {
        let state = self.state();
        let bytes = state.memory.get(&memory).expect("unknown device memory");
        bytes
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

fn memory_range(
    len: usize,
    offset: vk::DeviceSize,
    size: usize,
) -> VkResult<std::ops::Range<usize>> {
    let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
    let end = start
        .checked_add(size)
        .filter(|end| *end <= len)
        .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
    Ok(start..end)
}

impl DeviceDispatch for MockDevice {
    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let mut state = self.state();
        if state.fail_set_layouts {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let layout = state.handle();
        state.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state().set_layouts.remove(&layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state();
        if state.fail_descriptor_pools {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let pool = state.handle();
        state.pools.insert(
            pool,
            PoolState {
                max_sets,
                sets: HashSet::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state().pools.remove(&pool);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        match state.pools.get(&pool) {
            Some(p) if p.sets.len() + layouts.len() <= p.max_sets as usize => {}
            Some(_) => return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            None => return Err(vk::Result::ERROR_UNKNOWN),
        }
        let sets: Vec<vk::DescriptorSet> = layouts.iter().map(|_| state.handle()).collect();
        if let Some(p) = state.pools.get_mut(&pool) {
            p.sets.extend(sets.iter().copied());
        }
        Ok(sets)
    }

    fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.fail_descriptor_frees {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let pool = state.pools.get_mut(&pool).ok_or(vk::Result::ERROR_UNKNOWN)?;
        for set in sets {
            pool.sets.remove(set);
        }
        Ok(())
    }

    fn write_storage_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        buffer: vk::Buffer,
        _range: vk::DeviceSize,
    ) {
        self.state().descriptor_writes.insert((set, binding), buffer);
    }

    fn create_output_buffer(&self, size: vk::DeviceSize) -> VkResult<OutputMemoryBlock> {
        let mut state = self.state();
        if state.fail_buffers {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let buffer = state.handle();
        let memory = state.handle();
        // Fresh allocations are not zeroed on real drivers either.
        state.memory.insert(memory, vec![0xCD; size as usize]);
        state.buffers.insert(buffer, memory);
        state.last_memory = Some(memory);
        Ok(OutputMemoryBlock {
            buffer,
            memory,
            size,
        })
    }

    fn destroy_output_buffer(&self, block: &OutputMemoryBlock) {
        let mut state = self.state();
        state.buffers.remove(&block.buffer);
        state.memory.remove(&block.memory);
    }

    fn read_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        dst: &mut [u8],
    ) -> VkResult<()> {
        let state = self.state();
        if state.fail_memory_reads {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let bytes = state
            .memory
            .get(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let range = memory_range(bytes.len(), offset, dst.len())?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        src: &[u8],
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.fail_memory_writes {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let bytes = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let range = memory_range(bytes.len(), offset, src.len())?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let mut state = self.state();
        let module = state.handle();
        state.shader_modules.insert(module, code.to_vec());
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state().shader_modules.remove(&module);
    }

    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state().bound_sets.push(BoundDescriptorSets {
            command_buffer,
            bind_point,
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let mut state = self.state();
        let pool = state.handle();
        state.command_pools.insert(pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state().command_pools.remove(&pool);
    }

    fn allocate_primary_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> VkResult<vk::CommandBuffer> {
        let mut state = self.state();
        if !state.command_pools.contains(&pool) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        Ok(state.handle())
    }

    fn record_host_read_barrier(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.state().barriers_recorded += 1;
        Ok(())
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        command_buffers: &[vk::CommandBuffer],
        _fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.fail_queue_submit {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.submits.push((queue, command_buffers.to_vec()));
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        self.state().wait_idles += 1;
        Ok(())
    }
}

/// Collects everything reported to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<DebugPrintfMessage>>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<DebugPrintfMessage> {
        self.messages.lock().expect("sink lock poisoned").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.text).collect()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().expect("sink lock poisoned").clone()
    }
}

impl MessageSink for RecordingSink {
    fn printf(&self, message: &DebugPrintfMessage) {
        self.messages
            .lock()
            .expect("sink lock poisoned")
            .push(message.clone());
    }

    fn diagnostic(&self, diagnostic: &Diagnostic) {
        self.diagnostics
            .lock()
            .expect("sink lock poisoned")
            .push(diagnostic.clone());
    }
}

#[derive(Debug, Clone)]
enum RewriteMode {
    Append,
    Fail(String),
    Corrupt,
}

/// `(descriptor_set, binding, shader_id)` of every rewrite request.
pub type RewriteRequests = Arc<Mutex<Vec<(u32, u32, ShaderId)>>>;

/// A rewriter with scripted behavior.
#[derive(Debug, Clone)]
pub struct MockRewriter {
    mode: RewriteMode,
    requests: RewriteRequests,
}

impl MockRewriter {
    fn with_mode(mode: RewriteMode) -> Self {
        Self {
            mode,
            requests: Arc::default(),
        }
    }

    /// Appends an `OpNop`, which keeps the module valid but makes it distinguishable.
    pub fn appending() -> Self {
        Self::with_mode(RewriteMode::Append)
    }

    /// Reports `reason` as an error message, then fails.
    pub fn failing(reason: &str) -> Self {
        Self::with_mode(RewriteMode::Fail(reason.to_owned()))
    }

    /// Returns something that is not SPIR-V.
    pub fn corrupting() -> Self {
        Self::with_mode(RewriteMode::Corrupt)
    }

    pub fn requests(&self) -> RewriteRequests {
        self.requests.clone()
    }
}

/// `OpNop`.
pub const OP_NOP: u32 = 1 << 16;

impl ShaderRewriter for MockRewriter {
    fn rewrite(
        &self,
        request: &RewriteRequest<'_>,
        messages: &mut dyn FnMut(RewriteMessage),
    ) -> Result<Vec<u32>, String> {
        self.requests.lock().expect("rewriter lock poisoned").push((
            request.descriptor_set,
            request.binding,
            request.shader_id,
        ));
        match &self.mode {
            RewriteMode::Append => {
                let mut out = request.bytecode.to_vec();
                out.push(OP_NOP);
                Ok(out)
            }
            RewriteMode::Fail(reason) => {
                messages(RewriteMessage {
                    level: RewriteMessageLevel::Error,
                    text: reason.clone(),
                });
                Err(reason.clone())
            }
            RewriteMode::Corrupt => Ok(vec![0xDEAD_BEEF; 3]),
        }
    }
}

/// A device context over a fresh [`MockDevice`] and [`RecordingSink`] with default settings.
pub fn test_context() -> (Arc<DeviceContext>, Arc<MockDevice>, Arc<RecordingSink>) {
    test_context_with(DebugPrintfConfig::default())
}

pub fn test_context_with(
    config: DebugPrintfConfig,
) -> (Arc<DeviceContext>, Arc<MockDevice>, Arc<RecordingSink>) {
    let device = Arc::new(MockDevice::new());
    let sink = Arc::new(RecordingSink::new());
    let reporter = Reporter::new(sink.clone(), config.to_stdout);
    let ctx = Arc::new(DeviceContext::new(device.clone(), config.normalized(), reporter));
    (ctx, device, sink)
}

/// Lays out records the way an instrumented shader writes them.
#[derive(Debug, Clone)]
pub struct OutputBufferBuilder {
    words: Vec<u32>,
}

impl Default for OutputBufferBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBufferBuilder {
    pub fn new() -> Self {
        Self { words: vec![0] }
    }

    pub fn record(
        &mut self,
        shader_id: ShaderId,
        instruction_position: u32,
        stage: u32,
        stage_words: [u32; 3],
        format_string_id: u32,
        values: &[u32],
    ) -> &mut Self {
        let size = u32::try_from(8 + values.len()).expect("record too large");
        self.words.extend_from_slice(&[
            size,
            shader_id.0,
            instruction_position,
            stage,
            stage_words[0],
            stage_words[1],
            stage_words[2],
            format_string_id,
        ]);
        self.words.extend_from_slice(values);
        self
    }

    /// Sets the count word and pads with zeros up to `min_words`.
    pub fn finish(&self, min_words: usize) -> Vec<u32> {
        let mut words = self.words.clone();
        words[0] = u32::try_from(words.len() - 1).expect("buffer too large");
        if words.len() < min_words {
            words.resize(min_words, 0);
        }
        words
    }
}
