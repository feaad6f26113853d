use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ash::vk;
use tracing::debug;

/// Process-unique id stamped into every record an instrumented shader writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderId(pub u32);

impl fmt::Display for ShaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the decoder needs to turn a record back into text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderRecord {
    pub shader_id: ShaderId,
    /// The application's bytecode; format strings and line info are read from it.
    pub original_bytecode: Arc<[u32]>,
    /// The module created from the instrumented bytecode, once known.
    pub module: vk::ShaderModule,
    /// Live pipelines built from the module.
    pub pipelines: Vec<vk::Pipeline>,
}

#[derive(Debug)]
struct Entry {
    record: ShaderRecord,
    module_alive: bool,
}

impl Entry {
    fn is_dead(&self) -> bool {
        !self.module_alive && self.record.pipelines.is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<ShaderId, Entry>,
    modules: HashMap<vk::ShaderModule, ShaderId>,
}

/// Shader id → original bytecode.
///
/// A record stays alive while its shader module or any pipeline built from it does, so records
/// decoded after the module was destroyed still resolve.
#[derive(Debug)]
pub struct ShaderRegistry {
    next_id: AtomicU32,
    state: RwLock<RegistryState>,
}

impl Default for ShaderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            state: RwLock::new(RegistryState::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the next id; ids are never reused.
    pub fn allocate_id(&self) -> ShaderId {
        ShaderId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, shader_id: ShaderId, original_bytecode: Arc<[u32]>) {
        let mut state = self.write();
        state.entries.insert(
            shader_id,
            Entry {
                record: ShaderRecord {
                    shader_id,
                    original_bytecode,
                    module: vk::ShaderModule::null(),
                    pipelines: Vec::new(),
                },
                module_alive: true,
            },
        );
    }

    /// Drops a record whose module never got created.
    pub fn discard(&self, shader_id: ShaderId) {
        self.write().entries.remove(&shader_id);
    }

    pub fn bind_module(&self, shader_id: ShaderId, module: vk::ShaderModule) {
        let mut state = self.write();
        if let Some(entry) = state.entries.get_mut(&shader_id) {
            entry.record.module = module;
            state.modules.insert(module, shader_id);
        }
    }

    pub fn shader_for_module(&self, module: vk::ShaderModule) -> Option<ShaderId> {
        self.read().modules.get(&module).copied()
    }

    pub fn get(&self, shader_id: ShaderId) -> Option<ShaderRecord> {
        self.read()
            .entries
            .get(&shader_id)
            .map(|e| e.record.clone())
    }

    pub fn add_pipeline(&self, shader_id: ShaderId, pipeline: vk::Pipeline) {
        let mut state = self.write();
        if let Some(entry) = state.entries.get_mut(&shader_id) {
            if !entry.record.pipelines.contains(&pipeline) {
                entry.record.pipelines.push(pipeline);
            }
        }
    }

    /// Returns the shader whose record went away with the module, if any.
    pub fn module_destroyed(&self, module: vk::ShaderModule) -> Option<ShaderId> {
        let mut state = self.write();
        let shader_id = state.modules.remove(&module)?;
        let entry = state.entries.get_mut(&shader_id)?;
        entry.module_alive = false;
        if !entry.is_dead() {
            return None;
        }
        state.entries.remove(&shader_id);
        debug!(%shader_id, "dropped shader record");
        Some(shader_id)
    }

    /// Returns the shaders whose records went away with the pipeline.
    pub fn pipeline_destroyed(
        &self,
        pipeline: vk::Pipeline,
        shader_ids: &[ShaderId],
    ) -> Vec<ShaderId> {
        let mut state = self.write();
        let mut dropped = Vec::new();
        for shader_id in shader_ids {
            let Some(entry) = state.entries.get_mut(shader_id) else {
                continue;
            };
            entry.record.pipelines.retain(|p| *p != pipeline);
            if entry.is_dead() {
                state.entries.remove(shader_id);
                debug!(%shader_id, "dropped shader record");
                dropped.push(*shader_id);
            }
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.entries.clear();
        state.modules.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn bytecode() -> Arc<[u32]> {
        Arc::from(vec![0x0723_0203, 0x0001_0300, 0, 1, 0])
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let registry = ShaderRegistry::new();
        assert_eq!(registry.allocate_id(), ShaderId(1));
        assert_eq!(registry.allocate_id(), ShaderId(2));
    }

    #[test]
    fn record_outlives_module_while_pipeline_exists() {
        let registry = ShaderRegistry::new();
        let id = registry.allocate_id();
        let module = vk::ShaderModule::from_raw(0x10);
        let pipeline = vk::Pipeline::from_raw(0x20);
        registry.register(id, bytecode());
        registry.bind_module(id, module);
        registry.add_pipeline(id, pipeline);
        assert_eq!(registry.shader_for_module(module), Some(id));

        assert_eq!(registry.module_destroyed(module), None);
        assert_eq!(registry.shader_for_module(module), None);
        let record = registry.get(id).unwrap();
        assert_eq!(record.pipelines, vec![pipeline]);
        assert_eq!(record.module, module);

        assert_eq!(registry.pipeline_destroyed(pipeline, &[id]), vec![id]);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn record_without_pipelines_goes_with_its_module() {
        let registry = ShaderRegistry::new();
        let id = registry.allocate_id();
        let module = vk::ShaderModule::from_raw(0x30);
        registry.register(id, bytecode());
        registry.bind_module(id, module);

        assert_eq!(registry.module_destroyed(module), Some(id));
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn pipeline_destruction_keeps_record_of_live_module() {
        let registry = ShaderRegistry::new();
        let id = registry.allocate_id();
        let module = vk::ShaderModule::from_raw(0x40);
        let pipeline = vk::Pipeline::from_raw(0x50);
        registry.register(id, bytecode());
        registry.bind_module(id, module);
        registry.add_pipeline(id, pipeline);

        assert!(registry.pipeline_destroyed(pipeline, &[id]).is_empty());
        assert!(registry.get(id).is_some());
        assert_eq!(registry.len(), 1);
    }
}
