//! Pipeline layouts and pipelines as seen by debug printf.
//!
//! Pipeline layouts are widened so that the debug set index (`bind_index`) is always a valid
//! slot: application set layouts come first, then empty placeholder layouts, then the debug
//! printf layout. Pipelines are tracked so a draw can find the layout it must bind against.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use ash::vk;

use crate::registry::ShaderId;

/// Upper bound on the descriptor set index debug printf will claim.
pub const MAX_ADJUSTED_BOUND_DESCRIPTOR_SETS: u32 = 33;

/// The reserved descriptor set index for a device reporting `max_bound_descriptor_sets`.
pub fn bind_index_for(max_bound_descriptor_sets: u32) -> u32 {
    max_bound_descriptor_sets
        .min(MAX_ADJUSTED_BOUND_DESCRIPTOR_SETS)
        .saturating_sub(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
    RayTracing,
}

impl PipelineKind {
    pub fn from_bind_point(bind_point: vk::PipelineBindPoint) -> Option<Self> {
        match bind_point {
            vk::PipelineBindPoint::GRAPHICS => Some(Self::Graphics),
            vk::PipelineBindPoint::COMPUTE => Some(Self::Compute),
            vk::PipelineBindPoint::RAY_TRACING_KHR => Some(Self::RayTracing),
            _ => None,
        }
    }

    pub fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            Self::Graphics => vk::PipelineBindPoint::GRAPHICS,
            Self::Compute => vk::PipelineBindPoint::COMPUTE,
            Self::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }

    /// How verbose messages label the n-th command of this kind.
    pub fn operation_label(self) -> &'static str {
        match self {
            Self::Graphics => "Draw Index",
            Self::Compute => "Compute Dispatch Index",
            Self::RayTracing => "Ray Trace Index",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStageModule {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
}

/// The shader stages of a pipeline create-info, by pipeline kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStages {
    Graphics(Vec<ShaderStageModule>),
    Compute(ShaderStageModule),
    RayTracing(Vec<ShaderStageModule>),
}

impl PipelineStages {
    pub fn kind(&self) -> PipelineKind {
        match self {
            Self::Graphics(_) => PipelineKind::Graphics,
            Self::Compute(_) => PipelineKind::Compute,
            Self::RayTracing(_) => PipelineKind::RayTracing,
        }
    }

    pub fn stage_count(&self) -> usize {
        match self {
            Self::Graphics(stages) | Self::RayTracing(stages) => stages.len(),
            Self::Compute(_) => 1,
        }
    }

    pub fn module(&self, stage: usize) -> Option<vk::ShaderModule> {
        self.stage(stage).map(|s| s.module)
    }

    /// Replaces the module of `stage`; returns `false` when there is no such stage.
    pub fn set_module(&mut self, stage: usize, module: vk::ShaderModule) -> bool {
        let slot = match self {
            Self::Graphics(stages) | Self::RayTracing(stages) => stages.get_mut(stage),
            Self::Compute(s) => (stage == 0).then_some(s),
        };
        match slot {
            Some(slot) => {
                slot.module = module;
                true
            }
            None => false,
        }
    }

    fn stage(&self, stage: usize) -> Option<&ShaderStageModule> {
        match self {
            Self::Graphics(stages) | Self::RayTracing(stages) => stages.get(stage),
            Self::Compute(s) => (stage == 0).then_some(s),
        }
    }
}

/// What a pipeline create hook sees and may modify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCreateDesc {
    pub layout: vk::PipelineLayout,
    pub stages: PipelineStages,
}

/// Descriptor set counts of a pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLayoutState {
    /// Sets declared by the application.
    pub app_set_count: u32,
    /// Sets in the layout actually created, including placeholders and the debug set.
    pub total_set_count: u32,
}

impl PipelineLayoutState {
    /// Whether the debug set can be bound at `bind_index` without disturbing application sets.
    pub fn can_bind_debug_set(&self, bind_index: u32) -> bool {
        self.app_set_count <= bind_index && bind_index < self.total_set_count
    }
}

/// Builds the widened set-layout list, or `None` when the application already uses `bind_index`.
pub fn widen_set_layouts(
    app_layouts: &[vk::DescriptorSetLayout],
    bind_index: u32,
    placeholder: vk::DescriptorSetLayout,
    debug_layout: vk::DescriptorSetLayout,
) -> Option<Vec<vk::DescriptorSetLayout>> {
    let bind_index = bind_index as usize;
    if app_layouts.len() > bind_index {
        return None;
    }
    let mut layouts = Vec::with_capacity(bind_index + 1);
    layouts.extend_from_slice(app_layouts);
    layouts.resize(bind_index, placeholder);
    layouts.push(debug_layout);
    Some(layouts)
}

/// A pipeline created while debug printf was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineState {
    pub kind: PipelineKind,
    pub layout: vk::PipelineLayout,
    /// Captured at creation; the layout object may be destroyed before the pipeline.
    pub layout_state: Option<PipelineLayoutState>,
    /// Instrumented shaders compiled into the pipeline.
    pub shader_ids: Vec<ShaderId>,
}

#[derive(Debug, Default)]
pub struct PipelineTracker {
    layouts: RwLock<HashMap<vk::PipelineLayout, PipelineLayoutState>>,
    pipelines: RwLock<HashMap<vk::Pipeline, PipelineState>>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn layouts(&self) -> RwLockWriteGuard<'_, HashMap<vk::PipelineLayout, PipelineLayoutState>> {
        self.layouts.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipelines(&self) -> RwLockWriteGuard<'_, HashMap<vk::Pipeline, PipelineState>> {
        self.pipelines.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_layout(&self, layout: vk::PipelineLayout, state: PipelineLayoutState) {
        self.layouts().insert(layout, state);
    }

    pub fn layout(&self, layout: vk::PipelineLayout) -> Option<PipelineLayoutState> {
        let layouts = self.layouts.read().unwrap_or_else(PoisonError::into_inner);
        layouts.get(&layout).copied()
    }

    pub fn remove_layout(&self, layout: vk::PipelineLayout) {
        self.layouts().remove(&layout);
    }

    pub fn insert_pipeline(&self, pipeline: vk::Pipeline, state: PipelineState) {
        self.pipelines().insert(pipeline, state);
    }

    pub fn pipeline(&self, pipeline: vk::Pipeline) -> Option<PipelineState> {
        let pipelines = self.pipelines.read().unwrap_or_else(PoisonError::into_inner);
        pipelines.get(&pipeline).cloned()
    }

    pub fn remove_pipeline(&self, pipeline: vk::Pipeline) -> Option<PipelineState> {
        self.pipelines().remove(&pipeline)
    }

    pub fn clear(&self) {
        self.layouts().clear();
        self.pipelines().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use pretty_assertions::assert_eq;

    fn layout(raw: u64) -> vk::DescriptorSetLayout {
        vk::DescriptorSetLayout::from_raw(raw)
    }

    #[test]
    fn bind_index_is_clamped() {
        assert_eq!(bind_index_for(4), 3);
        assert_eq!(bind_index_for(32), 31);
        assert_eq!(bind_index_for(1000), 32);
        assert_eq!(bind_index_for(0), 0);
    }

    #[test]
    fn widening_fills_with_placeholders() {
        let placeholder = layout(0xAA);
        let debug = layout(0xDD);
        let widened = widen_set_layouts(&[layout(1), layout(2)], 5, placeholder, debug).unwrap();
        assert_eq!(
            widened,
            vec![layout(1), layout(2), placeholder, placeholder, placeholder, debug]
        );

        // Already using the last slot below the reserved one.
        let widened = widen_set_layouts(&[layout(1), layout(2)], 2, placeholder, debug).unwrap();
        assert_eq!(widened, vec![layout(1), layout(2), debug]);
    }

    #[test]
    fn widening_is_refused_when_the_reserved_slot_is_taken() {
        let app: Vec<_> = (1..=4).map(layout).collect();
        assert_eq!(widen_set_layouts(&app, 3, layout(0xAA), layout(0xDD)), None);
    }

    #[test]
    fn layout_state_decides_bindability() {
        let widened = PipelineLayoutState {
            app_set_count: 2,
            total_set_count: 4,
        };
        assert!(widened.can_bind_debug_set(3));

        let full = PipelineLayoutState {
            app_set_count: 4,
            total_set_count: 4,
        };
        assert!(!full.can_bind_debug_set(3));
    }

    #[test]
    fn stages_can_be_swapped() {
        let vs = ShaderStageModule {
            stage: vk::ShaderStageFlags::VERTEX,
            module: vk::ShaderModule::from_raw(1),
        };
        let fs = ShaderStageModule {
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: vk::ShaderModule::from_raw(2),
        };
        let mut graphics = PipelineStages::Graphics(vec![vs, fs]);
        assert_eq!(graphics.kind(), PipelineKind::Graphics);
        assert_eq!(graphics.stage_count(), 2);
        assert!(graphics.set_module(1, vk::ShaderModule::from_raw(9)));
        assert_eq!(graphics.module(1), Some(vk::ShaderModule::from_raw(9)));
        assert!(!graphics.set_module(2, vk::ShaderModule::from_raw(9)));

        let mut compute = PipelineStages::Compute(vs);
        assert_eq!(compute.stage_count(), 1);
        assert_eq!(compute.module(1), None);
        assert!(compute.set_module(0, vk::ShaderModule::from_raw(7)));
        assert_eq!(compute.module(0), Some(vk::ShaderModule::from_raw(7)));
    }

    #[test]
    fn bind_points_round_trip() {
        for kind in [
            PipelineKind::Graphics,
            PipelineKind::Compute,
            PipelineKind::RayTracing,
        ] {
            assert_eq!(PipelineKind::from_bind_point(kind.bind_point()), Some(kind));
        }
    }
}
