use ash::vk;
use gpuav_spirv::SpirvError;
use thiserror::Error;

/// Problems that stop debug printf from running on a device at all.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SetupError {
    #[error("debug printf requires Vulkan 1.1 or later (device reports {major}.{minor})")]
    ApiVersionTooOld { major: u32, minor: u32 },

    #[error(
        "debug printf requires the vertexPipelineStoresAndAtomics and fragmentStoresAndAtomics features"
    )]
    MissingStoresAndAtomics,

    #[error("device can bind {0} descriptor set(s); debug printf needs at least 2")]
    TooFewDescriptorSets(u32),

    #[error("failed to create a debug printf descriptor set layout: {0}")]
    DescriptorSetLayout(vk::Result),

    #[error("no pipeline is bound at {0:?} when recording an instrumented command")]
    NoBoundPipeline(vk::PipelineBindPoint),
}

/// Failures while creating or accessing device objects owned by debug printf.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("unable to create descriptor pool: {0}")]
    DescriptorPool(vk::Result),

    #[error("unable to allocate descriptor sets: {0}")]
    DescriptorSets(vk::Result),

    #[error("unable to allocate the output buffer: {0}")]
    OutputBuffer(vk::Result),

    #[error("unable to access output buffer memory: {0}")]
    MemoryAccess(vk::Result),

    #[error("unable to create the host-read barrier command buffer: {0}")]
    BarrierCommandBuffer(vk::Result),

    #[error("submitting the host-read barrier failed: {0}")]
    BarrierSubmit(vk::Result),

    #[error("waiting for the queue to go idle failed: {0}")]
    QueueWaitIdle(vk::Result),
}

/// Why a shader module was left uninstrumented.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InstrumentationError {
    #[error("shader module is not valid SPIR-V: {0}")]
    InvalidInput(SpirvError),

    #[error("shader rewrite failed: {0}")]
    RewriteFailed(String),

    #[error("instrumented shader module failed validation: {0}")]
    InvalidOutput(SpirvError),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    #[error("format string needs more values than the record carries (at value word {position})")]
    ValuesExhausted { position: usize },
}
