/// SPIR-V execution models that can appear as a shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ExecutionModel {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    GlCompute,
    Kernel,
    TaskNv,
    MeshNv,
    RayGeneration,
    Intersection,
    AnyHit,
    ClosestHit,
    Miss,
    Callable,
    TaskExt,
    MeshExt,
}

impl ExecutionModel {
    /// Decodes the numeric `ExecutionModel` value.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Vertex,
            1 => Self::TessellationControl,
            2 => Self::TessellationEvaluation,
            3 => Self::Geometry,
            4 => Self::Fragment,
            5 => Self::GlCompute,
            6 => Self::Kernel,
            5267 => Self::TaskNv,
            5268 => Self::MeshNv,
            5313 => Self::RayGeneration,
            5314 => Self::Intersection,
            5315 => Self::AnyHit,
            5316 => Self::ClosestHit,
            5317 => Self::Miss,
            5318 => Self::Callable,
            5364 => Self::TaskExt,
            5365 => Self::MeshExt,
            _ => return None,
        })
    }

    /// The numeric `ExecutionModel` value.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Vertex => 0,
            Self::TessellationControl => 1,
            Self::TessellationEvaluation => 2,
            Self::Geometry => 3,
            Self::Fragment => 4,
            Self::GlCompute => 5,
            Self::Kernel => 6,
            Self::TaskNv => 5267,
            Self::MeshNv => 5268,
            Self::RayGeneration => 5313,
            Self::Intersection => 5314,
            Self::AnyHit => 5315,
            Self::ClosestHit => 5316,
            Self::Miss => 5317,
            Self::Callable => 5318,
            Self::TaskExt => 5364,
            Self::MeshExt => 5365,
        }
    }

    /// Human-readable stage name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "Vertex",
            Self::TessellationControl => "Tessellation Control",
            Self::TessellationEvaluation => "Tessellation Eval",
            Self::Geometry => "Geometry",
            Self::Fragment => "Fragment",
            Self::GlCompute => "Compute",
            Self::Kernel => "Kernel",
            Self::TaskNv | Self::TaskExt => "Task",
            Self::MeshNv | Self::MeshExt => "Mesh",
            Self::RayGeneration => "Ray Generation",
            Self::Intersection => "Intersection",
            Self::AnyHit => "Any Hit",
            Self::ClosestHit => "Closest Hit",
            Self::Miss => "Miss",
            Self::Callable => "Callable",
        }
    }
}
