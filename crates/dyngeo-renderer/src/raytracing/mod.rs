//! Acceleration structure lifecycle and shader binding tables.

pub mod blas;
pub mod device;
pub mod hit_groups;
pub mod recording;
pub mod sbt;
pub mod scheduler;
pub mod stream;
pub mod tlas;

pub use blas::{BottomLevelStructure, GeometryInstance};
pub use device::{AccelerationStructureEncoder, BuildFlags, BuildMode, RaytracingDevice};
pub use hit_groups::{HitGroupLayout, RayGenShaderType, RayType};
pub use recording::RecordingDevice;
pub use sbt::{ShaderBindingTableBuilder, ShaderBindingTables, UploadedShaderTables};
pub use scheduler::{AccelerationStructureScheduler, FrameReport, RebuildRequests, UpdateMode};
pub use stream::{GeometryTransformStream, UploadStream, FRAME_COUNT};
pub use tlas::TopLevelStructure;
