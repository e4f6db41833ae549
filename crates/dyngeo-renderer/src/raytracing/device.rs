//! Seam between the acceleration-structure core and a GPU backend.
//!
//! The core never talks to a graphics API directly. It allocates buffers,
//! queries build requirements and records build commands through
//! [`RaytracingDevice`] and [`AccelerationStructureEncoder`]. The Vulkan
//! backend and the in-memory recording device both implement these.

use bytemuck::{Pod, Zeroable};

use crate::error::RtResult;

/// GPU virtual address.
pub type GpuAddress = u64;

bitflags::bitflags! {
    /// Acceleration structure build preferences.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BuildFlags: u32 {
        const PREFER_FAST_TRACE = 1 << 0;
        const PREFER_FAST_BUILD = 1 << 1;
        /// Required on the full build for any later refit.
        const ALLOW_UPDATE = 1 << 2;
        const MINIMIZE_MEMORY = 1 << 3;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const SCRATCH = 1 << 0;
        const BUILD_INPUT = 1 << 1;
        const SHADER_BINDING_TABLE = 1 << 2;
        const STORAGE = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
    }
}

/// Full rebuild or in-place refit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    Build,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn size_in_bytes(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    GpuOnly,
    /// Host-visible, written by the CPU every frame.
    CpuToGpu,
}

/// Sizes reported by the device for one build description.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BuildSizes {
    pub result_data_max_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

impl BuildSizes {
    /// Scratch needed to either build or refit.
    pub fn required_scratch_size(&self) -> u64 {
        self.scratch_size.max(self.update_scratch_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// A device buffer. Not `Clone`: exactly one owner releases it.
#[derive(Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    pub id: BufferId,
    pub size: u64,
    pub device_address: GpuAddress,
}

impl GpuBuffer {
    pub fn at(&self, offset: u64) -> GpuAddress {
        self.device_address + offset
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    /// Minimum alignment of the device address.
    pub alignment: u64,
}

/// A device acceleration structure and its backing storage.
#[derive(Debug, PartialEq, Eq)]
pub struct AccelerationStructure {
    pub raw: u64,
    pub kind: AccelerationStructureKind,
    pub size: u64,
    pub device_address: GpuAddress,
}

/// One triangle geometry inside a bottom-level build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasGeometryDesc {
    pub vertex_address: GpuAddress,
    pub vertex_count: u32,
    pub vertex_stride: u32,
    pub index_address: GpuAddress,
    pub index_count: u32,
    pub index_format: IndexFormat,
    /// Address of a [`Transform3x4`] applied to the geometry during the build.
    pub transform_address: Option<GpuAddress>,
    pub opaque: bool,
}

impl BlasGeometryDesc {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Row-major 3x4 affine transform, the layout GPUs consume for geometry and
/// instance transforms.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Transform3x4 {
    pub rows: [[f32; 4]; 3],
}

impl Transform3x4 {
    pub const IDENTITY: Self = Self {
        rows: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ],
    };

    pub fn to_mat4(&self) -> glam::Mat4 {
        glam::Mat4::from_cols_array_2d(&[
            self.rows[0],
            self.rows[1],
            self.rows[2],
            [0.0, 0.0, 0.0, 1.0],
        ])
        .transpose()
    }
}

impl Default for Transform3x4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<glam::Mat4> for Transform3x4 {
    fn from(m: glam::Mat4) -> Self {
        let t = m.transpose();
        Self {
            rows: [t.x_axis.to_array(), t.y_axis.to_array(), t.z_axis.to_array()],
        }
    }
}

/// Opaque shader identifier returned by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderIdentifier(pub Vec<u8>);

/// Shader record layout constraints of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroupLayout {
    pub identifier_size: u32,
    /// Record stride must be a multiple of this.
    pub record_alignment: u32,
    /// Table start addresses must be a multiple of this.
    pub table_alignment: u32,
}

/// Records acceleration structure commands into one command stream.
pub trait AccelerationStructureEncoder {
    /// Frame-in-flight slot this encoder records into. Per-frame upload
    /// slices of this slot are free to overwrite once the encoder exists.
    fn frame_slot(&self) -> usize;

    /// In `Update` mode the structure is refit in place and must have been
    /// fully built before with `ALLOW_UPDATE`.
    fn build_bottom_level(
        &mut self,
        target: &AccelerationStructure,
        geometries: &[BlasGeometryDesc],
        flags: BuildFlags,
        mode: BuildMode,
        scratch: GpuAddress,
    );

    fn build_top_level(
        &mut self,
        target: &AccelerationStructure,
        instances: GpuAddress,
        instance_count: u32,
        flags: BuildFlags,
        mode: BuildMode,
        scratch: GpuAddress,
    );

    /// Orders the previous build before the next one. Needed between builds
    /// that share scratch memory and before a TLAS build reads BLAS results.
    fn barrier(&mut self);
}

/// Device/resource layer consumed by the acceleration-structure core.
pub trait RaytracingDevice {
    type Encoder: AccelerationStructureEncoder;

    /// Query result and scratch sizes for a bottom-level description.
    fn blas_build_sizes(&self, geometries: &[BlasGeometryDesc], flags: BuildFlags) -> RtResult<BuildSizes>;

    fn tlas_build_sizes(&self, instance_count: u32, flags: BuildFlags) -> RtResult<BuildSizes>;

    fn create_buffer(&mut self, desc: &BufferDesc) -> RtResult<GpuBuffer>;

    /// Write into a `CpuToGpu` buffer.
    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RtResult<()>;

    fn destroy_buffer(&mut self, buffer: GpuBuffer);

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        size: u64,
        name: &str,
    ) -> RtResult<AccelerationStructure>;

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure);

    /// Wait until the next frame slot has retired on the GPU and start
    /// recording into it.
    fn begin_commands(&mut self) -> RtResult<Self::Encoder>;

    /// Submit the recorded commands and advance to the next frame slot.
    fn submit_commands(&mut self, encoder: Self::Encoder) -> RtResult<()>;

    /// Block until the GPU has finished all submitted work.
    fn wait_idle(&mut self) -> RtResult<()>;

    fn shader_group_layout(&self) -> ShaderGroupLayout;

    /// Identifiers of the first `group_count` shader groups of the bound pipeline.
    fn shader_identifiers(&self, group_count: u32) -> RtResult<Vec<ShaderIdentifier>>;
}

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
