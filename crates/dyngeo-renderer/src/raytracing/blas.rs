//! Bottom-level acceleration structures.

use std::ops::Range;

use glam::Mat4;

use crate::error::{RtError, RtResult};

use super::device::{
    AccelerationStructure, AccelerationStructureEncoder, AccelerationStructureKind, BlasGeometryDesc, BuildFlags,
    BuildMode, BuildSizes, GpuAddress, GpuBuffer, IndexFormat, RaytracingDevice, Transform3x4,
};
use super::sbt::MaterialConstants;

/// A range of an index/vertex buffer pair placed into a bottom-level structure.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryInstance {
    pub vertex_buffer: GpuAddress,
    pub vertex_range: Range<u32>,
    pub vertex_stride: u32,
    pub index_buffer: GpuAddress,
    pub index_range: Range<u32>,
    pub index_format: IndexFormat,
    /// Descriptor slot of the index buffer. The vertex buffer sits in the next slot.
    pub index_descriptor: u32,
    /// Element of the geometry transform stream applied during the build.
    pub transform_slot: Option<u32>,
    pub material: MaterialConstants,
}

impl GeometryInstance {
    pub fn vertex_count(&self) -> u32 {
        self.vertex_range.len() as u32
    }

    pub fn index_count(&self) -> u32 {
        self.index_range.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count() / 3
    }

    pub fn vertex_descriptor(&self) -> u32 {
        self.index_descriptor + 1
    }

    /// Address of the first vertex used by this instance.
    pub fn vertex_address(&self) -> GpuAddress {
        self.vertex_buffer + self.vertex_range.start as u64 * self.vertex_stride as u64
    }

    /// Address of the first index used by this instance.
    pub fn index_address(&self) -> GpuAddress {
        self.index_buffer + self.index_range.start as u64 * self.index_format.size_in_bytes()
    }

    fn to_desc(&self, transforms: Option<GpuAddress>) -> BlasGeometryDesc {
        BlasGeometryDesc {
            vertex_address: self.vertex_address(),
            vertex_count: self.vertex_count(),
            vertex_stride: self.vertex_stride,
            index_address: self.index_address(),
            index_count: self.index_count(),
            index_format: self.index_format,
            transform_address: match (transforms, self.transform_slot) {
                (Some(base), Some(slot)) => {
                    Some(base + slot as u64 * std::mem::size_of::<Transform3x4>() as u64)
                }
                _ => None,
            },
            opaque: true,
        }
    }
}

pub struct BottomLevelStructure {
    name: String,
    geometry_instances: Vec<GeometryInstance>,
    build_flags: BuildFlags,
    sizes: BuildSizes,
    structure: Option<AccelerationStructure>,
    transform: Mat4,
    instance_contribution_to_hit_group_index: u32,
    dirty: bool,
    built: bool,
}

impl BottomLevelStructure {
    /// Query build sizes for `geometry_instances` and allocate the result storage.
    pub fn initialize<D: RaytracingDevice>(
        device: &mut D,
        name: impl Into<String>,
        geometry_instances: Vec<GeometryInstance>,
        build_flags: BuildFlags,
    ) -> RtResult<Self> {
        let name = name.into();
        if geometry_instances.is_empty() {
            return Err(RtError::invariant(format!("BLAS '{name}' has no geometry")));
        }
        if let Some(bad) = geometry_instances.iter().find(|g| g.index_count() == 0 || g.index_count() % 3 != 0) {
            return Err(RtError::invariant(format!(
                "BLAS '{name}' geometry has {} indices, not a whole number of triangles",
                bad.index_count()
            )));
        }

        let descs: Vec<BlasGeometryDesc> = geometry_instances.iter().map(|g| g.to_desc(None)).collect();
        let sizes = device.blas_build_sizes(&descs, build_flags)?;
        let structure = device.create_acceleration_structure(
            AccelerationStructureKind::BottomLevel,
            sizes.result_data_max_size,
            &name,
        )?;

        log::debug!(
            "BLAS '{}': {} geometries, result {} bytes, scratch {} / update {} bytes",
            name,
            geometry_instances.len(),
            sizes.result_data_max_size,
            sizes.scratch_size,
            sizes.update_scratch_size
        );

        Ok(Self {
            name,
            geometry_instances,
            build_flags,
            sizes,
            structure: Some(structure),
            transform: Mat4::IDENTITY,
            instance_contribution_to_hit_group_index: 0,
            dirty: true,
            built: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn geometry_instances(&self) -> &[GeometryInstance] {
        &self.geometry_instances
    }

    pub fn geometry_count(&self) -> usize {
        self.geometry_instances.len()
    }

    pub fn triangle_count(&self) -> u64 {
        self.geometry_instances.iter().map(|g| g.triangle_count() as u64).sum()
    }

    pub fn build_flags(&self) -> BuildFlags {
        self.build_flags
    }

    pub fn sizes(&self) -> BuildSizes {
        self.sizes
    }

    pub fn required_result_data_size(&self) -> u64 {
        self.sizes.result_data_max_size
    }

    pub fn required_scratch_size(&self) -> u64 {
        self.sizes.required_scratch_size()
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.structure.as_ref().map_or(0, |s| s.device_address)
    }

    /// Instance transform used by the top-level structure.
    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
        self.dirty = true;
    }

    /// Whether the transform changed since the top level last staged it.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn instance_contribution_to_hit_group_index(&self) -> u32 {
        self.instance_contribution_to_hit_group_index
    }

    pub fn set_instance_contribution_to_hit_group_index(&mut self, contribution: u32) {
        self.instance_contribution_to_hit_group_index = contribution;
    }

    pub fn has_completed_build(&self) -> bool {
        self.built
    }

    /// Whether a refit may be recorded now.
    pub fn can_update(&self) -> bool {
        self.built && self.build_flags.contains(BuildFlags::ALLOW_UPDATE)
    }

    /// Record a full build or a refit followed by a barrier, so the next
    /// build may reuse `scratch`.
    ///
    /// `transforms` is the current frame's geometry transform stream, if any.
    pub fn build<E: AccelerationStructureEncoder>(
        &mut self,
        encoder: &mut E,
        scratch: &GpuBuffer,
        transforms: Option<GpuAddress>,
        do_update: bool,
    ) -> RtResult<BuildMode> {
        let structure = self
            .structure
            .as_ref()
            .ok_or_else(|| RtError::invariant(format!("BLAS '{}' was released", self.name)))?;
        if do_update && !self.can_update() {
            return Err(RtError::invariant(format!(
                "refit requested for BLAS '{}' which has no updatable full build",
                self.name
            )));
        }
        let needed = if do_update { self.sizes.update_scratch_size } else { self.sizes.scratch_size };
        if scratch.size < needed {
            return Err(RtError::invariant(format!(
                "scratch of {} bytes too small for BLAS '{}' ({} needed)",
                scratch.size, self.name, needed
            )));
        }
        if self.geometry_instances.iter().any(|g| g.transform_slot.is_some()) && transforms.is_none() {
            return Err(RtError::invariant(format!("BLAS '{}' needs geometry transforms", self.name)));
        }

        let mode = if do_update { BuildMode::Update } else { BuildMode::Build };
        let descs: Vec<BlasGeometryDesc> = self.geometry_instances.iter().map(|g| g.to_desc(transforms)).collect();
        encoder.build_bottom_level(structure, &descs, self.build_flags, mode, scratch.device_address);
        encoder.barrier();

        if mode == BuildMode::Build {
            self.built = true;
        }
        Ok(mode)
    }

    pub fn release<D: RaytracingDevice>(&mut self, device: &mut D) {
        if let Some(structure) = self.structure.take() {
            device.destroy_acceleration_structure(structure);
        }
        self.built = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raytracing::device::{BufferDesc, BufferUsage, MemoryLocation};
    use crate::raytracing::recording::{RecordedCommand, RecordingDevice};
    use glam::Vec3;

    fn instance(index_count: u32, transform_slot: Option<u32>) -> GeometryInstance {
        GeometryInstance {
            vertex_buffer: 0x10_0000,
            vertex_range: 0..24,
            vertex_stride: 32,
            index_buffer: 0x20_0000,
            index_range: 0..index_count,
            index_format: IndexFormat::U16,
            index_descriptor: 0,
            transform_slot,
            material: MaterialConstants::default(),
        }
    }

    fn scratch(device: &mut RecordingDevice, blas: &BottomLevelStructure) -> GpuBuffer {
        device
            .create_buffer(&BufferDesc {
                name: "scratch",
                size: blas.required_scratch_size(),
                usage: BufferUsage::SCRATCH,
                location: MemoryLocation::GpuOnly,
                alignment: 256,
            })
            .unwrap()
    }

    #[test]
    fn test_initialize_reports_device_sizes() {
        let mut device = RecordingDevice::new();
        let blas =
            BottomLevelStructure::initialize(&mut device, "sphere", vec![instance(36, None)], BuildFlags::ALLOW_UPDATE)
                .unwrap();
        assert!(blas.required_result_data_size() > 0);
        assert!(blas.required_scratch_size() >= blas.sizes().update_scratch_size);
        assert!(blas.is_dirty());
        assert!(!blas.has_completed_build());
        assert_eq!(device.live_structure_count(), 1);
    }

    #[test]
    fn test_rejects_partial_triangles() {
        let mut device = RecordingDevice::new();
        let result = BottomLevelStructure::initialize(&mut device, "bad", vec![instance(7, None)], BuildFlags::empty());
        assert!(matches!(result, Err(RtError::InvariantViolation(_))));
        assert!(BottomLevelStructure::initialize(&mut device, "empty", vec![], BuildFlags::empty()).is_err());
    }

    #[test]
    fn test_refit_before_first_build_is_an_error() {
        let mut device = RecordingDevice::new();
        let mut blas =
            BottomLevelStructure::initialize(&mut device, "sphere", vec![instance(36, None)], BuildFlags::ALLOW_UPDATE)
                .unwrap();
        let scratch = scratch(&mut device, &blas);
        let mut encoder = device.begin_commands().unwrap();
        assert!(blas.build(&mut encoder, &scratch, None, true).is_err());
        assert!(encoder.commands().is_empty());
    }

    #[test]
    fn test_refit_needs_allow_update() {
        let mut device = RecordingDevice::new();
        let flags = BuildFlags::PREFER_FAST_TRACE;
        let instances = vec![instance(36, None)];
        let mut blas = BottomLevelStructure::initialize(&mut device, "sphere", instances, flags).unwrap();
        let scratch = scratch(&mut device, &blas);
        let mut encoder = device.begin_commands().unwrap();
        blas.build(&mut encoder, &scratch, None, false).unwrap();
        assert!(!blas.can_update());
        assert!(blas.build(&mut encoder, &scratch, None, true).is_err());
    }

    #[test]
    fn test_build_then_refit_records_barriers() {
        let mut device = RecordingDevice::new();
        let mut blas =
            BottomLevelStructure::initialize(&mut device, "sphere", vec![instance(36, None)], BuildFlags::ALLOW_UPDATE)
                .unwrap();
        let scratch = scratch(&mut device, &blas);
        let mut encoder = device.begin_commands().unwrap();
        assert_eq!(blas.build(&mut encoder, &scratch, None, false).unwrap(), BuildMode::Build);
        assert!(blas.has_completed_build());
        assert_eq!(blas.build(&mut encoder, &scratch, None, true).unwrap(), BuildMode::Update);

        let commands = encoder.commands();
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0].mode(), Some(BuildMode::Build));
        assert!(commands[1].is_barrier());
        assert_eq!(commands[2].mode(), Some(BuildMode::Update));
        assert!(commands[3].is_barrier());
        device.submit_commands(encoder).unwrap();
    }

    #[test]
    fn test_geometry_transform_addresses_follow_slots() {
        let mut device = RecordingDevice::new();
        let instances = vec![instance(36, Some(0)), instance(36, Some(3))];
        let mut blas =
            BottomLevelStructure::initialize(&mut device, "spheres", instances, BuildFlags::empty()).unwrap();
        let scratch = scratch(&mut device, &blas);
        let mut encoder = device.begin_commands().unwrap();
        assert!(blas.build(&mut encoder, &scratch, None, false).is_err());
        blas.build(&mut encoder, &scratch, Some(0x4000), false).unwrap();

        let RecordedCommand::BuildBottomLevel { geometries, .. } = &encoder.commands()[0] else {
            panic!("expected a bottom-level build");
        };
        assert_eq!(geometries[0].transform_address, Some(0x4000));
        assert_eq!(geometries[1].transform_address, Some(0x4000 + 3 * 48));
    }

    #[test]
    fn test_set_transform_marks_dirty() {
        let mut device = RecordingDevice::new();
        let mut blas =
            BottomLevelStructure::initialize(&mut device, "sphere", vec![instance(36, None)], BuildFlags::empty())
                .unwrap();
        blas.clear_dirty();
        let moved = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        blas.set_transform(moved);
        assert!(blas.is_dirty());
        assert_eq!(blas.transform(), moved);
    }

    #[test]
    fn test_instance_addresses_honor_ranges() {
        let mut g = instance(36, None);
        g.vertex_range = 10..20;
        g.index_range = 6..42;
        assert_eq!(g.vertex_address(), 0x10_0000 + 10 * 32);
        assert_eq!(g.index_address(), 0x20_0000 + 6 * 2);
        assert_eq!(g.triangle_count(), 12);
        assert_eq!(g.vertex_descriptor(), g.index_descriptor + 1);
    }

    #[test]
    fn test_release_destroys_structure() {
        let mut device = RecordingDevice::new();
        let mut blas =
            BottomLevelStructure::initialize(&mut device, "sphere", vec![instance(36, None)], BuildFlags::empty())
                .unwrap();
        blas.release(&mut device);
        assert_eq!(device.live_structure_count(), 0);
        assert_eq!(blas.gpu_address(), 0);
    }
}
