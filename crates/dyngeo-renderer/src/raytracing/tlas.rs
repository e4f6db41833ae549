//! Top-level acceleration structure.

use bytemuck::{Pod, Zeroable};

use crate::error::{RtError, RtResult};

use super::blas::BottomLevelStructure;
use super::device::{
    AccelerationStructure, AccelerationStructureEncoder, AccelerationStructureKind, BuildFlags, BuildMode,
    BuildSizes, GpuAddress, GpuBuffer, RaytracingDevice, Transform3x4,
};
use super::stream::{UploadStream, FRAME_COUNT};

/// Instance flag disabling back-face culling, matching the API bit.
pub const INSTANCE_FLAG_TRIANGLE_CULL_DISABLE: u8 = 0x1;

/// One TLAS instance in the layout the GPU consumes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    pub transform: Transform3x4,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        Self::new(Transform3x4::IDENTITY, 0, 0)
    }
}

impl InstanceDesc {
    /// Create an instance of the BLAS at `blas_address`, visible to every ray.
    pub fn new(transform: Transform3x4, custom_index: u32, blas_address: GpuAddress) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & 0xFFFFFF),
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask = ((mask as u32) << 24) | (self.instance_custom_index_and_mask & 0xFFFFFF);
        self
    }

    /// Set the hit group base offset and instance flags.
    pub fn with_hit_group_offset(mut self, offset: u32, flags: u8) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags = ((flags as u32) << 24) | (offset & 0xFFFFFF);
        self
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFFFFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFFFFFF
    }
}

/// Per-instance fields that must match between a full build and a refit.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InstanceLayout {
    blas_address: GpuAddress,
    hit_group_offset: u32,
}

pub struct TopLevelStructure {
    build_flags: BuildFlags,
    sizes: BuildSizes,
    structure: Option<AccelerationStructure>,
    instance_descs: UploadStream<InstanceDesc>,
    built_layout: Option<Vec<InstanceLayout>>,
}

impl Default for TopLevelStructure {
    fn default() -> Self {
        Self::new()
    }
}

impl TopLevelStructure {
    pub fn new() -> Self {
        Self {
            build_flags: BuildFlags::empty(),
            sizes: BuildSizes::default(),
            structure: None,
            instance_descs: UploadStream::new("tlas instance descs"),
            built_layout: None,
        }
    }

    /// One instance per bottom-level structure, in list order.
    pub fn initialize<D: RaytracingDevice>(
        &mut self,
        device: &mut D,
        bottom_levels: &[BottomLevelStructure],
        build_flags: BuildFlags,
    ) -> RtResult<()> {
        if bottom_levels.is_empty() {
            return Err(RtError::invariant("TLAS needs at least one BLAS"));
        }
        self.release(device);

        let instance_count = bottom_levels.len() as u32;
        self.instance_descs.create(device, bottom_levels.len(), FRAME_COUNT)?;
        for (index, (desc, blas)) in self.instance_descs.staging_mut().iter_mut().zip(bottom_levels).enumerate() {
            *desc = InstanceDesc::new(blas.transform().into(), index as u32, blas.gpu_address())
                .with_hit_group_offset(
                    blas.instance_contribution_to_hit_group_index(),
                    INSTANCE_FLAG_TRIANGLE_CULL_DISABLE,
                );
        }

        self.sizes = device.tlas_build_sizes(instance_count, build_flags)?;
        self.structure = Some(device.create_acceleration_structure(
            AccelerationStructureKind::TopLevel,
            self.sizes.result_data_max_size,
            "tlas",
        )?);
        self.build_flags = build_flags;

        log::debug!(
            "TLAS: {} instances, result {} bytes, scratch {} / update {} bytes",
            instance_count,
            self.sizes.result_data_max_size,
            self.sizes.scratch_size,
            self.sizes.update_scratch_size
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.structure.is_some()
    }

    pub fn instance_count(&self) -> usize {
        self.instance_descs.len()
    }

    /// Staged instance descriptors, as they will be uploaded by the next build.
    pub fn instance_descs(&self) -> &[InstanceDesc] {
        self.instance_descs.staging()
    }

    /// Device address of the instance descriptors uploaded for `frame_index`.
    pub fn instance_descs_address(&self, frame_index: usize) -> Option<GpuAddress> {
        self.instance_descs.gpu_address(frame_index)
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

    /// Memory held for instance descriptors across all frames.
    pub fn instance_descs_size(&self) -> u64 {
        self.instance_descs.gpu_size()
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.structure.as_ref().map_or(0, |s| s.device_address)
    }

    pub fn has_completed_build(&self) -> bool {
        self.built_layout.is_some()
    }

    /// Whether a refit may be recorded against the current instances.
    pub fn can_update(&self) -> bool {
        self.build_flags.contains(BuildFlags::ALLOW_UPDATE)
            && self.built_layout.as_deref() == Some(self.current_layout().as_slice())
    }

    /// Stage every BLAS's current transform into its instance descriptor.
    pub fn update_instance_desc_transforms(&mut self, bottom_levels: &mut [BottomLevelStructure]) -> RtResult<()> {
        if bottom_levels.len() != self.instance_descs.len() {
            return Err(RtError::invariant(format!(
                "TLAS has {} instances but {} BLAS were given",
                self.instance_descs.len(),
                bottom_levels.len()
            )));
        }
        for (desc, blas) in self.instance_descs.staging_mut().iter_mut().zip(bottom_levels.iter_mut()) {
            desc.transform = blas.transform().into();
            blas.clear_dirty();
        }
        Ok(())
    }

    /// Upload the instance descriptors into the encoder's frame slot and
    /// record a build or refit.
    pub fn build<D: RaytracingDevice>(
        &mut self,
        device: &mut D,
        encoder: &mut D::Encoder,
        scratch: &GpuBuffer,
        do_update: bool,
    ) -> RtResult<BuildMode> {
        let structure = self
            .structure
            .as_ref()
            .ok_or_else(|| RtError::invariant("TLAS built before initialization"))?;
        if do_update && !self.can_update() {
            return Err(RtError::invariant(
                "refit requested for TLAS whose instances changed or which has no updatable full build",
            ));
        }
        let needed = if do_update { self.sizes.update_scratch_size } else { self.sizes.scratch_size };
        if scratch.size < needed {
            return Err(RtError::invariant(format!(
                "scratch of {} bytes too small for TLAS ({needed} needed)",
                scratch.size
            )));
        }

        let slot = encoder.frame_slot();
        self.instance_descs.copy_staging_to_gpu(device, slot)?;
        let instances = self
            .instance_descs
            .gpu_address(slot)
            .ok_or_else(|| RtError::invariant("TLAS instance descriptors were not allocated"))?;

        let mode = if do_update { BuildMode::Update } else { BuildMode::Build };
        encoder.build_top_level(
            structure,
            instances,
            self.instance_descs.len() as u32,
            self.build_flags,
            mode,
            scratch.device_address,
        );
        encoder.barrier();

        if mode == BuildMode::Build {
            self.built_layout = Some(self.current_layout());
        }
        Ok(mode)
    }

    pub fn release<D: RaytracingDevice>(&mut self, device: &mut D) {
        if let Some(structure) = self.structure.take() {
            device.destroy_acceleration_structure(structure);
        }
        self.instance_descs.release(device);
        self.built_layout = None;
        self.sizes = BuildSizes::default();
    }

    fn current_layout(&self) -> Vec<InstanceLayout> {
        self.instance_descs
            .staging()
            .iter()
            .map(|d| InstanceLayout {
                blas_address: d.acceleration_structure_reference,
                hit_group_offset: d.hit_group_offset(),
            })
            .collect()
    }
}
