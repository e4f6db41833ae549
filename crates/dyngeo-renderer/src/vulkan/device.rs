//! [`RaytracingDevice`] on top of the Vulkan context.

use std::collections::HashMap;

use ash::khr::acceleration_structure;
use ash::vk;
use ash::vk::Handle;

use crate::error::{RtError, RtResult};
use crate::raytracing::device::{
    AccelerationStructure, AccelerationStructureEncoder, AccelerationStructureKind, BlasGeometryDesc, BufferDesc,
    BufferId, BufferUsage, BuildFlags, BuildMode, BuildSizes, GpuAddress, GpuBuffer, IndexFormat, MemoryLocation,
    RaytracingDevice, ShaderGroupLayout, ShaderIdentifier,
};
use crate::raytracing::stream::FRAME_COUNT;

use super::commands::{acceleration_structure_barrier, CommandRing};
use super::memory::{Buffer, MemoryManager};
use super::VulkanContext;

fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut vk_flags = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(BuildFlags::MINIMIZE_MEMORY) {
        vk_flags |= vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY;
    }
    vk_flags
}

fn build_mode(mode: BuildMode) -> vk::BuildAccelerationStructureModeKHR {
    match mode {
        BuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
        BuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
    }
}

fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

fn structure_type(kind: AccelerationStructureKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelerationStructureKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelerationStructureKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.intersects(BufferUsage::SCRATCH | BufferUsage::STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::BUILD_INPUT) {
        flags |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::SHADER_BINDING_TABLE) {
        flags |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    flags
}

fn memory_location(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
    }
}

fn triangle_geometry(desc: &BlasGeometryDesc) -> vk::AccelerationStructureGeometryKHR<'static> {
    let mut triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: desc.vertex_address })
        .vertex_stride(desc.vertex_stride as vk::DeviceSize)
        .max_vertex(desc.vertex_count.saturating_sub(1))
        .index_type(index_type(desc.index_format))
        .index_data(vk::DeviceOrHostAddressConstKHR { device_address: desc.index_address });
    if let Some(transform) = desc.transform_address {
        triangles = triangles.transform_data(vk::DeviceOrHostAddressConstKHR { device_address: transform });
    }

    let flags = if desc.opaque { vk::GeometryFlagsKHR::OPAQUE } else { vk::GeometryFlagsKHR::empty() };
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(flags)
}

fn instance_geometry(instances: GpuAddress) -> vk::AccelerationStructureGeometryKHR<'static> {
    let data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR { device_address: instances });
    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data })
}

fn sizes_from(info: &vk::AccelerationStructureBuildSizesInfoKHR, flags: BuildFlags) -> BuildSizes {
    BuildSizes {
        result_data_max_size: info.acceleration_structure_size,
        scratch_size: info.build_scratch_size,
        update_scratch_size: if flags.contains(BuildFlags::ALLOW_UPDATE) { info.update_scratch_size } else { 0 },
    }
}

/// Records builds into the current frame's command buffer.
pub struct VulkanEncoder {
    device: ash::Device,
    loader: acceleration_structure::Device,
    command_buffer: vk::CommandBuffer,
    slot: usize,
}

impl AccelerationStructureEncoder for VulkanEncoder {
    fn frame_slot(&self) -> usize {
        self.slot
    }

    fn build_bottom_level(
        &mut self,
        target: &AccelerationStructure,
        geometries: &[BlasGeometryDesc],
        flags: BuildFlags,
        mode: BuildMode,
        scratch: GpuAddress,
    ) {
        let handle = vk::AccelerationStructureKHR::from_raw(target.raw);
        let vk_geometries: Vec<_> = geometries.iter().map(triangle_geometry).collect();
        let ranges: Vec<_> = geometries
            .iter()
            .map(|g| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(g.triangle_count()))
            .collect();

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(build_flags(flags))
            .mode(build_mode(mode))
            .dst_acceleration_structure(handle)
            .geometries(&vk_geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch });
        if mode == BuildMode::Update {
            build_info = build_info.src_acceleration_structure(handle);
        }

        unsafe {
            self.loader
                .cmd_build_acceleration_structures(self.command_buffer, &[build_info], &[ranges.as_slice()]);
        }
    }

    fn build_top_level(
        &mut self,
        target: &AccelerationStructure,
        instances: GpuAddress,
        instance_count: u32,
        flags: BuildFlags,
        mode: BuildMode,
        scratch: GpuAddress,
    ) {
        let handle = vk::AccelerationStructureKHR::from_raw(target.raw);
        let geometries = [instance_geometry(instances)];
        let ranges = [vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(instance_count)];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(build_flags(flags))
            .mode(build_mode(mode))
            .dst_acceleration_structure(handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch });
        if mode == BuildMode::Update {
            build_info = build_info.src_acceleration_structure(handle);
        }

        unsafe {
            self.loader
                .cmd_build_acceleration_structures(self.command_buffer, &[build_info], &[ranges.as_slice()]);
        }
    }

    fn barrier(&mut self) {
        unsafe { acceleration_structure_barrier(&self.device, self.command_buffer) };
    }
}

struct StructureEntry {
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
}

/// Hardware ray tracing device.
///
/// Shader identifiers come from the ray tracing pipeline set with
/// [`VulkanDevice::set_pipeline`]; pipeline creation happens elsewhere.
pub struct VulkanDevice {
    memory: MemoryManager,
    commands: CommandRing,
    buffers: HashMap<BufferId, Buffer>,
    structures: HashMap<u64, StructureEntry>,
    next_buffer_id: u64,
    pipeline: Option<vk::Pipeline>,
    // Dropped last: everything above holds handles into it.
    ctx: VulkanContext,
}

impl VulkanDevice {
    pub fn new(enable_validation: bool) -> RtResult<Self> {
        let ctx = unsafe { VulkanContext::new(enable_validation)? };
        let memory = MemoryManager::new(&ctx)?;
        let commands = CommandRing::new(&ctx, FRAME_COUNT)?;
        Ok(Self {
            memory,
            commands,
            buffers: HashMap::new(),
            structures: HashMap::new(),
            next_buffer_id: 1,
            pipeline: None,
            ctx,
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    pub fn set_pipeline(&mut self, pipeline: Option<vk::Pipeline>) {
        self.pipeline = pipeline;
    }

    fn query_sizes(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        geometries: &[vk::AccelerationStructureGeometryKHR],
        primitive_counts: &[u32],
        flags: BuildFlags,
    ) -> BuildSizes {
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(build_flags(flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(geometries);
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.accel_struct_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                primitive_counts,
                &mut size_info,
            );
        }
        sizes_from(&size_info, flags)
    }
}

impl RaytracingDevice for VulkanDevice {
    type Encoder = VulkanEncoder;

    fn blas_build_sizes(&self, geometries: &[BlasGeometryDesc], flags: BuildFlags) -> RtResult<BuildSizes> {
        let caps = &self.ctx.rt_capabilities;
        if geometries.len() as u64 > caps.max_geometry_count {
            return Err(RtError::BuildRejected {
                what: "bottom-level acceleration structure".into(),
                reason: format!(
                    "{} geometries exceed the device limit of {}",
                    geometries.len(),
                    caps.max_geometry_count
                ),
            });
        }
        let triangles: u64 = geometries.iter().map(|g| g.triangle_count() as u64).sum();
        if triangles > caps.max_primitive_count {
            return Err(RtError::BuildRejected {
                what: "bottom-level acceleration structure".into(),
                reason: format!("{triangles} triangles exceed the device limit of {}", caps.max_primitive_count),
            });
        }

        let vk_geometries: Vec<_> = geometries.iter().map(triangle_geometry).collect();
        let counts: Vec<u32> = geometries.iter().map(BlasGeometryDesc::triangle_count).collect();
        Ok(self.query_sizes(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, &vk_geometries, &counts, flags))
    }

    fn tlas_build_sizes(&self, instance_count: u32, flags: BuildFlags) -> RtResult<BuildSizes> {
        let max = self.ctx.rt_capabilities.max_instance_count;
        if instance_count as u64 > max {
            return Err(RtError::BuildRejected {
                what: "top-level acceleration structure".into(),
                reason: format!("{instance_count} instances exceed the device limit of {max}"),
            });
        }
        let geometries = [instance_geometry(0)];
        Ok(self.query_sizes(vk::AccelerationStructureTypeKHR::TOP_LEVEL, &geometries, &[instance_count], flags))
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RtResult<GpuBuffer> {
        if desc.size == 0 {
            return Err(RtError::Allocation { what: desc.name.to_string(), reason: "zero-sized buffer".into() });
        }
        let alignment = if desc.usage.contains(BufferUsage::SCRATCH) {
            desc.alignment.max(self.ctx.rt_capabilities.min_scratch_offset_alignment as u64)
        } else {
            desc.alignment
        };
        let buffer = unsafe {
            self.memory.create_buffer(
                desc.size,
                buffer_usage(desc.usage),
                memory_location(desc.location),
                alignment,
                desc.name,
            )?
        };

        let id = BufferId(self.next_buffer_id);
        self.next_buffer_id += 1;
        let gpu_buffer = GpuBuffer { id, size: desc.size, device_address: buffer.device_address };
        self.buffers.insert(id, buffer);
        Ok(gpu_buffer)
    }

    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RtResult<()> {
        let target = self
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| RtError::invariant(format!("write to released buffer {:?}", buffer.id)))?;
        target.write(offset, data)
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        if let Some(buffer) = self.buffers.remove(&buffer.id) {
            unsafe { self.memory.destroy_buffer(buffer) };
        }
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        size: u64,
        name: &str,
    ) -> RtResult<AccelerationStructure> {
        let buffer = unsafe {
            self.memory.create_buffer(
                size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
                gpu_allocator::MemoryLocation::GpuOnly,
                256,
                name,
            )?
        };

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .size(size)
            .ty(structure_type(kind));
        let handle = match unsafe { self.ctx.accel_struct_loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => handle,
            Err(e) => {
                unsafe { self.memory.destroy_buffer(buffer) };
                return Err(RtError::vulkan("create acceleration structure", e));
            }
        };

        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(handle);
        let loader = &self.ctx.accel_struct_loader;
        let device_address = unsafe { loader.get_acceleration_structure_device_address(&addr_info) };

        let raw = handle.as_raw();
        self.structures.insert(raw, StructureEntry { handle, buffer });
        Ok(AccelerationStructure { raw, kind, size, device_address })
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure) {
        if let Some(entry) = self.structures.remove(&structure.raw) {
            unsafe {
                self.ctx.accel_struct_loader.destroy_acceleration_structure(entry.handle, None);
                self.memory.destroy_buffer(entry.buffer);
            }
        }
    }

    fn begin_commands(&mut self) -> RtResult<VulkanEncoder> {
        let (slot, command_buffer) = self.commands.begin()?;
        Ok(VulkanEncoder {
            device: self.ctx.device.clone(),
            loader: self.ctx.accel_struct_loader.clone(),
            command_buffer,
            slot,
        })
    }

    fn submit_commands(&mut self, encoder: VulkanEncoder) -> RtResult<()> {
        self.commands.submit(self.ctx.queue, encoder.command_buffer)
    }

    fn wait_idle(&mut self) -> RtResult<()> {
        self.ctx.wait_idle()
    }

    fn shader_group_layout(&self) -> ShaderGroupLayout {
        let caps = &self.ctx.rt_capabilities;
        ShaderGroupLayout {
            identifier_size: caps.shader_group_handle_size,
            record_alignment: caps.shader_group_handle_alignment,
            table_alignment: caps.shader_group_base_alignment,
        }
    }

    fn shader_identifiers(&self, group_count: u32) -> RtResult<Vec<ShaderIdentifier>> {
        let pipeline = self
            .pipeline
            .ok_or_else(|| RtError::Unsupported("no ray tracing pipeline bound".into()))?;
        let size = self.ctx.rt_capabilities.shader_group_handle_size as usize;
        let handles = unsafe {
            self.ctx
                .rt_pipeline_loader
                .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, size * group_count as usize)
                .map_err(|e| RtError::vulkan("get shader group handles", e))?
        };
        Ok(handles.chunks_exact(size).map(|h| ShaderIdentifier(h.to_vec())).collect())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            log::warn!("Wait idle on shutdown failed: {e}");
        }
        unsafe {
            for (_, entry) in self.structures.drain() {
                self.ctx.accel_struct_loader.destroy_acceleration_structure(entry.handle, None);
                self.memory.destroy_buffer(entry.buffer);
            }
            for (_, buffer) in self.buffers.drain() {
                self.memory.destroy_buffer(buffer);
            }
            self.commands.destroy();
        }
    }
}
