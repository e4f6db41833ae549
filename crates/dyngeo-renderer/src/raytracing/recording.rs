//! In-memory device that records commands instead of executing them.
//!
//! Sizes are deterministic functions of the build description, so the
//! core's sizing and scheduling can be checked without a GPU. Submitted
//! builds are validated the way a driver would trip over them: a refit of a
//! structure that was never built, or built without `ALLOW_UPDATE`, is
//! rejected.

use std::collections::HashMap;

use crate::error::{RtError, RtResult};

use super::device::{
    align_up, AccelerationStructure, AccelerationStructureEncoder, AccelerationStructureKind, BlasGeometryDesc,
    BufferDesc, BufferId, BuildFlags, BuildMode, BuildSizes, GpuAddress, GpuBuffer, MemoryLocation, RaytracingDevice,
    ShaderGroupLayout, ShaderIdentifier,
};
use super::stream::FRAME_COUNT;

const ADDRESS_ALIGNMENT: u64 = 256;
const FIRST_ADDRESS: u64 = 0x1_0000;

/// A command captured by [`RecordingEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BuildBottomLevel {
        structure: u64,
        mode: BuildMode,
        flags: BuildFlags,
        geometries: Vec<BlasGeometryDesc>,
        scratch: GpuAddress,
    },
    BuildTopLevel {
        structure: u64,
        mode: BuildMode,
        flags: BuildFlags,
        instances: GpuAddress,
        instance_count: u32,
        scratch: GpuAddress,
    },
    Barrier,
}

impl RecordedCommand {
    pub fn mode(&self) -> Option<BuildMode> {
        match self {
            RecordedCommand::BuildBottomLevel { mode, .. } | RecordedCommand::BuildTopLevel { mode, .. } => Some(*mode),
            RecordedCommand::Barrier => None,
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, RecordedCommand::Barrier)
    }
}

#[derive(Debug)]
pub struct RecordingEncoder {
    commands: Vec<RecordedCommand>,
    slot: usize,
}

impl RecordingEncoder {
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }
}

impl AccelerationStructureEncoder for RecordingEncoder {
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
        self.commands.push(RecordedCommand::BuildBottomLevel {
            structure: target.raw,
            mode,
            flags,
            geometries: geometries.to_vec(),
            scratch,
        });
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
        self.commands.push(RecordedCommand::BuildTopLevel {
            structure: target.raw,
            mode,
            flags,
            instances,
            instance_count,
            scratch,
        });
    }

    fn barrier(&mut self) {
        self.commands.push(RecordedCommand::Barrier);
    }
}

struct RecordedBuffer {
    name: String,
    address: GpuAddress,
    location: MemoryLocation,
    data: Vec<u8>,
}

struct RecordedStructure {
    kind: AccelerationStructureKind,
    size: u64,
    /// Flags of the last full build, `None` until built.
    built_with: Option<BuildFlags>,
}

/// Deterministic stand-in for a GPU device.
pub struct RecordingDevice {
    buffers: HashMap<BufferId, RecordedBuffer>,
    structures: HashMap<u64, RecordedStructure>,
    next_id: u64,
    next_address: GpuAddress,
    submissions: Vec<Vec<RecordedCommand>>,
    /// Frame slot the next encoder records into; advances on submit.
    frame_slot: usize,
    wait_idle_count: usize,
    max_triangles: Option<u32>,
    lose_device_on_submit: bool,
    device_lost: bool,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            structures: HashMap::new(),
            next_id: 1,
            next_address: FIRST_ADDRESS,
            submissions: Vec::new(),
            frame_slot: 0,
            wait_idle_count: 0,
            max_triangles: None,
            lose_device_on_submit: false,
            device_lost: false,
        }
    }

    /// Reject bottom-level descriptions with more triangles than `limit`.
    pub fn reject_triangles_above(&mut self, limit: u32) {
        self.max_triangles = Some(limit);
    }

    /// Fail the next submission with a lost device.
    pub fn lose_device_on_next_submit(&mut self) {
        self.lose_device_on_submit = true;
    }

    pub fn submissions(&self) -> &[Vec<RecordedCommand>] {
        &self.submissions
    }

    pub fn last_submission(&self) -> Option<&[RecordedCommand]> {
        self.submissions.last().map(Vec::as_slice)
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    pub fn wait_idle_count(&self) -> usize {
        self.wait_idle_count
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_structure_count(&self) -> usize {
        self.structures.len()
    }

    pub fn structure_size(&self, raw: u64) -> Option<u64> {
        self.structures.get(&raw).map(|s| s.size)
    }

    pub fn buffer_name(&self, buffer: &GpuBuffer) -> Option<&str> {
        self.buffers.get(&buffer.id).map(|b| b.name.as_str())
    }

    /// Read `len` bytes at a device address inside any live buffer.
    pub fn read(&self, address: GpuAddress, len: usize) -> Option<&[u8]> {
        self.buffers.values().find_map(|b| {
            let end = b.address + b.data.len() as u64;
            if address >= b.address && address + len as u64 <= end {
                let start = (address - b.address) as usize;
                Some(&b.data[start..start + len])
            } else {
                None
            }
        })
    }

    fn check_alive(&self) -> RtResult<()> {
        if self.device_lost {
            Err(RtError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn allocate_address(&mut self, size: u64, alignment: u64) -> GpuAddress {
        let alignment = alignment.max(ADDRESS_ALIGNMENT);
        let address = align_up(self.next_address, alignment);
        self.next_address = address + align_up(size.max(1), ADDRESS_ALIGNMENT);
        address
    }

    fn validate_submission(&mut self, commands: &[RecordedCommand]) -> RtResult<()> {
        for command in commands {
            let (structure, mode, flags, kind) = match command {
                RecordedCommand::BuildBottomLevel { structure, mode, flags, .. } => {
                    (*structure, *mode, *flags, AccelerationStructureKind::BottomLevel)
                }
                RecordedCommand::BuildTopLevel { structure, mode, flags, .. } => {
                    (*structure, *mode, *flags, AccelerationStructureKind::TopLevel)
                }
                RecordedCommand::Barrier => continue,
            };
            let entry = self
                .structures
                .get_mut(&structure)
                .ok_or_else(|| RtError::invariant(format!("build of destroyed structure {structure:#x}")))?;
            if entry.kind != kind {
                return Err(RtError::invariant(format!("structure {structure:#x} built as the wrong level")));
            }
            match mode {
                BuildMode::Build => {
                    entry.built_with = Some(flags);
                }
                BuildMode::Update => match entry.built_with {
                    Some(built) if built.contains(BuildFlags::ALLOW_UPDATE) => {}
                    Some(_) => {
                        return Err(RtError::invariant(format!(
                            "refit of structure {structure:#x} built without ALLOW_UPDATE"
                        )))
                    }
                    None => {
                        return Err(RtError::invariant(format!("refit of never-built structure {structure:#x}")))
                    }
                },
            }
        }
        Ok(())
    }
}

impl RaytracingDevice for RecordingDevice {
    type Encoder = RecordingEncoder;

    fn blas_build_sizes(&self, geometries: &[BlasGeometryDesc], flags: BuildFlags) -> RtResult<BuildSizes> {
        self.check_alive()?;
        let triangles: u64 = geometries.iter().map(|g| g.triangle_count() as u64).sum();
        let vertices: u64 = geometries.iter().map(|g| g.vertex_count as u64).sum();
        if let Some(limit) = self.max_triangles {
            if triangles > limit as u64 {
                return Err(RtError::BuildRejected {
                    what: "bottom-level acceleration structure".into(),
                    reason: format!("{triangles} triangles exceed the device limit of {limit}"),
                });
            }
        }

        let mut result = 256 + 64 * triangles + 16 * vertices + 32 * geometries.len() as u64;
        if flags.contains(BuildFlags::ALLOW_UPDATE) {
            result += result / 4;
        }
        if flags.contains(BuildFlags::MINIMIZE_MEMORY) {
            result = result * 3 / 4;
        }
        let scratch = align_up(128 + 48 * triangles + 8 * vertices, ADDRESS_ALIGNMENT);
        let update_scratch = if flags.contains(BuildFlags::ALLOW_UPDATE) {
            align_up(128 + 16 * triangles, ADDRESS_ALIGNMENT)
        } else {
            0
        };
        Ok(BuildSizes {
            result_data_max_size: align_up(result, ADDRESS_ALIGNMENT),
            scratch_size: scratch,
            update_scratch_size: update_scratch,
        })
    }

    fn tlas_build_sizes(&self, instance_count: u32, flags: BuildFlags) -> RtResult<BuildSizes> {
        self.check_alive()?;
        let instances = instance_count as u64;
        let mut result = 256 + 128 * instances;
        if flags.contains(BuildFlags::ALLOW_UPDATE) {
            result += result / 4;
        }
        if flags.contains(BuildFlags::MINIMIZE_MEMORY) {
            result = result * 3 / 4;
        }
        let update_scratch = if flags.contains(BuildFlags::ALLOW_UPDATE) {
            align_up(128 + 32 * instances, ADDRESS_ALIGNMENT)
        } else {
            0
        };
        Ok(BuildSizes {
            result_data_max_size: align_up(result, ADDRESS_ALIGNMENT),
            scratch_size: align_up(128 + 64 * instances, ADDRESS_ALIGNMENT),
            update_scratch_size: update_scratch,
        })
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RtResult<GpuBuffer> {
        self.check_alive()?;
        if desc.size == 0 {
            return Err(RtError::Allocation {
                what: desc.name.to_string(),
                reason: "zero-sized buffer".into(),
            });
        }
        let id = BufferId(self.next_id);
        self.next_id += 1;
        let address = self.allocate_address(desc.size, desc.alignment);
        self.buffers.insert(
            id,
            RecordedBuffer {
                name: desc.name.to_string(),
                address,
                location: desc.location,
                data: vec![0; desc.size as usize],
            },
        );
        Ok(GpuBuffer { id, size: desc.size, device_address: address })
    }

    fn write_buffer(&mut self, buffer: &GpuBuffer, offset: u64, data: &[u8]) -> RtResult<()> {
        self.check_alive()?;
        let target = self
            .buffers
            .get_mut(&buffer.id)
            .ok_or_else(|| RtError::invariant(format!("write to released buffer {:?}", buffer.id)))?;
        if target.location != MemoryLocation::CpuToGpu {
            return Err(RtError::invariant(format!("buffer '{}' is not host visible", target.name)));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(RtError::invariant(format!(
                "write of {} bytes at {offset} overflows buffer '{}' ({} bytes)",
                data.len(),
                target.name,
                target.data.len()
            )));
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: GpuBuffer) {
        self.buffers.remove(&buffer.id);
    }

    fn create_acceleration_structure(
        &mut self,
        kind: AccelerationStructureKind,
        size: u64,
        _name: &str,
    ) -> RtResult<AccelerationStructure> {
        self.check_alive()?;
        let raw = self.next_id;
        self.next_id += 1;
        let device_address = self.allocate_address(size, ADDRESS_ALIGNMENT);
        self.structures.insert(raw, RecordedStructure { kind, size, built_with: None });
        Ok(AccelerationStructure { raw, kind, size, device_address })
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructure) {
        self.structures.remove(&structure.raw);
    }

    fn begin_commands(&mut self) -> RtResult<RecordingEncoder> {
        self.check_alive()?;
        Ok(RecordingEncoder { commands: Vec::new(), slot: self.frame_slot })
    }

    fn submit_commands(&mut self, encoder: RecordingEncoder) -> RtResult<()> {
        self.check_alive()?;
        if self.lose_device_on_submit {
            self.lose_device_on_submit = false;
            self.device_lost = true;
            return Err(RtError::DeviceLost);
        }
        self.validate_submission(&encoder.commands)?;
        self.submissions.push(encoder.commands);
        self.frame_slot = (self.frame_slot + 1) % FRAME_COUNT;
        Ok(())
    }

    fn wait_idle(&mut self) -> RtResult<()> {
        self.check_alive()?;
        self.wait_idle_count += 1;
        Ok(())
    }

    fn shader_group_layout(&self) -> ShaderGroupLayout {
        ShaderGroupLayout { identifier_size: 32, record_alignment: 32, table_alignment: 64 }
    }

    fn shader_identifiers(&self, group_count: u32) -> RtResult<Vec<ShaderIdentifier>> {
        self.check_alive()?;
        let size = self.shader_group_layout().identifier_size as usize;
        Ok((0..group_count).map(|i| ShaderIdentifier(vec![(i + 1) as u8; size])).collect())
    }
}
