//! Shader binding tables.
//!
//! Tables are assembled on the CPU from shader identifiers plus per-record
//! root arguments, then packed into one host-visible buffer with each table
//! starting on the device's table alignment.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{RtError, RtResult};

use super::blas::{BottomLevelStructure, GeometryInstance};
use super::device::{
    align_up, BufferDesc, BufferUsage, GpuAddress, GpuBuffer, MemoryLocation, RaytracingDevice, ShaderGroupLayout,
    ShaderIdentifier,
};
use super::hit_groups::{HitGroupLayout, RayGenShaderType, RayType};

/// Shading constants read by the closest-hit shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct MaterialConstants {
    pub albedo: [f32; 4],
    pub reflectance_coef: f32,
    pub diffuse_coef: f32,
    pub specular_coef: f32,
    pub specular_power: f32,
    pub step_scale: f32,
    _padding: u32,
}

impl MaterialConstants {
    pub fn new(
        albedo: [f32; 4],
        reflectance_coef: f32,
        diffuse_coef: f32,
        specular_coef: f32,
        specular_power: f32,
        step_scale: f32,
    ) -> Self {
        Self { albedo, reflectance_coef, diffuse_coef, specular_coef, specular_power, step_scale, _padding: 0 }
    }
}

/// Local root arguments of every hit group record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct HitGroupRootArguments {
    pub material: MaterialConstants,
    pub index_buffer: GpuAddress,
    pub vertex_buffer: GpuAddress,
}

impl From<&GeometryInstance> for HitGroupRootArguments {
    fn from(instance: &GeometryInstance) -> Self {
        Self {
            material: instance.material,
            index_buffer: instance.index_address(),
            vertex_buffer: instance.vertex_address(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShaderRecord {
    pub name: String,
    pub identifier: ShaderIdentifier,
    pub root_arguments: Vec<u8>,
}

impl ShaderRecord {
    pub fn new(name: impl Into<String>, identifier: ShaderIdentifier) -> Self {
        Self { name: name.into(), identifier, root_arguments: Vec::new() }
    }

    pub fn with_root_arguments<T: Pod>(mut self, arguments: &T) -> Self {
        self.root_arguments = bytemuck::bytes_of(arguments).to_vec();
        self
    }

    pub fn size(&self) -> u32 {
        (self.identifier.0.len() + self.root_arguments.len()) as u32
    }
}

/// Records sharing one stride: identifier size plus the largest root
/// arguments block, rounded up to the record alignment.
#[derive(Debug, Clone)]
pub struct ShaderTable {
    name: String,
    layout: ShaderGroupLayout,
    records: Vec<ShaderRecord>,
}

impl ShaderTable {
    pub fn new(name: impl Into<String>, layout: ShaderGroupLayout) -> Self {
        Self { name: name.into(), layout, records: Vec::new() }
    }

    pub fn push(&mut self, record: ShaderRecord) -> RtResult<()> {
        if record.identifier.0.len() != self.layout.identifier_size as usize {
            return Err(RtError::invariant(format!(
                "shader record '{}' has a {} byte identifier, device uses {}",
                record.name,
                record.identifier.0.len(),
                self.layout.identifier_size
            )));
        }
        self.records.push(record);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn records(&self) -> &[ShaderRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&ShaderRecord> {
        self.records.get(index)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn stride(&self) -> u32 {
        let largest = self.records.iter().map(ShaderRecord::size).max().unwrap_or(self.layout.identifier_size);
        align_up(largest as u64, self.layout.record_alignment as u64) as u32
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.stride() as u64 * self.records.len() as u64
    }

    /// Records laid out at `stride()` intervals, zero padded.
    pub fn to_bytes(&self) -> Vec<u8> {
        let stride = self.stride() as usize;
        let mut bytes = vec![0u8; stride * self.records.len()];
        for (i, record) in self.records.iter().enumerate() {
            let start = i * stride;
            let id_end = start + record.identifier.0.len();
            bytes[start..id_end].copy_from_slice(&record.identifier.0);
            bytes[id_end..id_end + record.root_arguments.len()].copy_from_slice(&record.root_arguments);
        }
        bytes
    }
}

impl fmt::Display for ShaderTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "|--------------------------------------------------------------------")?;
        writeln!(f, "|Shader table - {}: {} bytes, stride {}", self.name, self.size_in_bytes(), self.stride())?;
        for (i, record) in self.records.iter().enumerate() {
            writeln!(
                f,
                "| [{i}]: {}, {} + {} bytes",
                record.name,
                record.identifier.0.len(),
                record.root_arguments.len()
            )?;
        }
        write!(f, "|--------------------------------------------------------------------")
    }
}

/// Shader identifiers of the ray tracing pipeline, grouped by table.
#[derive(Debug, Clone)]
pub struct ShaderIdentifiers {
    pub ray_gen: Vec<ShaderIdentifier>,
    pub miss: Vec<ShaderIdentifier>,
    pub hit_groups: Vec<ShaderIdentifier>,
}

impl ShaderIdentifiers {
    /// Ray generation, then miss per ray type, then hit group per ray type.
    pub const GROUP_COUNT: u32 = RayGenShaderType::COUNT + 2 * RayType::COUNT;

    pub fn query<D: RaytracingDevice>(device: &D) -> RtResult<Self> {
        let mut all = device.shader_identifiers(Self::GROUP_COUNT)?;
        if all.len() != Self::GROUP_COUNT as usize {
            return Err(RtError::invariant(format!(
                "pipeline returned {} shader identifiers, expected {}",
                all.len(),
                Self::GROUP_COUNT
            )));
        }
        let hit_groups = all.split_off((RayGenShaderType::COUNT + RayType::COUNT) as usize);
        let miss = all.split_off(RayGenShaderType::COUNT as usize);
        Ok(Self { ray_gen: all, miss, hit_groups })
    }
}

/// Assembles the tables for a set of bottom-level structures.
pub struct ShaderBindingTableBuilder<'a> {
    layout: ShaderGroupLayout,
    identifiers: &'a ShaderIdentifiers,
    hit_groups: &'a HitGroupLayout,
}

impl<'a> ShaderBindingTableBuilder<'a> {
    pub fn new(layout: ShaderGroupLayout, identifiers: &'a ShaderIdentifiers, hit_groups: &'a HitGroupLayout) -> Self {
        Self { layout, identifiers, hit_groups }
    }

    pub fn build(&self, bottom_levels: &[BottomLevelStructure]) -> RtResult<ShaderBindingTables> {
        let mut ray_gen = Vec::with_capacity(RayGenShaderType::ALL.len());
        for (kind, identifier) in RayGenShaderType::ALL.iter().zip(&self.identifiers.ray_gen) {
            let mut table = ShaderTable::new(format!("{} shader table", kind.name()), self.layout);
            table.push(ShaderRecord::new(kind.name(), identifier.clone()))?;
            ray_gen.push(table);
        }

        let mut miss = ShaderTable::new("miss shader table", self.layout);
        for (ray, identifier) in RayType::ALL.iter().zip(&self.identifiers.miss) {
            miss.push(ShaderRecord::new(format!("miss {}", ray.name()), identifier.clone()))?;
        }

        let hit_group = self.build_hit_group_table(bottom_levels)?;
        log::debug!("{hit_group}");

        Ok(ShaderBindingTables { ray_gen, miss, hit_group })
    }

    fn build_hit_group_table(&self, bottom_levels: &[BottomLevelStructure]) -> RtResult<ShaderTable> {
        let ray_types = self.hit_groups.ray_type_count();
        if ray_types as usize != self.identifiers.hit_groups.len() {
            return Err(RtError::invariant(format!(
                "{} hit group identifiers for {ray_types} ray types",
                self.identifiers.hit_groups.len()
            )));
        }
        if bottom_levels.len() != self.hit_groups.blas_count() {
            return Err(RtError::invariant("hit group layout does not match the BLAS list"));
        }

        let mut table = ShaderTable::new("hit group shader table", self.layout);
        for (blas_index, blas) in bottom_levels.iter().enumerate() {
            let expected = self.hit_groups.instance_contribution(blas_index);
            if Some(blas.instance_contribution_to_hit_group_index()) != expected {
                return Err(RtError::invariant(format!(
                    "BLAS '{}' instance contribution disagrees with the hit group layout",
                    blas.name()
                )));
            }
            for (geometry_index, instance) in blas.geometry_instances().iter().enumerate() {
                let global = self
                    .hit_groups
                    .global_instance(blas_index, geometry_index as u32)
                    .ok_or_else(|| RtError::invariant(format!("geometry {geometry_index} of BLAS '{}'", blas.name())))?;
                let arguments = HitGroupRootArguments::from(instance);
                for (ray_index, identifier) in self.identifiers.hit_groups.iter().enumerate() {
                    let expected = self.hit_groups.record_index(global, ray_index as u32);
                    if table.len() as u32 != expected {
                        return Err(RtError::invariant(format!(
                            "hit group record {} written at position {}",
                            expected,
                            table.len()
                        )));
                    }
                    let name = format!("{} [{}] {}", blas.name(), geometry_index, RayType::ALL[ray_index].name());
                    table.push(ShaderRecord::new(name, identifier.clone()).with_root_arguments(&arguments))?;
                }
            }
        }
        Ok(table)
    }
}

/// Start, stride and size of one table inside the uploaded buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderTableRegion {
    pub address: GpuAddress,
    pub stride: u64,
    pub size: u64,
}

pub struct ShaderBindingTables {
    pub ray_gen: Vec<ShaderTable>,
    pub miss: ShaderTable,
    pub hit_group: ShaderTable,
}

impl ShaderBindingTables {
    /// Pack every table into one buffer.
    pub fn upload<D: RaytracingDevice>(&self, device: &mut D) -> RtResult<UploadedShaderTables> {
        let table_alignment = device.shader_group_layout().table_alignment as u64;
        let tables: Vec<&ShaderTable> = self.ray_gen.iter().chain([&self.miss, &self.hit_group]).collect();

        let mut offsets = Vec::with_capacity(tables.len());
        let mut total = 0;
        for table in &tables {
            offsets.push(total);
            total = align_up(total + table.size_in_bytes(), table_alignment);
        }

        let buffer = device.create_buffer(&BufferDesc {
            name: "shader binding table",
            size: total.max(table_alignment),
            usage: BufferUsage::SHADER_BINDING_TABLE,
            location: MemoryLocation::CpuToGpu,
            alignment: table_alignment,
        })?;

        let mut regions = Vec::with_capacity(tables.len());
        for (table, &offset) in tables.iter().zip(&offsets) {
            if let Err(e) = device.write_buffer(&buffer, offset, &table.to_bytes()) {
                device.destroy_buffer(buffer);
                return Err(e);
            }
            regions.push(ShaderTableRegion {
                address: if table.is_empty() { 0 } else { buffer.at(offset) },
                stride: table.stride() as u64,
                size: table.size_in_bytes(),
            });
        }

        let hit_group = regions.pop().unwrap_or_default();
        let miss = regions.pop().unwrap_or_default();
        Ok(UploadedShaderTables { buffer, ray_gen: regions, miss, hit_group })
    }
}

/// Device copy of the shader binding tables.
pub struct UploadedShaderTables {
    buffer: GpuBuffer,
    pub ray_gen: Vec<ShaderTableRegion>,
    pub miss: ShaderTableRegion,
    pub hit_group: ShaderTableRegion,
}

impl UploadedShaderTables {
    pub fn size(&self) -> u64 {
        self.buffer.size
    }

    pub fn release<D: RaytracingDevice>(self, device: &mut D) {
        device.destroy_buffer(self.buffer);
    }
}
