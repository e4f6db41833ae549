//! Hit group indexing shared by the top-level structure and the hit group table.
//!
//! Every geometry instance in every BLAS owns `ray_type_count` consecutive
//! hit group records. A BLAS's instance contribution is the global index of
//! its first geometry instance times `ray_type_count`, so the GPU's
//! `contribution + geometry * ray_type_count + ray_type` lands on the record
//! the table builder wrote for that geometry.

use crate::error::{RtError, RtResult};

use super::blas::BottomLevelStructure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayType {
    Radiance,
    Shadow,
    GBuffer,
}

impl RayType {
    pub const COUNT: u32 = 3;
    pub const ALL: [RayType; 3] = [RayType::Radiance, RayType::Shadow, RayType::GBuffer];

    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            RayType::Radiance => "radiance",
            RayType::Shadow => "shadow",
            RayType::GBuffer => "gbuffer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayGenShaderType {
    GBuffer,
    PrimaryAndAo,
    Ao,
}

impl RayGenShaderType {
    pub const COUNT: u32 = 3;
    pub const ALL: [RayGenShaderType; 3] =
        [RayGenShaderType::GBuffer, RayGenShaderType::PrimaryAndAo, RayGenShaderType::Ao];

    pub fn name(self) -> &'static str {
        match self {
            RayGenShaderType::GBuffer => "raygen gbuffer",
            RayGenShaderType::PrimaryAndAo => "raygen primary and ao",
            RayGenShaderType::Ao => "raygen ao",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HitGroupLayout {
    ray_type_count: u32,
    first_instance: Vec<u32>,
    instance_counts: Vec<u32>,
    total_instances: u32,
}

impl HitGroupLayout {
    /// Layout for BLAS holding `instance_counts[i]` geometry instances each.
    pub fn new(instance_counts: impl IntoIterator<Item = u32>, ray_type_count: u32) -> Self {
        let instance_counts: Vec<u32> = instance_counts.into_iter().collect();
        let mut first_instance = Vec::with_capacity(instance_counts.len());
        let mut total = 0;
        for &count in &instance_counts {
            first_instance.push(total);
            total += count;
        }
        Self { ray_type_count, first_instance, instance_counts, total_instances: total }
    }

    pub fn from_structures(bottom_levels: &[BottomLevelStructure], ray_type_count: u32) -> Self {
        Self::new(bottom_levels.iter().map(|b| b.geometry_count() as u32), ray_type_count)
    }

    pub fn ray_type_count(&self) -> u32 {
        self.ray_type_count
    }

    pub fn blas_count(&self) -> usize {
        self.instance_counts.len()
    }

    /// Geometry instances across all BLAS.
    pub fn instance_count(&self) -> u32 {
        self.total_instances
    }

    /// Hit group records needed in the table.
    pub fn record_count(&self) -> u32 {
        self.total_instances * self.ray_type_count
    }

    pub fn first_instance(&self, blas_index: usize) -> Option<u32> {
        self.first_instance.get(blas_index).copied()
    }

    pub fn instance_contribution(&self, blas_index: usize) -> Option<u32> {
        self.first_instance(blas_index).map(|first| first * self.ray_type_count)
    }

    pub fn global_instance(&self, blas_index: usize, geometry_index: u32) -> Option<u32> {
        let count = *self.instance_counts.get(blas_index)?;
        if geometry_index >= count {
            return None;
        }
        Some(self.first_instance[blas_index] + geometry_index)
    }

    pub fn record_index(&self, global_instance: u32, ray_type_index: u32) -> u32 {
        global_instance * self.ray_type_count + ray_type_index
    }

    /// Inverse of [`Self::record_index`].
    pub fn lookup(&self, record_index: u32) -> Option<(u32, u32)> {
        if self.ray_type_count == 0 || record_index >= self.record_count() {
            return None;
        }
        Some((record_index / self.ray_type_count, record_index % self.ray_type_count))
    }

    /// The record the GPU selects for a hit on `geometry_index` of `blas_index`.
    pub fn hit_group_index(&self, blas_index: usize, geometry_index: u32, ray_type_index: u32) -> Option<u32> {
        self.global_instance(blas_index, geometry_index)?;
        let contribution = self.instance_contribution(blas_index)?;
        Some(contribution + geometry_index * self.ray_type_count + ray_type_index)
    }

    /// BLAS and local geometry index of a global instance.
    pub fn locate(&self, global_instance: u32) -> Option<(usize, u32)> {
        if global_instance >= self.total_instances {
            return None;
        }
        // Last BLAS starting at or before the instance. Empty BLAS share their
        // first index with the next one, so they are never picked.
        let blas = self.first_instance.partition_point(|&first| first <= global_instance) - 1;
        Some((blas, global_instance - self.first_instance[blas]))
    }

    /// Write each BLAS's instance contribution.
    pub fn apply(&self, bottom_levels: &mut [BottomLevelStructure]) -> RtResult<()> {
        if bottom_levels.len() != self.blas_count() {
            return Err(RtError::invariant(format!(
                "hit group layout covers {} BLAS but {} were given",
                self.blas_count(),
                bottom_levels.len()
            )));
        }
        for (index, blas) in bottom_levels.iter_mut().enumerate() {
            if blas.geometry_count() as u32 != self.instance_counts[index] {
                return Err(RtError::invariant(format!(
                    "BLAS '{}' has {} geometries, layout expects {}",
                    blas.name(),
                    blas.geometry_count(),
                    self.instance_counts[index]
                )));
            }
            blas.set_instance_contribution_to_hit_group_index(self.first_instance[index] * self.ray_type_count);
        }
        Ok(())
    }
}
