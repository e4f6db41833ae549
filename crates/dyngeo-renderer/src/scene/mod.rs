//! The procedural demo scene: a ground plane and grids of tesselated spheres.

pub mod args;
pub mod layout;
pub mod primitives;

pub use args::{SceneArgs, SceneSettings, TopologyKind, MAX_BLAS};

use glam::Mat4;

use crate::error::{RtError, RtResult};
use crate::raytracing::blas::GeometryInstance;
use crate::raytracing::device::{BufferDesc, BufferUsage, GpuBuffer, IndexFormat, MemoryLocation, RaytracingDevice};
use crate::raytracing::sbt::MaterialConstants;

use primitives::{Mesh, Vertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeometryType {
    Plane,
    Sphere,
}

impl GeometryType {
    pub const COUNT: usize = 2;

    pub fn name(self) -> &'static str {
        match self {
            GeometryType::Plane => "plane",
            GeometryType::Sphere => "sphere",
        }
    }

    pub fn material(self) -> MaterialConstants {
        match self {
            GeometryType::Plane => MaterialConstants::new([0.75, 0.75, 0.75, 1.0], 0.0, 1.0, 0.4, 50.0, 1.0),
            GeometryType::Sphere => MaterialConstants::new([1.0, 0.0, 0.0, 0.0], 0.0, 1.0, 0.4, 50.0, 1.0),
        }
    }
}

/// Descriptor slots handed out in order. Index and vertex buffers of one
/// geometry take two adjacent slots.
#[derive(Debug, Clone)]
pub struct DescriptorAllocator {
    next: u32,
    capacity: u32,
}

impl DescriptorAllocator {
    /// Room for every geometry's buffers, the per-BLAS views and the TLAS.
    pub const DEFAULT_CAPACITY: u32 = 2 * GeometryType::COUNT as u32 + 1 + 2 * MAX_BLAS + 1;

    pub fn new(capacity: u32) -> Self {
        Self { next: 0, capacity }
    }

    pub fn allocate(&mut self) -> RtResult<u32> {
        if self.next >= self.capacity {
            return Err(RtError::Allocation {
                what: "descriptor slot".into(),
                reason: format!("all {} slots in use", self.capacity),
            });
        }
        let slot = self.next;
        self.next += 1;
        Ok(slot)
    }

    /// Slots for an index buffer and the vertex buffer that must follow it.
    pub fn allocate_buffer_pair(&mut self) -> RtResult<(u32, u32)> {
        let index = self.allocate()?;
        let vertex = self.allocate()?;
        if vertex != index + 1 {
            return Err(RtError::invariant(format!(
                "vertex buffer descriptor {vertex} does not follow index buffer descriptor {index}"
            )));
        }
        Ok((index, vertex))
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }
}

/// Index and vertex buffers of one mesh on the device.
pub struct Geometry {
    pub kind: GeometryType,
    pub index_buffer: GpuBuffer,
    pub vertex_buffer: GpuBuffer,
    pub index_count: u32,
    pub vertex_count: u32,
    pub index_descriptor: u32,
    pub vertex_descriptor: u32,
}

impl Geometry {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// All meshes of the scene, uploaded once per geometry initialization.
pub struct SceneGeometry {
    geometries: Vec<Geometry>,
    tesselation: u32,
    radius: f32,
}

impl SceneGeometry {
    pub fn build<D: RaytracingDevice>(device: &mut D, tesselation: u32, radius: f32) -> RtResult<Self> {
        let mut descriptors = DescriptorAllocator::new(DescriptorAllocator::DEFAULT_CAPACITY);
        let sphere = primitives::tesselated_sphere(radius, tesselation);
        let sphere = upload_mesh(device, &mut descriptors, GeometryType::Sphere, &sphere)?;
        let plane = match upload_mesh(device, &mut descriptors, GeometryType::Plane, &primitives::plane()) {
            Ok(plane) => plane,
            Err(e) => {
                device.destroy_buffer(sphere.index_buffer);
                device.destroy_buffer(sphere.vertex_buffer);
                return Err(e);
            }
        };

        log::info!(
            "Scene geometry: tesselation {}, {} sphere triangles, {} descriptors",
            tesselation,
            sphere.triangle_count(),
            descriptors.allocated()
        );
        Ok(Self { geometries: vec![plane, sphere], tesselation, radius })
    }

    pub fn geometry(&self, kind: GeometryType) -> &Geometry {
        &self.geometries[kind as usize]
    }

    pub fn tesselation(&self) -> u32 {
        self.tesselation
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// The whole mesh of `kind` as one geometry instance.
    pub fn instance(&self, kind: GeometryType, transform_slot: Option<u32>) -> GeometryInstance {
        let geometry = self.geometry(kind);
        GeometryInstance {
            vertex_buffer: geometry.vertex_buffer.device_address,
            vertex_range: 0..geometry.vertex_count,
            vertex_stride: std::mem::size_of::<Vertex>() as u32,
            index_buffer: geometry.index_buffer.device_address,
            index_range: 0..geometry.index_count,
            index_format: IndexFormat::U16,
            index_descriptor: geometry.index_descriptor,
            transform_slot,
            material: kind.material(),
        }
    }

    pub fn release<D: RaytracingDevice>(self, device: &mut D) {
        for geometry in self.geometries {
            device.destroy_buffer(geometry.index_buffer);
            device.destroy_buffer(geometry.vertex_buffer);
        }
    }
}

fn upload_mesh<D: RaytracingDevice>(
    device: &mut D,
    descriptors: &mut DescriptorAllocator,
    kind: GeometryType,
    mesh: &Mesh,
) -> RtResult<Geometry> {
    let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
    let usage = BufferUsage::BUILD_INPUT | BufferUsage::STORAGE;

    let index_name = format!("{} index buffer", kind.name());
    let index_buffer = device.create_buffer(&BufferDesc {
        name: &index_name,
        size: index_bytes.len() as u64,
        usage: usage | BufferUsage::INDEX,
        location: MemoryLocation::CpuToGpu,
        alignment: 16,
    })?;
    let vertex_name = format!("{} vertex buffer", kind.name());
    let vertex_buffer = match device.create_buffer(&BufferDesc {
        name: &vertex_name,
        size: vertex_bytes.len() as u64,
        usage: usage | BufferUsage::VERTEX,
        location: MemoryLocation::CpuToGpu,
        alignment: 16,
    }) {
        Ok(buffer) => buffer,
        Err(e) => {
            device.destroy_buffer(index_buffer);
            return Err(e);
        }
    };

    let uploaded = device
        .write_buffer(&index_buffer, 0, index_bytes)
        .and_then(|()| device.write_buffer(&vertex_buffer, 0, vertex_bytes))
        .and_then(|()| descriptors.allocate_buffer_pair());
    match uploaded {
        Ok((index_descriptor, vertex_descriptor)) => Ok(Geometry {
            kind,
            index_buffer,
            vertex_buffer,
            index_count: mesh.indices.len() as u32,
            vertex_count: mesh.vertices.len() as u32,
            index_descriptor,
            vertex_descriptor,
        }),
        Err(e) => {
            device.destroy_buffer(index_buffer);
            device.destroy_buffer(vertex_buffer);
            Err(e)
        }
    }
}

/// One bottom-level structure to create.
#[derive(Debug, Clone)]
pub struct BlasLayout {
    pub name: String,
    pub instances: Vec<GeometryInstance>,
    pub transform: Mat4,
    /// Whether the BLAS bobs when the scene animates.
    pub animated: bool,
}

/// How geometry instances are grouped into bottom-level structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneTopology {
    /// A plane BLAS followed by `sphere_blas` BLAS of `geometries_per_blas` spheres each.
    MultiBlas { sphere_blas: u32, geometries_per_blas: u32 },
    /// The plane and `geometries` spheres in one BLAS.
    SingleBlas { geometries: u32 },
}

impl SceneTopology {
    pub fn blas_count(&self) -> usize {
        match *self {
            SceneTopology::MultiBlas { sphere_blas, .. } => 1 + sphere_blas as usize,
            SceneTopology::SingleBlas { .. } => 1,
        }
    }

    /// Spheres in each group sharing one set of geometry transforms.
    pub fn geometries_per_group(&self) -> u32 {
        match *self {
            SceneTopology::MultiBlas { geometries_per_blas, .. } => geometries_per_blas,
            SceneTopology::SingleBlas { geometries } => geometries,
        }
    }

    /// Length of the geometry transform stream.
    pub fn geometry_transform_count(&self) -> usize {
        match *self {
            SceneTopology::MultiBlas { sphere_blas, geometries_per_blas } => {
                sphere_blas as usize * geometries_per_blas as usize
            }
            SceneTopology::SingleBlas { geometries } => geometries as usize,
        }
    }

    pub fn blas_layouts(&self, scene: &SceneGeometry) -> Vec<BlasLayout> {
        let radius = scene.radius();
        match *self {
            SceneTopology::MultiBlas { sphere_blas, geometries_per_blas } => {
                let mut layouts = Vec::with_capacity(self.blas_count());
                layouts.push(BlasLayout {
                    name: "plane".into(),
                    instances: vec![scene.instance(GeometryType::Plane, None)],
                    transform: layout::plane_transform(),
                    animated: false,
                });
                let placements = layout::sphere_blas_transforms(sphere_blas, geometries_per_blas, radius);
                for (blas, transform) in placements.into_iter().enumerate() {
                    let first_slot = blas as u32 * geometries_per_blas;
                    layouts.push(BlasLayout {
                        name: format!("spheres {blas}"),
                        instances: (0..geometries_per_blas)
                            .map(|i| scene.instance(GeometryType::Sphere, Some(first_slot + i)))
                            .collect(),
                        transform,
                        animated: true,
                    });
                }
                layouts
            }
            SceneTopology::SingleBlas { geometries } => {
                // The plane is baked in through its own transform slot.
                let mut instances = vec![scene.instance(GeometryType::Plane, Some(geometries))];
                instances.extend((0..geometries).map(|i| scene.instance(GeometryType::Sphere, Some(i))));
                vec![BlasLayout { name: "scene".into(), instances, transform: Mat4::IDENTITY, animated: false }]
            }
        }
    }

    /// Transform stream contents for a geometry rotation of `angle`.
    pub fn geometry_transforms(&self, radius: f32, angle: f32) -> Vec<Mat4> {
        let group = layout::geometry_transforms(self.geometries_per_group(), radius, angle);
        match *self {
            SceneTopology::MultiBlas { sphere_blas, .. } => {
                (0..sphere_blas).flat_map(|_| group.iter().copied()).collect()
            }
            SceneTopology::SingleBlas { .. } => {
                let mut transforms = group;
                transforms.push(layout::plane_transform());
                transforms
            }
        }
    }

    /// Stream length including any static slots.
    pub fn transform_slot_count(&self) -> usize {
        match *self {
            SceneTopology::MultiBlas { .. } => self.geometry_transform_count(),
            SceneTopology::SingleBlas { geometries } => geometries as usize + 1,
        }
    }
}
