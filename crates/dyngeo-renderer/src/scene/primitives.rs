//! Procedural meshes: the ground plane and the tesselated sphere family.
//!
//! All meshes are wound counter-clockwise when seen from outside.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, tex_coord: Vec2) -> Self {
        Self { position: position.to_array(), normal: normal.to_array(), tex_coord: tex_coord.to_array() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn next_index(&self) -> u16 {
        self.vertices.len() as u16
    }

    /// Append a flat-shaded polygon fan around `normal`.
    fn push_face(&mut self, corners: &[Vec3], normal: Vec3) {
        let base = self.next_index();
        let count = corners.len();
        for (i, &corner) in corners.iter().enumerate() {
            let angle = i as f32 / count as f32 * std::f32::consts::TAU;
            let uv = Vec2::new(0.5 + 0.5 * angle.cos(), 0.5 - 0.5 * angle.sin());
            self.vertices.push(Vertex::new(corner, normal, uv));
        }
        for i in 1..count as u16 - 1 {
            self.indices.extend_from_slice(&[base, base + i, base + i + 1]);
        }
    }
}

/// Unit quad in XZ at y = 0, facing +Y.
pub fn plane() -> Mesh {
    let up = Vec3::Y;
    Mesh {
        vertices: vec![
            Vertex::new(Vec3::new(0.0, 0.0, 0.0), up, Vec2::new(0.0, 0.0)),
            Vertex::new(Vec3::new(1.0, 0.0, 0.0), up, Vec2::new(1.0, 0.0)),
            Vertex::new(Vec3::new(1.0, 0.0, 1.0), up, Vec2::new(1.0, 1.0)),
            Vertex::new(Vec3::new(0.0, 0.0, 1.0), up, Vec2::new(0.0, 1.0)),
        ],
        indices: vec![3, 1, 0, 2, 1, 3],
    }
}

/// Sphere approximation for a tesselation factor: 0, 1 and 2 pick the
/// octahedron, dodecahedron and icosahedron, larger factors a UV sphere.
pub fn tesselated_sphere(radius: f32, tesselation: u32) -> Mesh {
    match tesselation {
        0 => octahedron(radius),
        1 => dodecahedron(radius),
        2 => icosahedron(radius),
        _ => uv_sphere(2.0 * radius, tesselation),
    }
}

pub fn octahedron(radius: f32) -> Mesh {
    let v = [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];
    let faces: [[usize; 3]; 8] =
        [[4, 0, 2], [4, 2, 1], [4, 1, 3], [4, 3, 0], [5, 2, 0], [5, 1, 2], [5, 3, 1], [5, 0, 3]];
    triangle_solid(&v, &faces, radius)
}

pub fn icosahedron(radius: f32) -> Mesh {
    let phi = (1.0 + 5f32.sqrt()) / 2.0;
    let v = [
        Vec3::new(-1.0, phi, 0.0),
        Vec3::new(1.0, phi, 0.0),
        Vec3::new(-1.0, -phi, 0.0),
        Vec3::new(1.0, -phi, 0.0),
        Vec3::new(0.0, -1.0, phi),
        Vec3::new(0.0, 1.0, phi),
        Vec3::new(0.0, -1.0, -phi),
        Vec3::new(0.0, 1.0, -phi),
        Vec3::new(phi, 0.0, -1.0),
        Vec3::new(phi, 0.0, 1.0),
        Vec3::new(-phi, 0.0, -1.0),
        Vec3::new(-phi, 0.0, 1.0),
    ];
    let faces: [[usize; 3]; 20] = [
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];
    triangle_solid(&v, &faces, radius)
}

/// Twelve pentagons, each a fan of three triangles.
pub fn dodecahedron(radius: f32) -> Mesh {
    let phi = (1.0 + 5f32.sqrt()) / 2.0;
    let b = 1.0 / phi;
    let mut corners = Vec::with_capacity(20);
    for x in [-1.0, 1.0] {
        for y in [-1.0, 1.0] {
            for z in [-1.0, 1.0] {
                corners.push(Vec3::new(x, y, z));
            }
        }
    }
    for s in [-1.0, 1.0] {
        for t in [-1.0, 1.0] {
            corners.push(Vec3::new(0.0, s * b, t * phi));
            corners.push(Vec3::new(s * b, t * phi, 0.0));
            corners.push(Vec3::new(s * phi, 0.0, t * b));
        }
    }
    let corners: Vec<Vec3> = corners.into_iter().map(|c| c.normalize() * radius).collect();

    // Face centres are the directions of the dual icosahedron's vertices.
    let mut face_normals = Vec::with_capacity(12);
    for s in [-1.0, 1.0] {
        for t in [-1.0, 1.0] {
            face_normals.push(Vec3::new(0.0, s * phi, t).normalize());
            face_normals.push(Vec3::new(s * phi, t, 0.0).normalize());
            face_normals.push(Vec3::new(s, 0.0, t * phi).normalize());
        }
    }

    let mut mesh = Mesh::default();
    for normal in face_normals {
        let mut face: Vec<Vec3> = corners.clone();
        face.sort_by(|a, b| b.dot(normal).total_cmp(&a.dot(normal)));
        face.truncate(5);

        let u = normal.any_orthonormal_vector();
        let v = normal.cross(u);
        face.sort_by(|a, b| a.dot(v).atan2(a.dot(u)).total_cmp(&b.dot(v).atan2(b.dot(u))));
        mesh.push_face(&face, normal);
    }
    mesh
}

/// Latitude/longitude sphere with `tesselation` rings and twice as many
/// segments. The seam column is duplicated so texture coordinates wrap.
pub fn uv_sphere(diameter: f32, tesselation: u32) -> Mesh {
    let vertical = tesselation.max(3);
    let horizontal = vertical * 2;
    let radius = diameter / 2.0;

    let mut mesh = Mesh::default();
    for i in 0..=vertical {
        let v = 1.0 - i as f32 / vertical as f32;
        let latitude = i as f32 * std::f32::consts::PI / vertical as f32 - std::f32::consts::FRAC_PI_2;
        let (dy, dxz) = latitude.sin_cos();
        for j in 0..=horizontal {
            let u = j as f32 / horizontal as f32;
            let longitude = j as f32 * std::f32::consts::TAU / horizontal as f32;
            let (dx, dz) = longitude.sin_cos();
            let normal = Vec3::new(dx * dxz, dy, dz * dxz);
            mesh.vertices.push(Vertex::new(normal * radius, normal, Vec2::new(u, v)));
        }
    }

    let stride = horizontal + 1;
    for i in 0..vertical {
        for j in 0..=horizontal {
            let next_i = i + 1;
            let next_j = (j + 1) % stride;
            let index = |row: u32, column: u32| (row * stride + column) as u16;
            mesh.indices.extend_from_slice(&[index(i, j), index(i, next_j), index(next_i, j)]);
            mesh.indices.extend_from_slice(&[index(i, next_j), index(next_i, next_j), index(next_i, j)]);
        }
    }
    mesh
}

fn triangle_solid(vertices: &[Vec3], faces: &[[usize; 3]], radius: f32) -> Mesh {
    let mut mesh = Mesh::default();
    for face in faces {
        let mut corners = face.map(|i| vertices[i].normalize() * radius);
        let normal = (corners[0] + corners[1] + corners[2]).normalize();
        if (corners[1] - corners[0]).cross(corners[2] - corners[0]).dot(normal) < 0.0 {
            corners.swap(1, 2);
        }
        mesh.push_face(&corners, normal);
    }
    mesh
}
