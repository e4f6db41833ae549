//! Placement and animation of the demo scene.

use glam::{Mat4, Vec3};

/// Radius of every tesselated sphere.
pub const GEOMETRY_RADIUS: f32 = 3.0;

/// Edge length of the ground plane.
pub const PLANE_WIDTH: f32 = 36.0;

pub const BLAS_ANIMATION_SECONDS: f32 = 24.0;
pub const GEOMETRY_ANIMATION_SECONDS: f32 = 12.0;

const BOB_BASE_AMPLITUDE: f32 = 16.0;
const BOB_DISTANCE_FACTOR: f32 = 0.35;

/// Goes 0 to 1 over the first half of `duration` and back to 0 over the second.
pub fn animation_interpolant(time: f32, duration: f32) -> f32 {
    let t = (time / duration).rem_euclid(1.0) * 2.0;
    if t > 1.0 {
        2.0 - t
    } else {
        t
    }
}

/// Smallest `d` with `d * d >= count`.
pub fn square_dim(count: u32) -> u32 {
    (0..).find(|d: &u32| d * d >= count).unwrap_or(count)
}

/// Smallest `d` with `d * d * d >= count`.
pub fn cube_dim(count: u32) -> u32 {
    (0..).find(|d: &u32| d * d * d >= count).unwrap_or(count)
}

/// Scale the unit plane in XZ and centre it on the origin.
pub fn plane_transform() -> Mat4 {
    Mat4::from_translation(Vec3::new(-PLANE_WIDTH / 2.0, 0.0, -PLANE_WIDTH / 2.0))
        * Mat4::from_scale(Vec3::new(PLANE_WIDTH, 1.0, PLANE_WIDTH))
}

/// Width of the cube of geometries inside one sphere BLAS.
pub fn blas_width(geometries_per_blas: u32, radius: f32) -> f32 {
    let dim = cube_dim(geometries_per_blas) as f32;
    let gap = radius;
    dim * 2.0 * radius + (dim - 1.0).max(0.0) * gap
}

/// Sphere BLAS laid out on a square grid in XZ, three gaps apart.
pub fn sphere_blas_transforms(sphere_blas: u32, geometries_per_blas: u32, radius: f32) -> Vec<Mat4> {
    let dim = square_dim(sphere_blas);
    let step = blas_width(geometries_per_blas, radius) + 3.0 * radius;
    let mut transforms = Vec::with_capacity(sphere_blas as usize);
    'grid: for x in 0..dim {
        for z in 0..dim {
            if transforms.len() as u32 >= sphere_blas {
                break 'grid;
            }
            transforms.push(Mat4::from_translation(Vec3::new(x as f32, 0.0, z as f32) * step));
        }
    }
    transforms
}

/// Geometries of one BLAS on a cube grid centred on the BLAS origin, each
/// resting on the ground and orbiting half a radius around its cell by `angle`.
pub fn geometry_transforms(geometries_per_blas: u32, radius: f32, angle: f32) -> Vec<Mat4> {
    let dim = cube_dim(geometries_per_blas) as i32;
    let step = 3.0 * radius;
    let local = Mat4::from_rotation_y(angle) * Mat4::from_translation(Vec3::new(0.0, radius, 0.5 * radius));

    let mut transforms = Vec::with_capacity(geometries_per_blas as usize);
    'grid: for y in 0..dim {
        for x in 0..dim {
            for z in 0..dim {
                if transforms.len() as u32 >= geometries_per_blas {
                    break 'grid;
                }
                let cell = Vec3::new((x - dim / 2) as f32, (y - dim / 2) as f32, (z - dim / 2) as f32) * step;
                transforms.push(Mat4::from_translation(cell) * local);
            }
        }
    }
    transforms
}

/// Move `base` along Y. Farther BLAS swing higher.
pub fn bob(base: Mat4, t: f32) -> Mat4 {
    let translation = base.w_axis.truncate();
    let height = t * (BOB_BASE_AMPLITUDE + BOB_DISTANCE_FACTOR * translation.length());
    let mut transform = base;
    transform.w_axis.y = translation.y + height;
    transform
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translation(m: &Mat4) -> Vec3 {
        m.w_axis.truncate()
    }

    #[test]
    fn test_interpolant_ping_pongs() {
        assert_eq!(animation_interpolant(0.0, 24.0), 0.0);
        assert!((animation_interpolant(6.0, 24.0) - 0.5).abs() < 1e-6);
        assert!((animation_interpolant(12.0, 24.0) - 1.0).abs() < 1e-6);
        assert!((animation_interpolant(18.0, 24.0) - 0.5).abs() < 1e-6);
        assert!(animation_interpolant(24.0, 24.0).abs() < 1e-6);
    }

    #[test]
    fn test_grid_dims() {
        assert_eq!(square_dim(1), 1);
        assert_eq!(square_dim(4), 2);
        assert_eq!(square_dim(5), 3);
        assert_eq!(cube_dim(1), 1);
        assert_eq!(cube_dim(8), 2);
        assert_eq!(cube_dim(9), 3);
    }

    #[test]
    fn test_plane_is_centred() {
        let m = plane_transform();
        assert_eq!(m.transform_point3(Vec3::ZERO), Vec3::new(-18.0, 0.0, -18.0));
        assert_eq!(m.transform_point3(Vec3::new(1.0, 0.0, 1.0)), Vec3::new(18.0, 0.0, 18.0));
    }

    #[test]
    fn test_sphere_blas_grid_spacing() {
        let transforms = sphere_blas_transforms(3, 1, 3.0);
        assert_eq!(transforms.len(), 3);
        // One geometry: width 6, plus a gap of 9.
        assert_eq!(translation(&transforms[0]), Vec3::ZERO);
        assert_eq!(translation(&transforms[1]), Vec3::new(0.0, 0.0, 15.0));
        assert_eq!(translation(&transforms[2]), Vec3::new(15.0, 0.0, 0.0));
    }

    #[test]
    fn test_geometry_grid_is_truncated_to_count() {
        let transforms = geometry_transforms(5, 1.0, 0.0);
        assert_eq!(transforms.len(), 5);
        assert_eq!(translation(&transforms[0]), Vec3::new(-3.0, -2.0, -2.5));
    }

    #[test]
    fn test_single_geometry_rests_on_ground() {
        let transforms = geometry_transforms(1, 3.0, 0.0);
        assert_eq!(translation(&transforms[0]), Vec3::new(0.0, 3.0, 1.5));
    }

    #[test]
    fn test_rotation_orbits_the_cell() {
        let at_rest = translation(&geometry_transforms(1, 2.0, 0.0)[0]);
        let turned = translation(&geometry_transforms(1, 2.0, std::f32::consts::PI)[0]);
        assert!((turned - Vec3::new(0.0, 2.0, -1.0)).length() < 1e-5);
        assert!((at_rest.y - turned.y).abs() < 1e-6);
    }

    #[test]
    fn test_bob_only_moves_y() {
        let base = Mat4::from_translation(Vec3::new(30.0, 0.0, 40.0));
        let moved = bob(base, 0.5);
        assert_eq!(moved.w_axis.x, 30.0);
        assert_eq!(moved.w_axis.z, 40.0);
        assert!((moved.w_axis.y - 0.5 * (16.0 + 0.35 * 50.0)).abs() < 1e-4);
        assert_eq!(bob(base, 0.0), base);
    }
}
