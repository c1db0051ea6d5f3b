//! Trilinear sampling of the distance field
//!
//! ICP refines poses against the implicit surface, which needs the field
//! and its gradient at arbitrary world points. Samples interpolate over
//! the eight voxel centers surrounding the query; any unobserved corner
//! (`weight == 0`) invalidates the sample.

use crate::index;
use crate::layer::TsdfLayer;
use glam::{IVec3, Vec3};

/// Trilinearly interpolated signed distance at `p`
///
/// Returns `None` when any of the eight surrounding voxels is unobserved
/// or unallocated.
pub fn distance_at(layer: &TsdfLayer, p: Vec3) -> Option<f32> {
    let voxel_size = layer.voxel_size();
    // Shift by half a voxel so corners are voxel centers
    let scaled = p / voxel_size - Vec3::splat(0.5);
    let base = IVec3::new(
        scaled.x.floor() as i32,
        scaled.y.floor() as i32,
        scaled.z.floor() as i32,
    );
    let frac = scaled - base.as_vec3();

    let mut accum = 0.0;
    for corner in 0..8usize {
        let offset = IVec3::new(
            (corner & 1) as i32,
            ((corner >> 1) & 1) as i32,
            ((corner >> 2) & 1) as i32,
        );
        let voxel = layer.voxel(base + offset)?;
        if !voxel.is_observed() {
            return None;
        }
        let wx = if offset.x == 1 { frac.x } else { 1.0 - frac.x };
        let wy = if offset.y == 1 { frac.y } else { 1.0 - frac.y };
        let wz = if offset.z == 1 { frac.z } else { 1.0 - frac.z };
        accum += wx * wy * wz * voxel.distance;
    }
    Some(accum)
}

/// Central-difference gradient of the interpolated field at `p`
///
/// The step is one voxel; all six offset samples must be valid.
pub fn gradient_at(layer: &TsdfLayer, p: Vec3) -> Option<Vec3> {
    let h = layer.voxel_size();
    let dx = distance_at(layer, p + Vec3::X * h)? - distance_at(layer, p - Vec3::X * h)?;
    let dy = distance_at(layer, p + Vec3::Y * h)? - distance_at(layer, p - Vec3::Y * h)?;
    let dz = distance_at(layer, p + Vec3::Z * h)? - distance_at(layer, p - Vec3::Z * h)?;
    Some(Vec3::new(dx, dy, dz) / (2.0 * h))
}

/// Distance and gradient in one call; `None` unless both are valid
pub fn distance_and_gradient_at(layer: &TsdfLayer, p: Vec3) -> Option<(f32, Vec3)> {
    Some((distance_at(layer, p)?, gradient_at(layer, p)?))
}

/// Voxel-center distance without interpolation, observed voxels only
pub fn nearest_distance_at(layer: &TsdfLayer, p: Vec3) -> Option<f32> {
    let gvi = index::global_voxel_index_from_point(p, 1.0 / layer.voxel_size());
    let voxel = layer.voxel(gvi)?;
    voxel.is_observed().then_some(voxel.distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Fill a region of the layer with the exact plane field d(p) = p.z
    fn plane_layer() -> TsdfLayer {
        let mut layer = TsdfLayer::new(0.1, 8);
        for x in -8..8 {
            for y in -8..8 {
                for z in -8..8 {
                    let gvi = IVec3::new(x, y, z);
                    let center = index::voxel_center(gvi, 0.1);
                    let voxel = layer.voxel_mut_or_allocate(gvi);
                    voxel.distance = center.z;
                    voxel.weight = 1.0;
                }
            }
        }
        layer
    }

    #[test]
    fn test_linear_field_is_reproduced_exactly() {
        let layer = plane_layer();
        for &p in &[
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(0.13, -0.21, 0.07),
            Vec3::new(-0.3, 0.3, -0.25),
        ] {
            let d = distance_at(&layer, p).unwrap();
            assert_relative_eq!(d, p.z, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_gradient_of_plane() {
        let layer = plane_layer();
        let g = gradient_at(&layer, Vec3::new(0.05, 0.05, 0.05)).unwrap();
        assert_relative_eq!(g.x, 0.0, epsilon = 1e-4);
        assert_relative_eq!(g.y, 0.0, epsilon = 1e-4);
        assert_relative_eq!(g.z, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_unobserved_corner_invalidates_sample() {
        let mut layer = plane_layer();
        // Knock out one corner of the cell around the query point
        layer.voxel_mut_or_allocate(IVec3::new(0, 0, 0)).weight = 0.0;
        assert!(distance_at(&layer, Vec3::new(0.1, 0.1, 0.1)).is_none());
        // Far away still fine
        assert!(distance_at(&layer, Vec3::new(-0.5, -0.5, -0.5)).is_some());
    }

    #[test]
    fn test_outside_allocation_is_none() {
        let layer = plane_layer();
        assert!(distance_at(&layer, Vec3::new(10.0, 0.0, 0.0)).is_none());
    }
}
