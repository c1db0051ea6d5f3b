//! Visualization derivations over the TSDF layer
//!
//! Pure functions producing point sets for downstream display. None of
//! these mutate the layer or its markers.

use crate::layer::TsdfLayer;
use crate::voxel::Color;
use glam::Vec3;

/// Centers and colors of near-surface voxels (`|d| < threshold`)
pub fn surface_pointcloud(layer: &TsdfLayer, threshold: f32) -> (Vec<Vec3>, Vec<Color>) {
    let mut points = Vec::new();
    let mut colors = Vec::new();
    for (_, block) in layer.iter() {
        if !block.has_data {
            continue;
        }
        for linear in 0..block.num_voxels() {
            let voxel = block.voxel(linear);
            if voxel.is_observed() && voxel.distance.abs() < threshold {
                points.push(block.voxel_center(linear));
                colors.push(voxel.color);
            }
        }
    }
    (points, colors)
}

/// Centers of all observed voxels with the signed distance as intensity
pub fn tsdf_pointcloud(layer: &TsdfLayer) -> (Vec<Vec3>, Vec<f32>) {
    let mut points = Vec::new();
    let mut intensities = Vec::new();
    for (_, block) in layer.iter() {
        if !block.has_data {
            continue;
        }
        for linear in 0..block.num_voxels() {
            let voxel = block.voxel(linear);
            if voxel.is_observed() {
                points.push(block.voxel_center(linear));
                intensities.push(voxel.distance);
            }
        }
    }
    (points, intensities)
}

/// Observed voxels whose center lies in the one-voxel slab at `z_level`
pub fn tsdf_slice(layer: &TsdfLayer, z_level: f32) -> (Vec<Vec3>, Vec<f32>) {
    let half = layer.voxel_size() * 0.5;
    let mut points = Vec::new();
    let mut intensities = Vec::new();
    for (_, block) in layer.iter() {
        if !block.has_data {
            continue;
        }
        for linear in 0..block.num_voxels() {
            let center = block.voxel_center(linear);
            if (center.z - z_level).abs() > half {
                continue;
            }
            let voxel = block.voxel(linear);
            if voxel.is_observed() {
                points.push(center);
                intensities.push(voxel.distance);
            }
        }
    }
    (points, intensities)
}

/// Centers of voxels the field places inside geometry (`d < 0`)
pub fn occupancy_markers(layer: &TsdfLayer) -> Vec<Vec3> {
    let mut points = Vec::new();
    for (_, block) in layer.iter() {
        if !block.has_data {
            continue;
        }
        for linear in 0..block.num_voxels() {
            let voxel = block.voxel(linear);
            if voxel.is_observed() && voxel.distance < 0.0 {
                points.push(block.voxel_center(linear));
            }
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    /// Two observed voxels: one at the surface, one inside
    fn small_layer() -> TsdfLayer {
        let mut layer = TsdfLayer::new(0.1, 8);
        {
            let block = layer.allocate_block(IVec3::ZERO);
            block.has_data = true;
            let voxel = block.voxel_mut(0); // center (0.05, 0.05, 0.05)
            voxel.distance = 0.01;
            voxel.weight = 1.0;
            voxel.color = Color::new(1, 2, 3);
            let inside = block.voxel_mut(1); // center (0.15, 0.05, 0.05)
            inside.distance = -0.2;
            inside.weight = 1.0;
        }
        layer
    }

    #[test]
    fn test_surface_pointcloud_filters_by_distance() {
        let layer = small_layer();
        let (points, colors) = surface_pointcloud(&layer, 0.05);
        assert_eq!(points.len(), 1);
        assert_eq!(colors[0], Color::new(1, 2, 3));
        assert!((points[0].x - 0.05).abs() < 1e-6);
    }

    #[test]
    fn test_tsdf_pointcloud_covers_all_observed() {
        let layer = small_layer();
        let (points, intensities) = tsdf_pointcloud(&layer);
        assert_eq!(points.len(), 2);
        assert!(intensities.contains(&0.01));
        assert!(intensities.contains(&-0.2));
    }

    #[test]
    fn test_slice_selects_one_slab() {
        let layer = small_layer();
        let (in_slab, _) = tsdf_slice(&layer, 0.05);
        assert_eq!(in_slab.len(), 2);
        let (off_slab, _) = tsdf_slice(&layer, 0.35);
        assert!(off_slab.is_empty());
    }

    #[test]
    fn test_occupancy_markers_are_interior_only() {
        let layer = small_layer();
        let markers = occupancy_markers(&layer);
        assert_eq!(markers.len(), 1);
        assert!((markers[0].x - 0.15).abs() < 1e-6);
    }
}
