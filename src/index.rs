//! Grid index math for the sparse block layer
//!
//! World space is partitioned into cubic blocks of `S^3` voxels. A world
//! point `p` lies in block `floor(p / B)` and, within it, in voxel
//! `floor((p mod B) / v)` where `v` is the voxel side length and
//! `B = S * v` the block side length. Floor division keeps negative
//! positions inside the block that contains them.
//!
//! Two index spaces are used throughout:
//! - **block index**: `IVec3` key of a block in the layer map
//! - **global voxel index**: `IVec3` addressing a voxel across all blocks

use glam::{IVec3, Vec3};

/// Block index in the sparse layer
pub type BlockIndex = IVec3;

/// Voxel index in the global grid
pub type GlobalVoxelIndex = IVec3;

/// Block index containing a world point
#[inline]
pub fn block_index_from_point(p: Vec3, block_size_inv: f32) -> BlockIndex {
    IVec3::new(
        (p.x * block_size_inv).floor() as i32,
        (p.y * block_size_inv).floor() as i32,
        (p.z * block_size_inv).floor() as i32,
    )
}

/// Global voxel index containing a world point
#[inline]
pub fn global_voxel_index_from_point(p: Vec3, voxel_size_inv: f32) -> GlobalVoxelIndex {
    IVec3::new(
        (p.x * voxel_size_inv).floor() as i32,
        (p.y * voxel_size_inv).floor() as i32,
        (p.z * voxel_size_inv).floor() as i32,
    )
}

/// Block index containing a global voxel index
#[inline]
pub fn block_index_from_global_voxel(gvi: GlobalVoxelIndex, voxels_per_side: i32) -> BlockIndex {
    IVec3::new(
        gvi.x.div_euclid(voxels_per_side),
        gvi.y.div_euclid(voxels_per_side),
        gvi.z.div_euclid(voxels_per_side),
    )
}

/// Voxel index local to its block, each component in `[0, S)`
#[inline]
pub fn local_from_global_voxel(gvi: GlobalVoxelIndex, voxels_per_side: i32) -> IVec3 {
    IVec3::new(
        gvi.x.rem_euclid(voxels_per_side),
        gvi.y.rem_euclid(voxels_per_side),
        gvi.z.rem_euclid(voxels_per_side),
    )
}

/// Global voxel index from block index and local voxel index
#[inline]
pub fn global_voxel_from_parts(
    block: BlockIndex,
    local: IVec3,
    voxels_per_side: i32,
) -> GlobalVoxelIndex {
    block * voxels_per_side + local
}

/// Flat array offset of a local voxel index, row-major with x fastest
#[inline]
pub fn linear_from_local(local: IVec3, voxels_per_side: usize) -> usize {
    debug_assert!(local.min_element() >= 0 && (local.max_element() as usize) < voxels_per_side);
    local.x as usize + voxels_per_side * (local.y as usize + voxels_per_side * local.z as usize)
}

/// Local voxel index from a flat array offset
#[inline]
pub fn local_from_linear(linear: usize, voxels_per_side: usize) -> IVec3 {
    let x = linear % voxels_per_side;
    let y = (linear / voxels_per_side) % voxels_per_side;
    let z = linear / (voxels_per_side * voxels_per_side);
    IVec3::new(x as i32, y as i32, z as i32)
}

/// World-space center of a global voxel
#[inline]
pub fn voxel_center(gvi: GlobalVoxelIndex, voxel_size: f32) -> Vec3 {
    (gvi.as_vec3() + Vec3::splat(0.5)) * voxel_size
}

/// World-space center of a block
#[inline]
pub fn block_center(index: BlockIndex, block_size: f32) -> Vec3 {
    (index.as_vec3() + Vec3::splat(0.5)) * block_size
}

/// World-space origin (lowest corner) of a block
#[inline]
pub fn block_origin(index: BlockIndex, block_size: f32) -> Vec3 {
    index.as_vec3() * block_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_points_map_into_containing_block() {
        // 8 voxels of 0.1m -> 0.8m blocks
        let inv = 1.0 / 0.8;
        assert_eq!(block_index_from_point(Vec3::new(0.1, 0.1, 0.1), inv), IVec3::ZERO);
        assert_eq!(
            block_index_from_point(Vec3::new(-0.1, -0.1, -0.1), inv),
            IVec3::splat(-1)
        );
        assert_eq!(
            block_index_from_point(Vec3::new(-0.85, 0.0, 1.7), inv),
            IVec3::new(-2, 0, 2)
        );
    }

    #[test]
    fn test_global_voxel_roundtrip() {
        let vps = 8;
        for &gvi in &[
            IVec3::new(0, 0, 0),
            IVec3::new(7, 8, 9),
            IVec3::new(-1, -8, -9),
            IVec3::new(-17, 23, -5),
        ] {
            let block = block_index_from_global_voxel(gvi, vps);
            let local = local_from_global_voxel(gvi, vps);
            assert!(local.min_element() >= 0 && local.max_element() < vps);
            assert_eq!(global_voxel_from_parts(block, local, vps), gvi);
        }
    }

    #[test]
    fn test_linear_roundtrip() {
        let vps = 8usize;
        for linear in 0..vps * vps * vps {
            let local = local_from_linear(linear, vps);
            assert_eq!(linear_from_local(local, vps), linear);
        }
        // x is the fastest-varying axis
        assert_eq!(linear_from_local(IVec3::new(1, 0, 0), vps), 1);
        assert_eq!(linear_from_local(IVec3::new(0, 1, 0), vps), 8);
        assert_eq!(linear_from_local(IVec3::new(0, 0, 1), vps), 64);
    }

    #[test]
    fn test_voxel_center() {
        let c = voxel_center(IVec3::new(10, 0, -1), 0.1);
        assert!((c.x - 1.05).abs() < 1e-6);
        assert!((c.y - 0.05).abs() < 1e-6);
        assert!((c.z + 0.05).abs() < 1e-6);
    }
}
