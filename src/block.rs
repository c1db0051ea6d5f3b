//! Fixed-size voxel blocks
//!
//! A block is a cube of `S^3` voxels stored as a flat row-major array
//! (x fastest). Blocks carry per-purpose "updated" markers so downstream
//! consumers (map publishing, meshing) can each drain their own dirty set
//! without clobbering the others.

use crate::index::{self, BlockIndex};
use crate::voxel::TsdfVoxel;
use glam::{IVec3, Vec3};

/// Downstream consumers tracked by the per-block update markers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Map publishing and pruning
    Map,
    /// Incremental meshing
    Mesh,
    /// Reserved for ESDF derivation
    Esdf,
}

impl Update {
    #[inline]
    fn bit(self) -> u8 {
        match self {
            Update::Map => 1 << 0,
            Update::Mesh => 1 << 1,
            Update::Esdf => 1 << 2,
        }
    }
}

/// Bitset of [`Update`] markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateFlags {
    bits: u8,
}

impl UpdateFlags {
    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn contains(&self, purpose: Update) -> bool {
        self.bits & purpose.bit() != 0
    }

    pub fn set(&mut self, purpose: Update) {
        self.bits |= purpose.bit();
    }

    pub fn clear(&mut self, purpose: Update) {
        self.bits &= !purpose.bit();
    }
}

/// Cubic cluster of voxels addressed by an integer 3-vector
#[derive(Debug, Clone)]
pub struct Block {
    index: BlockIndex,
    voxels_per_side: usize,
    voxel_size: f32,
    voxels: Vec<TsdfVoxel>,
    /// True once any voxel of this block has been written
    pub has_data: bool,
    updated: UpdateFlags,
}

impl Block {
    /// Create a zero-initialized (fully unobserved) block
    pub fn new(index: BlockIndex, voxels_per_side: usize, voxel_size: f32) -> Self {
        Self {
            index,
            voxels_per_side,
            voxel_size,
            voxels: vec![TsdfVoxel::default(); voxels_per_side.pow(3)],
            has_data: false,
            updated: UpdateFlags::empty(),
        }
    }

    pub fn index(&self) -> BlockIndex {
        self.index
    }

    pub fn voxels_per_side(&self) -> usize {
        self.voxels_per_side
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    /// Side length of the whole block
    pub fn block_size(&self) -> f32 {
        self.voxels_per_side as f32 * self.voxel_size
    }

    pub fn num_voxels(&self) -> usize {
        self.voxels.len()
    }

    /// Lowest corner of the block in world space
    pub fn origin(&self) -> Vec3 {
        index::block_origin(self.index, self.block_size())
    }

    /// World-space center of the block
    pub fn center(&self) -> Vec3 {
        index::block_center(self.index, self.block_size())
    }

    #[inline]
    pub fn voxel(&self, linear: usize) -> &TsdfVoxel {
        &self.voxels[linear]
    }

    #[inline]
    pub fn voxel_mut(&mut self, linear: usize) -> &mut TsdfVoxel {
        &mut self.voxels[linear]
    }

    /// Voxel by local index, each component in `[0, S)`
    #[inline]
    pub fn voxel_at(&self, local: IVec3) -> &TsdfVoxel {
        &self.voxels[index::linear_from_local(local, self.voxels_per_side)]
    }

    #[inline]
    pub fn voxel_at_mut(&mut self, local: IVec3) -> &mut TsdfVoxel {
        &mut self.voxels[index::linear_from_local(local, self.voxels_per_side)]
    }

    pub fn voxels(&self) -> &[TsdfVoxel] {
        &self.voxels
    }

    pub fn voxels_mut(&mut self) -> &mut [TsdfVoxel] {
        &mut self.voxels
    }

    /// World-space center of a voxel given its flat offset
    pub fn voxel_center(&self, linear: usize) -> Vec3 {
        let local = index::local_from_linear(linear, self.voxels_per_side);
        self.origin() + (local.as_vec3() + Vec3::splat(0.5)) * self.voxel_size
    }

    pub fn is_updated(&self, purpose: Update) -> bool {
        self.updated.contains(purpose)
    }

    pub fn set_updated(&mut self, purpose: Update) {
        self.updated.set(purpose);
    }

    pub fn clear_updated(&mut self, purpose: Update) {
        self.updated.clear(purpose);
    }

    /// True when no voxel carries weight at or above `eps`
    ///
    /// Deintegration drives weights back to zero; such blocks are pruning
    /// candidates.
    pub fn all_weights_below(&self, eps: f32) -> bool {
        self.voxels.iter().all(|v| v.weight < eps)
    }

    /// Reset every voxel to the unobserved state, keeping markers intact
    pub fn reset_voxels(&mut self) {
        for voxel in &mut self.voxels {
            *voxel = TsdfVoxel::default();
        }
        self.has_data = false;
    }
}
