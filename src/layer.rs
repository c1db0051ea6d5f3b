//! Sparse block-structured TSDF layer
//!
//! The layer maps integer block indices to voxel blocks. Allocation is
//! idempotent, lookups fail softly, and per-purpose update markers let the
//! map publisher and the mesher each walk only the blocks they still need
//! to process.

use crate::block::{Block, Update};
use crate::index::{self, BlockIndex, GlobalVoxelIndex};
use crate::voxel::TsdfVoxel;
use glam::Vec3;
use rustc_hash::FxHashMap;

/// Sparse mapping from block index to voxel block
///
/// Voxel side length and voxels-per-side are layer-wide constants; every
/// block allocated through this layer shares them.
#[derive(Debug, Clone)]
pub struct TsdfLayer {
    voxel_size: f32,
    voxels_per_side: usize,
    blocks: FxHashMap<BlockIndex, Block>,
}

impl TsdfLayer {
    pub fn new(voxel_size: f32, voxels_per_side: usize) -> Self {
        assert!(voxel_size > 0.0, "voxel_size must be positive");
        assert!(voxels_per_side > 0, "voxels_per_side must be positive");
        Self {
            voxel_size,
            voxels_per_side,
            blocks: FxHashMap::default(),
        }
    }

    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    pub fn voxels_per_side(&self) -> usize {
        self.voxels_per_side
    }

    /// Side length of one block
    pub fn block_size(&self) -> f32 {
        self.voxels_per_side as f32 * self.voxel_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Get or create the block at `index`
    ///
    /// Idempotent: an existing block is returned untouched, otherwise a
    /// zero-initialized block is inserted.
    pub fn allocate_block(&mut self, index: BlockIndex) -> &mut Block {
        let (voxels_per_side, voxel_size) = (self.voxels_per_side, self.voxel_size);
        self.blocks
            .entry(index)
            .or_insert_with(|| Block::new(index, voxels_per_side, voxel_size))
    }

    /// Read-only lookup, `None` when the block was never allocated
    pub fn block(&self, index: BlockIndex) -> Option<&Block> {
        self.blocks.get(&index)
    }

    pub fn block_mut(&mut self, index: BlockIndex) -> Option<&mut Block> {
        self.blocks.get_mut(&index)
    }

    pub fn contains_block(&self, index: BlockIndex) -> bool {
        self.blocks.contains_key(&index)
    }

    /// Drop the block at `index`; subsequent lookups return `None`
    pub fn remove_block(&mut self, index: BlockIndex) -> Option<Block> {
        self.blocks.remove(&index)
    }

    /// Indices of all blocks whose marker set includes `purpose`
    ///
    /// Does not clear the marker; consumers clear it themselves once the
    /// block has been processed.
    pub fn blocks_with_marker(&self, purpose: Update) -> Vec<BlockIndex> {
        self.blocks
            .iter()
            .filter(|(_, block)| block.is_updated(purpose))
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn set_marker(&mut self, index: BlockIndex, purpose: Update) {
        if let Some(block) = self.blocks.get_mut(&index) {
            block.set_updated(purpose);
        }
    }

    pub fn clear_marker(&mut self, index: BlockIndex, purpose: Update) {
        if let Some(block) = self.blocks.get_mut(&index) {
            block.clear_updated(purpose);
        }
    }

    /// Remove all blocks whose center lies strictly beyond `radius` of
    /// `center`, returning the removed indices so paired meshes can be
    /// cleared by the caller.
    pub fn remove_blocks_beyond(&mut self, center: Vec3, radius: f32) -> Vec<BlockIndex> {
        let block_size = self.block_size();
        let removed: Vec<BlockIndex> = self
            .blocks
            .keys()
            .filter(|&&idx| index::block_center(idx, block_size).distance(center) > radius)
            .copied()
            .collect();
        for index in &removed {
            self.blocks.remove(index);
        }
        removed
    }

    pub fn block_indices(&self) -> impl Iterator<Item = BlockIndex> + '_ {
        self.blocks.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockIndex, &Block)> {
        self.blocks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BlockIndex, &mut Block)> {
        self.blocks.iter_mut()
    }

    /// Voxel lookup by global voxel index
    pub fn voxel(&self, gvi: GlobalVoxelIndex) -> Option<&TsdfVoxel> {
        let vps = self.voxels_per_side as i32;
        let block = self.block(index::block_index_from_global_voxel(gvi, vps))?;
        Some(block.voxel_at(index::local_from_global_voxel(gvi, vps)))
    }

    /// Voxel lookup by world point
    pub fn voxel_at_point(&self, p: Vec3) -> Option<&TsdfVoxel> {
        self.voxel(index::global_voxel_index_from_point(p, 1.0 / self.voxel_size))
    }

    /// Mutable voxel lookup by global voxel index, allocating the block
    pub fn voxel_mut_or_allocate(&mut self, gvi: GlobalVoxelIndex) -> &mut TsdfVoxel {
        let vps = self.voxels_per_side as i32;
        let block_index = index::block_index_from_global_voxel(gvi, vps);
        let local = index::local_from_global_voxel(gvi, vps);
        self.allocate_block(block_index).voxel_at_mut(local)
    }

    /// Drop every block
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Approximate heap usage in bytes
    pub fn memory_usage(&self) -> usize {
        let per_block = std::mem::size_of::<Block>()
            + self.voxels_per_side.pow(3) * std::mem::size_of::<TsdfVoxel>();
        self.blocks.len() * (per_block + std::mem::size_of::<BlockIndex>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    fn test_layer() -> TsdfLayer {
        TsdfLayer::new(0.1, 8)
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut layer = test_layer();
        let idx = IVec3::new(1, 2, 3);

        layer.allocate_block(idx).voxel_mut(0).weight = 1.0;
        assert_eq!(layer.num_blocks(), 1);

        // Second allocation returns the same block, data intact
        let again = layer.allocate_block(idx);
        assert_eq!(again.voxel(0).weight, 1.0);
        assert_eq!(layer.num_blocks(), 1);
    }

    #[test]
    fn test_lookup_fails_softly() {
        let mut layer = test_layer();
        assert!(layer.block(IVec3::ZERO).is_none());

        layer.allocate_block(IVec3::ZERO);
        assert!(layer.block(IVec3::ZERO).is_some());

        layer.remove_block(IVec3::ZERO);
        assert!(layer.block(IVec3::ZERO).is_none());
    }

    #[test]
    fn test_markers_enumerate_without_clearing() {
        let mut layer = test_layer();
        layer.allocate_block(IVec3::ZERO).set_updated(Update::Mesh);
        layer.allocate_block(IVec3::X).set_updated(Update::Map);
        layer.allocate_block(IVec3::Y);

        let meshed = layer.blocks_with_marker(Update::Mesh);
        assert_eq!(meshed, vec![IVec3::ZERO]);
        // Enumeration leaves the marker set
        assert_eq!(layer.blocks_with_marker(Update::Mesh), vec![IVec3::ZERO]);

        layer.clear_marker(IVec3::ZERO, Update::Mesh);
        assert!(layer.blocks_with_marker(Update::Mesh).is_empty());
    }

    #[test]
    fn test_remove_blocks_beyond() {
        let mut layer = test_layer();
        // Block size 0.8m; block (0,0,0) center (0.4,0.4,0.4), block (10,0,0) center (8.4,0.4,0.4)
        layer.allocate_block(IVec3::ZERO);
        layer.allocate_block(IVec3::new(10, 0, 0));

        let removed = layer.remove_blocks_beyond(Vec3::ZERO, 2.0);
        assert_eq!(removed, vec![IVec3::new(10, 0, 0)]);
        assert!(layer.contains_block(IVec3::ZERO));
        assert!(!layer.contains_block(IVec3::new(10, 0, 0)));
    }

    #[test]
    fn test_voxel_lookup_across_blocks() {
        let mut layer = test_layer();
        let gvi = IVec3::new(-1, 0, 9);
        layer.voxel_mut_or_allocate(gvi).weight = 2.0;

        // Lands in block (-1, 0, 1) at local (7, 0, 1)
        assert!(layer.contains_block(IVec3::new(-1, 0, 1)));
        assert_eq!(layer.voxel(gvi).unwrap().weight, 2.0);

        // Point lookup at the voxel center resolves to the same voxel
        let p = Vec3::new(-0.05, 0.05, 0.95);
        assert_eq!(layer.voxel_at_point(p).unwrap().weight, 2.0);
    }
}
