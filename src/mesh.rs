//! Mesh blocks and the mesh layer
//!
//! The mesh layer mirrors the TSDF layer one-to-one: each TSDF block owns
//! at most one mesh block, addressed by the same integer index (a
//! back-reference by index, never by pointer). Downstream receivers
//! consume per-block deltas, so a removed TSDF block must leave behind a
//! *cleared* mesh with its `updated` flag set — deleting the entry would
//! silently strand the old triangles on the receiving side.

use crate::index::{self, BlockIndex};
use crate::voxel::Color;
use glam::Vec3;
use rustc_hash::FxHashMap;

/// Triangle mesh for one block
///
/// Vertices are emitted per-triangle (indices are sequential); normals
/// and colors run parallel to the vertex list.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub normals: Vec<Vec3>,
    pub colors: Vec<Color>,
    /// Set whenever the mesh content changes; cleared by the publisher
    pub updated: bool,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn num_triangles(&self) -> usize {
        self.indices.len() / 3
    }

    /// Append one vertex with its attributes, returning its index
    pub fn push_vertex(&mut self, position: Vec3, normal: Vec3, color: Color) -> u32 {
        let index = self.vertices.len() as u32;
        self.vertices.push(position);
        self.normals.push(normal);
        self.colors.push(color);
        self.indices.push(index);
        index
    }

    /// Drop all geometry, keeping allocations for reuse
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
        self.normals.clear();
        self.colors.clear();
    }
}

/// Sparse mapping from block index to mesh, parallel to the TSDF layer
#[derive(Debug, Clone)]
pub struct MeshLayer {
    block_size: f32,
    meshes: FxHashMap<BlockIndex, Mesh>,
}

impl MeshLayer {
    pub fn new(block_size: f32) -> Self {
        assert!(block_size > 0.0, "block_size must be positive");
        Self {
            block_size,
            meshes: FxHashMap::default(),
        }
    }

    pub fn block_size(&self) -> f32 {
        self.block_size
    }

    pub fn num_meshes(&self) -> usize {
        self.meshes.len()
    }

    pub fn mesh(&self, index: BlockIndex) -> Option<&Mesh> {
        self.meshes.get(&index)
    }

    pub fn mesh_mut(&mut self, index: BlockIndex) -> Option<&mut Mesh> {
        self.meshes.get_mut(&index)
    }

    /// Get or create the mesh paired with a block
    pub fn allocate_mesh(&mut self, index: BlockIndex) -> &mut Mesh {
        self.meshes.entry(index).or_default()
    }

    /// Replace the content of a block's mesh and flag it updated
    pub fn replace_mesh(&mut self, index: BlockIndex, mut mesh: Mesh) {
        mesh.updated = true;
        self.meshes.insert(index, mesh);
    }

    /// Clear (not delete) a block's mesh and flag it updated, so the next
    /// delta publish propagates the deletion
    pub fn clear_mesh(&mut self, index: BlockIndex) {
        let mesh = self.meshes.entry(index).or_default();
        mesh.clear();
        mesh.updated = true;
    }

    /// Drop mesh entries whose block center lies beyond `radius` of
    /// `center`; used by the spatial cull alongside the TSDF layer
    pub fn remove_meshes_beyond(&mut self, center: Vec3, radius: f32) -> Vec<BlockIndex> {
        let block_size = self.block_size;
        let removed: Vec<BlockIndex> = self
            .meshes
            .keys()
            .filter(|&&idx| index::block_center(idx, block_size).distance(center) > radius)
            .copied()
            .collect();
        for index in &removed {
            self.meshes.remove(index);
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockIndex, &Mesh)> {
        self.meshes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&BlockIndex, &mut Mesh)> {
        self.meshes.iter_mut()
    }

    /// Indices of meshes whose `updated` flag is set
    pub fn updated_meshes(&self) -> Vec<BlockIndex> {
        self.meshes
            .iter()
            .filter(|(_, mesh)| mesh.updated)
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn clear(&mut self) {
        self.meshes.clear();
    }

    /// Concatenate every block mesh into one, offsetting indices
    pub fn combined_mesh(&self) -> Mesh {
        let mut combined = Mesh::new();
        for mesh in self.meshes.values() {
            let offset = combined.vertices.len() as u32;
            combined.vertices.extend_from_slice(&mesh.vertices);
            combined.normals.extend_from_slice(&mesh.normals);
            combined.colors.extend_from_slice(&mesh.colors);
            combined
                .indices
                .extend(mesh.indices.iter().map(|i| i + offset));
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    fn triangle_mesh() -> Mesh {
        let mut mesh = Mesh::new();
        mesh.push_vertex(Vec3::ZERO, Vec3::Z, Color::white());
        mesh.push_vertex(Vec3::X, Vec3::Z, Color::white());
        mesh.push_vertex(Vec3::Y, Vec3::Z, Color::white());
        mesh
    }

    #[test]
    fn test_clear_mesh_keeps_entry_and_marks_updated() {
        let mut layer = MeshLayer::new(0.8);
        let mut mesh = triangle_mesh();
        mesh.updated = false;
        layer.replace_mesh(IVec3::ZERO, mesh);
        assert!(layer.mesh(IVec3::ZERO).unwrap().updated);

        layer.mesh_mut(IVec3::ZERO).unwrap().updated = false;
        layer.clear_mesh(IVec3::ZERO);

        let cleared = layer.mesh(IVec3::ZERO).unwrap();
        assert!(cleared.is_empty());
        assert!(cleared.updated);
        assert_eq!(layer.num_meshes(), 1);
    }

    #[test]
    fn test_clear_mesh_on_missing_entry_creates_cleared_marker() {
        let mut layer = MeshLayer::new(0.8);
        layer.clear_mesh(IVec3::new(3, 2, 1));
        let mesh = layer.mesh(IVec3::new(3, 2, 1)).unwrap();
        assert!(mesh.is_empty());
        assert!(mesh.updated);
    }

    #[test]
    fn test_combined_mesh_offsets_indices() {
        let mut layer = MeshLayer::new(0.8);
        layer.replace_mesh(IVec3::ZERO, triangle_mesh());
        layer.replace_mesh(IVec3::X, triangle_mesh());

        let combined = layer.combined_mesh();
        assert_eq!(combined.vertices.len(), 6);
        assert_eq!(combined.num_triangles(), 2);
        let mut sorted = combined.indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_spatial_cull() {
        let mut layer = MeshLayer::new(0.8);
        layer.replace_mesh(IVec3::ZERO, triangle_mesh());
        layer.replace_mesh(IVec3::new(20, 0, 0), triangle_mesh());

        let removed = layer.remove_meshes_beyond(Vec3::ZERO, 5.0);
        assert_eq!(removed, vec![IVec3::new(20, 0, 0)]);
        assert_eq!(layer.num_meshes(), 1);
    }
}
