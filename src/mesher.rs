//! Incremental marching-cubes surface extraction
//!
//! Each dirty TSDF block is meshed independently into its paired mesh
//! block. Cubes are anchored at every voxel of the block and reach one
//! voxel into the +x/+y/+z neighbors (the skirt), so faces shared across
//! block boundaries are cut exactly once and adjacent meshes line up.
//!
//! A cube is skipped unless all eight corners are observed, which also
//! satisfies the per-edge rule (no interpolation across an unobserved
//! endpoint). Vertex positions are the linear zero crossing of the
//! distance along each cut edge, colors interpolate along the same edge,
//! and normals are the normalized central-difference gradient, falling
//! back to the triangle face normal where the stencil is incomplete.

use crate::block::Update;
use crate::index::{self, BlockIndex, GlobalVoxelIndex};
use crate::layer::TsdfLayer;
use crate::mesh::{Mesh, MeshLayer};
use crate::mesh_tables::{CORNER_OFFSETS, EDGE_CORNERS, TRIANGLE_TABLE};
use crate::voxel::Color;
use glam::{IVec3, Vec3};
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Weights below this count as unobserved for meshing
const MIN_MESH_WEIGHT: f32 = 1e-4;

/// Marching-cubes mesher over dirty blocks
#[derive(Debug, Default)]
pub struct MeshIntegrator;

impl MeshIntegrator {
    pub fn new() -> Self {
        Self
    }

    /// Re-mesh blocks into the mesh layer
    ///
    /// With `only_updated`, only blocks carrying the mesh marker are
    /// visited; otherwise all. Each visited block's mesh is replaced and
    /// flagged updated. With `clear_flag`, the mesh marker is cleared on
    /// every visited block.
    pub fn generate(
        &self,
        layer: &mut TsdfLayer,
        mesh_layer: &mut MeshLayer,
        only_updated: bool,
        clear_flag: bool,
    ) {
        let indices: Vec<BlockIndex> = if only_updated {
            layer.blocks_with_marker(Update::Mesh)
        } else {
            layer.block_indices().collect()
        };

        // Extraction reads the layer; meshes for distinct blocks are
        // independent, so the per-block work fans out.
        let extract = |index: &BlockIndex| (*index, extract_block_mesh(layer, *index));
        #[cfg(feature = "parallel")]
        let meshes: Vec<(BlockIndex, Mesh)> = indices.par_iter().map(extract).collect();
        #[cfg(not(feature = "parallel"))]
        let meshes: Vec<(BlockIndex, Mesh)> = indices.iter().map(extract).collect();

        for (index, mesh) in meshes {
            mesh_layer.replace_mesh(index, mesh);
            if clear_flag {
                layer.clear_marker(index, Update::Mesh);
            }
        }
    }
}

/// Run marching cubes over one block plus its one-voxel neighbor skirt
pub fn extract_block_mesh(layer: &TsdfLayer, block_index: BlockIndex) -> Mesh {
    let mut mesh = Mesh::new();
    let Some(block) = layer.block(block_index) else {
        return mesh;
    };
    if !block.has_data {
        return mesh;
    }

    let vps = layer.voxels_per_side() as i32;
    let base = block_index * vps;
    for z in 0..vps {
        for y in 0..vps {
            for x in 0..vps {
                march_cube(layer, base + IVec3::new(x, y, z), &mut mesh);
            }
        }
    }
    mesh
}

/// Distance, color and observation state of the 8 cube corners
fn gather_corners(
    layer: &TsdfLayer,
    anchor: GlobalVoxelIndex,
) -> Option<([f32; 8], [Color; 8])> {
    let mut distances = [0.0f32; 8];
    let mut colors = [Color::default(); 8];
    for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
        let gvi = anchor + IVec3::new(offset[0], offset[1], offset[2]);
        let voxel = layer.voxel(gvi)?;
        if voxel.weight < MIN_MESH_WEIGHT {
            return None;
        }
        distances[i] = voxel.distance;
        colors[i] = voxel.color;
    }
    Some((distances, colors))
}

fn march_cube(layer: &TsdfLayer, anchor: GlobalVoxelIndex, mesh: &mut Mesh) {
    let Some((distances, colors)) = gather_corners(layer, anchor) else {
        return;
    };

    let mut config = 0usize;
    for (i, &d) in distances.iter().enumerate() {
        if d < 0.0 {
            config |= 1 << i;
        }
    }
    let row = &TRIANGLE_TABLE[config];
    if row[0] == -1 {
        return;
    }

    let voxel_size = layer.voxel_size();
    let corner_position = |corner: usize| -> Vec3 {
        let offset = CORNER_OFFSETS[corner];
        index::voxel_center(
            anchor + IVec3::new(offset[0], offset[1], offset[2]),
            voxel_size,
        )
    };

    for tri in row.chunks(3) {
        if tri[0] == -1 {
            break;
        }
        let mut positions = [Vec3::ZERO; 3];
        let mut vertex_colors = [Color::default(); 3];
        let mut normals = [None; 3];
        for (slot, &edge) in tri.iter().enumerate() {
            let [c0, c1] = EDGE_CORNERS[edge as usize];
            let d0 = distances[c0];
            let d1 = distances[c1];
            // Zero crossing along the edge; the cube index guarantees a
            // sign change, so the denominator is bounded away from zero
            let t = (d0 / (d0 - d1)).clamp(0.0, 1.0);
            positions[slot] = corner_position(c0).lerp(corner_position(c1), t);
            vertex_colors[slot] = Color::lerp(colors[c0], colors[c1], t);

            let g0 = voxel_gradient(layer, anchor, c0);
            let g1 = voxel_gradient(layer, anchor, c1);
            normals[slot] = match (g0, g1) {
                (Some(a), Some(b)) => {
                    let g = a.lerp(b, t);
                    (g.length_squared() > 1e-12).then(|| g.normalize())
                }
                _ => None,
            };
        }

        // Face normal fallback for incomplete gradient stencils; the
        // table winds clockwise seen from the positive-distance side, so
        // the cross product is taken in reverse to match the gradient
        // orientation
        let face = (positions[2] - positions[0]).cross(positions[1] - positions[0]);
        let face_normal = if face.length_squared() > 1e-12 {
            face.normalize()
        } else {
            Vec3::Z
        };
        for slot in 0..3 {
            mesh.push_vertex(
                positions[slot],
                normals[slot].unwrap_or(face_normal),
                vertex_colors[slot],
            );
        }
    }
}

/// Central-difference gradient at a cube corner voxel
fn voxel_gradient(layer: &TsdfLayer, anchor: GlobalVoxelIndex, corner: usize) -> Option<Vec3> {
    let offset = CORNER_OFFSETS[corner];
    let gvi = anchor + IVec3::new(offset[0], offset[1], offset[2]);
    let voxel_size = layer.voxel_size();

    let sample = |delta: IVec3| -> Option<f32> {
        let v = layer.voxel(gvi + delta)?;
        (v.weight >= MIN_MESH_WEIGHT).then_some(v.distance)
    };

    let gx = sample(IVec3::X)? - sample(-IVec3::X)?;
    let gy = sample(IVec3::Y)? - sample(-IVec3::Y)?;
    let gz = sample(IVec3::Z)? - sample(-IVec3::Z)?;
    Some(Vec3::new(gx, gy, gz) / (2.0 * voxel_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::{IntegratorConfig, MergedIntegrator};
    use crate::math::Pose;

    /// Fill every voxel in a slab of blocks with the plane field d = z
    fn plane_layer() -> TsdfLayer {
        let mut layer = TsdfLayer::new(0.1, 8);
        for bx in -1..=1 {
            for by in -1..=1 {
                for bz in -1..=0 {
                    let block = layer.allocate_block(IVec3::new(bx, by, bz));
                    block.has_data = true;
                    block.set_updated(Update::Mesh);
                    for linear in 0..block.num_voxels() {
                        let center = block.voxel_center(linear);
                        let voxel = block.voxel_mut(linear);
                        voxel.distance = center.z;
                        voxel.weight = 1.0;
                    }
                }
            }
        }
        layer
    }

    #[test]
    fn test_plane_mesh_lies_at_zero_crossing() {
        let mut layer = plane_layer();
        let mut mesh_layer = MeshLayer::new(layer.block_size());
        MeshIntegrator::new().generate(&mut layer, &mut mesh_layer, true, true);

        let combined = mesh_layer.combined_mesh();
        assert!(!combined.is_empty());
        for v in &combined.vertices {
            assert!(v.z.abs() < 1e-4, "vertex off the surface: {v:?}");
        }
        // Gradient of d = z is +z everywhere
        for n in &combined.normals {
            assert!(n.z > 0.9, "normal not aligned with gradient: {n:?}");
        }
    }

    #[test]
    fn test_mesh_marker_protocol() {
        let mut layer = plane_layer();
        let mut mesh_layer = MeshLayer::new(layer.block_size());

        let dirty_before = layer.blocks_with_marker(Update::Mesh).len();
        assert!(dirty_before > 0);

        MeshIntegrator::new().generate(&mut layer, &mut mesh_layer, true, true);

        // No block retains the marker; every previously marked block now
        // has an updated mesh
        assert!(layer.blocks_with_marker(Update::Mesh).is_empty());
        assert_eq!(mesh_layer.updated_meshes().len(), dirty_before);
    }

    #[test]
    fn test_only_updated_limits_extraction() {
        let mut layer = plane_layer();
        for index in layer.blocks_with_marker(Update::Mesh) {
            layer.clear_marker(index, Update::Mesh);
        }
        layer.set_marker(IVec3::new(0, 0, -1), Update::Mesh);

        let mut mesh_layer = MeshLayer::new(layer.block_size());
        MeshIntegrator::new().generate(&mut layer, &mut mesh_layer, true, true);
        assert_eq!(mesh_layer.num_meshes(), 1);
    }

    #[test]
    fn test_unobserved_block_meshes_empty() {
        let mut layer = TsdfLayer::new(0.1, 8);
        layer.allocate_block(IVec3::ZERO).set_updated(Update::Mesh);
        let mut mesh_layer = MeshLayer::new(layer.block_size());
        MeshIntegrator::new().generate(&mut layer, &mut mesh_layer, true, true);

        let mesh = mesh_layer.mesh(IVec3::ZERO).unwrap();
        assert!(mesh.is_empty());
        assert!(mesh.updated);
    }

    /// Cubes on block boundaries are cut exactly once: meshing a surface
    /// spanning two blocks emits no duplicate triangles at the seam.
    #[test]
    fn test_block_seam_has_no_duplicates() {
        let mut layer = plane_layer();
        let mut mesh_layer = MeshLayer::new(layer.block_size());
        MeshIntegrator::new().generate(&mut layer, &mut mesh_layer, true, true);

        let combined = mesh_layer.combined_mesh();
        let mut centroids: Vec<[i64; 3]> = combined
            .indices
            .chunks(3)
            .map(|tri| {
                let c = (combined.vertices[tri[0] as usize]
                    + combined.vertices[tri[1] as usize]
                    + combined.vertices[tri[2] as usize])
                    / 3.0;
                [
                    (c.x * 1e5).round() as i64,
                    (c.y * 1e5).round() as i64,
                    (c.z * 1e5).round() as i64,
                ]
            })
            .collect();
        let total = centroids.len();
        centroids.sort_unstable();
        centroids.dedup();
        assert_eq!(centroids.len(), total, "duplicate triangle at block seam");
    }

    /// Meshing the output of a real integration pass produces triangles
    /// near the observed surface.
    #[test]
    fn test_meshes_integrated_wall() {
        let mut layer = TsdfLayer::new(0.05, 8);
        let integrator = MergedIntegrator::new(IntegratorConfig {
            truncation_distance: 0.2,
            ..IntegratorConfig::default()
        });
        let mut points = Vec::new();
        for y in -10..=10 {
            for z in -10..=10 {
                points.push(Vec3::new(1.0, y as f32 * 0.04, z as f32 * 0.04));
            }
        }
        let colors = vec![Color::new(30, 200, 90); points.len()];
        integrator.integrate(&mut layer, &Pose::IDENTITY, &points, &colors, false, false);

        let mut mesh_layer = MeshLayer::new(layer.block_size());
        MeshIntegrator::new().generate(&mut layer, &mut mesh_layer, true, true);

        let combined = mesh_layer.combined_mesh();
        assert!(combined.num_triangles() > 0);
        for v in &combined.vertices {
            assert!((v.x - 1.0).abs() < 0.1, "vertex far from wall: {v:?}");
        }
    }
}
