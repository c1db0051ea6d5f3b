//! Merged (bundled) integration
//!
//! Dense clouds land many points in the same voxel; casting a ray per
//! point then repeats nearly identical updates. This flavor groups points
//! by their containing voxel first and casts a single ray per group,
//! carrying the group's summed weight, weighted-mean endpoint and blended
//! color. Per-group updates are commutative weighted means, so the end
//! state of a cloud does not depend on bucket iteration order.

use super::raycast::RayCaster;
use super::{mark_block_touched, update_voxel, IntegratorConfig, MIN_RAY_LENGTH};
use crate::index::{self, GlobalVoxelIndex};
use crate::layer::TsdfLayer;
use crate::math::Pose;
use crate::voxel::Color;
use glam::Vec3;
use rustc_hash::{FxHashMap, FxHashSet};

/// Running accumulator for one voxel bucket
struct Bundle {
    weighted_position: Vec3,
    weight: f32,
    color: Color,
}

#[derive(Debug)]
pub struct MergedIntegrator {
    pub config: IntegratorConfig,
}

impl MergedIntegrator {
    pub fn new(config: IntegratorConfig) -> Self {
        Self { config }
    }

    pub fn integrate(
        &self,
        layer: &mut TsdfLayer,
        t_g_c: &Pose,
        points_c: &[Vec3],
        colors: &[Color],
        is_freespace: bool,
        deintegrate: bool,
    ) {
        let voxel_size = layer.voxel_size();
        let voxel_size_inv = 1.0 / voxel_size;
        let vps = layer.voxels_per_side() as i32;
        let tau = self.config.truncation_distance;
        let origin = t_g_c.translation;

        // Bucket points by containing voxel; the distance part of the
        // point weight is folded in here, the obliqueness part is applied
        // per updated voxel below.
        let mut bundles: FxHashMap<GlobalVoxelIndex, Bundle> = FxHashMap::default();
        for (point_c, color) in points_c.iter().zip(colors) {
            let point_g = t_g_c.transform_point(*point_c);
            let distance = (point_g - origin).length();
            if distance < MIN_RAY_LENGTH || distance > self.config.range_limit() {
                continue;
            }
            let weight = self.config.weight_policy.distance_weight(distance);
            let gvi = index::global_voxel_index_from_point(point_g, voxel_size_inv);
            bundles
                .entry(gvi)
                .and_modify(|bundle| {
                    bundle.color = Color::blend(bundle.color, bundle.weight, *color, weight);
                    bundle.weighted_position += point_g * weight;
                    bundle.weight += weight;
                })
                .or_insert_with(|| Bundle {
                    weighted_position: point_g * weight,
                    weight,
                    color: *color,
                });
        }

        let mut touched = FxHashSet::default();
        for bundle in bundles.values() {
            if bundle.weight <= 0.0 {
                continue;
            }
            let point_g = bundle.weighted_position / bundle.weight;
            let ray = point_g - origin;
            let distance = ray.length();
            if distance < MIN_RAY_LENGTH {
                continue;
            }
            let direction = ray / distance;
            let end = point_g + direction * tau;

            for gvi in RayCaster::new(origin * voxel_size_inv, end * voxel_size_inv) {
                let center = index::voxel_center(gvi, voxel_size);
                let sdf = (point_g - center).dot(direction);
                if is_freespace && sdf <= tau {
                    continue;
                }
                let weight = bundle.weight
                    * self
                        .config
                        .weight_policy
                        .dropoff_factor(sdf, tau, voxel_size);

                let block_index = index::block_index_from_global_voxel(gvi, vps);
                let local = index::local_from_global_voxel(gvi, vps);
                let voxel = layer.allocate_block(block_index).voxel_at_mut(local);
                if update_voxel(voxel, sdf, weight, bundle.color, &self.config, deintegrate) {
                    touched.insert(block_index);
                }
            }
        }

        for block_index in touched {
            mark_block_touched(layer, block_index);
        }
    }
}
