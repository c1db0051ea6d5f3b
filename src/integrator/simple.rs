//! Simple per-point ray integration
//!
//! For every point, walk the voxels from the sensor origin to the point
//! plus one truncation distance and apply the kernel to each. Redundant
//! work on dense clouds is the price of the simplest possible locality.
//!
//! Update order is documented rather than left incidental: points are
//! processed in input order and voxels in ray-traversal order from the
//! sensor outward. The end state of a cloud can depend mildly on this
//! order (the running average saturates at `max_weight`), which is why
//! this flavor does not support exact deintegration.

use super::raycast::RayCaster;
use super::{mark_block_touched, update_voxel, IntegratorConfig, MIN_RAY_LENGTH};
use crate::index;
use crate::layer::TsdfLayer;
use crate::math::Pose;
use crate::voxel::Color;
use glam::Vec3;
use rustc_hash::FxHashSet;

#[derive(Debug)]
pub struct SimpleIntegrator {
    pub config: IntegratorConfig,
}

impl SimpleIntegrator {
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
        let mut touched = FxHashSet::default();

        for (point_c, color) in points_c.iter().zip(colors) {
            let point_g = t_g_c.transform_point(*point_c);
            let ray = point_g - origin;
            let distance = ray.length();
            if distance < MIN_RAY_LENGTH || distance > self.config.range_limit() {
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
                let weight = self.config.weight_policy.distance_weight(distance)
                    * self
                        .config
                        .weight_policy
                        .dropoff_factor(sdf, tau, voxel_size);

                let block_index = index::block_index_from_global_voxel(gvi, vps);
                let local = index::local_from_global_voxel(gvi, vps);
                let voxel = layer.allocate_block(block_index).voxel_at_mut(local);
                if update_voxel(voxel, sdf, weight, *color, &self.config, deintegrate) {
                    touched.insert(block_index);
                }
            }
        }

        for block_index in touched {
            mark_block_touched(layer, block_index);
        }
    }
}
