//! TSDF integration from posed point clouds
//!
//! Three integrator flavors share one update kernel and one contract;
//! they differ only in which voxels they touch per cloud:
//!
//! - [`simple::SimpleIntegrator`] casts a ray per point and updates every
//!   voxel crossed.
//! - [`merged::MergedIntegrator`] buckets points by containing voxel and
//!   applies one combined update per bucket.
//! - [`projective::ProjectiveIntegrator`] renders the cloud into a range
//!   image and updates voxels by projection; its per-voxel update is a
//!   pure function of (pose, image, voxel center), which is what makes
//!   exact deintegration possible.
//!
//! The kernel is the Curless & Levoy running weighted average:
//!
//! ```text
//! d' = (w * d + w_p * sdf) / (w + w_p)      w' = min(w + w_p, w_max)
//! ```
//!
//! with the deintegration direction `w' = max(w - w_p, 0)` solving the
//! same equation for the removed sample.

pub mod merged;
pub mod projective;
pub mod raycast;
pub mod simple;

pub use merged::MergedIntegrator;
pub use projective::ProjectiveIntegrator;
pub use simple::SimpleIntegrator;

use crate::block::Update;
use crate::error::{Error, Result};
use crate::layer::TsdfLayer;
use crate::math::Pose;
use crate::voxel::{Color, TsdfVoxel};
use glam::Vec3;
use serde::Deserialize;
use std::str::FromStr;

/// Rays shorter than this are degenerate and dropped
pub(crate) const MIN_RAY_LENGTH: f32 = 1e-4;

/// Per-point weighting policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightPolicy {
    /// Every point contributes weight 1
    #[default]
    Constant,
    /// Weight falls off with the square of the distance to the sensor
    InverseSquare,
    /// Inverse-square, additionally ramping to zero behind the surface
    InverseSquareDropoff,
}

impl WeightPolicy {
    /// Distance-dependent part of the point weight
    pub fn distance_weight(self, distance: f32) -> f32 {
        match self {
            WeightPolicy::Constant => 1.0,
            WeightPolicy::InverseSquare | WeightPolicy::InverseSquareDropoff => {
                1.0 / distance.max(MIN_RAY_LENGTH).powi(2)
            }
        }
    }

    /// Obliqueness factor: ramp from 1 at `sdf = -dropoff_epsilon` down to
    /// 0 at `sdf = -truncation` for the dropoff policy, 1 otherwise
    pub fn dropoff_factor(self, sdf: f32, truncation: f32, dropoff_epsilon: f32) -> f32 {
        match self {
            WeightPolicy::InverseSquareDropoff if sdf < -dropoff_epsilon => {
                ((truncation + sdf) / (truncation - dropoff_epsilon).max(MIN_RAY_LENGTH))
                    .clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }
}

/// Integrator flavor selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    Simple,
    #[default]
    Merged,
    /// Accepted for compatibility; resolves to the merged flavor
    Fast,
    Projective,
}

impl FromStr for IntegrationMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(IntegrationMethod::Simple),
            "merged" => Ok(IntegrationMethod::Merged),
            "fast" => Ok(IntegrationMethod::Fast),
            "projective" => Ok(IntegrationMethod::Projective),
            other => Err(Error::Config(format!("unknown integrator method '{other}'"))),
        }
    }
}

/// Layer-wide integration constants, fixed at construction
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntegratorConfig {
    /// Truncation distance τ: maximum magnitude of stored signed distance
    pub truncation_distance: f32,
    /// Weight cap per voxel
    pub max_weight: f32,
    /// Per-point weighting policy
    pub weight_policy: WeightPolicy,
    /// Points farther than this from the sensor are dropped (0 = no limit)
    pub max_ray_length: f32,
    /// Azimuth bins of the projective range image
    pub range_image_width: usize,
    /// Elevation bins of the projective range image
    pub range_image_height: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            truncation_distance: 0.3,
            max_weight: 10_000.0,
            weight_policy: WeightPolicy::default(),
            max_ray_length: 20.0,
            range_image_width: 360,
            range_image_height: 180,
        }
    }
}

impl IntegratorConfig {
    /// Effective range cutoff; `f32::INFINITY` when unlimited
    pub(crate) fn range_limit(&self) -> f32 {
        if self.max_ray_length > 0.0 {
            self.max_ray_length
        } else {
            f32::INFINITY
        }
    }
}

/// Apply one weighted sample to a voxel
///
/// `sdf` is clipped to the truncation band before averaging. Returns true
/// when the voxel was modified. Deintegration solves the running average
/// for the removed sample; when the remaining weight reaches zero the
/// voxel returns to the unobserved state (distance and color cleared).
pub(crate) fn update_voxel(
    voxel: &mut TsdfVoxel,
    sdf: f32,
    point_weight: f32,
    color: Color,
    config: &IntegratorConfig,
    deintegrate: bool,
) -> bool {
    if point_weight <= 0.0 {
        return false;
    }
    let tau = config.truncation_distance;
    let sdf = sdf.clamp(-tau, tau);

    if deintegrate {
        if !voxel.is_observed() {
            return false;
        }
        let remaining = voxel.weight - point_weight;
        if remaining <= 0.0 {
            *voxel = TsdfVoxel::default();
            return true;
        }
        voxel.distance =
            ((voxel.weight * voxel.distance - point_weight * sdf) / remaining).clamp(-tau, tau);
        voxel.color = Color::unblend(voxel.color, voxel.weight, color, point_weight);
        voxel.weight = remaining;
    } else {
        let combined = voxel.weight + point_weight;
        voxel.distance =
            ((voxel.weight * voxel.distance + point_weight * sdf) / combined).clamp(-tau, tau);
        voxel.color = Color::blend(voxel.color, voxel.weight, color, point_weight);
        voxel.weight = combined.min(config.max_weight);
    }
    true
}

/// Mark a block as holding data and needing map/mesh processing
pub(crate) fn mark_block_touched(layer: &mut TsdfLayer, index: glam::IVec3) {
    if let Some(block) = layer.block_mut(index) {
        block.has_data = true;
        block.set_updated(Update::Map);
        block.set_updated(Update::Mesh);
    }
}

/// Polymorphic TSDF integrator
///
/// A tagged variant rather than trait objects: the set of flavors is
/// closed and the pipeline needs to query deintegration support at
/// construction time.
#[derive(Debug)]
pub enum TsdfIntegrator {
    Simple(SimpleIntegrator),
    Merged(MergedIntegrator),
    Projective(ProjectiveIntegrator),
}

impl TsdfIntegrator {
    pub fn new(method: IntegrationMethod, config: IntegratorConfig) -> Self {
        match method {
            IntegrationMethod::Simple => TsdfIntegrator::Simple(SimpleIntegrator::new(config)),
            IntegrationMethod::Merged | IntegrationMethod::Fast => {
                TsdfIntegrator::Merged(MergedIntegrator::new(config))
            }
            IntegrationMethod::Projective => {
                TsdfIntegrator::Projective(ProjectiveIntegrator::new(config))
            }
        }
    }

    pub fn config(&self) -> &IntegratorConfig {
        match self {
            TsdfIntegrator::Simple(i) => &i.config,
            TsdfIntegrator::Merged(i) => &i.config,
            TsdfIntegrator::Projective(i) => &i.config,
        }
    }

    /// True when `integrate(..); integrate(.., deintegrate = true)` is an
    /// exact inverse; the pipeline refuses sliding-window deintegration
    /// otherwise
    pub fn supports_deintegration(&self) -> bool {
        matches!(self, TsdfIntegrator::Projective(_))
    }

    /// Fuse (or remove) one posed cloud into the layer
    ///
    /// `points_c` and `colors` are in the sensor frame and must have equal
    /// length; a mismatch is a programming error, not an input error.
    /// All writes are visible when this returns.
    pub fn integrate(
        &self,
        layer: &mut TsdfLayer,
        t_g_c: &Pose,
        points_c: &[Vec3],
        colors: &[Color],
        is_freespace: bool,
        deintegrate: bool,
    ) {
        assert_eq!(
            points_c.len(),
            colors.len(),
            "points and colors must be the same length"
        );
        match self {
            TsdfIntegrator::Simple(i) => {
                i.integrate(layer, t_g_c, points_c, colors, is_freespace, deintegrate)
            }
            TsdfIntegrator::Merged(i) => {
                i.integrate(layer, t_g_c, points_c, colors, is_freespace, deintegrate)
            }
            TsdfIntegrator::Projective(i) => {
                i.integrate(layer, t_g_c, points_c, colors, is_freespace, deintegrate)
            }
        }
    }
}
