//! ICP pose refinement against the TSDF
//!
//! Aligns a sensor-frame cloud to the implicit surface by Gauss-Newton
//! on the point-to-surface distance: each iteration samples the field and
//! its gradient at the transformed points (trilinear, observed voxels
//! only), accumulates the 6x6 normal system for the twist
//! `(rx, ry, rz, tx, ty, tz)` and composes the solved increment onto the
//! pose. The residual for a point `p` is `d(T p)` with Jacobian
//! `[ (T p) x g , g ]` for gradient `g`.
//!
//! The system is lightly damped so directions the surface cannot observe
//! (e.g. yaw against a single plane) receive no update instead of
//! blowing up the solve.

use crate::interpolator;
use crate::layer::TsdfLayer;
use crate::math::Pose;
use glam::Vec3;
use serde::Deserialize;

/// ICP configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Iteration cap per refinement
    pub max_iterations: usize,
    /// Stop once the increment twist norm falls below this
    pub convergence_threshold: f32,
    /// Minimum fraction of points with a valid field sample
    pub min_valid_fraction: f32,
    /// Upper bound on points used per iteration (uniform stride)
    pub max_points: usize,
    /// When false, roll and pitch of the accumulated correction are
    /// zeroed so gravity-aligned drift cannot creep in
    pub refine_roll_pitch: bool,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            convergence_threshold: 1e-5,
            min_valid_fraction: 0.1,
            max_points: 500,
            refine_roll_pitch: false,
        }
    }
}

/// Gauss-Newton refiner; stateless between calls
#[derive(Debug, Clone, Default)]
pub struct IcpRefiner {
    pub config: IcpConfig,
}

impl IcpRefiner {
    pub fn new(config: IcpConfig) -> Self {
        Self { config }
    }

    /// Refine `t_init` so the cloud lies on the implicit surface
    ///
    /// Returns the refined pose and the number of iterations that
    /// produced a valid solve. Zero means the field could not be sampled
    /// (too few observed voxels under the cloud) and the pose is returned
    /// unchanged.
    pub fn refine(
        &self,
        layer: &TsdfLayer,
        points_c: &[Vec3],
        t_init: &Pose,
    ) -> (Pose, usize) {
        let mut pose = *t_init;
        let mut succeeded = 0;

        for _ in 0..self.config.max_iterations {
            let Some(twist) = self.step(layer, points_c, &pose) else {
                break;
            };
            let (rot, trans) = twist;
            pose = Pose::from_twist(rot, trans) * pose;
            succeeded += 1;
            if rot.length() + trans.length() < self.config.convergence_threshold {
                break;
            }
        }

        if succeeded > 0 && !self.config.refine_roll_pitch {
            pose = zero_roll_pitch(&pose, t_init);
        }
        (pose, succeeded)
    }

    /// One Gauss-Newton step; `None` when too few samples are valid or
    /// the normal system cannot be solved
    fn step(&self, layer: &TsdfLayer, points_c: &[Vec3], pose: &Pose) -> Option<(Vec3, Vec3)> {
        let stride = (points_c.len() / self.config.max_points.max(1)).max(1);
        let mut h = [[0.0f64; 6]; 6];
        let mut b = [0.0f64; 6];
        let mut considered = 0usize;
        let mut valid = 0usize;

        for point_c in points_c.iter().step_by(stride) {
            considered += 1;
            let point_g = pose.transform_point(*point_c);
            let Some((distance, gradient)) =
                interpolator::distance_and_gradient_at(layer, point_g)
            else {
                continue;
            };
            if gradient.length_squared() < 1e-12 {
                continue;
            }
            valid += 1;

            let j_rot = point_g.cross(gradient);
            let jacobian = [
                j_rot.x as f64,
                j_rot.y as f64,
                j_rot.z as f64,
                gradient.x as f64,
                gradient.y as f64,
                gradient.z as f64,
            ];
            let residual = distance as f64;
            for row in 0..6 {
                b[row] += jacobian[row] * residual;
                for col in 0..6 {
                    h[row][col] += jacobian[row] * jacobian[col];
                }
            }
        }

        if considered == 0 || (valid as f32) < self.config.min_valid_fraction * considered as f32 {
            return None;
        }

        // Damp unobservable directions toward a zero update
        let trace: f64 = (0..6).map(|i| h[i][i]).sum();
        let damping = 1e-6 * trace / 6.0 + 1e-12;
        for (i, row) in h.iter_mut().enumerate() {
            row[i] += damping;
            b[i] = -b[i];
        }

        let delta = solve6(h, b)?;
        Some((
            Vec3::new(delta[0] as f32, delta[1] as f32, delta[2] as f32),
            Vec3::new(delta[3] as f32, delta[4] as f32, delta[5] as f32),
        ))
    }
}

/// Rebuild the refined pose with the roll and pitch of the accumulated
/// correction zeroed in its log-map
fn zero_roll_pitch(refined: &Pose, initial: &Pose) -> Pose {
    let correction = *refined * initial.inverse();
    let (mut rot_vec, trans) = correction.to_twist();
    rot_vec.x = 0.0;
    rot_vec.y = 0.0;
    Pose::from_twist(rot_vec, trans) * *initial
}

/// Gaussian elimination with partial pivoting on the 6x6 normal system
fn solve6(mut a: [[f64; 6]; 6], mut b: [f64; 6]) -> Option<[f64; 6]> {
    for col in 0..6 {
        let pivot_row = (col..6)
            .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
            .unwrap_or(col);
        if a[pivot_row][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..6 {
            let factor = a[row][col] / a[col][col];
            for k in col..6 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 6];
    for row in (0..6).rev() {
        let mut sum = b[row];
        for col in (row + 1)..6 {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}
