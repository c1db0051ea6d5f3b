//! Pose and time primitives
//!
//! A [`Pose`] is a rigid-body transform (rotation + translation) used for
//! sensor-to-world extrinsics, incremental ICP corrections and trajectory
//! records. Timestamps are integer nanoseconds to keep message ordering and
//! throttling exact.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::ops::Mul;

/// Message timestamp in nanoseconds since an arbitrary epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Create from fractional seconds
    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * 1e9).round() as i64)
    }

    /// Convert to fractional seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 * 1e-9
    }

    /// Nanosecond count
    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Elapsed seconds since `earlier` (negative if `self` is older)
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.0 - earlier.0) as f64 * 1e-9
    }
}

/// Rigid-body transform: rotation followed by translation
///
/// `T_A_B` maps points expressed in frame `B` into frame `A`:
/// `p_A = R * p_B + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Rotation component (unit quaternion)
    pub rotation: Quat,
    /// Translation component
    pub translation: Vec3,
}

impl Pose {
    /// Identity transform
    pub const IDENTITY: Pose = Pose {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    /// Create from rotation and translation
    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation: rotation.normalize(),
            translation,
        }
    }

    /// Pure translation
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            rotation: Quat::IDENTITY,
            translation,
        }
    }

    /// Build from a 6-vector twist `(rx, ry, rz, tx, ty, tz)`
    ///
    /// The rotation part is interpreted as a scaled axis (angle * axis).
    /// The translation is applied directly, which is the usual small-angle
    /// treatment for iterative refinement increments.
    pub fn from_twist(rot_vec: Vec3, translation: Vec3) -> Self {
        Self {
            rotation: Quat::from_scaled_axis(rot_vec),
            translation,
        }
    }

    /// Decompose into `(scaled_axis, translation)`
    pub fn to_twist(&self) -> (Vec3, Vec3) {
        (self.rotation.to_scaled_axis(), self.translation)
    }

    /// Apply the transform to a point
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.rotation * p + self.translation
    }

    /// Rotate a direction without translating
    pub fn rotate(&self, v: Vec3) -> Vec3 {
        self.rotation * v
    }

    /// Inverse transform
    pub fn inverse(&self) -> Pose {
        let inv_rot = self.rotation.conjugate();
        Pose {
            rotation: inv_rot,
            translation: inv_rot * -self.translation,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Pose {
    type Output = Pose;

    /// Compose transforms: `(a * b).transform_point(p) == a.transform_point(b.transform_point(p))`
    fn mul(self, rhs: Pose) -> Pose {
        Pose {
            rotation: (self.rotation * rhs.rotation).normalize(),
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_timestamp_roundtrip() {
        let t = Timestamp::from_secs_f64(1.25);
        assert_eq!(t.as_nanos(), 1_250_000_000);
        assert_relative_eq!(t.as_secs_f64(), 1.25);
        assert_relative_eq!(
            Timestamp::from_secs_f64(2.0).seconds_since(t),
            0.75,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_pose_compose_inverse() {
        let a = Pose::new(
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
            Vec3::new(1.0, 0.0, 0.0),
        );
        let b = Pose::new(
            Quat::from_rotation_x(0.3),
            Vec3::new(0.0, 2.0, -1.0),
        );

        let p = Vec3::new(0.5, -0.25, 1.5);
        let composed = (a * b).transform_point(p);
        let chained = a.transform_point(b.transform_point(p));
        assert_relative_eq!(composed.x, chained.x, epsilon = 1e-5);
        assert_relative_eq!(composed.y, chained.y, epsilon = 1e-5);
        assert_relative_eq!(composed.z, chained.z, epsilon = 1e-5);

        let back = a.inverse().transform_point(a.transform_point(p));
        assert_relative_eq!(back.x, p.x, epsilon = 1e-5);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-5);
        assert_relative_eq!(back.z, p.z, epsilon = 1e-5);
    }

    #[test]
    fn test_twist_roundtrip() {
        let pose = Pose::from_twist(Vec3::new(0.1, -0.2, 0.05), Vec3::new(1.0, 2.0, 3.0));
        let (rot_vec, trans) = pose.to_twist();
        assert_relative_eq!(rot_vec.x, 0.1, epsilon = 1e-5);
        assert_relative_eq!(rot_vec.y, -0.2, epsilon = 1e-5);
        assert_relative_eq!(rot_vec.z, 0.05, epsilon = 1e-5);
        assert_eq!(trans, Vec3::new(1.0, 2.0, 3.0));
    }
}
