//! Time-stamped transform lookup
//!
//! The ingest pipeline resolves each message's sensor frame into the
//! world frame at the message timestamp through the [`TransformSource`]
//! trait. Implementations must be non-blocking: a transform that is not
//! (yet) available is reported as `None` and the pipeline retries from
//! its queue.
//!
//! [`TransformBuffer`] is the provided implementation: per-frame sample
//! vectors ordered by time, interpolated lookup between brackets, plus
//! static transforms for fixed sensor mounts.

use crate::math::{Pose, Timestamp};
use rustc_hash::FxHashMap;

/// Resolver from (frame, time) to a world-frame pose
pub trait TransformSource {
    /// Pose of `frame_id` in the world frame at `time`, or `None` when
    /// the transform cannot be resolved right now
    fn lookup(&self, frame_id: &str, time: Timestamp) -> Option<Pose>;
}

/// Buffered, interpolating transform tree
#[derive(Debug, Default)]
pub struct TransformBuffer {
    samples: FxHashMap<String, Vec<(Timestamp, Pose)>>,
    static_transforms: FxHashMap<String, Pose>,
}

impl TransformBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a time-stamped sample for a frame, keeping samples ordered
    pub fn insert(&mut self, frame_id: &str, time: Timestamp, pose: Pose) {
        let samples = self.samples.entry(frame_id.to_string()).or_default();
        let position = samples.partition_point(|(t, _)| *t <= time);
        samples.insert(position, (time, pose));
    }

    /// Register a time-invariant transform (fixed mount)
    pub fn set_static(&mut self, frame_id: &str, pose: Pose) {
        self.static_transforms.insert(frame_id.to_string(), pose);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.static_transforms.is_empty()
    }
}

impl TransformSource for TransformBuffer {
    fn lookup(&self, frame_id: &str, time: Timestamp) -> Option<Pose> {
        if let Some(pose) = self.static_transforms.get(frame_id) {
            return Some(*pose);
        }
        let samples = self.samples.get(frame_id)?;
        let after = samples.partition_point(|(t, _)| *t < time);

        if after == 0 {
            // Exact hit on the first sample is fine, anything earlier is
            // outside the buffered interval
            let (t, pose) = samples.first()?;
            return (*t == time).then_some(*pose);
        }
        if after == samples.len() {
            let (t, pose) = samples.last()?;
            return (*t == time).then_some(*pose);
        }

        let (t0, p0) = samples[after - 1];
        let (t1, p1) = samples[after];
        if t0 == time {
            return Some(p0);
        }
        let alpha = (time.as_nanos() - t0.as_nanos()) as f32
            / (t1.as_nanos() - t0.as_nanos()) as f32;
        Some(Pose::new(
            p0.rotation.slerp(p1.rotation, alpha),
            p0.translation.lerp(p1.translation, alpha),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Quat, Vec3};

    #[test]
    fn test_exact_and_interpolated_lookup() {
        let mut buffer = TransformBuffer::new();
        buffer.insert(
            "base",
            Timestamp::from_secs_f64(1.0),
            Pose::from_translation(Vec3::new(0.0, 0.0, 0.0)),
        );
        buffer.insert(
            "base",
            Timestamp::from_secs_f64(2.0),
            Pose::from_translation(Vec3::new(2.0, 0.0, 0.0)),
        );

        let exact = buffer
            .lookup("base", Timestamp::from_secs_f64(1.0))
            .unwrap();
        assert_eq!(exact.translation, Vec3::ZERO);

        let mid = buffer
            .lookup("base", Timestamp::from_secs_f64(1.5))
            .unwrap();
        assert_relative_eq!(mid.translation.x, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_outside_interval_fails() {
        let mut buffer = TransformBuffer::new();
        buffer.insert(
            "base",
            Timestamp::from_secs_f64(1.0),
            Pose::IDENTITY,
        );
        assert!(buffer.lookup("base", Timestamp::from_secs_f64(0.5)).is_none());
        assert!(buffer.lookup("base", Timestamp::from_secs_f64(1.5)).is_none());
        assert!(buffer.lookup("other", Timestamp::from_secs_f64(1.0)).is_none());
    }

    #[test]
    fn test_static_transform_ignores_time() {
        let mut buffer = TransformBuffer::new();
        let mount = Pose::new(Quat::from_rotation_z(0.5), Vec3::new(0.1, 0.0, 0.3));
        buffer.set_static("lidar", mount);

        for secs in [0.0, 5.0, 1e6] {
            let pose = buffer
                .lookup("lidar", Timestamp::from_secs_f64(secs))
                .unwrap();
            assert_eq!(pose.translation, mount.translation);
        }
    }

    #[test]
    fn test_unordered_insertion_still_interpolates() {
        let mut buffer = TransformBuffer::new();
        buffer.insert(
            "base",
            Timestamp::from_secs_f64(3.0),
            Pose::from_translation(Vec3::new(3.0, 0.0, 0.0)),
        );
        buffer.insert(
            "base",
            Timestamp::from_secs_f64(1.0),
            Pose::from_translation(Vec3::new(1.0, 0.0, 0.0)),
        );

        let mid = buffer
            .lookup("base", Timestamp::from_secs_f64(2.0))
            .unwrap();
        assert_relative_eq!(mid.translation.x, 2.0, epsilon = 1e-6);
    }
}
