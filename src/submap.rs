//! Submap records and disk persistence
//!
//! A submap is a self-contained snapshot: the full current layer plus
//! the trajectory accumulated since the last cut. When a target
//! directory is configured (absolute, ASCII-only) each cut is also
//! written to disk:
//!
//! ```text
//! <root>/voxblox_submap_<N>/volumetric_map.tsdf
//! <root>/voxblox_submap_<N>/robot_trajectory.traj
//! ```
//!
//! The trajectory file is a length-prefixed record: robot name, frame
//! id, then `{timestamp_ns, position xyz, quaternion wxyz}` per sample.

use crate::codec;
use crate::error::{Error, Result};
use crate::layer::TsdfLayer;
use crate::math::{Pose, Timestamp};
use glam::{Quat, Vec3};
use std::fs;
use std::path::{Path, PathBuf};

/// One trajectory sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrajectoryPoint {
    pub timestamp: Timestamp,
    pub pose: Pose,
}

/// Ordered pose history of one submap
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub robot_name: String,
    pub frame_id: String,
    pub points: Vec<TrajectoryPoint>,
}

/// Validate a configured submap root directory
///
/// Must be absolute and ASCII-only; anything else is a configuration
/// error and the caller disables disk writes.
pub fn validate_submap_directory(dir: &str) -> Result<PathBuf> {
    if !dir.is_ascii() {
        return Err(Error::Config(format!(
            "submap directory '{dir}' contains non-ASCII characters"
        )));
    }
    let path = PathBuf::from(dir);
    if !path.is_absolute() {
        return Err(Error::Config(format!(
            "submap directory '{dir}' is not absolute"
        )));
    }
    Ok(path)
}

/// Recursively create a directory, wide permissions, single exit
///
/// An already-existing directory is success.
pub fn create_path(path: &Path) -> Result<()> {
    #[cfg(unix)]
    let result = {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(path)
    };
    #[cfg(not(unix))]
    let result = fs::DirBuilder::new().recursive(true).create(path);

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn take_string(bytes: &[u8], at: &mut usize) -> Result<String> {
    if bytes.len() < *at + 4 {
        return Err(Error::InvalidFormat("truncated trajectory string".to_string()));
    }
    let len = u32::from_le_bytes(bytes[*at..*at + 4].try_into().unwrap()) as usize;
    *at += 4;
    if bytes.len() < *at + len {
        return Err(Error::InvalidFormat("truncated trajectory string".to_string()));
    }
    let s = String::from_utf8(bytes[*at..*at + len].to_vec())
        .map_err(|e| Error::InvalidFormat(format!("trajectory string: {e}")))?;
    *at += len;
    Ok(s)
}

/// Serialize a trajectory to its on-disk payload
pub fn encode_trajectory(trajectory: &Trajectory) -> Vec<u8> {
    let mut out = Vec::new();
    put_string(&mut out, &trajectory.robot_name);
    put_string(&mut out, &trajectory.frame_id);
    out.extend_from_slice(&(trajectory.points.len() as u32).to_le_bytes());
    for point in &trajectory.points {
        out.extend_from_slice(&point.timestamp.as_nanos().to_le_bytes());
        let t = point.pose.translation;
        for v in [t.x as f64, t.y as f64, t.z as f64] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let q = point.pose.rotation;
        for v in [q.w as f64, q.x as f64, q.y as f64, q.z as f64] {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

/// Decode a trajectory payload
pub fn decode_trajectory(bytes: &[u8]) -> Result<Trajectory> {
    let mut at = 0usize;
    let robot_name = take_string(bytes, &mut at)?;
    let frame_id = take_string(bytes, &mut at)?;

    if bytes.len() < at + 4 {
        return Err(Error::InvalidFormat("truncated trajectory count".to_string()));
    }
    let count = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) as usize;
    at += 4;

    const POINT_BYTES: usize = 8 + 7 * 8;
    if bytes.len() < at + count * POINT_BYTES {
        return Err(Error::InvalidFormat("truncated trajectory points".to_string()));
    }

    let read_f64 = |at: &mut usize| {
        let v = f64::from_le_bytes(bytes[*at..*at + 8].try_into().unwrap());
        *at += 8;
        v
    };

    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let timestamp =
            Timestamp(i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()));
        at += 8;
        let x = read_f64(&mut at);
        let y = read_f64(&mut at);
        let z = read_f64(&mut at);
        let w = read_f64(&mut at);
        let qx = read_f64(&mut at);
        let qy = read_f64(&mut at);
        let qz = read_f64(&mut at);
        points.push(TrajectoryPoint {
            timestamp,
            pose: Pose::new(
                Quat::from_xyzw(qx as f32, qy as f32, qz as f32, w as f32),
                Vec3::new(x as f32, y as f32, z as f32),
            ),
        });
    }
    Ok(Trajectory {
        robot_name,
        frame_id,
        points,
    })
}

/// Write one submap to disk, returning its directory
pub fn write_submap(
    root: &Path,
    submap_index: u64,
    layer: &TsdfLayer,
    trajectory: &Trajectory,
) -> Result<PathBuf> {
    let dir = root.join(format!("voxblox_submap_{submap_index}"));
    create_path(&dir)?;

    codec::save_layer(layer, dir.join("volumetric_map.tsdf"))?;

    let payload = encode_trajectory(trajectory);
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    fs::write(dir.join("robot_trajectory.traj"), framed)?;

    Ok(dir)
}

/// Read a submap trajectory back from disk
pub fn read_trajectory(path: &Path) -> Result<Trajectory> {
    let bytes = fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::InvalidFormat("truncated trajectory file".to_string()));
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if bytes.len() < 4 + len {
        return Err(Error::InvalidFormat("truncated trajectory file".to_string()));
    }
    decode_trajectory(&bytes[4..4 + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_trajectory() -> Trajectory {
        Trajectory {
            robot_name: "rover".to_string(),
            frame_id: "odom".to_string(),
            points: vec![
                TrajectoryPoint {
                    timestamp: Timestamp::from_secs_f64(1.0),
                    pose: Pose::from_translation(Vec3::new(1.0, 2.0, 3.0)),
                },
                TrajectoryPoint {
                    timestamp: Timestamp::from_secs_f64(2.5),
                    pose: Pose::new(Quat::from_rotation_z(0.7), Vec3::new(-1.0, 0.5, 0.0)),
                },
            ],
        }
    }

    #[test]
    fn test_directory_validation() {
        assert!(validate_submap_directory("/data/maps").is_ok());
        assert!(matches!(
            validate_submap_directory("relative/path"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            validate_submap_directory("/data/mäps"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_create_path_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        create_path(&nested).unwrap();
        assert!(nested.is_dir());
        // Second call on the existing path still succeeds
        create_path(&nested).unwrap();
    }

    #[test]
    fn test_trajectory_roundtrip() {
        let trajectory = sample_trajectory();
        let bytes = encode_trajectory(&trajectory);
        let decoded = decode_trajectory(&bytes).unwrap();

        assert_eq!(decoded.robot_name, "rover");
        assert_eq!(decoded.frame_id, "odom");
        assert_eq!(decoded.points.len(), 2);
        assert_eq!(decoded.points[0].timestamp, trajectory.points[0].timestamp);
        let q0 = trajectory.points[1].pose.rotation;
        let q1 = decoded.points[1].pose.rotation;
        assert_relative_eq!(q0.dot(q1).abs(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_write_submap_layout() {
        let root = tempfile::tempdir().unwrap();
        let mut layer = TsdfLayer::new(0.1, 4);
        layer.allocate_block(glam::IVec3::ZERO).has_data = true;

        let dir = write_submap(root.path(), 3, &layer, &sample_trajectory()).unwrap();
        assert!(dir.ends_with("voxblox_submap_3"));
        assert!(dir.join("volumetric_map.tsdf").is_file());
        assert!(dir.join("robot_trajectory.traj").is_file());

        let restored = codec::load_layer(dir.join("volumetric_map.tsdf")).unwrap();
        assert_eq!(restored.num_blocks(), 1);
        let trajectory = read_trajectory(&dir.join("robot_trajectory.traj")).unwrap();
        assert_eq!(trajectory.points.len(), 2);
    }
}
