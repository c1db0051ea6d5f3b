//! Configuration
//!
//! Serde-derived option structs with defaults for every field, loadable
//! from JSON. Validation is lenient by design: a rejected value logs a
//! configuration error and disables the feature it gates, it never takes
//! the pipeline down (see the pipeline constructor for the checks).
//!
//! Optional limits ("unset means no limit") are `Option`s, never numeric
//! sentinels.

use crate::error::{Error, Result};
use crate::icp::IcpConfig;
use crate::integrator::{IntegrationMethod, IntegratorConfig};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Layer geometry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Voxel side length in meters
    pub voxel_size: f32,
    /// Voxels per block side
    pub voxels_per_side: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.2,
            voxels_per_side: 16,
        }
    }
}

/// ICP gating around the refiner's own settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IcpOptions {
    pub enable_icp: bool,
    /// Carry the correction across messages instead of per-message
    pub accumulate_icp_corrections: bool,
    #[serde(flatten)]
    pub refiner: IcpConfig,
}

/// Ingest queue and culling behavior
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Messages closer together than this are dropped
    pub min_time_between_msgs_sec: f64,
    /// Queue bound; on transform failure the head is dropped once the
    /// queue reaches this length
    pub pointcloud_queue_size: usize,
    /// Blocks farther than this from the sensor are culled (unset: keep all)
    pub max_block_distance_from_body: Option<f32>,
    /// Enable the parallel freespace queue
    pub use_freespace_pointcloud: bool,
    /// World frame name used for lookups and published artifacts
    pub world_frame: String,
    /// Robot name recorded in trajectory files
    pub robot_name: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_time_between_msgs_sec: 0.0,
            pointcloud_queue_size: 10,
            max_block_distance_from_body: None,
            use_freespace_pointcloud: false,
            world_frame: "world".to_string(),
            robot_name: "robot".to_string(),
        }
    }
}

/// Sliding-window deintegration limits; any subset may be set
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub pointcloud_deintegration_max_queue_length: Option<usize>,
    pub pointcloud_deintegration_max_time_interval_sec: Option<f64>,
    pub pointcloud_deintegration_max_distance_travelled: Option<f32>,
}

impl WindowConfig {
    /// True when any axis is bounded
    pub fn enabled(&self) -> bool {
        self.pointcloud_deintegration_max_queue_length.is_some()
            || self.pointcloud_deintegration_max_time_interval_sec.is_some()
            || self.pointcloud_deintegration_max_distance_travelled.is_some()
    }
}

/// Submap cutting and persistence
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmapConfig {
    pub submap_max_time_interval_sec: Option<f64>,
    pub submap_max_distance_travelled: Option<f32>,
    /// Target directory for on-disk submaps; must be absolute and ASCII
    pub write_submaps_to_directory: Option<String>,
}

impl SubmapConfig {
    pub fn enabled(&self) -> bool {
        self.submap_max_time_interval_sec.is_some()
            || self.submap_max_distance_travelled.is_some()
    }
}

/// Meshing and publishing cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub update_mesh_every_n_sec: f64,
    pub publish_map_every_n_sec: f64,
    /// Vertex color source: "color" (integrated colors) or "normals"
    pub color_mode: String,
    /// When set, `generate_mesh` also writes a PLY here
    pub mesh_filename: Option<String>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            update_mesh_every_n_sec: 1.0,
            publish_map_every_n_sec: 1.0,
            color_mode: "color".to_string(),
            mesh_filename: None,
        }
    }
}

/// Visualization derivations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisConfig {
    /// Z level of the published slice
    pub slice_level: f32,
    /// Interpret `slice_level` relative to the sensor height
    pub slice_level_follow_robot: bool,
    /// Colormap for intensity clouds
    pub intensity_colormap: String,
    /// Intensity normalization divisor
    pub intensity_max_value: f32,
}

impl Default for VisConfig {
    fn default() -> Self {
        Self {
            slice_level: 0.5,
            slice_level_follow_robot: false,
            intensity_colormap: "rainbow".to_string(),
            intensity_max_value: 100.0,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub map: MapConfig,
    /// Integrator flavor: simple, merged, fast or projective
    pub method: IntegrationMethod,
    pub integrator: IntegratorConfig,
    pub icp: IcpOptions,
    pub ingest: IngestConfig,
    pub window: WindowConfig,
    pub submap: SubmapConfig,
    pub mesh: MeshConfig,
    pub vis: VisConfig,
}

impl Config {
    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::WeightPolicy;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.map.voxels_per_side, 16);
        assert_eq!(config.ingest.pointcloud_queue_size, 10);
        assert!(!config.window.enabled());
        assert!(!config.submap.enabled());
        assert!(config.submap.write_submaps_to_directory.is_none());
    }

    #[test]
    fn test_parse_partial_json() {
        let config = Config::from_json(
            r#"{
                "map": {"voxel_size": 0.05, "voxels_per_side": 8},
                "method": "projective",
                "integrator": {"truncation_distance": 0.15, "weight_policy": "inverse_square"},
                "window": {"pointcloud_deintegration_max_queue_length": 40},
                "submap": {"submap_max_distance_travelled": 2.0}
            }"#,
        )
        .unwrap();

        assert_eq!(config.map.voxel_size, 0.05);
        assert_eq!(config.method, IntegrationMethod::Projective);
        assert_eq!(config.integrator.truncation_distance, 0.15);
        assert_eq!(config.integrator.weight_policy, WeightPolicy::InverseSquare);
        assert_eq!(
            config.window.pointcloud_deintegration_max_queue_length,
            Some(40)
        );
        assert!(config.window.enabled());
        assert!(config.submap.enabled());
        // Untouched sections keep their defaults
        assert_eq!(config.mesh.update_mesh_every_n_sec, 1.0);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        assert!(matches!(
            Config::from_json("{ not json"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{"method": "telepathy"}"#),
            Err(Error::Config(_))
        ));
    }
}
