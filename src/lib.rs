//! # voxfuse
//!
//! Streaming fusion of posed 3D point clouds into a persistent
//! volumetric model: a sparse, block-structured Truncated Signed
//! Distance Field (TSDF) with incremental triangle-mesh extraction.
//!
//! ## Key Features
//!
//! - **Sparse block layer**: hashed integer-indexed voxel blocks with
//!   per-consumer dirty markers
//! - **Three integrator flavors**: simple per-ray, merged (bundled), and
//!   projective range-image updates sharing one weighted-average kernel
//! - **Sliding-window maps**: the projective flavor supports exact
//!   deintegration, bounding the map in count, time or distance traveled
//! - **Incremental meshing**: marching cubes over dirty blocks with
//!   seam-consistent neighbor skirts
//! - **ICP refinement**: Gauss-Newton alignment of incoming clouds
//!   against the implicit surface
//! - **Submapping**: layer + trajectory snapshots cut on time/distance
//!   thresholds, optionally persisted to disk
//!
//! ## Example
//!
//! ```rust
//! use voxfuse::{Config, NullSink, PointcloudMsg, Pose, Timestamp, TransformBuffer, TsdfPipeline};
//! use glam::Vec3;
//!
//! let mut pipeline = TsdfPipeline::new(Config::default(), NullSink);
//!
//! // A fixed sensor mount and one cloud
//! let mut transforms = TransformBuffer::new();
//! transforms.set_static("lidar", Pose::IDENTITY);
//! let points = vec![Vec3::new(1.0, 0.0, 0.0)];
//! let msg = PointcloudMsg::from_points(Timestamp::from_secs_f64(0.1), "lidar", &points);
//!
//! pipeline.insert_pointcloud(msg);
//! pipeline.process_queues(&transforms);
//! pipeline.update_mesh_event();
//! assert!(!pipeline.layer().is_empty());
//! ```

pub mod block;
pub mod codec;
pub mod colormap;
pub mod config;
pub mod container;
pub mod error;
pub mod export;
pub mod icp;
pub mod index;
pub mod integrator;
pub mod interpolator;
pub mod layer;
pub mod math;
pub mod mesh;
pub mod mesh_tables;
pub mod mesher;
pub mod pipeline;
pub mod pointcloud;
pub mod submap;
pub mod transform;
pub mod viz;
pub mod voxel;

// Re-export commonly used types
pub use crate::block::{Block, Update};
pub use crate::codec::{LayerAction, LayerMessage};
pub use crate::colormap::Colormap;
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::icp::{IcpConfig, IcpRefiner};
pub use crate::integrator::{IntegrationMethod, IntegratorConfig, TsdfIntegrator, WeightPolicy};
pub use crate::layer::TsdfLayer;
pub use crate::math::{Pose, Timestamp};
pub use crate::mesh::{Mesh, MeshLayer};
pub use crate::mesher::MeshIntegrator;
pub use crate::pipeline::{EventSink, MeshDelta, NullSink, SubmapMessage, TsdfPipeline};
pub use crate::pointcloud::{DecodedCloud, PointcloudMsg};
pub use crate::transform::{TransformBuffer, TransformSource};
pub use crate::voxel::{Color, TsdfVoxel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
