//! Streaming ingest pipeline
//!
//! Drives the whole fusion loop on one dispatch thread: inbound clouds
//! are throttled into a bounded queue, drained once their sensor-to-world
//! transform resolves, decoded, optionally ICP-refined, integrated, and
//! retired again through the sliding-window deintegration queue. Periodic
//! timer entry points re-mesh dirty blocks and publish layer state;
//! submaps are cut on time/distance thresholds.
//!
//! Errors never cross this boundary (see the error-handling policy):
//! transform misses retry from the queue, decode and inbound-layer errors
//! drop the offending message, I/O errors skip the write. Only
//! points/colors length mismatches are programming errors and assert.
//!
//! All outputs leave through the [`EventSink`] trait, which keeps the
//! transport (topics, services, TF broadcasts) out of the core.

use crate::block::Update;
use crate::codec::{self, LayerMessage};
use crate::colormap::Colormap;
use crate::config::Config;
use crate::export;
use crate::icp::IcpRefiner;
use crate::index::BlockIndex;
use crate::integrator::TsdfIntegrator;
use crate::layer::TsdfLayer;
use crate::math::{Pose, Timestamp};
use crate::mesh::{Mesh, MeshLayer};
use crate::mesher::MeshIntegrator;
use crate::pointcloud::{self, PointcloudMsg};
use crate::submap::{self, Trajectory, TrajectoryPoint};
use crate::transform::TransformSource;
use crate::viz;
use crate::voxel::Color;
use glam::Vec3;
use log::{error, info, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Blocks whose voxel weights all fall below this are pruned
const PRUNE_WEIGHT_EPSILON: f32 = 1e-4;
/// Near-surface band for the surface point cloud, in voxels
const SURFACE_DISTANCE_FACTOR: f32 = 0.75;
/// Throttle period for repeated soft-error logs
const LOG_EVERY_N: u64 = 100;

/// Per-block mesh delta for downstream receivers
///
/// Cleared meshes are included so receivers drop stale geometry.
#[derive(Debug, Clone, Default)]
pub struct MeshDelta {
    pub blocks: Vec<(BlockIndex, Mesh)>,
}

/// Full submap record published at each cut
#[derive(Debug, Clone)]
pub struct SubmapMessage {
    pub submap_index: u64,
    pub layer: LayerMessage,
    pub trajectory: Trajectory,
}

/// Outbound boundary of the pipeline
///
/// All methods default to no-ops so sinks implement only what they
/// consume.
pub trait EventSink {
    fn mesh_delta(&mut self, _delta: &MeshDelta) {}
    fn layer_message(&mut self, _msg: &LayerMessage) {}
    fn submap(&mut self, _msg: &SubmapMessage) {}
    fn submap_written(&mut self, _path: &Path) {}
    fn icp_transform(&mut self, _correction: &Pose) {}
    fn surface_pointcloud(&mut self, _points: &[Vec3], _colors: &[Color]) {}
    fn tsdf_pointcloud(&mut self, _points: &[Vec3], _intensities: &[f32]) {}
    fn tsdf_slice(&mut self, _points: &[Vec3], _intensities: &[f32]) {}
    fn occupancy_markers(&mut self, _points: &[Vec3]) {}
    fn reprojected_pointcloud(&mut self, _msg: &PointcloudMsg) {}
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {}

/// One retained integration, replayable as its own inverse
///
/// Point and color buffers are shared and immutable once enqueued.
struct DeintegrationPacket {
    timestamp: Timestamp,
    t_g_c: Pose,
    points: Arc<Vec<Vec3>>,
    colors: Arc<Vec<Color>>,
    is_freespace: bool,
}

/// The fusion pipeline
pub struct TsdfPipeline<S: EventSink> {
    config: Config,
    colormap: Colormap,
    layer: TsdfLayer,
    mesh_layer: MeshLayer,
    integrator: TsdfIntegrator,
    mesher: MeshIntegrator,
    icp: IcpRefiner,
    /// Explicit ICP correction state; identity unless accumulating
    icp_correction: Pose,
    /// Window config validated against integrator capability
    deintegration_enabled: bool,
    /// Validated submap target, `None` when disk writes are disabled
    submap_dir: Option<PathBuf>,

    queue: VecDeque<PointcloudMsg>,
    freespace_queue: VecDeque<PointcloudMsg>,
    last_msg_time: Option<Timestamp>,
    last_freespace_msg_time: Option<Timestamp>,
    deintegration_queue: VecDeque<DeintegrationPacket>,
    needs_pruning: bool,
    publish_full_next: bool,

    submap_count: u64,
    last_submap_time: Option<Timestamp>,
    last_submap_position: Option<Vec3>,
    current_position: Vec3,

    transform_drop_count: u64,
    bad_layer_msg_count: u64,

    sink: S,
}

impl<S: EventSink> TsdfPipeline<S> {
    /// Build the pipeline, disabling misconfigured features
    pub fn new(config: Config, sink: S) -> Self {
        let layer = TsdfLayer::new(config.map.voxel_size, config.map.voxels_per_side);
        let mesh_layer = MeshLayer::new(layer.block_size());
        let integrator = TsdfIntegrator::new(config.method, config.integrator.clone());

        let mut deintegration_enabled = config.window.enabled();
        if deintegration_enabled && !integrator.supports_deintegration() {
            error!(
                "pointcloud deintegration requires the projective integrator; \
                 sliding window disabled"
            );
            deintegration_enabled = false;
        }

        let submap_dir = match &config.submap.write_submaps_to_directory {
            Some(dir) => match submap::validate_submap_directory(dir) {
                Ok(path) => Some(path),
                Err(e) => {
                    error!("{e}; submap disk writes disabled");
                    None
                }
            },
            None => None,
        };

        let colormap = match config.vis.intensity_colormap.parse::<Colormap>() {
            Ok(map) => map,
            Err(e) => {
                error!("{e}; falling back to {}", Colormap::default().name());
                Colormap::default()
            }
        };

        let icp = IcpRefiner::new(config.icp.refiner.clone());

        Self {
            config,
            colormap,
            layer,
            mesh_layer,
            integrator,
            mesher: MeshIntegrator::new(),
            icp,
            icp_correction: Pose::IDENTITY,
            deintegration_enabled,
            submap_dir,
            queue: VecDeque::new(),
            freespace_queue: VecDeque::new(),
            last_msg_time: None,
            last_freespace_msg_time: None,
            deintegration_queue: VecDeque::new(),
            needs_pruning: false,
            publish_full_next: true,
            submap_count: 0,
            last_submap_time: None,
            last_submap_position: None,
            current_position: Vec3::ZERO,
            transform_drop_count: 0,
            bad_layer_msg_count: 0,
            sink,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn layer(&self) -> &TsdfLayer {
        &self.layer
    }

    pub fn mesh_layer(&self) -> &MeshLayer {
        &self.mesh_layer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// True when the sliding-window map is active
    pub fn deintegration_enabled(&self) -> bool {
        self.deintegration_enabled
    }

    /// Queue an inbound cloud, applying the message-rate throttle
    pub fn insert_pointcloud(&mut self, msg: PointcloudMsg) {
        let min_interval = self.config.ingest.min_time_between_msgs_sec;
        if !accept_after_throttle(&mut self.last_msg_time, min_interval, msg.timestamp) {
            return;
        }
        Self::bounded_push(
            &mut self.queue,
            msg,
            self.config.ingest.pointcloud_queue_size,
        );
    }

    /// Queue an inbound freespace cloud (far-field negative evidence)
    pub fn insert_freespace_pointcloud(&mut self, msg: PointcloudMsg) {
        if !self.config.ingest.use_freespace_pointcloud {
            return;
        }
        let min_interval = self.config.ingest.min_time_between_msgs_sec;
        if !accept_after_throttle(&mut self.last_freespace_msg_time, min_interval, msg.timestamp)
        {
            return;
        }
        Self::bounded_push(
            &mut self.freespace_queue,
            msg,
            self.config.ingest.pointcloud_queue_size,
        );
    }

    fn bounded_push(queue: &mut VecDeque<PointcloudMsg>, msg: PointcloudMsg, bound: usize) {
        if queue.len() >= bound.max(1) {
            queue.pop_front();
        }
        queue.push_back(msg);
    }

    /// Drain both queues as far as transform availability allows
    pub fn process_queues(&mut self, transforms: &dyn TransformSource) {
        self.drain_queue(transforms, false);
        if self.config.ingest.use_freespace_pointcloud {
            self.drain_queue(transforms, true);
        }
    }

    fn drain_queue(&mut self, transforms: &dyn TransformSource, is_freespace: bool) {
        loop {
            let head = {
                let queue = if is_freespace {
                    &self.freespace_queue
                } else {
                    &self.queue
                };
                match queue.front() {
                    Some(head) => (head.frame_id.clone(), head.timestamp),
                    None => return,
                }
            };

            let queue = if is_freespace {
                &mut self.freespace_queue
            } else {
                &mut self.queue
            };
            match transforms.lookup(&head.0, head.1) {
                Some(t_g_c) => {
                    let Some(msg) = queue.pop_front() else {
                        return;
                    };
                    self.process_pointcloud(&msg, t_g_c, is_freespace);
                }
                None => {
                    if queue.len() >= self.config.ingest.pointcloud_queue_size {
                        queue.pop_front();
                        self.transform_drop_count += 1;
                        if self.transform_drop_count % LOG_EVERY_N == 1 {
                            warn!(
                                "no transform for frame '{}'; dropped oldest queued cloud \
                                 ({} drops so far)",
                                head.0, self.transform_drop_count
                            );
                        }
                        continue;
                    }
                    // Short queue: leave the head for the next attempt
                    return;
                }
            }
        }
    }

    /// Steps 3-9 of the per-cloud state machine
    fn process_pointcloud(&mut self, msg: &PointcloudMsg, t_g_c: Pose, is_freespace: bool) {
        let cloud = match pointcloud::decode(msg, self.colormap, self.config.vis.intensity_max_value)
        {
            Ok(cloud) => cloud,
            Err(e) => {
                warn!("dropping undecodable cloud from '{}': {e}", msg.frame_id);
                return;
            }
        };
        if cloud.points.is_empty() {
            return;
        }

        let mut t_integrate = t_g_c;
        if self.config.icp.enable_icp && !is_freespace {
            t_integrate = self.refine_pose(&cloud.points, t_g_c);
        }

        let points = Arc::new(cloud.points);
        let colors = Arc::new(cloud.colors);
        self.integrator.integrate(
            &mut self.layer,
            &t_integrate,
            &points,
            &colors,
            is_freespace,
            false,
        );
        self.current_position = t_integrate.translation;

        self.emit_reprojected(msg.timestamp, &t_integrate, &points, &colors);

        if self.deintegration_enabled || self.config.submap.enabled() {
            self.deintegration_queue.push_back(DeintegrationPacket {
                timestamp: msg.timestamp,
                t_g_c: t_integrate,
                points,
                colors,
                is_freespace,
            });
        }
        if self.deintegration_enabled {
            self.service_deintegration_queue();
        }

        if let Some(max_distance) = self.config.ingest.max_block_distance_from_body {
            self.layer
                .remove_blocks_beyond(self.current_position, max_distance);
            self.mesh_layer
                .remove_meshes_beyond(self.current_position, max_distance);
        }

        self.maybe_cut_submap(msg.timestamp);
    }

    /// Step 4: ICP refinement and explicit correction bookkeeping
    fn refine_pose(&mut self, points_c: &[Vec3], t_g_c: Pose) -> Pose {
        let t_init = if self.config.icp.accumulate_icp_corrections {
            self.icp_correction * t_g_c
        } else {
            t_g_c
        };
        let (refined, iterations) = self.icp.refine(&self.layer, points_c, &t_init);
        if iterations == 0 {
            return t_init;
        }
        let correction = refined * t_g_c.inverse();
        if self.config.icp.accumulate_icp_corrections {
            self.icp_correction = correction;
        }
        self.sink.icp_transform(&correction);
        refined
    }

    /// Step 6: retire the oldest integrations while any window bound is
    /// exceeded, always keeping the newest packet
    fn service_deintegration_queue(&mut self) {
        let window = self.config.window.clone();
        while self.deintegration_queue.len() > 1 {
            let (Some(oldest), Some(newest)) = (
                self.deintegration_queue.front(),
                self.deintegration_queue.back(),
            ) else {
                break;
            };

            let over_length = window
                .pointcloud_deintegration_max_queue_length
                .is_some_and(|limit| self.deintegration_queue.len() > limit);
            let over_time = window
                .pointcloud_deintegration_max_time_interval_sec
                .is_some_and(|limit| newest.timestamp.seconds_since(oldest.timestamp) > limit);
            let over_distance = window
                .pointcloud_deintegration_max_distance_travelled
                .is_some_and(|limit| {
                    newest
                        .t_g_c
                        .translation
                        .distance(oldest.t_g_c.translation)
                        > limit
                });
            if !(over_length || over_time || over_distance) {
                break;
            }

            let Some(packet) = self.deintegration_queue.pop_front() else {
                break;
            };
            self.integrator.integrate(
                &mut self.layer,
                &packet.t_g_c,
                &packet.points,
                &packet.colors,
                packet.is_freespace,
                true,
            );
            self.needs_pruning = true;
        }
    }

    /// Step 7: drop fully deintegrated blocks, clearing paired meshes
    fn prune_deintegrated_blocks(&mut self) {
        if !self.needs_pruning {
            return;
        }
        for index in self.layer.blocks_with_marker(Update::Map) {
            let empty = self
                .layer
                .block(index)
                .is_some_and(|block| block.all_weights_below(PRUNE_WEIGHT_EPSILON));
            if empty {
                self.layer.remove_block(index);
                self.mesh_layer.clear_mesh(index);
            }
        }
        self.needs_pruning = false;
    }

    /// Step 9: cut a submap once a time or distance threshold trips
    fn maybe_cut_submap(&mut self, timestamp: Timestamp) {
        if !self.config.submap.enabled() {
            return;
        }
        let position = self.current_position;
        let (Some(last_time), Some(last_position)) =
            (self.last_submap_time, self.last_submap_position)
        else {
            // First sample only sets the bookmarks
            self.last_submap_time = Some(timestamp);
            self.last_submap_position = Some(position);
            return;
        };

        let over_time = self
            .config
            .submap
            .submap_max_time_interval_sec
            .is_some_and(|limit| timestamp.seconds_since(last_time) > limit);
        let over_distance = self
            .config
            .submap
            .submap_max_distance_travelled
            .is_some_and(|limit| position.distance(last_position) > limit);
        if !(over_time || over_distance) {
            return;
        }

        self.publish_submap();

        // Without deintegration there is no smooth handover; start the
        // next submap from an empty layer
        if !self.deintegration_enabled {
            self.layer.clear();
            let stale: Vec<BlockIndex> =
                self.mesh_layer.iter().map(|(index, _)| *index).collect();
            for index in stale {
                self.mesh_layer.clear_mesh(index);
            }
            self.deintegration_queue.clear();
            self.publish_full_next = true;
        }

        self.submap_count += 1;
        self.last_submap_time = Some(timestamp);
        self.last_submap_position = Some(position);
    }

    fn current_trajectory(&self) -> Trajectory {
        Trajectory {
            robot_name: self.config.ingest.robot_name.clone(),
            frame_id: self.config.ingest.world_frame.clone(),
            points: self
                .deintegration_queue
                .iter()
                .map(|packet| TrajectoryPoint {
                    timestamp: packet.timestamp,
                    pose: packet.t_g_c,
                })
                .collect(),
        }
    }

    fn publish_submap(&mut self) {
        let trajectory = self.current_trajectory();
        let message = SubmapMessage {
            submap_index: self.submap_count,
            layer: codec::serialize_layer_full(&self.layer),
            trajectory: trajectory.clone(),
        };
        self.sink.submap(&message);

        if let Some(root) = self.submap_dir.clone() {
            match submap::write_submap(&root, self.submap_count, &self.layer, &trajectory) {
                Ok(dir) => {
                    info!("submap {} written to {}", self.submap_count, dir.display());
                    self.sink.submap_written(&dir);
                }
                Err(e) => {
                    warn!("failed to persist submap {}: {e}", self.submap_count);
                }
            }
        }
    }

    /// Timer: re-mesh dirty blocks and publish the mesh delta
    pub fn update_mesh_event(&mut self) {
        self.prune_deintegrated_blocks();
        self.mesher
            .generate(&mut self.layer, &mut self.mesh_layer, true, true);

        let mut delta = MeshDelta::default();
        for index in self.mesh_layer.updated_meshes() {
            if let Some(mesh) = self.mesh_layer.mesh(index) {
                delta.blocks.push((index, mesh.clone()));
            }
            if let Some(mesh) = self.mesh_layer.mesh_mut(index) {
                mesh.updated = false;
            }
        }
        if !delta.blocks.is_empty() {
            self.sink.mesh_delta(&delta);
        }
    }

    /// Timer: publish layer state (delta, or full after subscriber churn)
    pub fn publish_map_event(&mut self) {
        self.prune_deintegrated_blocks();
        let message = if self.publish_full_next {
            self.publish_full_next = false;
            codec::serialize_layer_full(&self.layer)
        } else {
            codec::serialize_layer_delta(&mut self.layer)
        };
        self.sink.layer_message(&message);
    }

    /// A new layer subscriber appeared; the next publish must replace
    pub fn on_new_subscriber(&mut self) {
        self.publish_full_next = true;
    }

    /// Apply an inbound layer delta from a peer node
    pub fn apply_layer_message(&mut self, msg: &LayerMessage) {
        if let Err(e) = codec::apply_layer_message(&mut self.layer, msg) {
            self.bad_layer_msg_count += 1;
            if self.bad_layer_msg_count % LOG_EVERY_N == 1 {
                warn!(
                    "discarding bad inbound layer message: {e} ({} so far)",
                    self.bad_layer_msg_count
                );
            }
        }
    }

    fn emit_reprojected(
        &mut self,
        timestamp: Timestamp,
        t_g_c: &Pose,
        points_c: &[Vec3],
        colors: &[Color],
    ) {
        let world_points: Vec<Vec3> = points_c
            .iter()
            .map(|p| t_g_c.transform_point(*p))
            .collect();
        let msg = PointcloudMsg::from_points_colors(
            timestamp,
            &self.config.ingest.world_frame,
            &world_points,
            colors,
        );
        self.sink.reprojected_pointcloud(&msg);
    }

    // Synchronous commands

    /// Drop all map state; the next publish is a full replace
    pub fn clear_map(&mut self) -> bool {
        self.layer.clear();
        self.mesh_layer.clear();
        self.deintegration_queue.clear();
        self.needs_pruning = false;
        self.publish_full_next = true;
        self.icp_correction = Pose::IDENTITY;
        true
    }

    /// Re-mesh everything, publish it, and write the PLY if configured
    pub fn generate_mesh(&mut self) -> bool {
        self.mesher
            .generate(&mut self.layer, &mut self.mesh_layer, false, true);
        for (_, mesh) in self.mesh_layer.iter_mut() {
            mesh.updated = false;
        }
        let delta = MeshDelta {
            blocks: self
                .mesh_layer
                .iter()
                .map(|(index, mesh)| (*index, mesh.clone()))
                .collect(),
        };
        self.sink.mesh_delta(&delta);

        if let Some(filename) = self.config.mesh.mesh_filename.clone() {
            let mut combined = self.mesh_layer.combined_mesh();
            apply_color_mode(&mut combined, &self.config.mesh.color_mode);
            if let Err(e) = export::export_mesh_ply(&combined, &filename, true) {
                warn!("failed to write mesh to '{filename}': {e}");
                return false;
            }
            info!("mesh written to '{filename}'");
        }
        true
    }

    /// Save the full layer to a container file
    pub fn save_map(&self, path: impl AsRef<Path>) -> bool {
        match codec::save_layer(&self.layer, &path) {
            Ok(()) => true,
            Err(e) => {
                warn!("save_map failed: {e}");
                false
            }
        }
    }

    /// Replace the layer with a container file's content
    pub fn load_map(&mut self, path: impl AsRef<Path>) -> bool {
        match codec::load_layer(&path) {
            Ok(layer) => {
                self.mesh_layer = MeshLayer::new(layer.block_size());
                self.layer = layer;
                self.deintegration_queue.clear();
                self.publish_full_next = true;
                true
            }
            Err(e) => {
                warn!("load_map failed: {e}");
                false
            }
        }
    }

    /// Publish the visualization point sets
    pub fn publish_pointclouds(&mut self) -> bool {
        let threshold = self.layer.voxel_size() * SURFACE_DISTANCE_FACTOR;
        let (surface_points, surface_colors) = viz::surface_pointcloud(&self.layer, threshold);
        self.sink
            .surface_pointcloud(&surface_points, &surface_colors);

        let (tsdf_points, tsdf_intensities) = viz::tsdf_pointcloud(&self.layer);
        self.sink.tsdf_pointcloud(&tsdf_points, &tsdf_intensities);

        let slice_z = if self.config.vis.slice_level_follow_robot {
            self.current_position.z + self.config.vis.slice_level
        } else {
            self.config.vis.slice_level
        };
        let (slice_points, slice_intensities) = viz::tsdf_slice(&self.layer, slice_z);
        self.sink.tsdf_slice(&slice_points, &slice_intensities);

        let markers = viz::occupancy_markers(&self.layer);
        self.sink.occupancy_markers(&markers);
        true
    }

    /// Publish the current layer state immediately
    pub fn publish_map(&mut self) -> bool {
        self.publish_map_event();
        true
    }

    /// Queue depth of the main ingest queue (tests and introspection)
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of submaps cut so far
    pub fn submap_count(&self) -> u64 {
        self.submap_count
    }

    /// Retained sliding-window integrations
    pub fn window_len(&self) -> usize {
        self.deintegration_queue.len()
    }
}

/// Recolor exported vertices per the configured mesh color mode
///
/// `color` keeps the integrated voxel colors; `normals` encodes the
/// vertex normal into RGB. Unknown modes keep the colors and log once
/// per export.
fn apply_color_mode(mesh: &mut Mesh, mode: &str) {
    match mode {
        "color" => {}
        "normals" => {
            for (color, normal) in mesh.colors.iter_mut().zip(&mesh.normals) {
                let encode = |v: f32| ((v * 0.5 + 0.5) * 255.0).round() as u8;
                *color = Color::new(encode(normal.x), encode(normal.y), encode(normal.z));
            }
        }
        other => warn!("unknown mesh color_mode '{other}'; keeping vertex colors"),
    }
}

/// Message-rate throttle: accept and remember, or drop
fn accept_after_throttle(
    last: &mut Option<Timestamp>,
    min_interval_sec: f64,
    timestamp: Timestamp,
) -> bool {
    if let Some(previous) = *last {
        if timestamp.seconds_since(previous) < min_interval_sec {
            return false;
        }
    }
    *last = Some(timestamp);
    true
}
