//! Layer and block serialization
//!
//! Two publication modes: "full" emits every block with the *replace*
//! action, "delta" emits only blocks carrying the map marker with the
//! *merge* action and clears the marker as it goes, so a delta publish
//! atomically consumes the dirty set. Blocks serialize as a fixed-width
//! little-endian header (index, voxel size, voxels per side, voxel
//! count) followed by packed voxels.

use crate::block::Update;
use crate::error::{Error, Result};
use crate::index::BlockIndex;
use crate::layer::TsdfLayer;
use crate::voxel::{Color, TsdfVoxel};
use glam::IVec3;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// What a receiver should do with a layer message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerAction {
    /// Drop the local layer and adopt the message content
    Replace,
    /// Apply the contained blocks over the local layer
    Merge,
}

impl LayerAction {
    fn tag(self) -> u8 {
        match self {
            LayerAction::Replace => 0,
            LayerAction::Merge => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(LayerAction::Replace),
            1 => Ok(LayerAction::Merge),
            other => Err(Error::InvalidFormat(format!("unknown layer action {other}"))),
        }
    }
}

/// One serialized block
#[derive(Debug, Clone)]
pub struct BlockData {
    pub index: BlockIndex,
    pub voxels: Vec<TsdfVoxel>,
}

/// Layer publication message
#[derive(Debug, Clone)]
pub struct LayerMessage {
    pub action: LayerAction,
    pub voxel_size: f32,
    pub voxels_per_side: u32,
    pub blocks: Vec<BlockData>,
}

/// Serialize every block (replace action)
pub fn serialize_layer_full(layer: &TsdfLayer) -> LayerMessage {
    let blocks = layer
        .iter()
        .map(|(index, block)| BlockData {
            index: *index,
            voxels: block.voxels().to_vec(),
        })
        .collect();
    LayerMessage {
        action: LayerAction::Replace,
        voxel_size: layer.voxel_size(),
        voxels_per_side: layer.voxels_per_side() as u32,
        blocks,
    }
}

/// Serialize only map-marked blocks (merge action), clearing the marker
pub fn serialize_layer_delta(layer: &mut TsdfLayer) -> LayerMessage {
    let indices = layer.blocks_with_marker(Update::Map);
    let mut blocks = Vec::with_capacity(indices.len());
    for index in indices {
        if let Some(block) = layer.block(index) {
            blocks.push(BlockData {
                index,
                voxels: block.voxels().to_vec(),
            });
        }
        layer.clear_marker(index, Update::Map);
    }
    LayerMessage {
        action: LayerAction::Merge,
        voxel_size: layer.voxel_size(),
        voxels_per_side: layer.voxels_per_side() as u32,
        blocks,
    }
}

/// Apply an inbound layer message
///
/// Layer constants must match; applied blocks are marked for meshing so
/// the local mesh catches up.
pub fn apply_layer_message(layer: &mut TsdfLayer, msg: &LayerMessage) -> Result<()> {
    if (msg.voxel_size - layer.voxel_size()).abs() > f32::EPSILON
        || msg.voxels_per_side as usize != layer.voxels_per_side()
    {
        return Err(Error::LayerMismatch(format!(
            "message grid {}x{} vs local {}x{}",
            msg.voxel_size,
            msg.voxels_per_side,
            layer.voxel_size(),
            layer.voxels_per_side()
        )));
    }
    let expected_voxels = (msg.voxels_per_side as usize).pow(3);
    for block_data in &msg.blocks {
        if block_data.voxels.len() != expected_voxels {
            return Err(Error::InvalidFormat(format!(
                "block {:?} carries {} voxels, expected {}",
                block_data.index,
                block_data.voxels.len(),
                expected_voxels
            )));
        }
    }

    if msg.action == LayerAction::Replace {
        layer.clear();
    }
    for block_data in &msg.blocks {
        let block = layer.allocate_block(block_data.index);
        block.voxels_mut().copy_from_slice(&block_data.voxels);
        block.has_data = block_data.voxels.iter().any(|v| v.is_observed());
        block.set_updated(Update::Mesh);
    }
    Ok(())
}

/// Bytes per serialized voxel: distance f32, weight f32, rgb u8x3
const VOXEL_BYTES: usize = 11;
/// Block header: index i32x3, voxel size f32, voxels per side u32, count u32
const BLOCK_HEADER_BYTES: usize = 24;

fn encode_block(data: &BlockData, voxel_size: f32, voxels_per_side: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&data.index.x.to_le_bytes());
    out.extend_from_slice(&data.index.y.to_le_bytes());
    out.extend_from_slice(&data.index.z.to_le_bytes());
    out.extend_from_slice(&voxel_size.to_le_bytes());
    out.extend_from_slice(&voxels_per_side.to_le_bytes());
    out.extend_from_slice(&(data.voxels.len() as u32).to_le_bytes());
    for voxel in &data.voxels {
        out.extend_from_slice(&voxel.distance.to_le_bytes());
        out.extend_from_slice(&voxel.weight.to_le_bytes());
        out.extend_from_slice(&[voxel.color.r, voxel.color.g, voxel.color.b]);
    }
}

fn decode_block(bytes: &[u8]) -> Result<(BlockData, f32, u32, usize)> {
    if bytes.len() < BLOCK_HEADER_BYTES {
        return Err(Error::InvalidFormat("truncated block header".to_string()));
    }
    let read_i32 = |at: usize| i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    let read_u32 = |at: usize| u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    let read_f32 = |at: usize| f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());

    let index = IVec3::new(read_i32(0), read_i32(4), read_i32(8));
    let voxel_size = read_f32(12);
    let voxels_per_side = read_u32(16);
    let count = read_u32(20) as usize;

    let total = BLOCK_HEADER_BYTES + count * VOXEL_BYTES;
    if bytes.len() < total {
        return Err(Error::InvalidFormat("truncated block payload".to_string()));
    }

    let mut voxels = Vec::with_capacity(count);
    let mut at = BLOCK_HEADER_BYTES;
    for _ in 0..count {
        voxels.push(TsdfVoxel {
            distance: read_f32(at),
            weight: read_f32(at + 4),
            color: Color::new(bytes[at + 8], bytes[at + 9], bytes[at + 10]),
        });
        at += VOXEL_BYTES;
    }
    Ok((BlockData { index, voxels }, voxel_size, voxels_per_side, total))
}

/// Encode a layer message to bytes for transport
pub fn encode_layer_message(msg: &LayerMessage) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(msg.action.tag());
    out.extend_from_slice(&msg.voxel_size.to_le_bytes());
    out.extend_from_slice(&msg.voxels_per_side.to_le_bytes());
    out.extend_from_slice(&(msg.blocks.len() as u32).to_le_bytes());
    for block in &msg.blocks {
        encode_block(block, msg.voxel_size, msg.voxels_per_side, &mut out);
    }
    out
}

/// Decode a layer message from bytes
pub fn decode_layer_message(bytes: &[u8]) -> Result<LayerMessage> {
    if bytes.len() < 13 {
        return Err(Error::InvalidFormat("truncated layer message".to_string()));
    }
    let action = LayerAction::from_tag(bytes[0])?;
    let voxel_size = f32::from_le_bytes(bytes[1..5].try_into().unwrap());
    let voxels_per_side = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
    let block_count = u32::from_le_bytes(bytes[9..13].try_into().unwrap()) as usize;

    let mut blocks = Vec::with_capacity(block_count);
    let mut at = 13;
    for _ in 0..block_count {
        let (block, block_voxel_size, block_vps, consumed) = decode_block(&bytes[at..])?;
        if (block_voxel_size - voxel_size).abs() > f32::EPSILON || block_vps != voxels_per_side {
            return Err(Error::InvalidFormat(
                "block header disagrees with layer header".to_string(),
            ));
        }
        blocks.push(block);
        at += consumed;
    }
    Ok(LayerMessage {
        action,
        voxel_size,
        voxels_per_side,
        blocks,
    })
}

/// Write a full layer to a container file
pub fn save_layer(layer: &TsdfLayer, path: impl AsRef<Path>) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = crate::container::ContainerWriter::new(BufWriter::new(file));
    let msg = serialize_layer_full(layer);
    writer.write_frame(&encode_layer_message(&msg))?;
    writer.finish()
}

/// Load a layer from a container file
pub fn load_layer(path: impl AsRef<Path>) -> Result<TsdfLayer> {
    let file = File::open(path)?;
    let mut reader = crate::container::ContainerReader::open(BufReader::new(file))?;
    let frame = reader
        .next_frame()?
        .ok_or_else(|| Error::InvalidFormat("empty map container".to_string()))?;
    let msg = decode_layer_message(&frame)?;
    let mut layer = TsdfLayer::new(msg.voxel_size, msg.voxels_per_side as usize);
    apply_layer_message(&mut layer, &msg)?;
    Ok(layer)
}

#[cfg(test)]
mod tests {
    use super::*;
    fn populated_layer() -> TsdfLayer {
        let mut layer = TsdfLayer::new(0.1, 4);
        for (i, index) in [IVec3::ZERO, IVec3::new(1, -2, 3)].iter().enumerate() {
            let block = layer.allocate_block(*index);
            block.has_data = true;
            block.set_updated(Update::Map);
            let voxel = block.voxel_mut(i * 7);
            voxel.distance = 0.05 * (i as f32 + 1.0);
            voxel.weight = 2.0;
            voxel.color = Color::new(10 * i as u8, 128, 200);
        }
        layer
    }

    #[test]
    fn test_full_message_roundtrip() {
        let layer = populated_layer();
        let msg = serialize_layer_full(&layer);
        assert_eq!(msg.action, LayerAction::Replace);
        assert_eq!(msg.blocks.len(), 2);

        let bytes = encode_layer_message(&msg);
        let decoded = decode_layer_message(&bytes).unwrap();

        let mut restored = TsdfLayer::new(0.1, 4);
        apply_layer_message(&mut restored, &decoded).unwrap();
        assert_eq!(restored.num_blocks(), 2);
        let voxel = restored.block(IVec3::new(1, -2, 3)).unwrap().voxel(7);
        assert_eq!(voxel.weight, 2.0);
        assert_eq!(voxel.color, Color::new(10, 128, 200));
    }

    #[test]
    fn test_delta_consumes_markers() {
        let mut layer = populated_layer();
        let msg = serialize_layer_delta(&mut layer);
        assert_eq!(msg.action, LayerAction::Merge);
        assert_eq!(msg.blocks.len(), 2);
        assert!(layer.blocks_with_marker(Update::Map).is_empty());

        // A second delta is empty
        let again = serialize_layer_delta(&mut layer);
        assert!(again.blocks.is_empty());
    }

    #[test]
    fn test_replace_drops_stale_blocks() {
        let mut local = TsdfLayer::new(0.1, 4);
        local.allocate_block(IVec3::new(9, 9, 9));

        let msg = serialize_layer_full(&populated_layer());
        apply_layer_message(&mut local, &msg).unwrap();
        assert!(local.block(IVec3::new(9, 9, 9)).is_none());
        assert_eq!(local.num_blocks(), 2);
        // Applied blocks are queued for meshing
        assert_eq!(local.blocks_with_marker(Update::Mesh).len(), 2);
    }

    #[test]
    fn test_mismatched_layer_is_rejected() {
        let mut local = TsdfLayer::new(0.2, 4);
        let msg = serialize_layer_full(&populated_layer());
        assert!(matches!(
            apply_layer_message(&mut local, &msg),
            Err(Error::LayerMismatch(_))
        ));
    }

    #[test]
    fn test_garbage_bytes_are_rejected() {
        assert!(decode_layer_message(&[1, 2, 3]).is_err());

        let layer = populated_layer();
        let mut bytes = encode_layer_message(&serialize_layer_full(&layer));
        bytes.truncate(bytes.len() - 5);
        assert!(decode_layer_message(&bytes).is_err());
    }

    #[test]
    fn test_save_load_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.tsdf");

        let layer = populated_layer();
        save_layer(&layer, &path).unwrap();
        let restored = load_layer(&path).unwrap();

        assert_eq!(restored.num_blocks(), layer.num_blocks());
        assert_eq!(restored.voxel_size(), layer.voxel_size());
        let a = layer.block(IVec3::ZERO).unwrap().voxel(0);
        let b = restored.block(IVec3::ZERO).unwrap().voxel(0);
        assert_eq!(a.distance, b.distance);
    }
}
