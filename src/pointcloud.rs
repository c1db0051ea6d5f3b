//! Point cloud messages and decoding
//!
//! Inbound clouds arrive as packed binary records with a field
//! descriptor table (the PointCloud2 layout). Decoding turns them into
//! the internal `(points, colors)` form:
//!
//! - a float-packed `rgb` field yields true color,
//! - an `intensity` field is normalized and run through the configured
//!   colormap,
//! - bare XYZ gets a neutral default color.
//!
//! Malformed layouts are decode errors; non-finite points are dropped
//! silently (sensors routinely emit NaN returns for missing range).

use crate::colormap::Colormap;
use crate::error::{Error, Result};
use crate::math::Timestamp;
use crate::voxel::Color;
use glam::Vec3;

/// Field datatype tag for 32-bit floats (sensor_msgs convention)
pub const FIELD_FLOAT32: u8 = 7;

/// Description of one per-point field
#[derive(Debug, Clone)]
pub struct PointField {
    /// Field name, e.g. "x", "rgb", "intensity"
    pub name: String,
    /// Byte offset from the start of a point record
    pub offset: u32,
    /// Datatype tag; only FLOAT32 fields are consumed here
    pub datatype: u8,
    /// Elements per field (typically 1)
    pub count: u32,
}

impl PointField {
    pub fn float32(name: &str, offset: u32) -> Self {
        Self {
            name: name.to_string(),
            offset,
            datatype: FIELD_FLOAT32,
            count: 1,
        }
    }
}

/// Time-stamped packed point cloud in a named sensor frame
#[derive(Debug, Clone)]
pub struct PointcloudMsg {
    pub timestamp: Timestamp,
    pub frame_id: String,
    pub fields: Vec<PointField>,
    /// Length of one point record in bytes
    pub point_step: u32,
    /// Packed little-endian point records
    pub data: Vec<u8>,
}

impl PointcloudMsg {
    pub fn num_points(&self) -> usize {
        if self.point_step == 0 {
            0
        } else {
            self.data.len() / self.point_step as usize
        }
    }

    fn field(&self, name: &str) -> Option<&PointField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Build a plain XYZ message (12-byte points)
    pub fn from_points(timestamp: Timestamp, frame_id: &str, points: &[Vec3]) -> Self {
        let mut data = Vec::with_capacity(points.len() * 12);
        for p in points {
            data.extend_from_slice(&p.x.to_le_bytes());
            data.extend_from_slice(&p.y.to_le_bytes());
            data.extend_from_slice(&p.z.to_le_bytes());
        }
        Self {
            timestamp,
            frame_id: frame_id.to_string(),
            fields: vec![
                PointField::float32("x", 0),
                PointField::float32("y", 4),
                PointField::float32("z", 8),
            ],
            point_step: 12,
            data,
        }
    }

    /// Build a colored message with the float-packed `rgb` convention
    /// (`0x00RRGGBB` reinterpreted as f32 bits)
    pub fn from_points_colors(
        timestamp: Timestamp,
        frame_id: &str,
        points: &[Vec3],
        colors: &[Color],
    ) -> Self {
        assert_eq!(points.len(), colors.len());
        let mut data = Vec::with_capacity(points.len() * 16);
        for (p, c) in points.iter().zip(colors) {
            data.extend_from_slice(&p.x.to_le_bytes());
            data.extend_from_slice(&p.y.to_le_bytes());
            data.extend_from_slice(&p.z.to_le_bytes());
            let packed = ((c.r as u32) << 16) | ((c.g as u32) << 8) | c.b as u32;
            data.extend_from_slice(&f32::from_bits(packed).to_le_bytes());
        }
        Self {
            timestamp,
            frame_id: frame_id.to_string(),
            fields: vec![
                PointField::float32("x", 0),
                PointField::float32("y", 4),
                PointField::float32("z", 8),
                PointField::float32("rgb", 12),
            ],
            point_step: 16,
            data,
        }
    }

    /// Build an intensity message (16-byte points)
    pub fn from_points_intensities(
        timestamp: Timestamp,
        frame_id: &str,
        points: &[Vec3],
        intensities: &[f32],
    ) -> Self {
        assert_eq!(points.len(), intensities.len());
        let mut data = Vec::with_capacity(points.len() * 16);
        for (p, i) in points.iter().zip(intensities) {
            data.extend_from_slice(&p.x.to_le_bytes());
            data.extend_from_slice(&p.y.to_le_bytes());
            data.extend_from_slice(&p.z.to_le_bytes());
            data.extend_from_slice(&i.to_le_bytes());
        }
        Self {
            timestamp,
            frame_id: frame_id.to_string(),
            fields: vec![
                PointField::float32("x", 0),
                PointField::float32("y", 4),
                PointField::float32("z", 8),
                PointField::float32("intensity", 12),
            ],
            point_step: 16,
            data,
        }
    }
}

/// Decoded cloud: sensor-frame points with per-point colors
#[derive(Debug, Clone, Default)]
pub struct DecodedCloud {
    pub points: Vec<Vec3>,
    pub colors: Vec<Color>,
}

/// Decode a packed message into points and colors
///
/// `colormap` and `intensity_max` apply only to intensity clouds.
pub fn decode(
    msg: &PointcloudMsg,
    colormap: Colormap,
    intensity_max: f32,
) -> Result<DecodedCloud> {
    let step = msg.point_step as usize;
    if step == 0 {
        return Err(Error::Decode("zero point_step".to_string()));
    }
    if msg.data.len() % step != 0 {
        return Err(Error::Decode(format!(
            "data length {} is not a multiple of point_step {}",
            msg.data.len(),
            step
        )));
    }

    let read_offset = |name: &str| -> Result<usize> {
        let field = msg
            .field(name)
            .ok_or_else(|| Error::Decode(format!("missing field '{name}'")))?;
        if field.datatype != FIELD_FLOAT32 {
            return Err(Error::Decode(format!(
                "field '{name}' has unsupported datatype {}",
                field.datatype
            )));
        }
        let offset = field.offset as usize;
        if offset + 4 > step {
            return Err(Error::Decode(format!(
                "field '{name}' overruns point_step"
            )));
        }
        Ok(offset)
    };

    let x_off = read_offset("x")?;
    let y_off = read_offset("y")?;
    let z_off = read_offset("z")?;
    let rgb_off = msg.field("rgb").map(|_| read_offset("rgb")).transpose()?;
    let intensity_off = if rgb_off.is_none() {
        msg.field("intensity")
            .map(|_| read_offset("intensity"))
            .transpose()?
    } else {
        None
    };

    let read_f32 = |record: &[u8], offset: usize| {
        f32::from_le_bytes([
            record[offset],
            record[offset + 1],
            record[offset + 2],
            record[offset + 3],
        ])
    };

    let mut cloud = DecodedCloud::default();
    for record in msg.data.chunks_exact(step) {
        let point = Vec3::new(
            read_f32(record, x_off),
            read_f32(record, y_off),
            read_f32(record, z_off),
        );
        if !point.is_finite() {
            continue;
        }
        let color = if let Some(offset) = rgb_off {
            let packed = read_f32(record, offset).to_bits();
            Color::new(
                ((packed >> 16) & 0xff) as u8,
                ((packed >> 8) & 0xff) as u8,
                (packed & 0xff) as u8,
            )
        } else if let Some(offset) = intensity_off {
            let intensity = read_f32(record, offset);
            colormap.map(intensity / intensity_max.max(f32::MIN_POSITIVE))
        } else {
            Color::white()
        };
        cloud.points.push(point);
        cloud.colors.push(color);
    }
    Ok(cloud)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp() -> Timestamp {
        Timestamp::from_secs_f64(1.0)
    }

    #[test]
    fn test_xyz_roundtrip() {
        let points = vec![Vec3::new(1.0, -2.0, 3.0), Vec3::new(0.5, 0.0, -0.5)];
        let msg = PointcloudMsg::from_points(stamp(), "lidar", &points);
        assert_eq!(msg.num_points(), 2);

        let cloud = decode(&msg, Colormap::Rainbow, 1.0).unwrap();
        assert_eq!(cloud.points, points);
        assert!(cloud.colors.iter().all(|c| *c == Color::white()));
    }

    #[test]
    fn test_rgb_roundtrip() {
        let points = vec![Vec3::new(1.0, 2.0, 3.0)];
        let colors = vec![Color::new(12, 200, 99)];
        let msg = PointcloudMsg::from_points_colors(stamp(), "cam", &points, &colors);

        let cloud = decode(&msg, Colormap::Rainbow, 1.0).unwrap();
        assert_eq!(cloud.colors, colors);
    }

    #[test]
    fn test_intensity_uses_colormap() {
        let points = vec![Vec3::X, Vec3::Y];
        let msg =
            PointcloudMsg::from_points_intensities(stamp(), "lidar", &points, &[0.0, 100.0]);

        let cloud = decode(&msg, Colormap::Grayscale, 100.0).unwrap();
        assert_eq!(cloud.colors[0], Color::new(0, 0, 0));
        assert_eq!(cloud.colors[1], Color::new(255, 255, 255));
    }

    #[test]
    fn test_nan_points_are_dropped() {
        let points = vec![Vec3::X, Vec3::new(f32::NAN, 0.0, 0.0), Vec3::Y];
        let msg = PointcloudMsg::from_points(stamp(), "lidar", &points);
        let cloud = decode(&msg, Colormap::Rainbow, 1.0).unwrap();
        assert_eq!(cloud.points, vec![Vec3::X, Vec3::Y]);
    }

    #[test]
    fn test_malformed_messages_fail_softly() {
        let mut msg = PointcloudMsg::from_points(stamp(), "lidar", &[Vec3::X]);
        msg.data.pop();
        assert!(matches!(
            decode(&msg, Colormap::Rainbow, 1.0),
            Err(Error::Decode(_))
        ));

        let mut msg = PointcloudMsg::from_points(stamp(), "lidar", &[Vec3::X]);
        msg.fields.retain(|f| f.name != "z");
        assert!(matches!(
            decode(&msg, Colormap::Rainbow, 1.0),
            Err(Error::Decode(_))
        ));

        let mut msg = PointcloudMsg::from_points(stamp(), "lidar", &[Vec3::X]);
        msg.fields[0].offset = 100;
        assert!(decode(&msg, Colormap::Rainbow, 1.0).is_err());
    }
}
