//! Intensity colormaps
//!
//! Intensity-only clouds carry a single scalar per point; a colormap
//! turns the normalized value into an RGB color for the voxel layer and
//! the mesh. The set of maps is closed, so it is a plain enum with one
//! operation.

use crate::error::{Error, Result};
use crate::voxel::Color;
use std::str::FromStr;

/// Closed set of supported intensity colormaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colormap {
    #[default]
    Rainbow,
    InverseRainbow,
    Grayscale,
    InverseGrayscale,
    Ironbow,
}

impl Colormap {
    /// Human-readable name matching the configuration spelling
    pub fn name(&self) -> &'static str {
        match self {
            Colormap::Rainbow => "rainbow",
            Colormap::InverseRainbow => "inverse_rainbow",
            Colormap::Grayscale => "grayscale",
            Colormap::InverseGrayscale => "inverse_grayscale",
            Colormap::Ironbow => "ironbow",
        }
    }

    /// Map a normalized intensity in `[0, 1]` to a color
    pub fn map(&self, value: f32) -> Color {
        let v = value.clamp(0.0, 1.0);
        match self {
            Colormap::Rainbow => rainbow(v),
            Colormap::InverseRainbow => rainbow(1.0 - v),
            Colormap::Grayscale => gray(v),
            Colormap::InverseGrayscale => gray(1.0 - v),
            Colormap::Ironbow => ironbow(v),
        }
    }
}

impl FromStr for Colormap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rainbow" => Ok(Colormap::Rainbow),
            "inverse_rainbow" => Ok(Colormap::InverseRainbow),
            "grayscale" => Ok(Colormap::Grayscale),
            "inverse_grayscale" => Ok(Colormap::InverseGrayscale),
            "ironbow" => Ok(Colormap::Ironbow),
            other => Err(Error::Config(format!("unknown colormap '{other}'"))),
        }
    }
}

fn gray(v: f32) -> Color {
    let c = (v * 255.0).round() as u8;
    Color::new(c, c, c)
}

/// Blue (0) through green to red (1), full saturation
fn rainbow(v: f32) -> Color {
    // Hue sweep 240 deg -> 0 deg over four equal segments
    let s = v * 4.0;
    let (r, g, b) = if s < 1.0 {
        (0.0, s, 1.0)
    } else if s < 2.0 {
        (0.0, 1.0, 2.0 - s)
    } else if s < 3.0 {
        (s - 2.0, 1.0, 0.0)
    } else {
        (1.0, 4.0 - s, 0.0)
    };
    Color::new(
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    )
}

/// Thermal-style palette: black, purple, red, yellow, white
fn ironbow(v: f32) -> Color {
    const STOPS: [(f32, Color); 5] = [
        (0.00, Color::new(0, 0, 0)),
        (0.25, Color::new(128, 0, 128)),
        (0.50, Color::new(255, 64, 0)),
        (0.75, Color::new(255, 200, 0)),
        (1.00, Color::new(255, 255, 255)),
    ];
    for window in STOPS.windows(2) {
        let (t0, c0) = window[0];
        let (t1, c1) = window[1];
        if v <= t1 {
            return Color::lerp(c0, c1, (v - t0) / (t1 - t0));
        }
    }
    STOPS[4].1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        for map in [
            Colormap::Rainbow,
            Colormap::InverseRainbow,
            Colormap::Grayscale,
            Colormap::InverseGrayscale,
            Colormap::Ironbow,
        ] {
            assert_eq!(map.name().parse::<Colormap>().unwrap(), map);
        }
        assert!("viridis".parse::<Colormap>().is_err());
    }

    #[test]
    fn test_endpoints() {
        assert_eq!(Colormap::Grayscale.map(0.0), Color::new(0, 0, 0));
        assert_eq!(Colormap::Grayscale.map(1.0), Color::new(255, 255, 255));
        assert_eq!(Colormap::InverseGrayscale.map(0.0), Color::new(255, 255, 255));

        // Rainbow runs blue to red
        assert_eq!(Colormap::Rainbow.map(0.0), Color::new(0, 0, 255));
        assert_eq!(Colormap::Rainbow.map(1.0), Color::new(255, 0, 0));
        assert_eq!(Colormap::InverseRainbow.map(0.0), Color::new(255, 0, 0));

        assert_eq!(Colormap::Ironbow.map(0.0), Color::new(0, 0, 0));
        assert_eq!(Colormap::Ironbow.map(1.0), Color::new(255, 255, 255));
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(Colormap::Grayscale.map(-3.0), Color::new(0, 0, 0));
        assert_eq!(Colormap::Grayscale.map(7.0), Color::new(255, 255, 255));
    }
}
