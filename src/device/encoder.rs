//! Grid → device wire bytes
//!
//! The wire format is headerless: three bytes per LED in the device's channel
//! order, LEDs in wiring order, `width * height * 3` bytes per frame.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use super::topology::{Topology, verify_topology};
use crate::show::{PixelGrid, Rgb};
use crate::{Error, Result};

/// Byte order of the three color channels on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Rbg,
    /// WS2812B default
    #[default]
    Grb,
    Gbr,
    Brg,
    Bgr,
}

impl ChannelOrder {
    /// Reorder one color for the wire
    #[must_use]
    pub const fn arrange(self, c: Rgb) -> [u8; 3] {
        match self {
            Self::Rgb => [c.r, c.g, c.b],
            Self::Rbg => [c.r, c.b, c.g],
            Self::Grb => [c.g, c.r, c.b],
            Self::Gbr => [c.g, c.b, c.r],
            Self::Brg => [c.b, c.r, c.g],
            Self::Bgr => [c.b, c.g, c.r],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rgb => "rgb",
            Self::Rbg => "rbg",
            Self::Grb => "grb",
            Self::Gbr => "gbr",
            Self::Brg => "brg",
            Self::Bgr => "bgr",
        }
    }
}

impl fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "rgb" => Ok(Self::Rgb),
            "rbg" => Ok(Self::Rbg),
            "grb" => Ok(Self::Grb),
            "gbr" => Ok(Self::Gbr),
            "brg" => Ok(Self::Brg),
            "bgr" => Ok(Self::Bgr),
            other => Err(Error::Config(format!("unknown channel order: {other}"))),
        }
    }
}

/// Encodes frames for one panel geometry
#[derive(Clone)]
pub struct FrameEncoder {
    topology: Arc<dyn Topology>,
    order: ChannelOrder,
    brightness: u8,
    width: usize,
    height: usize,
}

impl fmt::Debug for FrameEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEncoder")
            .field("topology", &self.topology.name())
            .field("order", &self.order)
            .field("brightness", &self.brightness)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl FrameEncoder {
    /// Create an encoder for a `width × height` panel
    ///
    /// # Errors
    ///
    /// Returns `Config` if the topology is not a bijection for this size
    pub fn new(
        topology: Arc<dyn Topology>,
        order: ChannelOrder,
        width: usize,
        height: usize,
    ) -> Result<Self> {
        verify_topology(topology.as_ref(), width, height)?;
        Ok(Self {
            topology,
            order,
            brightness: u8::MAX,
            width,
            height,
        })
    }

    /// Scale all output by `level / 255`
    #[must_use]
    pub const fn with_brightness(mut self, level: u8) -> Self {
        self.brightness = level;
        self
    }

    /// Bytes per encoded frame
    #[must_use]
    pub const fn frame_len(&self) -> usize {
        self.width * self.height * 3
    }

    #[must_use]
    pub const fn order(&self) -> ChannelOrder {
        self.order
    }

    #[must_use]
    pub fn topology_name(&self) -> &str {
        self.topology.name()
    }

    /// Encode a grid into a fresh buffer
    ///
    /// # Errors
    ///
    /// Returns `Config` if the grid size differs from the encoder's
    pub fn encode(&self, grid: &PixelGrid) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(grid, &mut out)?;
        Ok(out)
    }

    /// Encode into `out`, reusing its allocation
    ///
    /// # Errors
    ///
    /// Returns `Config` if the grid size differs from the encoder's
    pub fn encode_into(&self, grid: &PixelGrid, out: &mut Vec<u8>) -> Result<()> {
        if grid.width() != self.width || grid.height() != self.height {
            return Err(Error::Config(format!(
                "frame is {}x{} but encoder expects {}x{}",
                grid.width(),
                grid.height(),
                self.width,
                self.height
            )));
        }

        out.clear();
        out.resize(self.frame_len(), 0);

        for (y, row) in grid.rows().enumerate() {
            for (x, color) in row.iter().enumerate() {
                let index = self.topology.index(x, y, self.width, self.height) * 3;
                let color = if self.brightness == u8::MAX {
                    *color
                } else {
                    color.scaled(self.brightness)
                };
                out[index..index + 3].copy_from_slice(&self.order.arrange(color));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::topology::{RowMajor, SerpentineRows};

    #[test]
    fn test_channel_orders() {
        let c = Rgb::new(1, 2, 3);
        assert_eq!(ChannelOrder::Rgb.arrange(c), [1, 2, 3]);
        assert_eq!(ChannelOrder::Grb.arrange(c), [2, 1, 3]);
        assert_eq!(ChannelOrder::Gbr.arrange(c), [2, 3, 1]);
        assert_eq!(ChannelOrder::Bgr.arrange(c), [3, 2, 1]);
    }

    #[test]
    fn test_encode_length_and_placement() {
        let encoder = FrameEncoder::new(Arc::new(SerpentineRows), ChannelOrder::Rgb, 2, 2).unwrap();
        let mut grid = PixelGrid::new(2, 2).unwrap();
        // Row 1 runs right to left, so (0, 1) is the fourth LED
        grid.set(0, 1, Rgb::new(9, 8, 7));

        let bytes = encoder.encode(&grid).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[9..12], &[9, 8, 7]);
        assert!(bytes[..9].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_brightness_scales_output() {
        let encoder = FrameEncoder::new(Arc::new(RowMajor), ChannelOrder::Rgb, 1, 1)
            .unwrap()
            .with_brightness(51);
        let mut grid = PixelGrid::new(1, 1).unwrap();
        grid.fill(Rgb::new(255, 100, 0));
        assert_eq!(encoder.encode(&grid).unwrap(), vec![51, 20, 0]);
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let encoder = FrameEncoder::new(Arc::new(RowMajor), ChannelOrder::Grb, 2, 2).unwrap();
        let grid = PixelGrid::new(3, 2).unwrap();
        assert!(matches!(encoder.encode(&grid), Err(Error::Config(_))));
    }

    #[test]
    fn test_channel_order_parse() {
        assert_eq!("GRB".parse::<ChannelOrder>().unwrap(), ChannelOrder::Grb);
        assert!("rgbw".parse::<ChannelOrder>().is_err());
    }
}
