//! Pixel grid and published frame snapshots

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One LED color
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Self = Self::new(0, 0, 0);
    pub const WHITE: Self = Self::new(255, 255, 255);

    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Scale every channel by `level / 255`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn scaled(self, level: u8) -> Self {
        let l = level as u16;
        Self {
            r: ((self.r as u16 * l) / 255) as u8,
            g: ((self.g as u16 * l) / 255) as u8,
            b: ((self.b as u16 * l) / 255) as u8,
        }
    }

    /// Linear blend toward `other`; `amount` is clamped to `[0, 1]`
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn lerp(self, other: Self, amount: f32) -> Self {
        let a = amount.clamp(0.0, 1.0);
        let mix = |x: u8, y: u8| (f32::from(x) + (f32::from(y) - f32::from(x)) * a).round() as u8;
        Self {
            r: mix(self.r, other.r),
            g: mix(self.g, other.g),
            b: mix(self.b, other.b),
        }
    }
}

/// Fixed-size 2-D array of colors, stored row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: usize,
    height: usize,
    cells: Vec<Rgb>,
}

impl PixelGrid {
    /// Create a black grid
    ///
    /// # Errors
    ///
    /// Returns error if either dimension is zero
    pub fn new(width: usize, height: usize) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "panel dimensions must be non-zero (got {width}x{height})"
            )));
        }

        Ok(Self {
            width,
            height,
            cells: vec![Rgb::BLACK; width * height],
        })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Number of cells
    #[must_use]
    pub const fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Color at `(x, y)`, or `None` when out of range
    #[must_use]
    pub fn get(&self, x: usize, y: usize) -> Option<Rgb> {
        (x < self.width && y < self.height).then(|| self.cells[y * self.width + x])
    }

    /// Write one cell; out-of-range writes are ignored and return false
    pub fn set(&mut self, x: usize, y: usize, color: Rgb) -> bool {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = color;
            true
        } else {
            false
        }
    }

    /// Fill every cell with one color
    pub fn fill(&mut self, color: Rgb) {
        self.cells.fill(color);
    }

    /// All cells in row-major order
    #[must_use]
    pub fn cells(&self) -> &[Rgb] {
        &self.cells
    }

    /// Iterate rows top to bottom
    pub fn rows(&self) -> impl Iterator<Item = &[Rgb]> {
        self.cells.chunks(self.width)
    }
}

/// Immutable snapshot published once a tick has rendered every cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Rendered pixels
    pub grid: PixelGrid,
    /// Logical time the frame was rendered at
    pub tick: u64,
    /// Name of the show that produced it
    pub show: Arc<str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(PixelGrid::new(0, 4), Err(Error::Config(_))));
        assert!(matches!(PixelGrid::new(4, 0), Err(Error::Config(_))));
    }

    #[test]
    fn test_get_set_bounds() {
        let mut grid = PixelGrid::new(3, 2).unwrap();
        assert!(grid.set(2, 1, Rgb::WHITE));
        assert!(!grid.set(3, 0, Rgb::WHITE));
        assert_eq!(grid.get(2, 1), Some(Rgb::WHITE));
        assert_eq!(grid.get(0, 2), None);
        assert_eq!(grid.cells()[5], Rgb::WHITE);
    }

    #[test]
    fn test_rows_are_row_major() {
        let mut grid = PixelGrid::new(2, 2).unwrap();
        grid.set(1, 0, Rgb::new(1, 2, 3));
        let rows: Vec<_> = grid.rows().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], Rgb::new(1, 2, 3));
    }

    #[test]
    fn test_scaled() {
        assert_eq!(Rgb::WHITE.scaled(255), Rgb::WHITE);
        assert_eq!(Rgb::WHITE.scaled(0), Rgb::BLACK);
        assert_eq!(Rgb::new(200, 100, 50).scaled(51), Rgb::new(40, 20, 10));
    }

    #[test]
    fn test_lerp_clamps() {
        let a = Rgb::BLACK;
        let b = Rgb::new(100, 200, 50);
        assert_eq!(a.lerp(b, 0.0), a);
        assert_eq!(a.lerp(b, 1.0), b);
        assert_eq!(a.lerp(b, 2.0), b);
        assert_eq!(a.lerp(b, 0.5), Rgb::new(50, 100, 25));
    }
}
