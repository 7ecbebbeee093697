//! Coordinate frame model and conversions.
//!
//! Events leave the HDI layer in `ScreenTl` (origin top-left, y grows
//! downward); applications may prefer a cartesian view. Conversions are
//! parameterized by the matrix extent and are exact on the integer pixel
//! lattice, so `from_screen_tl(to_screen_tl(p)) == p` for every pixel.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Closed set of coordinate frames exchanged across the app boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Frame {
    /// Origin top-left, +y down. The render/native frame.
    #[default]
    ScreenTl,
    /// Origin bottom-left, +y up.
    CartesianBl,
    /// Origin at the extent center, +x right, +y up.
    CartesianCenter,
}

/// Matrix extent in pixels, `(width, height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn max_x(self) -> f64 {
        f64::from(self.width.saturating_sub(1))
    }

    fn max_y(self) -> f64 {
        f64::from(self.height.saturating_sub(1))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown coordinate frame: {0:?} (expected screen_tl, cartesian_bl, or cartesian_center)")]
pub struct ParseFrameError(String);

impl FromStr for Frame {
    type Err = ParseFrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "screen_tl" => Ok(Frame::ScreenTl),
            "cartesian_bl" => Ok(Frame::CartesianBl),
            "cartesian_center" => Ok(Frame::CartesianCenter),
            other => Err(ParseFrameError(other.to_string())),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frame::ScreenTl => "screen_tl",
            Frame::CartesianBl => "cartesian_bl",
            Frame::CartesianCenter => "cartesian_center",
        };
        f.write_str(name)
    }
}

impl Frame {
    /// Map a point expressed in `self` into the render frame (`ScreenTl`).
    pub fn to_screen_tl(self, extent: Extent, x: f64, y: f64) -> (f64, f64) {
        match self {
            Frame::ScreenTl => (x, y),
            Frame::CartesianBl => (x, extent.max_y() - y),
            Frame::CartesianCenter => {
                (x + extent.max_x() / 2.0, extent.max_y() / 2.0 - y)
            }
        }
    }

    /// Map a render-frame (`ScreenTl`) point into `self`.
    pub fn from_screen_tl(self, extent: Extent, x: f64, y: f64) -> (f64, f64) {
        match self {
            Frame::ScreenTl => (x, y),
            Frame::CartesianBl => (x, extent.max_y() - y),
            Frame::CartesianCenter => {
                (x - extent.max_x() / 2.0, extent.max_y() / 2.0 - y)
            }
        }
    }
}
