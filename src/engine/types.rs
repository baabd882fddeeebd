//! Core value types shared by the worker and the render context

use serde::{Deserialize, Serialize};

/// Pixel format the decoder renders into and textures are created with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorSpace {
    /// 24-bit RGB
    #[default]
    Rgb,
    /// 24-bit BGR
    Bgr,
    /// 8-bit greyscale
    Grey,
}

impl ColorSpace {
    /// Decodes the wire id used by the `cs` command (0=RGB, 1=BGR, 2=grey8).
    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::Rgb),
            1 => Some(Self::Bgr),
            2 => Some(Self::Grey),
            _ => None,
        }
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Rgb => 0,
            Self::Bgr => 1,
            Self::Grey => 2,
        }
    }

    /// Bytes per pixel in a rendered tile.
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Rgb | Self::Bgr => 3,
            Self::Grey => 1,
        }
    }

    /// Bytes per pixel reserved in a staging buffer.
    ///
    /// Colour paths reserve one padding byte per pixel so rows stay 4-byte aligned.
    #[must_use]
    pub const fn staging_bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb | Self::Bgr => 4,
            Self::Grey => 1,
        }
    }
}

/// Page layout strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Every page is scaled to the viewport width.
    #[default]
    Width,
    /// One zoom for the whole document, chosen so the widest page fills the viewport.
    Proportional,
    /// Each page is scaled to fit both viewport axes.
    Page,
}

impl FitMode {
    /// Decodes the wire id used by `geometry`/`reqlayout` (0=width, 1=proportional, 2=page).
    #[must_use]
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::Width),
            1 => Some(Self::Proportional),
            2 => Some(Self::Page),
            _ => None,
        }
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        match self {
            Self::Width => 0,
            Self::Proportional => 1,
            Self::Page => 2,
        }
    }
}

/// Page rotation in degrees, normalized to 0, 90, 180 or 270.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rotation(u16);

impl Rotation {
    /// Snaps arbitrary degrees (including negative values) down to a quarter turn.
    #[must_use]
    pub fn from_degrees(degrees: i32) -> Self {
        let quarter = degrees.rem_euclid(360) / 90;
        Self((quarter * 90) as u16)
    }

    #[must_use]
    pub const fn degrees(self) -> u16 {
        self.0
    }

    /// True when the page's width and height trade places.
    #[must_use]
    pub const fn swaps_axes(self) -> bool {
        self.0 == 90 || self.0 == 270
    }
}

/// Viewport size in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Monotonic epoch counters.
///
/// Handles capture a copy at creation; comparing against the session's
/// current value tells a controller whether a result is stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Generations {
    /// Bumped by every layout request.
    pub layout: u64,
    /// Bumped whenever a layout changes any page's pixel size.
    pub size: u64,
    /// Bumped whenever a document is opened.
    pub access: u64,
}

impl Generations {
    /// Whether something stamped with `stamp` is still valid for the current
    /// document and page sizes.
    #[must_use]
    pub fn is_current(&self, stamp: &Generations) -> bool {
        self.access == stamp.access && self.size == stamp.size
    }
}

/// Rectangle in page pixel space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelRect {
    #[must_use]
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}
