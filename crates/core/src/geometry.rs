//! Rectangle and size arithmetic plus orientation normalization.
//!
//! All coordinates are integer pixels with a top-left origin. Scaling by a
//! non-integral factor uses one rounding rule everywhere: sizes round up,
//! offsets round down, and values within `SCALE_EPSILON` of an integer snap
//! to it first so that `600 * 4.0` never becomes 2401.

use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

const SCALE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn of(image: &RgbImage) -> Self {
        Self::new(image.width(), image.height())
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn max_dimension(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(
            scale_length(self.width, factor),
            scale_length(self.height, factor),
        )
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn from_size(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.size().is_empty()
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Maps a source-space rect into a canvas scaled by `factor`.
    pub fn scaled(&self, factor: f64) -> Rect {
        Rect::new(
            scale_offset(self.x, factor),
            scale_offset(self.y, factor),
            scale_length(self.width, factor),
            scale_length(self.height, factor),
        )
    }

    /// Clips the rect to `0..bounds`; returns `None` when nothing is left.
    pub fn clipped_to(&self, bounds: Size) -> Option<Rect> {
        self.intersection(&Rect::from_size(bounds))
    }

    /// Converts between top-left and bottom-left origin conventions inside a
    /// container of the given height. Applying it twice is the identity.
    pub fn flip_vertical(&self, container_height: u32) -> Rect {
        Rect::new(
            self.x,
            container_height.saturating_sub(self.bottom()),
            self.width,
            self.height,
        )
    }
}

pub fn scale_length(value: u32, factor: f64) -> u32 {
    let scaled = value as f64 * factor;
    let rounded = scaled.round();
    if (scaled - rounded).abs() < SCALE_EPSILON {
        rounded as u32
    } else {
        scaled.ceil() as u32
    }
}

pub fn scale_offset(value: u32, factor: f64) -> u32 {
    let scaled = value as f64 * factor;
    let rounded = scaled.round();
    if (scaled - rounded).abs() < SCALE_EPSILON {
        rounded as u32
    } else {
        scaled.floor() as u32
    }
}

/// Embedded rotation metadata, numbered like the EXIF orientation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Upright,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Rotate90FlipHorizontal,
    Rotate90,
    Rotate270FlipHorizontal,
    Rotate270,
}

impl Orientation {
    pub fn from_exif(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Upright),
            2 => Some(Self::FlipHorizontal),
            3 => Some(Self::Rotate180),
            4 => Some(Self::FlipVertical),
            5 => Some(Self::Rotate90FlipHorizontal),
            6 => Some(Self::Rotate90),
            7 => Some(Self::Rotate270FlipHorizontal),
            8 => Some(Self::Rotate270),
            _ => None,
        }
    }

    pub fn to_exif(self) -> u8 {
        match self {
            Self::Upright => 1,
            Self::FlipHorizontal => 2,
            Self::Rotate180 => 3,
            Self::FlipVertical => 4,
            Self::Rotate90FlipHorizontal => 5,
            Self::Rotate90 => 6,
            Self::Rotate270FlipHorizontal => 7,
            Self::Rotate270 => 8,
        }
    }

    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Self::Rotate90FlipHorizontal
                | Self::Rotate90
                | Self::Rotate270FlipHorizontal
                | Self::Rotate270
        )
    }

    /// Size of the upright image once this orientation is applied.
    pub fn upright_size(self, stored: Size) -> Size {
        if self.swaps_dimensions() {
            Size::new(stored.height, stored.width)
        } else {
            stored
        }
    }

    /// Bakes the orientation into the pixels, returning an upright image.
    pub fn normalize(self, image: RgbImage) -> RgbImage {
        match self {
            Self::Upright => image,
            Self::FlipHorizontal => imageops::flip_horizontal(&image),
            Self::Rotate180 => imageops::rotate180(&image),
            Self::FlipVertical => imageops::flip_vertical(&image),
            Self::Rotate90FlipHorizontal => imageops::flip_horizontal(&imageops::rotate90(&image)),
            Self::Rotate90 => imageops::rotate90(&image),
            Self::Rotate270FlipHorizontal => {
                imageops::flip_horizontal(&imageops::rotate270(&image))
            }
            Self::Rotate270 => imageops::rotate270(&image),
        }
    }
}
