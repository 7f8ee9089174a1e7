//! Output canvas that processed tiles are stitched into.
//!
//! The canvas starts as the source image resized to the output scale, so
//! partially processed snapshots always show the whole picture. Tiles are
//! written at their scaled source position; later tiles cover earlier ones
//! unless [`SeamPolicy::Feather`] blends the overlap.

use std::sync::Arc;

use image::{imageops, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ProcessError;
use crate::geometry::{scale_offset, Rect, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeamPolicy {
    /// Last tile placed wins.
    #[default]
    Overwrite,
    /// Linear ramp across the overlap with previously placed tiles on the
    /// left and top edges.
    Feather,
}

impl std::fmt::Display for SeamPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overwrite => write!(f, "overwrite"),
            Self::Feather => write!(f, "feather"),
        }
    }
}

impl std::str::FromStr for SeamPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "feather" | "blend" => Ok(Self::Feather),
            other => Err(format!("unknown seam policy: {other}")),
        }
    }
}

pub struct Canvas {
    image: RgbImage,
    scale: f64,
    seam: SeamPolicy,
    placed: Vec<Rect>,
}

impl Canvas {
    /// Allocates `ceil(w * scale) x ceil(h * scale)` with `source` drawn as
    /// the placeholder background.
    pub fn new(source: &RgbImage, scale: f64, seam: SeamPolicy) -> Result<Self, ProcessError> {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ProcessError::tiling(format!(
                "scale factor {scale} must be positive"
            )));
        }

        let size = Size::of(source).scaled(scale);
        if size.is_empty() {
            return Err(ProcessError::tiling(format!(
                "output canvas for {} at scale {scale} has zero area",
                Size::of(source)
            )));
        }

        let image = if size == Size::of(source) {
            source.clone()
        } else {
            imageops::resize(source, size.width, size.height, imageops::FilterType::Triangle)
        };

        debug!(canvas = %size, scale, seam = %seam, "Allocated output canvas");

        Ok(Self {
            image,
            scale,
            seam,
            placed: Vec::new(),
        })
    }

    pub fn size(&self) -> Size {
        Size::of(&self.image)
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn snapshot(&self) -> Arc<RgbImage> {
        Arc::new(self.image.clone())
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }

    /// Canvas rectangle a processed tile lands on, clipped to the canvas.
    pub fn destination(&self, processed: &RgbImage, source_rect: Rect) -> Option<Rect> {
        Rect::new(
            scale_offset(source_rect.x, self.scale),
            scale_offset(source_rect.y, self.scale),
            processed.width(),
            processed.height(),
        )
        .clipped_to(self.size())
    }

    /// Writes `processed` at the scaled position of `source_rect`.
    ///
    /// Returns the canvas rectangle that was written, or `None` when the
    /// tile falls entirely outside the canvas.
    pub fn place_tile(&mut self, processed: &RgbImage, source_rect: Rect) -> Option<Rect> {
        let dest = self.destination(processed, source_rect)?;

        match self.seam {
            SeamPolicy::Overwrite => {
                imageops::replace(&mut self.image, processed, dest.x as i64, dest.y as i64);
            }
            SeamPolicy::Feather => {
                let (feather_left, feather_top) = self.feather_widths(dest);
                self.blend(processed, dest, feather_left, feather_top);
            }
        }

        self.placed.push(dest);
        Some(dest)
    }

    /// Overlap with already placed tiles along the left and top edges.
    /// Edges on the canvas border never get a ramp.
    fn feather_widths(&self, dest: Rect) -> (u32, u32) {
        let mut left = 0u32;
        let mut top = 0u32;

        for previous in &self.placed {
            let Some(shared) = previous.intersection(&dest) else {
                continue;
            };
            if dest.x > 0 && previous.x < dest.x && shared.x == dest.x {
                left = left.max(shared.width);
            }
            if dest.y > 0 && previous.y < dest.y && shared.y == dest.y {
                top = top.max(shared.height);
            }
        }

        (left.min(dest.width), top.min(dest.height))
    }

    fn blend(&mut self, processed: &RgbImage, dest: Rect, feather_left: u32, feather_top: u32) {
        for dy in 0..dest.height {
            let weight_y = ramp(dy, feather_top);
            for dx in 0..dest.width {
                let weight = ramp(dx, feather_left).min(weight_y);
                let incoming = processed.get_pixel(dx, dy);
                let target = self.image.get_pixel_mut(dest.x + dx, dest.y + dy);
                *target = if weight >= 1.0 {
                    *incoming
                } else {
                    mix(target, incoming, weight)
                };
            }
        }
    }
}

fn ramp(offset: u32, width: u32) -> f32 {
    if offset >= width {
        1.0
    } else {
        (offset + 1) as f32 / (width + 1) as f32
    }
}

fn mix(existing: &Rgb<u8>, incoming: &Rgb<u8>, weight: f32) -> Rgb<u8> {
    let channel = |i: usize| {
        let value = existing[i] as f32 * (1.0 - weight) + incoming[i] as f32 * weight;
        value.round().clamp(0.0, 255.0) as u8
    };
    Rgb([channel(0), channel(1), channel(2)])
}
