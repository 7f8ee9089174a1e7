//! Tile partitioner: covers an image with a row-major grid of square,
//! possibly overlapping tiles that never leave the image bounds.

use image::{imageops, RgbImage};
use tracing::debug;

use crate::error::ProcessError;
use crate::geometry::{Rect, Size};
use crate::types::Tile;

/// Upper bound on tiles per run; larger plans are rejected before inference.
pub const DEFAULT_MAX_TILES: usize = 400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub image_size: Size,
    /// Requested size clamped to `min(tile_size, width, height)`.
    pub tile_size: u32,
    pub overlap_size: u32,
    pub stride: u32,
    pub rects: Vec<Rect>,
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn ensure_within(&self, max_tiles: Option<usize>) -> Result<(), ProcessError> {
        match max_tiles {
            Some(max) if self.rects.len() > max => Err(ProcessError::TooManyTiles {
                count: self.rects.len(),
                max,
            }),
            _ => Ok(()),
        }
    }
}

/// Computes tile rectangles without touching pixels.
pub fn plan_tiles(image_size: Size, tile_size: u32, overlap: f64) -> Result<TilePlan, ProcessError> {
    if image_size.is_empty() {
        return Err(ProcessError::tiling(format!(
            "image {image_size} has zero area"
        )));
    }
    if tile_size == 0 {
        return Err(ProcessError::tiling("tile size must be positive"));
    }
    if !overlap.is_finite() || !(0.0..1.0).contains(&overlap) {
        return Err(ProcessError::tiling(format!(
            "overlap {overlap} must be in 0..1"
        )));
    }

    let Size { width, height } = image_size;
    let tile = tile_size.min(width).min(height);

    if tile == width && tile == height {
        return Ok(TilePlan {
            image_size,
            tile_size: tile,
            overlap_size: 0,
            stride: tile,
            rects: vec![Rect::from_size(image_size)],
        });
    }

    let overlap_size = (tile as f64 * overlap).floor() as u32;
    let stride = tile - overlap_size;
    if stride == 0 {
        return Err(ProcessError::tiling(format!(
            "overlap of {overlap_size}px leaves no stride for {tile}px tiles"
        )));
    }

    // Stopping at `dim - overlap_size` still reaches the far edge through the
    // clamp below, and never emits two tiles clamped onto the same origin.
    let x_end = width - overlap_size;
    let y_end = height - overlap_size;

    let mut rects = Vec::new();
    let mut y = 0u32;
    while y < y_end {
        let final_y = y.min(height - tile);
        let mut x = 0u32;
        while x < x_end {
            let final_x = x.min(width - tile);
            rects.push(Rect::new(final_x, final_y, tile, tile));
            x += stride;
        }
        y += stride;
    }

    debug!(
        image = %image_size,
        requested_tile_size = tile_size,
        tile_size = tile,
        overlap_size,
        stride,
        tiles = rects.len(),
        "Planned tiles"
    );

    Ok(TilePlan {
        image_size,
        tile_size: tile,
        overlap_size,
        stride,
        rects,
    })
}

/// Splits `image` into tiles following [`plan_tiles`].
pub fn partition(image: &RgbImage, tile_size: u32, overlap: f64) -> Result<Vec<Tile>, ProcessError> {
    let plan = plan_tiles(Size::of(image), tile_size, overlap)?;
    Ok(crop_tiles(image, &plan))
}

pub fn crop_tiles(image: &RgbImage, plan: &TilePlan) -> Vec<Tile> {
    plan.rects
        .iter()
        .enumerate()
        .map(|(index, rect)| Tile {
            index,
            image: imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image(),
            source_rect: *rect,
        })
        .collect()
}
