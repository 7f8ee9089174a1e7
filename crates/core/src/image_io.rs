//! Encoded image boundary: bytes or files in, [`SourceImage`] out, and back.

use std::io::Cursor;
use std::path::Path;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use tracing::debug;

use crate::error::ProcessError;
use crate::geometry::{Orientation, Size};
use crate::types::SourceImage;

/// Decodes `bytes` into RGB8 pixels, keeping embedded EXIF orientation
/// separate so it can be applied before tiling.
pub fn decode(bytes: &[u8]) -> Result<SourceImage, ProcessError> {
    if bytes.is_empty() {
        return Err(ProcessError::invalid_image("no image data"));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ProcessError::invalid_image(format!("failed to read image header: {e}")))?;
    let format = reader
        .format()
        .ok_or_else(|| ProcessError::invalid_image("unrecognized image format"))?;

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| ProcessError::invalid_image(format!("unsupported {format:?} data: {e}")))?;
    let orientation = decoder
        .orientation()
        .ok()
        .and_then(|value| Orientation::from_exif(value.to_exif()))
        .unwrap_or_default();

    let pixels = DynamicImage::from_decoder(decoder)
        .map_err(|e| ProcessError::invalid_image(format!("failed to decode {format:?}: {e}")))?
        .to_rgb8();

    let size = Size::of(&pixels);
    if size.is_empty() {
        return Err(ProcessError::invalid_image(format!("image {size} has zero area")));
    }

    debug!(
        format = ?format,
        size = %size,
        orientation = ?orientation,
        "Decoded source image"
    );

    Ok(SourceImage::with_orientation(pixels, orientation))
}

pub fn read_file(path: &Path) -> Result<SourceImage> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read image: {}", path.display()))?;
    decode(&bytes).with_context(|| format!("Failed to decode image: {}", path.display()))
}

pub fn encode(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, format)
        .with_context(|| format!("Failed to encode image as {format:?}"))?;
    Ok(buffer.into_inner())
}

/// Writes `image` to `path`, picking the format from the file extension.
pub fn save(image: &RgbImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path)
        .with_context(|| format!("Unsupported output extension: {}", path.display()))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }

    image
        .save_with_format(path, format)
        .with_context(|| format!("Failed to write image: {}", path.display()))?;
    debug!(path = %path.display(), size = %Size::of(image), "Saved image");
    Ok(())
}
