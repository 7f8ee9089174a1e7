//! Inference adapter: wraps an opaque fixed-size model behind a lazily loaded,
//! cached engine and maps its output back onto the tile it was fed.
//!
//! Tiles are padded to a square before they reach the engine (see
//! [`Padding`]), the padded output is cropped back to the tile's aspect, and
//! the resulting scale factor is checked against the first tile of the run.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProcessError;
use crate::geometry::{scale_length, Size};

const SCALE_TOLERANCE: f64 = 1e-6;

/// The model itself: a fixed-size image goes in, a fixed-size image comes out.
///
/// Engines need `&mut self` (an ORT session does), so the adapter serializes
/// calls through a mutex even when tiles are dispatched in parallel.
pub trait InferenceEngine: Send {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage>;
}

/// Produces an engine on first use. Called at most once per cached model.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> Result<Box<dyn InferenceEngine>>;
}

impl<F> ModelLoader for F
where
    F: Fn() -> Result<Box<dyn InferenceEngine>> + Send + Sync,
{
    fn load(&self) -> Result<Box<dyn InferenceEngine>> {
        self()
    }
}

pub type SharedEngine = Arc<Mutex<Box<dyn InferenceEngine>>>;

/// How a tile is prepared before it is handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Padding {
    /// Composite onto an opaque black square of side `max(w, h)`, top-left.
    #[default]
    Square,
    /// Submit the tile unchanged.
    None,
}

impl std::fmt::Display for Padding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Square => write!(f, "square"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for Padding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "square" => Ok(Self::Square),
            "none" => Ok(Self::None),
            other => Err(format!("unknown padding mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferredTile {
    pub image: RgbImage,
    /// Output pixels per input pixel, uniform on both axes.
    pub scale_factor: f64,
}

/// Lazily loaded, cached model plus its pre/post-processing.
pub struct InferenceAdapter {
    loader: Arc<dyn ModelLoader>,
    padding: Padding,
    engine: Mutex<Option<SharedEngine>>,
}

impl InferenceAdapter {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self::with_padding(loader, Padding::default())
    }

    pub fn with_padding(loader: Arc<dyn ModelLoader>, padding: Padding) -> Self {
        Self {
            loader,
            padding,
            engine: Mutex::new(None),
        }
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn is_loaded(&self) -> bool {
        self.engine
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Returns the cached engine, loading it first if needed. Blocking.
    pub fn get_or_load(&self) -> Result<SharedEngine, ProcessError> {
        let mut slot = self
            .engine
            .lock()
            .map_err(|_| ProcessError::model_load(&anyhow!("model cache lock poisoned")))?;

        if let Some(engine) = slot.as_ref() {
            return Ok(Arc::clone(engine));
        }

        let started = std::time::Instant::now();
        let engine = self
            .loader
            .load()
            .context("model loader failed")
            .map_err(|error| ProcessError::model_load(&error))?;
        let engine: SharedEngine = Arc::new(Mutex::new(engine));
        *slot = Some(Arc::clone(&engine));

        info!(
            elapsed_ms = format!("{:.1}", started.elapsed().as_secs_f64() * 1000.0),
            "Model loaded"
        );
        Ok(engine)
    }

    /// Drops the cached model; the next run loads it again.
    pub fn discard(&self) {
        if let Ok(mut slot) = self.engine.lock() {
            if slot.take().is_some() {
                debug!("Discarded cached model");
            }
        }
    }

    /// Runs one tile through `engine` and crops the output to the tile.
    pub fn infer(&self, engine: &SharedEngine, tile: &RgbImage) -> Result<InferredTile> {
        infer_with(engine, tile, self.padding)
    }
}

pub fn infer_with(engine: &SharedEngine, tile: &RgbImage, padding: Padding) -> Result<InferredTile> {
    let tile_size = Size::of(tile);
    if tile_size.is_empty() {
        bail!("tile has zero area");
    }

    let input = match padding {
        Padding::Square => pad_to_square(tile),
        Padding::None => tile.clone(),
    };
    let input_size = Size::of(&input);

    let output = {
        let mut engine = engine
            .lock()
            .map_err(|_| anyhow!("inference engine lock poisoned"))?;
        engine.run(&input).context("engine rejected tile")?
    };
    let output_size = Size::of(&output);
    if output_size.is_empty() {
        bail!("engine returned an empty image for a {input_size} input");
    }

    let scale_factor = output_size.max_dimension() as f64 / input_size.max_dimension() as f64;
    let expected = input_size.scaled(scale_factor);
    if expected != output_size {
        bail!(
            "engine output {output_size} does not match {input_size} input at scale {scale_factor}"
        );
    }

    let crop = Size::new(
        scale_length(tile_size.width, scale_factor).min(output_size.width),
        scale_length(tile_size.height, scale_factor).min(output_size.height),
    );
    let image = if crop == output_size {
        output
    } else {
        imageops::crop_imm(&output, 0, 0, crop.width, crop.height).to_image()
    };

    Ok(InferredTile {
        image,
        scale_factor,
    })
}

/// Places `tile` at the top-left of a black square canvas.
pub fn pad_to_square(tile: &RgbImage) -> RgbImage {
    let side = Size::of(tile).max_dimension();
    if tile.width() == side && tile.height() == side {
        return tile.clone();
    }
    let mut canvas = RgbImage::from_pixel(side, side, Rgb([0, 0, 0]));
    imageops::replace(&mut canvas, tile, 0, 0);
    canvas
}

/// Scale factor of a run: fixed by the first tile, asserted afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScaleDiscovery {
    factor: Option<f64>,
}

impl ScaleDiscovery {
    pub fn factor(&self) -> Option<f64> {
        self.factor
    }

    pub fn observe(&mut self, tile: &InferredTile) -> Result<f64> {
        match self.factor {
            None => {
                debug!(scale_factor = tile.scale_factor, "Discovered scale factor");
                self.factor = Some(tile.scale_factor);
                Ok(tile.scale_factor)
            }
            Some(expected) if (expected - tile.scale_factor).abs() <= SCALE_TOLERANCE => {
                Ok(expected)
            }
            Some(expected) => Err(anyhow!(
                "inconsistent output size: scale {} differs from {expected} seen on the first tile",
                tile.scale_factor
            )),
        }
    }
}
