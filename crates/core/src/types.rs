use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;
use crate::geometry::{Orientation, Rect, Size};

pub const DEFAULT_OVERLAP: f64 = 0.2;
pub const MIN_OVERLAP: f64 = 0.1;
pub const MAX_OVERLAP: f64 = 0.5;
const OVERLAP_STEP: f64 = 0.1;

/// Enhancement the caller asked for; selects which model gets loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingType {
    Upscaling,
    LightEnhancing,
}

impl ProcessingType {
    pub const ALL: [ProcessingType; 2] = [Self::Upscaling, Self::LightEnhancing];

    pub fn title(&self) -> &'static str {
        match self {
            Self::Upscaling => "Super resolution",
            Self::LightEnhancing => "Light enhancement",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Upscaling => "Increases resolution with a super-resolution model",
            Self::LightEnhancing => "Brightens under-exposed photos without changing their size",
        }
    }

    pub fn default_model_file(&self) -> &'static str {
        match self {
            Self::Upscaling => "upscaler.onnx",
            Self::LightEnhancing => "light_enhancer.onnx",
        }
    }
}

impl std::fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upscaling => write!(f, "upscaling"),
            Self::LightEnhancing => write!(f, "light-enhancing"),
        }
    }
}

impl std::str::FromStr for ProcessingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upscaling" | "upscale" | "super-resolution" => Ok(Self::Upscaling),
            "light-enhancing" | "light" | "low-light" => Ok(Self::LightEnhancing),
            other => Err(format!("unknown processing type: {other}")),
        }
    }
}

/// Tile edge lengths offered to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum TileSize {
    S512,
    S768,
    #[default]
    S1024,
    S2048,
}

impl TileSize {
    pub const ALL: [TileSize; 4] = [Self::S512, Self::S768, Self::S1024, Self::S2048];

    pub fn pixels(self) -> u32 {
        match self {
            Self::S512 => 512,
            Self::S768 => 768,
            Self::S1024 => 1024,
            Self::S2048 => 2048,
        }
    }
}

impl TryFrom<u32> for TileSize {
    type Error = ProcessError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|size| size.pixels() == value)
            .ok_or_else(|| {
                ProcessError::invalid_configuration(format!(
                    "tile size {value} is not one of 512, 768, 1024, 2048"
                ))
            })
    }
}

impl From<TileSize> for u32 {
    fn from(value: TileSize) -> Self {
        value.pixels()
    }
}

/// Per-run tiling parameters. Immutable once a run starts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TilingConfigRepr")]
pub struct TilingConfig {
    tile_size: TileSize,
    overlap: f64,
}

impl TilingConfig {
    pub fn new(tile_size: TileSize, overlap: f64) -> Result<Self, ProcessError> {
        validate_overlap(overlap)?;
        Ok(Self { tile_size, overlap })
    }

    pub fn tile_size(&self) -> TileSize {
        self.tile_size
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }
}

#[derive(Deserialize)]
struct TilingConfigRepr {
    tile_size: TileSize,
    overlap: f64,
}

impl TryFrom<TilingConfigRepr> for TilingConfig {
    type Error = ProcessError;

    fn try_from(repr: TilingConfigRepr) -> Result<Self, Self::Error> {
        Self::new(repr.tile_size, repr.overlap)
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: TileSize::default(),
            overlap: DEFAULT_OVERLAP,
        }
    }
}

pub fn validate_overlap(overlap: f64) -> Result<(), ProcessError> {
    if !overlap.is_finite() || !(MIN_OVERLAP - 1e-9..=MAX_OVERLAP + 1e-9).contains(&overlap) {
        return Err(ProcessError::invalid_configuration(format!(
            "overlap {overlap} is outside {MIN_OVERLAP}..={MAX_OVERLAP}"
        )));
    }

    let steps = overlap / OVERLAP_STEP;
    if (steps - steps.round()).abs() > 1e-6 {
        return Err(ProcessError::invalid_configuration(format!(
            "overlap {overlap} is not a multiple of {OVERLAP_STEP}"
        )));
    }

    Ok(())
}

/// Decoded pixels plus the rotation that must be applied before tiling.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: RgbImage,
    pub orientation: Orientation,
}

impl SourceImage {
    pub fn new(pixels: RgbImage) -> Self {
        Self::with_orientation(pixels, Orientation::Upright)
    }

    pub fn with_orientation(pixels: RgbImage, orientation: Orientation) -> Self {
        Self {
            pixels,
            orientation,
        }
    }

    /// Size after the orientation is applied.
    pub fn upright_size(&self) -> Size {
        self.orientation.upright_size(Size::of(&self.pixels))
    }

    pub fn into_upright(self) -> RgbImage {
        self.orientation.normalize(self.pixels)
    }
}

impl From<RgbImage> for SourceImage {
    fn from(pixels: RgbImage) -> Self {
        Self::new(pixels)
    }
}

/// One square crop of the source image.
#[derive(Debug, Clone)]
pub struct Tile {
    /// Position in row-major order.
    pub index: usize,
    pub image: RgbImage,
    pub source_rect: Rect,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessingProgress {
    pub message: Option<String>,
    pub completion_ratio: Option<f64>,
}

impl ProcessingProgress {
    pub fn new(message: impl Into<String>, completion_ratio: f64) -> Self {
        Self {
            message: Some(message.into()),
            completion_ratio: Some(completion_ratio.clamp(0.0, 1.0)),
        }
    }
}

/// Non-terminal notification emitted while a run is in flight.
#[derive(Debug, Clone)]
pub enum ProcessingUpdate {
    Progress(ProcessingProgress),
    /// Snapshot of the partially (or fully) composited output.
    Image(Arc<RgbImage>),
}

/// Item of a run's event stream. Exactly one terminal item ends the stream.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Update(ProcessingUpdate),
    Finished(Arc<RgbImage>),
    Cancelled,
    Failed(ProcessError),
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Update(_))
    }
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Finished(Arc<RgbImage>),
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Processing,
    Finished,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_size_accepts_only_enumerated_values() {
        assert_eq!(TileSize::try_from(768).expect("768 is valid"), TileSize::S768);
        assert!(TileSize::try_from(500).is_err());
        assert_eq!(u32::from(TileSize::S2048), 2048);
    }

    #[test]
    fn tiling_config_defaults() {
        let config = TilingConfig::default();
        assert_eq!(config.tile_size(), TileSize::S1024);
        assert!((config.overlap() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn overlap_validation() {
        for overlap in [0.1, 0.2, 0.3, 0.4, 0.5] {
            assert!(TilingConfig::new(TileSize::S512, overlap).is_ok(), "{overlap}");
        }
        assert!(TilingConfig::new(TileSize::S512, 0.05).is_err());
        assert!(TilingConfig::new(TileSize::S512, 0.6).is_err());
        assert!(TilingConfig::new(TileSize::S512, 0.25).is_err());
        assert!(TilingConfig::new(TileSize::S512, f64::NAN).is_err());
    }

    #[test]
    fn tiling_config_serde_uses_plain_tile_size() {
        let config = TilingConfig::new(TileSize::S768, 0.3).expect("valid config");
        let json = serde_json::to_string(&config).expect("config should serialize");
        assert_eq!(json, r#"{"tile_size":768,"overlap":0.3}"#);

        let rejected = serde_json::from_str::<TilingConfig>(r#"{"tile_size":700,"overlap":0.3}"#);
        assert!(rejected.is_err());
        let rejected = serde_json::from_str::<TilingConfig>(r#"{"tile_size":512,"overlap":0.9}"#);
        assert!(rejected.is_err());
    }

    #[test]
    fn processing_type_parses_cli_spellings() {
        assert_eq!(
            "upscaling".parse::<ProcessingType>(),
            Ok(ProcessingType::Upscaling)
        );
        assert_eq!(
            "Light-Enhancing".parse::<ProcessingType>(),
            Ok(ProcessingType::LightEnhancing)
        );
        assert!("denoise".parse::<ProcessingType>().is_err());
        assert_eq!(ProcessingType::LightEnhancing.to_string(), "light-enhancing");
    }

    #[test]
    fn progress_ratio_is_clamped() {
        let progress = ProcessingProgress::new("x", 1.5);
        assert_eq!(progress.completion_ratio, Some(1.0));
    }

    #[test]
    fn run_state_serializes_snake_case() {
        let json = serde_json::to_string(&RunState::Cancelled).expect("state should serialize");
        assert_eq!(json, "\"cancelled\"");
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Processing.is_terminal());
    }
}
