//! Typed failures of a processing run.
//!
//! Every variant is terminal for the run that produced it. Nothing in the
//! core retries; callers that want a retry start a new run.

/// Error surfaced as the terminal event of a run.
///
/// Underlying `anyhow` chains are flattened into the `detail` strings with
/// `{:#}` so the error stays `Clone` and can travel through event channels.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProcessError {
    #[error("model loading failed: {detail}")]
    ModelLoad { detail: String },

    #[error("invalid image data: {detail}")]
    InvalidImageData { detail: String },

    #[error("tiling failed: {detail}")]
    Tiling { detail: String },

    #[error("inference failed on tile {tile_index}: {detail}")]
    Inference { tile_index: usize, detail: String },

    #[error("image needs {count} tiles, limit is {max}")]
    TooManyTiles { count: usize, max: usize },

    #[error("invalid configuration: {detail}")]
    InvalidConfiguration { detail: String },

    /// A worker task died without reporting a result.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl ProcessError {
    pub fn model_load(error: &anyhow::Error) -> Self {
        Self::ModelLoad {
            detail: format!("{error:#}"),
        }
    }

    pub fn inference(tile_index: usize, error: &anyhow::Error) -> Self {
        Self::Inference {
            tile_index,
            detail: format!("{error:#}"),
        }
    }

    pub fn invalid_image(detail: impl Into<String>) -> Self {
        Self::InvalidImageData {
            detail: detail.into(),
        }
    }

    pub fn tiling(detail: impl Into<String>) -> Self {
        Self::Tiling {
            detail: detail.into(),
        }
    }

    pub fn invalid_configuration(detail: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// Short, user-facing title for the failure kind.
    pub fn title(&self) -> &'static str {
        match self {
            Self::ModelLoad { .. } => "Model loading error",
            Self::InvalidImageData { .. } => "Invalid image data",
            Self::Tiling { .. } => "Tiling error",
            Self::Inference { .. } => "Processing error",
            Self::TooManyTiles { .. } => "Image too large",
            Self::InvalidConfiguration { .. } => "Invalid configuration",
            Self::Internal { .. } => "Internal error",
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::ModelLoad { .. } => "Restart the application or try again later",
            Self::InvalidImageData { .. } => "Reload the image or choose another one",
            Self::Tiling { .. } => "Reload the image",
            Self::Inference { .. } => "Try again, or restart the application",
            Self::TooManyTiles { .. } => "Choose a larger tile size or a smaller image",
            Self::InvalidConfiguration { .. } => {
                "Use a tile size of 512, 768, 1024 or 2048 and an overlap between 0.1 and 0.5"
            }
            Self::Internal { .. } => "Restart the application",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_error_keeps_context_chain() {
        let error = anyhow::anyhow!("session run failed").context("tile 3 inference");
        let wrapped = ProcessError::inference(3, &error);

        assert_eq!(
            wrapped.to_string(),
            "inference failed on tile 3: tile 3 inference: session run failed"
        );
    }

    #[test]
    fn too_many_tiles_message_names_both_counts() {
        let error = ProcessError::TooManyTiles { count: 500, max: 400 };
        assert_eq!(error.to_string(), "image needs 500 tiles, limit is 400");
        assert_eq!(error.title(), "Image too large");
    }

    #[test]
    fn every_variant_has_a_recovery_suggestion() {
        let errors = [
            ProcessError::ModelLoad { detail: String::new() },
            ProcessError::invalid_image("x"),
            ProcessError::tiling("x"),
            ProcessError::Inference { tile_index: 0, detail: String::new() },
            ProcessError::TooManyTiles { count: 2, max: 1 },
            ProcessError::invalid_configuration("x"),
            ProcessError::internal("x"),
        ];

        for error in errors {
            assert!(!error.recovery_suggestion().is_empty());
        }
    }
}
