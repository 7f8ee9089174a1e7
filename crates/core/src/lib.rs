//! Core crate for tiled image enhancement.

pub mod backend;
pub mod compositor;
pub mod config;
pub mod error;
pub mod geometry;
pub mod image_io;
pub mod inference;
pub mod logging;
pub mod onnx;
pub mod orchestrator;
pub mod runtime;
pub mod tiling;
pub mod types;

pub use error::ProcessError;
pub use orchestrator::{ExecutionMode, Processor, ProcessorOptions, RunHandle};
pub use types::{ProcessingType, RunEvent, RunOutcome, RunState, TileSize, TilingConfig};
