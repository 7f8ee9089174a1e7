//! Processing orchestrator: drives one run from model load to the final
//! composited image and reports progress through a bounded event channel.
//!
//! A [`Processor`] owns the cached model and a single current-run slot.
//! Starting a run cancels whatever run held the slot before; a superseded
//! run still finishes its own event stream but never touches the slot again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compositor::{Canvas, SeamPolicy};
use crate::error::ProcessError;
use crate::geometry::{Rect, Size};
use crate::image_io;
use crate::inference::{InferenceAdapter, InferredTile, ModelLoader, Padding, ScaleDiscovery, SharedEngine};
use crate::tiling::{self, DEFAULT_MAX_TILES};
use crate::types::{
    ProcessingProgress, ProcessingUpdate, RunEvent, RunOutcome, RunState, SourceImage, Tile,
    TilingConfig,
};

pub const DEFAULT_EVENT_BUFFER: usize = 16;

const LOADING_MESSAGE: &str = "Loading model";
const COMPLETED_MESSAGE: &str = "Completed";

/// How tiles are dispatched to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    /// Up to `max_concurrency` tiles in flight; results are still
    /// composited in tile order.
    Parallel { max_concurrency: usize },
}

impl ExecutionMode {
    /// `0` and `1` mean sequential.
    pub fn from_parallelism(parallelism: usize) -> Self {
        if parallelism <= 1 {
            Self::Sequential
        } else {
            Self::Parallel {
                max_concurrency: parallelism,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    pub execution: ExecutionMode,
    /// Pause between tiles in sequential mode.
    pub tile_delay: Option<Duration>,
    pub max_tiles: Option<usize>,
    pub seam: SeamPolicy,
    pub padding: Padding,
    pub event_buffer: usize,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            execution: ExecutionMode::default(),
            tile_delay: None,
            max_tiles: Some(DEFAULT_MAX_TILES),
            seam: SeamPolicy::default(),
            padding: Padding::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

struct RunSlot {
    generation: u64,
    token: CancellationToken,
    state: RunState,
}

impl Default for RunSlot {
    fn default() -> Self {
        Self {
            generation: 0,
            token: CancellationToken::new(),
            state: RunState::Idle,
        }
    }
}

enum RunInput {
    Decoded(SourceImage),
    Encoded(Vec<u8>),
}

/// Long-lived entry point. Cheap to clone; clones share the cached model
/// and the current-run slot.
#[derive(Clone)]
pub struct Processor {
    adapter: Arc<InferenceAdapter>,
    options: ProcessorOptions,
    current: Arc<Mutex<RunSlot>>,
}

impl Processor {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self::with_options(loader, ProcessorOptions::default())
    }

    pub fn with_options(loader: Arc<dyn ModelLoader>, options: ProcessorOptions) -> Self {
        let adapter = InferenceAdapter::with_padding(loader, options.padding);
        Self {
            adapter: Arc::new(adapter),
            options,
            current: Arc::new(Mutex::new(RunSlot::default())),
        }
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Starts a run over already decoded pixels. Must be called from within
    /// a tokio runtime.
    pub fn process(&self, source: impl Into<SourceImage>, config: TilingConfig) -> RunHandle {
        self.start(RunInput::Decoded(source.into()), config)
    }

    /// Starts a run over encoded bytes; decoding happens inside the run and
    /// a failure ends it with `InvalidImageData`.
    pub fn process_encoded(&self, bytes: Vec<u8>, config: TilingConfig) -> RunHandle {
        self.start(RunInput::Encoded(bytes), config)
    }

    /// Cancels the active run. No-op when nothing is running.
    pub fn cancel(&self) {
        let slot = lock_slot(&self.current);
        if slot.state == RunState::Processing {
            slot.token.cancel();
        }
    }

    /// Returns a finished, failed or cancelled processor to `Idle`.
    pub fn reset(&self) -> bool {
        let mut slot = lock_slot(&self.current);
        if slot.state.is_terminal() {
            slot.state = RunState::Idle;
            true
        } else {
            false
        }
    }

    pub fn state(&self) -> RunState {
        lock_slot(&self.current).state
    }

    pub fn is_model_loaded(&self) -> bool {
        self.adapter.is_loaded()
    }

    pub fn discard_model(&self) {
        self.adapter.discard();
    }

    fn start(&self, input: RunInput, config: TilingConfig) -> RunHandle {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        let generation = {
            let mut slot = lock_slot(&self.current);
            if slot.state == RunState::Processing {
                debug!(run_id = %id, "Cancelling previous run");
            }
            slot.token.cancel();
            slot.generation = slot.generation.wrapping_add(1);
            slot.token = token.clone();
            slot.state = RunState::Processing;
            slot.generation
        };

        let (events_tx, events_rx) = mpsc::channel(self.options.event_buffer.max(1));
        let run = Run {
            id,
            token: token.clone(),
            events: events_tx,
            adapter: Arc::clone(&self.adapter),
            options: self.options.clone(),
            config,
        };
        let current = Arc::clone(&self.current);

        let join = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = run.execute(input).await;

            let state = match &outcome {
                Ok(RunOutcome::Finished(_)) => RunState::Finished,
                Ok(RunOutcome::Cancelled) => RunState::Cancelled,
                Err(_) => RunState::Failed,
            };
            {
                let mut slot = lock_slot(&current);
                if slot.generation == generation {
                    slot.state = state;
                }
            }

            let elapsed_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0);
            let terminal = match &outcome {
                Ok(RunOutcome::Finished(image)) => {
                    info!(run_id = %run.id, elapsed_ms, "Run finished");
                    RunEvent::Finished(Arc::clone(image))
                }
                Ok(RunOutcome::Cancelled) => {
                    info!(run_id = %run.id, elapsed_ms, "Run cancelled");
                    RunEvent::Cancelled
                }
                Err(error) => {
                    warn!(run_id = %run.id, elapsed_ms, error = %error, "Run failed");
                    RunEvent::Failed(error.clone())
                }
            };
            let _ = run.events.send(terminal).await;

            outcome
        });

        RunHandle {
            id,
            events: events_rx,
            token,
            join,
        }
    }
}

/// Caller's side of one run.
pub struct RunHandle {
    id: Uuid,
    events: mpsc::Receiver<RunEvent>,
    token: CancellationToken,
    join: JoinHandle<Result<RunOutcome, ProcessError>>,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for the run to end. Undelivered events are dropped.
    pub async fn wait(self) -> Result<RunOutcome, ProcessError> {
        drop(self.events);
        match self.join.await {
            Ok(outcome) => outcome,
            Err(error) if error.is_cancelled() => Ok(RunOutcome::Cancelled),
            Err(error) => Err(ProcessError::internal(format!("run task failed: {error}"))),
        }
    }
}

struct Run {
    id: Uuid,
    token: CancellationToken,
    events: mpsc::Sender<RunEvent>,
    adapter: Arc<InferenceAdapter>,
    options: ProcessorOptions,
    config: TilingConfig,
}

impl Run {
    /// Updates are dropped once the run is cancelled, so a reader that
    /// stopped polling cannot hold a cancelled run open.
    async fn emit(&self, update: ProcessingUpdate) {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {}
            // A dropped receiver only means nobody is listening any more.
            _ = self.events.send(RunEvent::Update(update)) => {}
        }
    }

    async fn emit_progress(&self, message: impl Into<String>, ratio: f64) {
        self.emit(ProcessingUpdate::Progress(ProcessingProgress::new(message, ratio)))
            .await;
    }

    async fn execute(&self, input: RunInput) -> Result<RunOutcome, ProcessError> {
        self.emit_progress(LOADING_MESSAGE, 0.0).await;

        let adapter = Arc::clone(&self.adapter);
        let engine = tokio::task::spawn_blocking(move || adapter.get_or_load())
            .await
            .map_err(|e| ProcessError::model_load(&anyhow!("model loading task failed: {e}")))??;

        if self.token.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        let image = tokio::task::spawn_blocking(move || prepare_source(input))
            .await
            .map_err(|e| ProcessError::internal(format!("image preparation task failed: {e}")))??;

        let tile_size = self.config.tile_size().pixels();
        let plan = tiling::plan_tiles(Size::of(&image), tile_size, self.config.overlap())?;
        plan.ensure_within(self.options.max_tiles)?;
        let tiles = tiling::crop_tiles(&image, &plan);

        info!(
            run_id = %self.id,
            image = %plan.image_size,
            tile_size = plan.tile_size,
            overlap_size = plan.overlap_size,
            tiles = tiles.len(),
            execution = ?self.options.execution,
            "Processing image"
        );

        let canvas = match self.options.execution {
            ExecutionMode::Sequential => self.run_sequential(&image, tiles, engine).await?,
            ExecutionMode::Parallel { max_concurrency } => {
                self.run_parallel(&image, tiles, engine, max_concurrency.max(1))
                    .await?
            }
        };

        let Some(canvas) = canvas else {
            return Ok(RunOutcome::Cancelled);
        };

        self.emit_progress(COMPLETED_MESSAGE, 1.0).await;
        Ok(RunOutcome::Finished(Arc::new(canvas.into_image())))
    }

    /// Returns `None` when the run was cancelled between tiles.
    async fn run_sequential(
        &self,
        image: &RgbImage,
        tiles: Vec<Tile>,
        engine: SharedEngine,
    ) -> Result<Option<Canvas>, ProcessError> {
        let total = tiles.len();
        let mut composer = Composer::new(self.options.seam);
        let mut total_infer_ms = 0.0_f64;

        for tile in tiles {
            if self.token.is_cancelled() {
                debug!(run_id = %self.id, next_tile = tile.index, "Stopping at tile boundary");
                return Ok(None);
            }

            let index = tile.index;
            self.emit_progress(
                format!("[{}/{}] Processing", index + 1, total),
                index as f64 / total as f64,
            )
            .await;

            let source_rect = tile.source_rect;
            let started = Instant::now();
            let inferred = infer_tile(&self.adapter, &engine, tile).await?;
            total_infer_ms += started.elapsed().as_secs_f64() * 1000.0;

            composer.place(image, index, source_rect, &inferred)?;
            self.emit(ProcessingUpdate::Image(composer.snapshot()?)).await;

            if let Some(delay) = self.options.tile_delay.filter(|_| index + 1 < total) {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        if total > 0 {
            info!(
                run_id = %self.id,
                tiles = total,
                avg_infer_ms = format!("{:.1}", total_infer_ms / total as f64),
                total_infer_ms = format!("{:.0}", total_infer_ms),
                "Tile stage summary"
            );
        }

        composer.finish().map(Some)
    }

    async fn run_parallel(
        &self,
        image: &RgbImage,
        tiles: Vec<Tile>,
        engine: SharedEngine,
        max_concurrency: usize,
    ) -> Result<Option<Canvas>, ProcessError> {
        let total = tiles.len();
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let dispatch = self.token.child_token();
        let mut workers = JoinSet::new();

        for tile in tiles {
            let semaphore = Arc::clone(&semaphore);
            let dispatch = dispatch.clone();
            let adapter = Arc::clone(&self.adapter);
            let engine = Arc::clone(&engine);
            workers.spawn(async move {
                let index = tile.index;
                let source_rect = tile.source_rect;
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, source_rect, None);
                };
                if dispatch.is_cancelled() {
                    return (index, source_rect, None);
                }
                let result = infer_tile(&adapter, &engine, tile).await;
                (index, source_rect, Some(result))
            });
        }

        let started = Instant::now();
        let mut composer = Composer::new(self.options.seam);
        let mut pending: BTreeMap<usize, (Rect, InferredTile)> = BTreeMap::new();
        let mut next_index = 0usize;
        let mut completed = 0usize;

        loop {
            let joined = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    workers.abort_all();
                    return Ok(None);
                }
                joined = workers.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let (index, source_rect, result) = joined
                .map_err(|e| ProcessError::internal(format!("tile worker failed: {e}")))?;
            let inferred = match result {
                Some(Ok(inferred)) => inferred,
                Some(Err(error)) => {
                    dispatch.cancel();
                    workers.abort_all();
                    return Err(error);
                }
                None if self.token.is_cancelled() => return Ok(None),
                None => continue,
            };

            completed += 1;
            self.emit_progress(
                format!("[{completed}/{total}] Processing"),
                completed as f64 / total as f64,
            )
            .await;

            pending.insert(index, (source_rect, inferred));
            let mut placed_any = false;
            while let Some((source_rect, inferred)) = pending.remove(&next_index) {
                composer.place(image, next_index, source_rect, &inferred)?;
                next_index += 1;
                placed_any = true;
            }
            if placed_any {
                self.emit(ProcessingUpdate::Image(composer.snapshot()?)).await;
            }
        }

        if self.token.is_cancelled() {
            return Ok(None);
        }

        info!(
            run_id = %self.id,
            tiles = total,
            max_concurrency,
            elapsed_ms = format!("{:.0}", started.elapsed().as_secs_f64() * 1000.0),
            "Parallel tile stage summary"
        );

        composer.finish().map(Some)
    }
}

/// Builds the output canvas from the first tile and places tiles in order.
struct Composer {
    seam: SeamPolicy,
    scale: ScaleDiscovery,
    canvas: Option<Canvas>,
}

impl Composer {
    fn new(seam: SeamPolicy) -> Self {
        Self {
            seam,
            scale: ScaleDiscovery::default(),
            canvas: None,
        }
    }

    fn place(
        &mut self,
        source: &RgbImage,
        index: usize,
        source_rect: Rect,
        inferred: &InferredTile,
    ) -> Result<(), ProcessError> {
        let scale = self
            .scale
            .observe(inferred)
            .map_err(|error| ProcessError::inference(index, &error))?;

        if self.canvas.is_none() {
            self.canvas = Some(Canvas::new(source, scale, self.seam)?);
        }
        let Some(canvas) = self.canvas.as_mut() else {
            return Err(ProcessError::internal("output canvas missing"));
        };

        if canvas.place_tile(&inferred.image, source_rect).is_none() {
            warn!(tile = index, ?source_rect, "Tile landed outside the output canvas");
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<RgbImage>, ProcessError> {
        self.canvas
            .as_ref()
            .map(Canvas::snapshot)
            .ok_or_else(|| ProcessError::internal("no canvas before the first tile"))
    }

    fn finish(self) -> Result<Canvas, ProcessError> {
        self.canvas
            .ok_or_else(|| ProcessError::tiling("image produced no tiles"))
    }
}

async fn infer_tile(
    adapter: &Arc<InferenceAdapter>,
    engine: &SharedEngine,
    tile: Tile,
) -> Result<InferredTile, ProcessError> {
    let index = tile.index;
    let adapter = Arc::clone(adapter);
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || adapter.infer(&engine, &tile.image))
        .await
        .map_err(|e| ProcessError::inference(index, &anyhow!("inference task failed: {e}")))?
        .map_err(|error| ProcessError::inference(index, &error))
}

fn prepare_source(input: RunInput) -> Result<RgbImage, ProcessError> {
    let source = match input {
        RunInput::Decoded(source) => source,
        RunInput::Encoded(bytes) => image_io::decode(&bytes)?,
    };

    let size = source.upright_size();
    if size.is_empty() {
        return Err(ProcessError::invalid_image(format!("image {size} has zero area")));
    }
    Ok(source.into_upright())
}

fn lock_slot(slot: &Mutex<RunSlot>) -> MutexGuard<'_, RunSlot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
