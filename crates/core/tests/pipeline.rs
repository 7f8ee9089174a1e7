use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use image::{imageops, Rgb, RgbImage};
use uppscale_core::compositor::SeamPolicy;
use uppscale_core::inference::{InferenceEngine, ModelLoader};
use uppscale_core::types::ProcessingUpdate;
use uppscale_core::{
    ExecutionMode, ProcessError, Processor, ProcessorOptions, RunEvent, RunOutcome, RunState,
    TileSize, TilingConfig,
};

struct Identity;

impl InferenceEngine for Identity {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage> {
        Ok(input.clone())
    }
}

struct Nearest4;

impl InferenceEngine for Nearest4 {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage> {
        Ok(imageops::resize(
            input,
            input.width() * 4,
            input.height() * 4,
            imageops::FilterType::Nearest,
        ))
    }
}

/// Identity engine that counts calls and fails on call number `fail_at`.
struct Counting {
    calls: Arc<AtomicUsize>,
    fail_at: Option<usize>,
}

impl InferenceEngine for Counting {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_at == Some(call) {
            bail!("synthetic failure on call {call}");
        }
        Ok(input.clone())
    }
}

/// Identity engine that counts calls and takes `delay` per tile.
struct Slow {
    calls: Arc<AtomicUsize>,
    delay: Duration,
}

impl InferenceEngine for Slow {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(input.clone())
    }
}

/// Tracks how many `run` calls overlap.
struct Overlapping {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InferenceEngine for Overlapping {
    fn run(&mut self, input: &RgbImage) -> Result<RgbImage> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(input.clone())
    }
}

fn loader<E, F>(make: F) -> Arc<dyn ModelLoader>
where
    E: InferenceEngine + 'static,
    F: Fn() -> E + Send + Sync + 'static,
{
    Arc::new(move || -> Result<Box<dyn InferenceEngine>> { Ok(Box::new(make())) })
}

fn gradient(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x * 7 + y * 3) % 256) as u8])
    })
}

fn config(tile_size: TileSize, overlap: f64) -> TilingConfig {
    TilingConfig::new(tile_size, overlap).expect("valid tiling config")
}

/// Drains a run's events into progress ratios, snapshot count and the terminal event.
async fn drain(handle: &mut uppscale_core::RunHandle) -> (Vec<f64>, usize, RunEvent) {
    let mut ratios = Vec::new();
    let mut snapshots = 0;
    while let Some(event) = handle.next_event().await {
        match event {
            RunEvent::Update(ProcessingUpdate::Progress(progress)) => {
                ratios.extend(progress.completion_ratio);
            }
            RunEvent::Update(ProcessingUpdate::Image(_)) => snapshots += 1,
            terminal => {
                assert!(handle.next_event().await.is_none(), "events after terminal");
                return (ratios, snapshots, terminal);
            }
        }
    }
    panic!("event stream ended without a terminal event");
}

async fn finished_image(processor: &Processor, source: RgbImage, tiling: TilingConfig) -> RgbImage {
    match processor.process(source, tiling).wait().await {
        Ok(RunOutcome::Finished(image)) => (*image).clone(),
        other => panic!("expected finished run, got {other:?}"),
    }
}

#[tokio::test]
async fn identity_model_reproduces_the_source() {
    let processor = Processor::new(loader(|| Identity));
    let source = gradient(600, 600);

    let mut handle = processor.process(source.clone(), config(TileSize::S512, 0.2));
    let (ratios, snapshots, terminal) = drain(&mut handle).await;

    let RunEvent::Finished(image) = terminal else {
        panic!("expected Finished, got {terminal:?}");
    };
    assert_eq!(*image, source);
    assert_eq!(snapshots, 4);
    assert_eq!(ratios.first(), Some(&0.0));
    assert_eq!(ratios.last(), Some(&1.0));
    assert!(ratios.windows(2).all(|pair| pair[0] <= pair[1]), "{ratios:?}");
}

#[tokio::test]
async fn upscaling_model_produces_ceil_scaled_output() {
    let processor = Processor::new(loader(|| Nearest4));
    let source = gradient(601, 333);

    let image = finished_image(&processor, source.clone(), config(TileSize::S512, 0.3)).await;

    assert_eq!(image.dimensions(), (2404, 1332));
    assert_eq!(image.get_pixel(0, 0), source.get_pixel(0, 0));
    assert_eq!(image.get_pixel(2403, 1331), source.get_pixel(600, 332));
    assert_eq!(image.get_pixel(4 * 300 + 3, 4 * 200), source.get_pixel(300, 200));
}

#[tokio::test]
async fn repeated_runs_are_deterministic() {
    let processor = Processor::new(loader(|| Nearest4));
    let source = gradient(900, 700);
    let tiling = config(TileSize::S512, 0.2);

    let first = finished_image(&processor, source.clone(), tiling).await;
    let second = finished_image(&processor, source, tiling).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn parallel_dispatch_matches_sequential_output() {
    let source = gradient(1300, 900);
    let tiling = config(TileSize::S512, 0.2);

    for seam in [SeamPolicy::Overwrite, SeamPolicy::Feather] {
        let sequential = Processor::with_options(
            loader(|| Nearest4),
            ProcessorOptions {
                seam,
                ..ProcessorOptions::default()
            },
        );
        let parallel = Processor::with_options(
            loader(|| Nearest4),
            ProcessorOptions {
                seam,
                execution: ExecutionMode::Parallel { max_concurrency: 3 },
                ..ProcessorOptions::default()
            },
        );

        let expected = finished_image(&sequential, source.clone(), tiling).await;
        let actual = finished_image(&parallel, source.clone(), tiling).await;
        assert_eq!(expected, actual, "seam policy {seam}");
    }
}

#[tokio::test]
async fn parallel_progress_is_monotonic_and_complete() {
    let processor = Processor::with_options(
        loader(|| Identity),
        ProcessorOptions {
            execution: ExecutionMode::Parallel { max_concurrency: 4 },
            ..ProcessorOptions::default()
        },
    );

    let mut handle = processor.process(gradient(1000, 700), config(TileSize::S512, 0.2));
    let (ratios, snapshots, terminal) = drain(&mut handle).await;

    assert!(matches!(terminal, RunEvent::Finished(_)));
    assert!(snapshots >= 1);
    assert_eq!(ratios.last(), Some(&1.0));
    assert!(ratios.windows(2).all(|pair| pair[0] <= pair[1]), "{ratios:?}");
}

#[tokio::test]
async fn cancelling_after_first_tile_stops_before_the_next() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::clone(&calls);
    let processor = Processor::with_options(
        loader(move || Counting {
            calls: Arc::clone(&engine_calls),
            fail_at: None,
        }),
        ProcessorOptions {
            tile_delay: Some(Duration::from_secs(10)),
            ..ProcessorOptions::default()
        },
    );

    let mut handle = processor.process(gradient(600, 600), config(TileSize::S512, 0.2));
    let mut saw_finished = false;
    let mut terminal = None;
    while let Some(event) = handle.next_event().await {
        match event {
            RunEvent::Update(ProcessingUpdate::Image(_)) => handle.cancel(),
            RunEvent::Update(_) => {}
            RunEvent::Finished(_) => saw_finished = true,
            other => terminal = Some(other),
        }
    }

    assert!(!saw_finished);
    assert!(matches!(terminal, Some(RunEvent::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(processor.state(), RunState::Cancelled);
}

#[tokio::test]
async fn engine_failure_ends_the_run_without_a_result() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::clone(&calls);
    let processor = Processor::new(loader(move || Counting {
        calls: Arc::clone(&engine_calls),
        fail_at: Some(1),
    }));

    let mut handle = processor.process(gradient(600, 600), config(TileSize::S512, 0.2));
    let (_, snapshots, terminal) = drain(&mut handle).await;

    match terminal {
        RunEvent::Failed(ProcessError::Inference { tile_index, detail }) => {
            assert_eq!(tile_index, 1);
            assert!(detail.contains("synthetic failure"), "{detail}");
        }
        other => panic!("expected inference failure, got {other:?}"),
    }
    assert_eq!(snapshots, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(processor.state(), RunState::Failed);
}

#[tokio::test]
async fn loader_failure_is_reported_as_model_load() {
    let failing: Arc<dyn ModelLoader> =
        Arc::new(|| -> Result<Box<dyn InferenceEngine>> { bail!("model file is corrupt") });
    let processor = Processor::new(failing);

    let outcome = processor
        .process(gradient(64, 64), TilingConfig::default())
        .wait()
        .await;

    assert!(matches!(outcome, Err(ProcessError::ModelLoad { .. })));
    assert!(!processor.is_model_loaded());
}

#[tokio::test]
async fn processor_cancel_stops_the_active_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::clone(&calls);
    let processor = Processor::with_options(
        loader(move || Counting {
            calls: Arc::clone(&engine_calls),
            fail_at: None,
        }),
        ProcessorOptions {
            tile_delay: Some(Duration::from_secs(10)),
            ..ProcessorOptions::default()
        },
    );

    let mut handle = processor.process(gradient(600, 600), config(TileSize::S512, 0.2));
    let mut saw_finished = false;
    let mut terminal = None;
    while let Some(event) = handle.next_event().await {
        match event {
            RunEvent::Update(ProcessingUpdate::Image(_)) => processor.cancel(),
            RunEvent::Update(_) => {}
            RunEvent::Finished(_) => saw_finished = true,
            other => terminal = Some(other),
        }
    }

    assert!(!saw_finished);
    assert!(matches!(terminal, Some(RunEvent::Cancelled)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(processor.state(), RunState::Cancelled);
    assert!(processor.reset());
}

#[tokio::test]
async fn parallel_run_can_be_cancelled() {
    let calls = Arc::new(AtomicUsize::new(0));
    let engine_calls = Arc::clone(&calls);
    let processor = Processor::with_options(
        loader(move || Slow {
            calls: Arc::clone(&engine_calls),
            delay: Duration::from_millis(50),
        }),
        ProcessorOptions {
            execution: ExecutionMode::Parallel { max_concurrency: 2 },
            ..ProcessorOptions::default()
        },
    );

    // 1200x1200 with 512px tiles and 0.2 overlap is a 3x3 grid.
    let mut handle = processor.process(gradient(1200, 1200), config(TileSize::S512, 0.2));
    let mut saw_finished = false;
    let mut terminal = None;
    while let Some(event) = handle.next_event().await {
        match event {
            RunEvent::Update(ProcessingUpdate::Image(_)) => processor.cancel(),
            RunEvent::Update(_) => {}
            RunEvent::Finished(_) => saw_finished = true,
            other => terminal = Some(other),
        }
    }

    assert!(!saw_finished);
    assert!(matches!(terminal, Some(RunEvent::Cancelled)));
    assert!(calls.load(Ordering::SeqCst) < 9);
    assert_eq!(processor.state(), RunState::Cancelled);
}

#[tokio::test]
async fn cancelled_run_ends_while_nobody_reads_its_events() {
    let processor = Processor::with_options(
        loader(|| Identity),
        ProcessorOptions {
            event_buffer: 1,
            ..ProcessorOptions::default()
        },
    );

    let mut handle = processor.process(gradient(600, 600), config(TileSize::S512, 0.2));
    // Let the run fill the single-slot buffer and park on the next update.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(processor.state(), RunState::Processing);
    processor.cancel();

    tokio::time::timeout(Duration::from_secs(5), async {
        while processor.state() == RunState::Processing {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cancelled run should settle without a reader");
    assert_eq!(processor.state(), RunState::Cancelled);

    let (_, _, terminal) = drain(&mut handle).await;
    assert!(matches!(terminal, RunEvent::Cancelled));
}

#[tokio::test]
async fn starting_a_new_run_cancels_the_previous_one() {
    let processor = Processor::with_options(
        loader(|| Identity),
        ProcessorOptions {
            tile_delay: Some(Duration::from_secs(10)),
            ..ProcessorOptions::default()
        },
    );

    let mut first = processor.process(gradient(600, 600), config(TileSize::S512, 0.2));
    loop {
        match first.next_event().await {
            Some(RunEvent::Update(ProcessingUpdate::Image(_))) => break,
            Some(RunEvent::Update(_)) => {}
            other => panic!("first run ended early: {other:?}"),
        }
    }

    let small = gradient(100, 80);
    let mut second = processor.process(small.clone(), TilingConfig::default());
    let (_, _, second_terminal) = drain(&mut second).await;
    let (_, _, first_terminal) = drain(&mut first).await;

    assert!(matches!(first_terminal, RunEvent::Cancelled));
    match second_terminal {
        RunEvent::Finished(image) => assert_eq!(*image, small),
        other => panic!("expected second run to finish, got {other:?}"),
    }
    assert_eq!(processor.state(), RunState::Finished);
}

#[tokio::test]
async fn model_is_cached_until_discarded() {
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&loads);
    let processor = Processor::new(loader(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Identity
    }));
    let source = gradient(64, 64);

    finished_image(&processor, source.clone(), TilingConfig::default()).await;
    finished_image(&processor, source.clone(), TilingConfig::default()).await;
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(processor.is_model_loaded());

    processor.discard_model();
    assert!(!processor.is_model_loaded());

    finished_image(&processor, source, TilingConfig::default()).await;
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_tiles_never_run_the_engine_concurrently() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (engine_active, engine_peak) = (Arc::clone(&active), Arc::clone(&peak));
    let processor = Processor::with_options(
        loader(move || Overlapping {
            active: Arc::clone(&engine_active),
            peak: Arc::clone(&engine_peak),
        }),
        ProcessorOptions {
            execution: ExecutionMode::Parallel { max_concurrency: 4 },
            ..ProcessorOptions::default()
        },
    );

    finished_image(&processor, gradient(1200, 1200), config(TileSize::S512, 0.2)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(active.load(Ordering::SeqCst), 0);
}
