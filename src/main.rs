// Command line runner: replays a directory of frames through the engine.
// Saved events land in the configured events directory and are announced in
// the log. Exposure control, when enabled, runs against a replay camera that
// only records the commands it receives.

use anyhow::{Context, Result};
use clap::Parser;
use meteor_vision::config::StationConfig;
use meteor_vision::core_modules::exposure_control::ExposureController;
use meteor_vision::core_modules::frame::frame::CameraSettings;
use meteor_vision::error::{CameraError, ExposureError};
use meteor_vision::frame_source::DirectoryFrameSource;
use meteor_vision::interfaces::{ExposureCamera, FrameSource, LogNotifier};
use meteor_vision::parallel_pipeline::AsyncDetectionPipeline;
use meteor_vision::pipeline::{DetectionPipeline, PipelineConfig};
use meteor_vision::storage::{DirectoryExposureRecorder, DirectoryStorage};
use std::path::PathBuf;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meteor_vision", about = "Replay recorded all-sky frames through the meteor detector")]
struct Args {
    /// Directory of PNG frames, replayed in name order.
    frames: PathBuf,

    /// JSON station configuration. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the directory saved events are written to.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enables debug dumps into this directory.
    #[arg(long)]
    debug: Option<PathBuf>,
}

/// Camera stand-in for replays: accepts every command and remembers the last one.
struct ReplayCamera {
    min_exposure_us: u32,
    fps: f64,
    exposure_us: Option<u32>,
}

impl ExposureCamera for ReplayCamera {
    fn min_exposure_us(&self) -> u32 {
        self.min_exposure_us
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn set_exposure_time(&mut self, exposure_us: u32) -> Result<(), CameraError> {
        self.exposure_us = Some(exposure_us);
        Ok(())
    }
}

fn load_config(args: &Args) -> Result<StationConfig> {
    // --- 1. File or defaults ---
    let mut config = match args.config.as_deref() {
        Some(path) => StationConfig::from_json_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => StationConfig::default(),
    };

    // --- 2. Command line overrides ---
    if let Some(output) = args.output.as_ref() {
        config.storage.events_path = output.clone();
    }
    if let Some(debug) = args.debug.as_ref() {
        config.debug.enabled = true;
        config.debug.path = debug.clone();
    }

    config.validate().context("validating configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut source = DirectoryFrameSource::open(&args.frames, config.acquisition.fps, config.acquisition.bit_depth)
        .with_context(|| format!("listing frames in {}", args.frames.display()))?;
    info!(frames = source.len(), dir = %args.frames.display(), "replay started");

    let pipeline = DetectionPipeline::new(PipelineConfig::from_station(&config))?;
    let storage = DirectoryStorage::new(config.storage.events_path.clone());
    let driver = AsyncDetectionPipeline::spawn(pipeline, Box::new(storage), Box::new(LogNotifier));

    let mut exposure = config.exposure.enabled.then(|| {
        let recorder = DirectoryExposureRecorder::new(
            config.exposure.data_path.clone(),
            config.exposure.station_name.clone(),
        );
        ExposureController::new(config.exposure_params(), info_span!("exposure")).with_recorder(Box::new(recorder))
    });
    let mut camera = ReplayCamera {
        min_exposure_us: source.exposure_bounds().0,
        fps: source.fps(),
        exposure_us: None,
    };

    while let Some(frame) = source.next_frame()? {
        match exposure.as_mut().map(|controller| controller.on_frame(&frame, &mut camera)) {
            Some(Ok(Some(cycle))) => info!(exposure_us = cycle.final_exposure_us, "exposure cycle complete"),
            Some(Err(err @ (ExposureError::InvalidFps(_) | ExposureError::InvalidStep(_)))) => {
                warn!(error = %err, "exposure control disabled");
                exposure = None;
            }
            // Camera failures abort the cycle; the controller retries next interval.
            _ => {}
        }
        if let Some(exposure_us) = camera.exposure_us {
            source.set_camera_settings(CameraSettings {
                exposure_us,
                ..CameraSettings::default()
            });
        }
        let remaining = source.frames_remaining();
        if driver.submit(frame, remaining).await.is_err() {
            break;
        }
    }

    let summary = driver.finish().await?;
    info!(
        frames = summary.stats.frames,
        events = summary.stats.events,
        rejected = summary.stats.rejected,
        stored = summary.stored,
        last_exposure_us = ?camera.exposure_us,
        "replay finished"
    );
    Ok(())
}
