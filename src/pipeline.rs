// THEORY:
// The `pipeline` module is the top-level API of the detection engine. It chains the
// stages of the detector into one frame-synchronous call:
//
//   mask -> difference -> region scan / local events -> global events -> report
//
// `DetectionPipeline::process_frame` fully processes one frame before returning,
// so no state is ever shared with a tick in progress. All mutable per-run state
// (colour palette, region grid, active global events, noise history) lives in a
// `DetectionSession` owned by the pipeline; two pipelines never share anything.

use crate::config::StationConfig;
use crate::core_modules::debug_dump::{DebugDumper, StageImages};
use crate::core_modules::event_tracker::{EventTracker, TrackerParams};
use crate::core_modules::frame::frame::{Frame, PixelBuffer};
use crate::core_modules::frame_differencer::{DifferenceStats, FrameDifferencer};
use crate::core_modules::local_event::Palette;
use crate::core_modules::local_event_extractor::{ExtractionParams, local_event_extractor};
use crate::core_modules::mask::{MaskManager, MaskSettings};
use crate::core_modules::region_grid::RegionGrid;
use crate::error::DetectionError;
use crate::interfaces::{FrameSource, Notifier, Storage};
use image::GrayImage;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{Span, debug, info_span, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::global_event::{DetectedEvent, DiscardReason};

/// Configuration of a `DetectionPipeline`.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub downsample: bool,
    pub subdivisions: u32,
    pub mask: MaskSettings,
    pub extraction: ExtractionParams,
    pub tracker: TrackerParams,
    /// Attach per-frame difference noise to saved events.
    pub save_stdev: bool,
    /// Directory for debug dumps; `None` disables them.
    pub debug_path: Option<PathBuf>,
    pub debug_video: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            downsample: false,
            subdivisions: 10,
            mask: MaskSettings::default(),
            extraction: ExtractionParams::default(),
            tracker: TrackerParams::default(),
            save_stdev: false,
            debug_path: None,
            debug_video: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_station(config: &StationConfig) -> Self {
        Self {
            downsample: config.detection.downsample,
            subdivisions: config.detection.subdivisions,
            mask: config.mask_settings(),
            extraction: config.extraction_params(),
            tracker: config.tracker_params(),
            save_stdev: config.detection.save_stdev,
            debug_path: config.debug.enabled.then(|| config.debug.path.clone()),
            debug_video: config.debug.video,
        }
    }
}

/// The primary output of the pipeline for a single frame.
#[derive(Debug, Clone)]
pub enum Report {
    NoDetection,
    EventReady(DetectedEvent),
}

/// Diagnostics of the last processed frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameSummary {
    pub frame_index: u64,
    pub difference: Option<DifferenceStats>,
    pub local_events: usize,
    pub active_global_events: usize,
    pub discarded: Vec<(u64, DiscardReason)>,
}

/// Mutable state of one detection run.
pub struct DetectionSession {
    palette: Palette,
    grid: RegionGrid,
    tracker: EventTracker,
    dimensions: Option<(u32, u32)>,
    /// Recent (frame index, difference std-dev) pairs.
    noise: VecDeque<(u64, f64)>,
    noise_capacity: usize,
}

impl DetectionSession {
    pub fn new(config: &PipelineConfig, span: Span) -> Result<Self, DetectionError> {
        let tracker = config.tracker;
        Ok(Self {
            palette: Palette::new(),
            grid: RegionGrid::new(config.subdivisions)?,
            tracker: EventTracker::new(tracker, span),
            dimensions: None,
            noise: VecDeque::new(),
            noise_capacity: (tracker.max_age + tracker.grace_frames + 2) as usize,
        })
    }

    pub fn tracker(&self) -> &EventTracker {
        &self.tracker
    }

    pub fn reset(&mut self) {
        self.palette.release_all();
        self.tracker.reset();
        self.dimensions = None;
        self.noise.clear();
    }

    fn record_noise(&mut self, frame_index: u64, std_dev: f64) {
        self.noise.push_back((frame_index, std_dev));
        while self.noise.len() > self.noise_capacity {
            self.noise.pop_front();
        }
    }

    fn noise_between(&self, first: u64, last: u64) -> Vec<(u64, f64)> {
        self.noise
            .iter()
            .copied()
            .filter(|(frame, _)| (first..=last).contains(frame))
            .collect()
    }
}

/// The main, top-level struct of the detection engine.
pub struct DetectionPipeline {
    config: PipelineConfig,
    mask: MaskManager,
    differencer: FrameDifferencer,
    session: DetectionSession,
    dumper: Option<DebugDumper>,
    last_summary: FrameSummary,
    span: Span,
}

impl DetectionPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self, DetectionError> {
        let span = info_span!("detection");
        let mask = MaskManager::new(config.mask.clone(), info_span!(parent: &span, "mask"));
        Self::assemble(config, mask, span)
    }

    /// Builds a pipeline with an in-memory static mask.
    pub fn with_static_mask(config: PipelineConfig, static_mask: GrayImage) -> Result<Self, DetectionError> {
        let span = info_span!("detection");
        let mask = MaskManager::with_static_mask(config.mask.clone(), static_mask, info_span!(parent: &span, "mask"));
        Self::assemble(config, mask, span)
    }

    fn assemble(config: PipelineConfig, mask: MaskManager, span: Span) -> Result<Self, DetectionError> {
        let session = DetectionSession::new(&config, info_span!(parent: &span, "tracker"))?;
        let dumper = config
            .debug_path
            .clone()
            .map(|path| DebugDumper::new(path, config.debug_video, info_span!(parent: &span, "debug")));
        Ok(Self {
            config,
            mask,
            differencer: FrameDifferencer::new(),
            session,
            dumper,
            last_summary: FrameSummary::default(),
            span,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn session(&self) -> &DetectionSession {
        &self.session
    }

    pub fn last_summary(&self) -> &FrameSummary {
        &self.last_summary
    }

    /// Forgets every frame seen so far; masks are rebuilt on the next frame.
    pub fn reset(&mut self) {
        self.mask.reset();
        self.differencer.reset();
        self.session.reset();
        self.last_summary = FrameSummary::default();
    }

    /// Processes one frame.
    ///
    /// `frames_remaining` is the number of frames left in a finite acquisition
    /// (0 when unknown); close to the end, pending events are flushed.
    pub fn process_frame(&mut self, frame: &Frame, frames_remaining: u64) -> Result<Report, DetectionError> {
        let span = self.span.clone();
        let _entered = span.enter();

        // Stage 0: Working Image
        let working: Cow<'_, PixelBuffer> = if self.config.downsample {
            Cow::Owned(frame.buffer.downsample())
        } else {
            Cow::Borrowed(&frame.buffer)
        };
        let dimensions = working.dimensions();

        // Stage 1: Temporal Analysis
        let mask = self.mask.mask_for(&working)?;
        let difference = self.differencer.process(&working, mask)?;

        // Only a frame that passed the geometry checks may reset the session.
        if self.session.dimensions != Some(dimensions) {
            if self.session.dimensions.is_some() {
                debug!(?dimensions, "working dimensions changed, dropping active events");
            }
            self.session.tracker.reset();
            self.session.dimensions = Some(dimensions);
        }

        // Stage 2: Spatial Grouping
        let mut summary = FrameSummary {
            frame_index: frame.index,
            ..FrameSummary::default()
        };
        let mut local_events = Vec::new();
        let mut event_map = None;
        if let Some(output) = difference.as_ref() {
            summary.difference = Some(output.stats);
            self.session.record_noise(frame.index, output.stats.std_dev);

            let mut motion_map = output.motion_map.clone();
            let regions = self.session.grid.regions_for(dimensions.0, dimensions.1)?;
            let extraction = local_event_extractor::extract_frame(
                regions,
                &mut motion_map,
                &mut self.session.palette,
                frame.index,
                &self.config.extraction,
                &span,
            );
            local_events = extraction.local_events;
            event_map = Some(extraction.event_map);
        }
        summary.local_events = local_events.len();

        if let Some(dumper) = self.dumper.as_ref() {
            let stages = StageImages {
                working: &working,
                threshold_map: difference.as_ref().map(|d| &d.threshold_map),
                motion_map: difference.as_ref().map(|d| &d.motion_map),
                event_map: event_map.as_ref(),
            };
            dumper.dump(frame.index, &stages, !local_events.is_empty());
        }

        // Stage 3: Behavioral Analysis
        let outcome = self
            .session
            .tracker
            .update(local_events, frame.timestamp_us, frames_remaining, dimensions);
        summary.active_global_events = self.session.tracker.global_events().len();
        summary.discarded = outcome.discarded;
        self.last_summary = summary;

        // Stage 4: Report
        let Some(saved) = outcome.saved else {
            return Ok(Report::NoDetection);
        };
        let mut event = saved.into_detected_event();
        if self.config.save_stdev {
            event.noise = self.session.noise_between(event.first_frame, event.last_frame);
        }
        Ok(Report::EventReady(event))
    }

    /// Drains `source`, storing and announcing every saved event.
    ///
    /// A frame whose geometry does not match the pipeline state is skipped and
    /// logged; source failures end the run.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
        storage: &mut dyn Storage,
        notifier: &mut dyn Notifier,
    ) -> Result<RunStats, DetectionError> {
        let mut stats = RunStats::default();
        while let Some(frame) = source.next_frame()? {
            let remaining = source.frames_remaining();
            stats.frames += 1;
            match self.process_frame(&frame, remaining) {
                Ok(Report::NoDetection) => {}
                Ok(Report::EventReady(event)) => {
                    stats.events += 1;
                    if let Err(err) = storage.store(&event) {
                        warn!(id = event.id, error = %err, "failed to store event");
                    }
                    notifier.notify(&event);
                }
                Err(err @ DetectionError::GeometryMismatch { .. }) => {
                    stats.rejected += 1;
                    warn!(frame = frame.index, error = %err, "frame rejected");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(stats)
    }
}

/// Counters of a `DetectionPipeline::run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub frames: u64,
    pub events: u64,
    pub rejected: u64,
}
