// THEORY:
// The `ExposureController` keeps the sky background at a useful brightness by
// searching for the exposure time whose frames score a Mean Sample Value of 2.5.
// It is an explicit state machine driven one frame at a time:
//
//   Idle -> (Skipping) -> Uninitialized -> CoarseScan -> FineScan -> Done -> Idle
//
// Key architectural principles:
// 1.  **Interval Cycles**: A search cycle starts when `interval_s` seconds have
//     passed since the previous cycle ended (or was aborted). The first frame ever
//     seen starts a cycle immediately.
// 2.  **Two-Phase Search**: The coarse scan walks the whole range from the camera
//     minimum to `1e6 / fps` in large steps and finds the first pair of samples
//     straddling the target. The fine scan walks that bracket in small steps and
//     keeps whichever exposure of its own straddling pair scores closer to 2.5.
// 3.  **Settling**: After every exposure write the next `settle_frames` frames are
//     ignored, the sensor needs them to deliver frames at the new setting.
// 4.  **Recoverable Failures**: A rejected camera write or a bad frame rate aborts
//     the cycle and returns to Idle. The next interval simply tries again.

use crate::core_modules::frame::frame::Frame;
use crate::core_modules::histogram::histogram::{MSV_TARGET, frame_msv};
use crate::error::ExposureError;
use crate::interfaces::{ExposureCamera, ExposureRecorder};
use tracing::{Span, debug, info, warn};

/// Tuning of the exposure search.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureParams {
    /// Seconds between two search cycles.
    pub interval_s: f64,
    pub coarse_step_us: u32,
    pub fine_step_us: u32,
    /// Frames ignored after every exposure write.
    pub settle_frames: u32,
    pub target_msv: f64,
    /// Keep a frame from before and after the cycle for the recorder.
    pub save_image: bool,
    /// Hand the cycle summary to the recorder.
    pub save_infos: bool,
}

impl Default for ExposureParams {
    fn default() -> Self {
        Self {
            interval_s: 600.0,
            coarse_step_us: 1000,
            fine_step_us: 30,
            settle_frames: 2,
            target_msv: MSV_TARGET,
            save_image: false,
            save_infos: false,
        }
    }
}

/// Observable state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposurePhase {
    Idle,
    Skipping,
    Uninitialized,
    CoarseScan,
    FineScan,
    Done,
}

/// One (exposure, MSV) measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureSample {
    pub exposure_us: u32,
    pub msv: f64,
}

/// Result of one completed exposure cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub started_at_us: u64,
    pub finished_at_us: u64,
    pub coarse_samples: Vec<ExposureSample>,
    pub fine_samples: Vec<ExposureSample>,
    pub final_exposure_us: u32,
}

/// What the recorder receives at the end of a cycle.
#[derive(Debug, Clone, Copy)]
pub struct ExposureCycleRecord<'a> {
    pub summary: &'a CycleSummary,
    /// Frame captured when the cycle started, when images are saved.
    pub before: Option<&'a Frame>,
    /// First settled frame at the final exposure, when images are saved.
    pub after: Option<&'a Frame>,
    pub save_image: bool,
    pub save_infos: bool,
}

/// How a scan ended relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Analysis {
    /// Even the first sample is brighter than the target.
    Overexposed,
    /// Even the last sample is darker than the target.
    Underexposed,
    /// Samples `i` and `i + 1` straddle the target.
    Straddle(usize),
    /// No straddling pair; index of the sample closest to the target.
    Nearest(usize),
}

fn analyze(samples: &[ExposureSample], target: f64) -> Analysis {
    let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
        return Analysis::Nearest(0);
    };
    if first.msv > target {
        return Analysis::Overexposed;
    }
    if last.msv < target {
        return Analysis::Underexposed;
    }
    if let Some(i) = samples
        .windows(2)
        .position(|pair| pair[0].msv < target && target <= pair[1].msv)
    {
        return Analysis::Straddle(i);
    }
    let nearest = samples
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (a.msv - target).abs().total_cmp(&(b.msv - target).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    Analysis::Nearest(nearest)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Uninitialized,
    Coarse,
    Fine,
    Done,
}

pub struct ExposureController {
    params: ExposureParams,
    phase: Phase,
    frames_to_skip: u32,
    /// Current search bracket, in microseconds.
    bracket: (u32, u32),
    current_us: u32,
    coarse: Vec<ExposureSample>,
    fine: Vec<ExposureSample>,
    final_exposure_us: Option<u32>,
    /// End (or abort) time of the previous cycle.
    cycle_reference_us: Option<u64>,
    cycle_started_us: u64,
    before: Option<Frame>,
    last_cycle: Option<CycleSummary>,
    recorder: Option<Box<dyn ExposureRecorder + Send>>,
    span: Span,
}

impl ExposureController {
    pub fn new(params: ExposureParams, span: Span) -> Self {
        Self {
            params,
            phase: Phase::Idle,
            frames_to_skip: 0,
            bracket: (0, 0),
            current_us: 0,
            coarse: Vec::new(),
            fine: Vec::new(),
            final_exposure_us: None,
            cycle_reference_us: None,
            cycle_started_us: 0,
            before: None,
            last_cycle: None,
            recorder: None,
            span,
        }
    }

    pub fn with_recorder(mut self, recorder: Box<dyn ExposureRecorder + Send>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn phase(&self) -> ExposurePhase {
        match self.phase {
            Phase::Idle => ExposurePhase::Idle,
            _ if self.frames_to_skip > 0 => ExposurePhase::Skipping,
            Phase::Uninitialized => ExposurePhase::Uninitialized,
            Phase::Coarse => ExposurePhase::CoarseScan,
            Phase::Fine => ExposurePhase::FineScan,
            Phase::Done => ExposurePhase::Done,
        }
    }

    pub fn last_cycle(&self) -> Option<&CycleSummary> {
        self.last_cycle.as_ref()
    }

    /// Feeds one frame. Returns the summary when a cycle completes on this frame.
    pub fn on_frame<C: ExposureCamera + ?Sized>(
        &mut self,
        frame: &Frame,
        camera: &mut C,
    ) -> Result<Option<CycleSummary>, ExposureError> {
        let msv = frame_msv(&frame.buffer);
        self.advance(frame.timestamp_us, msv, camera, Some(frame))
    }

    /// Feeds an already measured MSV.
    pub fn step<C: ExposureCamera + ?Sized>(
        &mut self,
        timestamp_us: u64,
        msv: f64,
        camera: &mut C,
    ) -> Result<Option<CycleSummary>, ExposureError> {
        self.advance(timestamp_us, msv, camera, None)
    }

    fn advance<C: ExposureCamera + ?Sized>(
        &mut self,
        timestamp_us: u64,
        msv: f64,
        camera: &mut C,
        frame: Option<&Frame>,
    ) -> Result<Option<CycleSummary>, ExposureError> {
        let span = self.span.clone();
        let _entered = span.enter();

        if self.phase == Phase::Idle {
            if !self.cycle_due(timestamp_us) {
                return Ok(None);
            }
            let started = self.start_cycle(timestamp_us, camera, frame);
            return started.map(|_| None).map_err(|err| self.abort(timestamp_us, err));
        }

        if self.frames_to_skip > 0 {
            self.frames_to_skip -= 1;
            return Ok(None);
        }

        let sample = ExposureSample {
            exposure_us: self.current_us,
            msv,
        };
        let progressed = match self.phase {
            Phase::Uninitialized | Phase::Coarse => {
                self.phase = Phase::Coarse;
                self.coarse.push(sample);
                if self.current_us >= self.bracket.1 {
                    self.conclude_coarse(camera)
                } else {
                    let next = self.current_us.saturating_add(self.params.coarse_step_us).min(self.bracket.1);
                    self.write(camera, next)
                }
            }
            Phase::Fine => {
                self.fine.push(sample);
                if self.current_us >= self.bracket.1 {
                    self.conclude_fine(camera)
                } else {
                    let next = self.current_us.saturating_add(self.params.fine_step_us).min(self.bracket.1);
                    self.write(camera, next)
                }
            }
            Phase::Done => return Ok(Some(self.finish(timestamp_us, frame))),
            Phase::Idle => Ok(()),
        };
        progressed.map(|_| None).map_err(|err| self.abort(timestamp_us, err))
    }

    fn cycle_due(&self, timestamp_us: u64) -> bool {
        match self.cycle_reference_us {
            None => true,
            Some(reference) => {
                timestamp_us.saturating_sub(reference) as f64 >= self.params.interval_s * 1_000_000.0
            }
        }
    }

    fn start_cycle<C: ExposureCamera + ?Sized>(
        &mut self,
        timestamp_us: u64,
        camera: &mut C,
        frame: Option<&Frame>,
    ) -> Result<(), ExposureError> {
        let fps = camera.fps();
        if fps.is_nan() || fps <= 0.0 {
            return Err(ExposureError::InvalidFps(fps));
        }
        if self.params.coarse_step_us == 0 {
            return Err(ExposureError::InvalidStep("coarse_step_us"));
        }
        if self.params.fine_step_us == 0 {
            return Err(ExposureError::InvalidStep("fine_step_us"));
        }
        let min = camera.min_exposure_us();
        let max = ((1_000_000.0 / fps).floor() as u32).max(min);
        debug!(min, max, "exposure cycle started");

        self.reset_search();
        self.cycle_started_us = timestamp_us;
        self.bracket = (min, max);
        if self.params.save_image {
            self.before = frame.cloned();
        }
        self.phase = Phase::Uninitialized;
        self.write(camera, min)
    }

    fn write<C: ExposureCamera + ?Sized>(&mut self, camera: &mut C, exposure_us: u32) -> Result<(), ExposureError> {
        camera.set_exposure_time(exposure_us)?;
        self.current_us = exposure_us;
        self.frames_to_skip = self.params.settle_frames;
        Ok(())
    }

    fn settle<C: ExposureCamera + ?Sized>(&mut self, camera: &mut C, exposure_us: u32) -> Result<(), ExposureError> {
        self.final_exposure_us = Some(exposure_us);
        self.phase = Phase::Done;
        self.write(camera, exposure_us)
    }

    fn conclude_coarse<C: ExposureCamera + ?Sized>(&mut self, camera: &mut C) -> Result<(), ExposureError> {
        let target = self.params.target_msv;
        match analyze(&self.coarse, target) {
            Analysis::Overexposed => {
                debug!("whole range overexposed, settling at minimum");
                self.settle(camera, self.bracket.0)
            }
            Analysis::Underexposed => {
                debug!("whole range underexposed, settling at maximum");
                self.settle(camera, self.bracket.1)
            }
            Analysis::Straddle(i) => {
                self.bracket = (self.coarse[i].exposure_us, self.coarse[i + 1].exposure_us);
                debug!(low = self.bracket.0, high = self.bracket.1, "coarse scan bracketed the target");
                self.phase = Phase::Fine;
                self.write(camera, self.bracket.0)
            }
            Analysis::Nearest(i) => self.settle(camera, self.coarse[i].exposure_us),
        }
    }

    fn conclude_fine<C: ExposureCamera + ?Sized>(&mut self, camera: &mut C) -> Result<(), ExposureError> {
        let target = self.params.target_msv;
        let exposure_us = match analyze(&self.fine, target) {
            Analysis::Overexposed => self.fine[0].exposure_us,
            Analysis::Underexposed => self.fine[self.fine.len() - 1].exposure_us,
            Analysis::Straddle(i) => {
                let (low, high) = (self.fine[i], self.fine[i + 1]);
                if target - low.msv < high.msv - target {
                    low.exposure_us
                } else {
                    high.exposure_us
                }
            }
            Analysis::Nearest(i) => self.fine[i].exposure_us,
        };
        self.settle(camera, exposure_us)
    }

    fn finish(&mut self, timestamp_us: u64, frame: Option<&Frame>) -> CycleSummary {
        let summary = CycleSummary {
            started_at_us: self.cycle_started_us,
            finished_at_us: timestamp_us,
            coarse_samples: std::mem::take(&mut self.coarse),
            fine_samples: std::mem::take(&mut self.fine),
            final_exposure_us: self.final_exposure_us.unwrap_or(self.current_us),
        };
        info!(
            exposure_us = summary.final_exposure_us,
            coarse = summary.coarse_samples.len(),
            fine = summary.fine_samples.len(),
            "exposure cycle complete"
        );

        if self.params.save_image || self.params.save_infos {
            if let Some(recorder) = self.recorder.as_mut() {
                let after = if self.params.save_image { frame } else { None };
                let record = ExposureCycleRecord {
                    summary: &summary,
                    before: self.before.as_ref(),
                    after,
                    save_image: self.params.save_image,
                    save_infos: self.params.save_infos,
                };
                if let Err(err) = recorder.record(&record) {
                    warn!(error = %err, "failed to record exposure cycle");
                }
            }
        }

        self.reset_search();
        self.cycle_reference_us = Some(timestamp_us);
        self.last_cycle = Some(summary.clone());
        summary
    }

    fn abort(&mut self, timestamp_us: u64, err: ExposureError) -> ExposureError {
        warn!(error = %err, "exposure cycle aborted");
        self.reset_search();
        self.cycle_reference_us = Some(timestamp_us);
        err
    }

    fn reset_search(&mut self) {
        self.phase = Phase::Idle;
        self.frames_to_skip = 0;
        self.coarse.clear();
        self.fine.clear();
        self.final_exposure_us = None;
        self.before = None;
    }
}
