//! Boundaries between the engine and the outside world.
//!
//! The detector never talks to a camera SDK, a codec or a mail server directly.
//! Everything it consumes or produces crosses one of these traits, which keeps the
//! core testable with in-memory fakes.

use crate::core_modules::exposure_control::ExposureCycleRecord;
use crate::core_modules::frame::frame::Frame;
use crate::core_modules::global_event::DetectedEvent;
use crate::error::{CameraError, DetectionError, StorageError};
use tracing::info;

/// Produces ordered frames for the detection pipeline.
pub trait FrameSource {
    /// The next frame, or `None` once the acquisition is over.
    fn next_frame(&mut self) -> Result<Option<Frame>, DetectionError>;

    /// Frames left in the current acquisition; 0 means unknown or unbounded.
    fn frames_remaining(&self) -> u64;

    fn fps(&self) -> f64;

    /// Minimum and maximum exposure time supported, in microseconds.
    fn exposure_bounds(&self) -> (u32, u32);
}

/// Accepts the artifacts of a saved global event.
pub trait Storage {
    fn store(&mut self, event: &DetectedEvent) -> Result<(), StorageError>;
}

/// Tells someone that an event was saved.
pub trait Notifier {
    fn notify(&mut self, event: &DetectedEvent);
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, event: &DetectedEvent) {
        info!(
            id = event.id,
            first_frame = event.first_frame,
            last_frame = event.last_frame,
            points = event.trajectory.len(),
            "meteor detected"
        );
    }
}

/// The part of a camera the exposure controller drives.
///
/// Abstracts the camera hardware for testability of the exposure search.
pub trait ExposureCamera {
    /// Smallest exposure time the camera accepts, in microseconds.
    fn min_exposure_us(&self) -> u32;

    fn fps(&self) -> f64;

    /// Applies a new exposure time.
    ///
    /// # Arguments
    /// * `exposure_us` - exposure time in microseconds
    fn set_exposure_time(&mut self, exposure_us: u32) -> Result<(), CameraError>;
}

/// Persists the outcome of one exposure cycle.
pub trait ExposureRecorder {
    fn record(&mut self, record: &ExposureCycleRecord<'_>) -> Result<(), StorageError>;
}
