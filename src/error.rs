// THEORY:
// Every failure the engine can report is typed here, grouped by the concern that
// owns it. The grouping mirrors how the rest of the system reacts:
//
// 1.  **Configuration** failures are fatal to the feature they configure. The
//     caller either falls back to a safe default or disables the feature.
// 2.  **Camera** failures are retryable. The exposure controller aborts its cycle
//     and tries again on the next interval; they never stop the process.
// 3.  **Detection** failures are local to one frame. A geometry mismatch means an
//     upstream contract was broken, so the frame is rejected rather than being
//     silently misprocessed.
// 4.  **Storage** failures belong to the save path and never reach the detector.
// 5.  **Driver** failures mean a worker of the async pipeline died; the run ends.

use std::path::PathBuf;
use thiserror::Error;

/// Problems found while loading or validating the station configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Failures reported by the camera when a command cannot be applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CameraError {
    #[error("camera rejected exposure time {exposure_us}us: {reason}")]
    ExposureRejected { exposure_us: u32, reason: String },
}

/// Failures of one exposure-control cycle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExposureError {
    /// Retryable: the cycle is aborted and restarted on the next interval.
    #[error(transparent)]
    Camera(#[from] CameraError),
    /// Configuration: no exposure range can be derived from this frame rate.
    #[error("frame rate must be positive to bound exposure time, got {0}")]
    InvalidFps(f64),
    /// Configuration: a zero scan step would never leave the bracket floor.
    #[error("exposure scan step `{0}` must be positive")]
    InvalidStep(&'static str),
}

/// Failures of a single detection tick.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("{what} is {found_width}x{found_height}, expected {expected_width}x{expected_height}")]
    GeometryMismatch {
        what: &'static str,
        expected_width: u32,
        expected_height: u32,
        found_width: u32,
        found_height: u32,
    },
    #[error("region subdivision must be a positive even number, got {0}")]
    InvalidRegionCount(u32),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Failures while persisting artifacts of a finished event or exposure cycle.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode image: {0}")]
    Image(#[from] image::ImageError),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of the asynchronous driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error("the {0} worker stopped before the stream ended")]
    WorkerGone(&'static str),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
