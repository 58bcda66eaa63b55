// THEORY:
// The station configuration is one JSON document split into sections that mirror
// the subsystems: acquisition, detection, debug, exposure and storage. Every field
// has a default so a partial file (or `{}`) is a valid configuration.
//
// Loading is two steps. `serde_json` turns the text into `StationConfig`, then
// `validate` rejects values no subsystem can work with and applies the documented
// fallbacks (a non-positive bright-pixel mask interval becomes `fps * 10`). The
// rest of the engine never sees raw configuration; it receives the typed
// parameter structs built by the accessor methods below.

use crate::core_modules::event_tracker::TrackerParams;
use crate::core_modules::exposure_control::ExposureParams;
use crate::core_modules::local_event_extractor::ExtractionParams;
use crate::core_modules::mask::MaskSettings;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub acquisition: AcquisitionConfig,
    pub detection: DetectionConfig,
    pub debug: DebugConfig,
    pub exposure: ExposureConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub fps: f64,
    /// Significant bits per sample delivered by the camera (8..=16).
    pub bit_depth: u8,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            bit_depth: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Average 2x2 blocks before detection.
    pub downsample: bool,
    /// Apply the static mask read from `mask_path`.
    pub mask_enabled: bool,
    pub mask_path: Option<PathBuf>,
    /// Periodically exclude saturated pixels and their halo.
    pub static_mask_enabled: bool,
    /// Frames between two bright-pixel mask refreshes; `<= 0` means `fps * 10`.
    pub static_mask_interval: i64,
    /// Attach the per-frame difference noise to saved events.
    pub save_stdev: bool,
    pub roi_size: u32,
    pub max_local_events: usize,
    pub max_local_event_area: usize,
    /// Grid subdivisions per axis; must be even.
    pub subdivisions: u32,
    pub max_global_events: usize,
    pub grace_frames: u64,
    pub min_local_events: usize,
    pub save_good_transitions: usize,
    pub kill_good_transitions: usize,
    pub max_age: u64,
    pub max_direction_change_deg: f64,
    pub max_frame_gap_ratio: f64,
    pub end_of_stream_frames: u64,
    /// Defaults to half the ROI size.
    pub linear_tolerance_px: Option<f64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let extraction = ExtractionParams::default();
        let tracker = TrackerParams::default();
        Self {
            downsample: false,
            mask_enabled: false,
            mask_path: None,
            static_mask_enabled: true,
            static_mask_interval: 0,
            save_stdev: false,
            roi_size: extraction.roi_size,
            max_local_events: extraction.max_local_events,
            max_local_event_area: extraction.max_local_event_area,
            subdivisions: 10,
            max_global_events: tracker.max_global_events,
            grace_frames: tracker.grace_frames,
            min_local_events: tracker.min_local_events,
            save_good_transitions: tracker.save_good_transitions,
            kill_good_transitions: tracker.kill_good_transitions,
            max_age: tracker.max_age,
            max_direction_change_deg: tracker.max_direction_change_deg,
            max_frame_gap_ratio: tracker.max_frame_gap_ratio,
            end_of_stream_frames: tracker.end_of_stream_frames,
            linear_tolerance_px: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Dump intermediate bitmaps of every frame with motion.
    pub enabled: bool,
    pub path: PathBuf,
    /// Dump every frame, producing a numbered image sequence.
    pub video: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    pub enabled: bool,
    pub interval_s: f64,
    pub save_image: bool,
    pub save_infos: bool,
    pub data_path: PathBuf,
    pub station_name: String,
    pub coarse_step_us: u32,
    pub fine_step_us: u32,
    pub settle_frames: u32,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        let params = ExposureParams::default();
        Self {
            enabled: false,
            interval_s: params.interval_s,
            save_image: params.save_image,
            save_infos: params.save_infos,
            data_path: PathBuf::from("exposure"),
            station_name: String::from("STATION"),
            coarse_step_us: params.coarse_step_us,
            fine_step_us: params.fine_step_us,
            settle_frames: params.settle_frames,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of saved events.
    pub events_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            events_path: PathBuf::from("events"),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl StationConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: StationConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Rejects unusable values and applies fallbacks in place.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let fps = self.acquisition.fps;
        if fps.is_nan() || fps <= 0.0 {
            return Err(invalid("acquisition.fps", format!("must be positive, got {fps}")));
        }
        if !(8..=16).contains(&self.acquisition.bit_depth) {
            return Err(invalid(
                "acquisition.bit_depth",
                format!("must be within 8..=16, got {}", self.acquisition.bit_depth),
            ));
        }

        let detection = &mut self.detection;
        if detection.roi_size < 2 {
            return Err(invalid("detection.roi_size", "must be at least 2"));
        }
        if detection.subdivisions == 0 || detection.subdivisions % 2 != 0 {
            return Err(invalid(
                "detection.subdivisions",
                format!("must be a positive even number, got {}", detection.subdivisions),
            ));
        }
        if detection.max_local_events == 0 {
            return Err(invalid("detection.max_local_events", "must be positive"));
        }
        if detection.max_global_events == 0 {
            return Err(invalid("detection.max_global_events", "must be positive"));
        }
        if detection.static_mask_interval <= 0 {
            let fallback = (fps * 10.0).round() as i64;
            warn!(
                configured = detection.static_mask_interval,
                fallback, "non-positive bright-pixel mask interval, using fps * 10"
            );
            detection.static_mask_interval = fallback.max(1);
        }
        if detection.mask_enabled && detection.mask_path.is_none() {
            warn!("static mask enabled without a path, it will be ignored");
        }

        let exposure = &self.exposure;
        if exposure.enabled && (exposure.interval_s.is_nan() || exposure.interval_s < 0.0) {
            return Err(invalid("exposure.interval_s", "must not be negative"));
        }
        if exposure.enabled && exposure.coarse_step_us == 0 {
            return Err(invalid("exposure.coarse_step_us", "must be positive"));
        }
        if exposure.enabled && exposure.fine_step_us == 0 {
            return Err(invalid("exposure.fine_step_us", "must be positive"));
        }
        Ok(())
    }

    /// Bright-pixel mask refresh interval, with the `fps * 10` fallback.
    pub fn static_mask_interval(&self) -> u64 {
        match self.detection.static_mask_interval {
            interval if interval > 0 => interval as u64,
            _ => ((self.acquisition.fps * 10.0).round() as u64).max(1),
        }
    }

    pub fn mask_settings(&self) -> MaskSettings {
        MaskSettings {
            static_enabled: self.detection.mask_enabled,
            static_path: self.detection.mask_path.clone(),
            adaptive_enabled: self.detection.static_mask_enabled,
            adaptive_interval: self.static_mask_interval(),
        }
    }

    pub fn extraction_params(&self) -> ExtractionParams {
        ExtractionParams {
            roi_size: self.detection.roi_size,
            max_local_events: self.detection.max_local_events,
            max_local_event_area: self.detection.max_local_event_area,
        }
    }

    pub fn tracker_params(&self) -> TrackerParams {
        let d = &self.detection;
        TrackerParams {
            max_global_events: d.max_global_events,
            grace_frames: d.grace_frames,
            min_local_events: d.min_local_events,
            save_good_transitions: d.save_good_transitions,
            kill_good_transitions: d.kill_good_transitions,
            max_age: d.max_age,
            max_direction_change_deg: d.max_direction_change_deg,
            max_frame_gap_ratio: d.max_frame_gap_ratio,
            end_of_stream_frames: d.end_of_stream_frames,
            linear_tolerance_px: d.linear_tolerance_px.unwrap_or(d.roi_size as f64 / 2.0),
        }
    }

    pub fn exposure_params(&self) -> ExposureParams {
        let e = &self.exposure;
        ExposureParams {
            interval_s: e.interval_s,
            coarse_step_us: e.coarse_step_us,
            fine_step_us: e.fine_step_us,
            settle_frames: e.settle_frames,
            save_image: e.save_image,
            save_infos: e.save_infos,
            ..ExposureParams::default()
        }
    }
}
