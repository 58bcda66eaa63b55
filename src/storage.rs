// THEORY:
// Directory-backed implementations of the persistence boundaries. They are the
// default collaborators of the command line runner and the reference for anyone
// wiring the engine to a real archive.
//
// Layout of one saved event:
//
//   <root>/event_<id>_f<first frame>/
//       ownership_map.png   union of everything the event owned
//       trajectory.csv      one row per local event
//       report.txt          diagnostic summary
//       noise.csv           per-frame difference std-dev, when recorded
//
// Exposure cycles append one line to `<root>/<station>_exposure.log` and, when
// images are kept, write `<station>_<timestamp>_before.png` / `_after.png`.

use crate::core_modules::exposure_control::ExposureCycleRecord;
use crate::core_modules::global_event::DetectedEvent;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::StorageError;
use crate::interfaces::{ExposureRecorder, Storage};
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

fn write_text(path: &Path, text: &str) -> Result<(), StorageError> {
    std::fs::write(path, text).map_err(|e| StorageError::io(path, e))
}

fn create_dir(path: &Path) -> Result<(), StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::io(path, e))
}

/// Writes each saved event into its own directory under `root`.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn event_dir(&self, event: &DetectedEvent) -> PathBuf {
        self.root
            .join(format!("event_{:04}_f{}", event.id, event.first_frame))
    }
}

fn trajectory_csv(event: &DetectedEvent) -> String {
    let mut out = String::from("frame,x,y,area,transition_valid\n");
    for point in &event.trajectory {
        let valid = match point.transition_valid {
            Some(true) => "1",
            Some(false) => "0",
            None => "",
        };
        let _ = writeln!(
            out,
            "{},{:.2},{:.2},{},{}",
            point.frame_index, point.x, point.y, point.area, valid
        );
    }
    out
}

impl Storage for DirectoryStorage {
    fn store(&mut self, event: &DetectedEvent) -> Result<(), StorageError> {
        let dir = self.event_dir(event);
        create_dir(&dir)?;

        image_helper::save_gray(&dir.join("ownership_map.png"), &event.ownership_map)?;
        write_text(&dir.join("trajectory.csv"), &trajectory_csv(event))?;
        write_text(&dir.join("report.txt"), &event.report)?;
        if !event.noise.is_empty() {
            let mut noise = String::from("frame,std_dev\n");
            for (frame, std_dev) in &event.noise {
                let _ = writeln!(noise, "{frame},{std_dev:.3}");
            }
            write_text(&dir.join("noise.csv"), &noise)?;
        }

        info!(id = event.id, path = %dir.display(), "event stored");
        Ok(())
    }
}

/// Keeps the outcome of exposure cycles under `root`.
#[derive(Debug, Clone)]
pub struct DirectoryExposureRecorder {
    root: PathBuf,
    station_name: String,
}

impl DirectoryExposureRecorder {
    pub fn new(root: impl Into<PathBuf>, station_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            station_name: station_name.into(),
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(format!("{}_exposure.log", self.station_name))
    }
}

impl ExposureRecorder for DirectoryExposureRecorder {
    fn record(&mut self, record: &ExposureCycleRecord<'_>) -> Result<(), StorageError> {
        create_dir(&self.root)?;
        let summary = record.summary;

        if record.save_image {
            let stamp = summary.finished_at_us;
            for (label, frame) in [("before", record.before), ("after", record.after)] {
                if let Some(frame) = frame {
                    let path = self.root.join(format!("{}_{stamp}_{label}.png", self.station_name));
                    image_helper::save_gray(&path, &frame.buffer.to_gray8())?;
                }
            }
        }

        if record.save_infos {
            let path = self.log_path();
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            let last_msv = summary
                .fine_samples
                .last()
                .or(summary.coarse_samples.last())
                .map(|s| s.msv)
                .unwrap_or(0.0);
            writeln!(
                file,
                "{} start={} end={} exposure_us={} coarse={} fine={} last_msv={:.3}",
                self.station_name,
                summary.started_at_us,
                summary.finished_at_us,
                summary.final_exposure_us,
                summary.coarse_samples.len(),
                summary.fine_samples.len(),
                last_msv
            )
            .map_err(|e| StorageError::io(&path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::exposure_control::{CycleSummary, ExposureSample};
    use crate::core_modules::frame::frame::Frame;
    use crate::core_modules::global_event::TrajectoryPoint;
    use crate::core_modules::local_event::Rect;
    use image::{GrayImage, Luma};

    fn detected_event() -> DetectedEvent {
        DetectedEvent {
            id: 3,
            created_at_us: 1_000,
            first_frame: 42,
            last_frame: 43,
            ownership_map: GrayImage::from_pixel(16, 16, Luma([255])),
            bounds: Rect {
                x: 0,
                y: 0,
                width: 16,
                height: 16,
            },
            trajectory: vec![
                TrajectoryPoint {
                    frame_index: 42,
                    x: 4.5,
                    y: 4.5,
                    area: 100,
                    transition_valid: None,
                },
                TrajectoryPoint {
                    frame_index: 43,
                    x: 8.5,
                    y: 8.5,
                    area: 100,
                    transition_valid: Some(true),
                },
            ],
            report: String::from("event id        : 3\n"),
            noise: vec![(42, 1.25)],
        }
    }

    #[test]
    fn directory_storage_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = DirectoryStorage::new(dir.path());
        let event = detected_event();
        storage.store(&event).unwrap();

        let event_dir = storage.event_dir(&event);
        assert!(event_dir.ends_with("event_0003_f42"));
        assert!(event_dir.join("ownership_map.png").exists());
        let csv = std::fs::read_to_string(event_dir.join("trajectory.csv")).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.contains("43,8.50,8.50,100,1"));
        assert_eq!(
            std::fs::read_to_string(event_dir.join("report.txt")).unwrap(),
            event.report
        );
        assert!(event_dir.join("noise.csv").exists());
    }

    #[test]
    fn exposure_recorder_appends_log_lines_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = DirectoryExposureRecorder::new(dir.path(), "ORSAY");
        let summary = CycleSummary {
            started_at_us: 10,
            finished_at_us: 20,
            coarse_samples: vec![ExposureSample {
                exposure_us: 100,
                msv: 2.0,
            }],
            fine_samples: Vec::new(),
            final_exposure_us: 100,
        };
        let frame = Frame::from_gray8(0, 20, GrayImage::new(4, 4));
        let record = ExposureCycleRecord {
            summary: &summary,
            before: Some(&frame),
            after: Some(&frame),
            save_image: true,
            save_infos: true,
        };
        recorder.record(&record).unwrap();
        recorder.record(&record).unwrap();

        let log = std::fs::read_to_string(recorder.log_path()).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("exposure_us=100"));
        assert!(dir.path().join("ORSAY_20_before.png").exists());
        assert!(dir.path().join("ORSAY_20_after.png").exists());
    }
}
