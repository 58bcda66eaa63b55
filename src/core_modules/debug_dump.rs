// THEORY:
// Debug dumps make the detector's intermediate state visible: the threshold map,
// the motion map and the colour-coded event map of a frame are written as PNGs
// next to each other, so a missed or false detection can be replayed by eye.
//
// Dumps are side effects only. A failed write is logged and never affects
// detection.

use crate::core_modules::frame::frame::PixelBuffer;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::StorageError;
use image::GrayImage;
use std::path::PathBuf;
use tracing::{Span, warn};

/// Colour of motion pixels painted over the working image.
const MOTION_COLOR: [u8; 3] = [255, 0, 0];

/// Per-stage bitmaps of one frame.
pub struct StageImages<'a> {
    pub working: &'a PixelBuffer,
    pub threshold_map: Option<&'a GrayImage>,
    pub motion_map: Option<&'a GrayImage>,
    pub event_map: Option<&'a GrayImage>,
}

pub struct DebugDumper {
    root: PathBuf,
    /// Write the working image of every frame as a numbered sequence.
    video: bool,
    span: Span,
}

impl DebugDumper {
    pub fn new(root: PathBuf, video: bool, span: Span) -> Self {
        Self { root, video, span }
    }

    /// Writes the stages of `frame_index`. Stage maps are only written for frames
    /// where local events were found.
    pub fn dump(&self, frame_index: u64, stages: &StageImages<'_>, has_events: bool) {
        if let Err(err) = self.try_dump(frame_index, stages, has_events) {
            self.span
                .in_scope(|| warn!(frame_index, error = %err, "failed to write debug dump"));
        }
    }

    fn try_dump(&self, frame_index: u64, stages: &StageImages<'_>, has_events: bool) -> Result<(), StorageError> {
        if self.video {
            let video_dir = self.root.join("video");
            std::fs::create_dir_all(&video_dir).map_err(|e| StorageError::io(&video_dir, e))?;
            image_helper::save_gray(&video_dir.join(format!("{frame_index:08}.png")), &stages.working.to_gray8())?;
        }
        if !has_events {
            return Ok(());
        }

        let frame_dir = self.root.join(format!("frame_{frame_index:08}"));
        std::fs::create_dir_all(&frame_dir).map_err(|e| StorageError::io(&frame_dir, e))?;
        let working = stages.working.to_gray8();
        image_helper::save_gray(&frame_dir.join("working.png"), &working)?;
        if let Some(map) = stages.threshold_map {
            image_helper::save_gray(&frame_dir.join("threshold.png"), map)?;
        }
        if let Some(map) = stages.motion_map {
            image_helper::save_gray(&frame_dir.join("motion.png"), map)?;
            image_helper::save_rgb(
                &frame_dir.join("overlay.png"),
                &image_helper::overlay(&working, map, MOTION_COLOR),
            )?;
        }
        if let Some(map) = stages.event_map {
            image_helper::save_rgb(&frame_dir.join("events.png"), &image_helper::colorize_event_map(map))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn writes_stage_maps_for_frames_with_events() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = DebugDumper::new(dir.path().to_path_buf(), false, Span::none());
        let working = PixelBuffer::Gray8(GrayImage::from_pixel(8, 8, Luma([40])));
        let map = GrayImage::new(8, 8);
        let stages = StageImages {
            working: &working,
            threshold_map: Some(&map),
            motion_map: Some(&map),
            event_map: Some(&map),
        };

        dumper.dump(7, &stages, false);
        assert!(!dir.path().join("frame_00000007").exists());

        dumper.dump(7, &stages, true);
        let frame_dir = dir.path().join("frame_00000007");
        for name in ["working.png", "threshold.png", "motion.png", "overlay.png", "events.png"] {
            assert!(frame_dir.join(name).exists(), "{name} missing");
        }
    }

    #[test]
    fn video_mode_writes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = DebugDumper::new(dir.path().to_path_buf(), true, Span::none());
        let working = PixelBuffer::Gray8(GrayImage::new(4, 4));
        let stages = StageImages {
            working: &working,
            threshold_map: None,
            motion_map: None,
            event_map: None,
        };
        dumper.dump(0, &stages, false);
        dumper.dump(1, &stages, false);
        assert!(dir.path().join("video/00000000.png").exists());
        assert!(dir.path().join("video/00000001.png").exists());
    }
}
