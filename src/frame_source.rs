// THEORY:
// Replay sources feed recorded frames back through the engine. A directory of
// PNG files sorted by name stands in for a camera: frame indices follow the sort
// order and timestamps are synthesised from the configured frame rate.
//
// 8-bit images are kept as they are. 16-bit images keep their native samples
// and are tagged with the configured bit depth so saturation tests stay exact.

use crate::core_modules::frame::frame::{CameraSettings, Frame, PixelBuffer};
use crate::error::DetectionError;
use crate::interfaces::FrameSource;
use image::DynamicImage;
use std::path::{Path, PathBuf};

/// Frames read from the image files of one directory.
pub struct DirectoryFrameSource {
    files: Vec<PathBuf>,
    cursor: usize,
    fps: f64,
    bit_depth: u8,
    settings: CameraSettings,
}

impl DirectoryFrameSource {
    /// Lists the `.png` files of `dir` in name order.
    pub fn open(dir: &Path, fps: f64, bit_depth: u8) -> std::io::Result<Self> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_png = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("png"));
            if is_png {
                files.push(path);
            }
        }
        files.sort();
        Ok(Self {
            files,
            cursor: 0,
            fps,
            bit_depth,
            settings: CameraSettings::default(),
        })
    }

    /// Camera settings stamped on every frame produced from now on.
    pub fn set_camera_settings(&mut self, settings: CameraSettings) {
        self.settings = settings;
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn timestamp_us(&self, index: u64) -> u64 {
        if self.fps > 0.0 {
            (index as f64 * 1_000_000.0 / self.fps).round() as u64
        } else {
            0
        }
    }
}

impl FrameSource for DirectoryFrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, DetectionError> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        let buffer = match image::open(path)? {
            DynamicImage::ImageLuma16(image) => PixelBuffer::Gray16 {
                image,
                bit_depth: self.bit_depth.clamp(9, 16),
            },
            DynamicImage::ImageLuma8(image) => PixelBuffer::Gray8(image),
            other => PixelBuffer::Gray8(other.to_luma8()),
        };
        let index = self.cursor as u64;
        self.cursor += 1;
        Ok(Some(Frame::new(index, self.timestamp_us(index), self.settings, buffer)))
    }

    fn frames_remaining(&self) -> u64 {
        (self.files.len() - self.cursor) as u64
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn exposure_bounds(&self) -> (u32, u32) {
        let max = if self.fps > 0.0 {
            (1_000_000.0 / self.fps) as u32
        } else {
            u32::MAX
        };
        (1, max)
    }
}
