#![allow(dead_code)]

use image::{GrayImage, Luma};
use meteor_vision::core_modules::frame::frame::Frame;
use meteor_vision::error::{DetectionError, StorageError};
use meteor_vision::interfaces::{FrameSource, Notifier, Storage};
use meteor_vision::pipeline::{DetectedEvent, PipelineConfig};
use std::sync::{Arc, Mutex};

pub const SIZE: u32 = 240;
pub const FRAMES: u64 = 25;
pub const FRAME_PERIOD_US: u64 = 40_000;

/// A 4x4 streak of value 200 over a sky of 10, moving (+4, +4) per frame from
/// (24, 24). Visible on frames 1..=12, frame 0 and frames after 12 are empty.
pub fn meteor_frame(index: u64) -> GrayImage {
    let visible = (1..=12).contains(&index);
    let origin = 24 + 4 * (index.saturating_sub(1) as u32);
    GrayImage::from_fn(SIZE, SIZE, |x, y| {
        let inside = visible && (origin..origin + 4).contains(&x) && (origin..origin + 4).contains(&y);
        Luma([if inside { 200 } else { 10 }])
    })
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        subdivisions: 4,
        ..PipelineConfig::default()
    }
}

/// In-memory frames served in order.
pub struct VecSource {
    frames: Vec<Frame>,
    cursor: usize,
}

impl VecSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self { frames, cursor: 0 }
    }

    pub fn meteor() -> Self {
        Self::new(
            (0..FRAMES)
                .map(|i| Frame::from_gray8(i, i * FRAME_PERIOD_US, meteor_frame(i)))
                .collect(),
        )
    }
}

impl FrameSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, DetectionError> {
        let frame = self.frames.get(self.cursor).cloned();
        if frame.is_some() {
            self.cursor += 1;
        }
        Ok(frame)
    }

    fn frames_remaining(&self) -> u64 {
        (self.frames.len() - self.cursor) as u64
    }

    fn fps(&self) -> f64 {
        25.0
    }

    fn exposure_bounds(&self) -> (u32, u32) {
        (100, 40_000)
    }
}

/// Storage and notifier that keep what they receive.
#[derive(Clone, Default)]
pub struct Collector {
    pub stored: Arc<Mutex<Vec<DetectedEvent>>>,
    pub notified: Arc<Mutex<Vec<u64>>>,
}

impl Storage for Collector {
    fn store(&mut self, event: &DetectedEvent) -> Result<(), StorageError> {
        self.stored.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl Notifier for Collector {
    fn notify(&mut self, event: &DetectedEvent) {
        self.notified.lock().unwrap().push(event.id);
    }
}
