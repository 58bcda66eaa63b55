// THEORY:
// The asynchronous driver keeps acquisition, detection and persistence from
// stalling each other while leaving the detector itself strictly sequential.
//
// Key architectural principles:
// 1.  **Single-Slot Hand-Off**: Frames travel to the detector through a
//     capacity-1 channel. A producer that outruns detection waits on `send`,
//     so at most one frame is ever queued and memory stays bounded.
// 2.  **Sequential Detection**: One blocking worker owns the `DetectionPipeline`
//     and processes frames in arrival order, one tick at a time.
// 3.  **Non-Blocking Save**: Finished events go to the saver through another
//     capacity-1 channel using `try_send`. When the saver is busy the event is
//     parked in a local backlog and retried after the next frame; the detector
//     never waits on disk. The backlog holds at most `MAX_PARKED_EVENTS`; past
//     that the saver is stalled and the oldest parked event is dropped. What is
//     left is flushed when the stream ends.

use crate::core_modules::frame::frame::Frame;
use crate::error::{DetectionError, DriverError};
use crate::interfaces::{FrameSource, Notifier, Storage};
use crate::pipeline::{DetectedEvent, DetectionPipeline, Report, RunStats};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn};

/// Events waiting for the saver beyond this are dropped, oldest first.
pub const MAX_PARKED_EVENTS: usize = 8;

/// One frame queued for detection.
pub struct FrameTask {
    pub frame: Frame,
    pub frames_remaining: u64,
}

/// Everything handed back once the driver has shut down.
pub struct DriverSummary {
    /// The pipeline, with its state after the last frame.
    pub pipeline: DetectionPipeline,
    pub stats: RunStats,
    /// Events the storage accepted.
    pub stored: u64,
}

pub struct AsyncDetectionPipeline {
    frame_sender: mpsc::Sender<FrameTask>,
    detector: JoinHandle<Result<(DetectionPipeline, RunStats), DetectionError>>,
    saver: JoinHandle<u64>,
}

impl AsyncDetectionPipeline {
    /// Starts the detection and saver workers. Must be called from within a
    /// tokio runtime.
    pub fn spawn(
        pipeline: DetectionPipeline,
        storage: Box<dyn Storage + Send>,
        notifier: Box<dyn Notifier + Send>,
    ) -> Self {
        let (frame_sender, frame_receiver) = mpsc::channel::<FrameTask>(1);
        let (event_sender, event_receiver) = mpsc::channel::<DetectedEvent>(1);

        let detection_span = info_span!("detection_worker");
        let detector = tokio::task::spawn_blocking(move || {
            detection_span.in_scope(|| detection_worker(pipeline, frame_receiver, event_sender))
        });

        let saver_span = info_span!("saver");
        let saver = tokio::task::spawn_blocking(move || {
            saver_span.in_scope(|| save_worker(event_receiver, storage, notifier))
        });

        Self {
            frame_sender,
            detector,
            saver,
        }
    }

    /// Queues a frame, waiting while the previous one is still pending.
    pub async fn submit(&self, frame: Frame, frames_remaining: u64) -> Result<(), DriverError> {
        self.frame_sender
            .send(FrameTask {
                frame,
                frames_remaining,
            })
            .await
            .map_err(|_| DriverError::WorkerGone("detection"))
    }

    /// Closes the frame stream and waits for both workers to drain.
    pub async fn finish(self) -> Result<DriverSummary, DriverError> {
        let Self {
            frame_sender,
            detector,
            saver,
        } = self;
        drop(frame_sender);

        let detection = async move { Ok::<_, DriverError>(detector.await??) };
        let saving = async move { Ok::<_, DriverError>(saver.await?) };
        let ((pipeline, stats), stored) = futures::try_join!(detection, saving)?;

        info!(frames = stats.frames, events = stats.events, stored, "driver finished");
        Ok(DriverSummary {
            pipeline,
            stats,
            stored,
        })
    }

    /// Drains `source` through a freshly spawned driver.
    pub async fn run(
        pipeline: DetectionPipeline,
        source: &mut (dyn FrameSource + Send),
        storage: Box<dyn Storage + Send>,
        notifier: Box<dyn Notifier + Send>,
    ) -> Result<DriverSummary, DriverError> {
        let driver = Self::spawn(pipeline, storage, notifier);
        while let Some(frame) = source.next_frame()? {
            let remaining = source.frames_remaining();
            if let Err(err) = driver.submit(frame, remaining).await {
                // The detector's own error is more useful than the closed channel.
                return driver.finish().await.and(Err(err));
            }
        }
        driver.finish().await
    }
}

fn detection_worker(
    mut pipeline: DetectionPipeline,
    mut frames: mpsc::Receiver<FrameTask>,
    events: mpsc::Sender<DetectedEvent>,
) -> Result<(DetectionPipeline, RunStats), DetectionError> {
    let mut stats = RunStats::default();
    let mut backlog: VecDeque<DetectedEvent> = VecDeque::new();

    while let Some(task) = frames.blocking_recv() {
        stats.frames += 1;
        match pipeline.process_frame(&task.frame, task.frames_remaining) {
            Ok(Report::NoDetection) => {}
            Ok(Report::EventReady(event)) => {
                stats.events += 1;
                backlog.push_back(event);
            }
            Err(err @ DetectionError::GeometryMismatch { .. }) => {
                stats.rejected += 1;
                warn!(frame = task.frame.index, error = %err, "frame rejected");
            }
            Err(err) => return Err(err),
        }
        hand_off(&events, &mut backlog);
    }

    for event in backlog.drain(..) {
        if let Err(err) = events.blocking_send(event) {
            warn!(id = err.0.id, "saver stopped, event dropped");
        }
    }
    Ok((pipeline, stats))
}

/// Moves parked events to the saver without blocking.
fn hand_off(events: &mpsc::Sender<DetectedEvent>, backlog: &mut VecDeque<DetectedEvent>) {
    while let Some(event) = backlog.pop_front() {
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                backlog.push_front(event);
                debug!(pending = backlog.len(), "saver busy, event parked");
                break;
            }
            Err(TrySendError::Closed(event)) => {
                warn!(id = event.id, dropped = backlog.len() + 1, "saver stopped, events dropped");
                backlog.clear();
                break;
            }
        }
    }
    while backlog.len() > MAX_PARKED_EVENTS {
        if let Some(event) = backlog.pop_front() {
            warn!(id = event.id, pending = backlog.len(), "saver stalled, parked event dropped");
        }
    }
}

fn save_worker(
    mut events: mpsc::Receiver<DetectedEvent>,
    mut storage: Box<dyn Storage + Send>,
    mut notifier: Box<dyn Notifier + Send>,
) -> u64 {
    let mut stored = 0;
    while let Some(event) = events.blocking_recv() {
        match storage.store(&event) {
            Ok(()) => stored += 1,
            Err(err) => warn!(id = event.id, error = %err, "failed to store event"),
        }
        notifier.notify(&event);
    }
    stored
}
