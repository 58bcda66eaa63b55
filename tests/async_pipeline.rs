mod common;

use common::{Collector, FRAMES, VecSource, meteor_frame, pipeline_config};
use meteor_vision::core_modules::frame::frame::Frame;
use meteor_vision::frame_source::DirectoryFrameSource;
use meteor_vision::interfaces::LogNotifier;
use meteor_vision::parallel_pipeline::AsyncDetectionPipeline;
use meteor_vision::pipeline::DetectionPipeline;
use meteor_vision::storage::DirectoryStorage;

#[tokio::test]
async fn async_driver_hands_the_meteor_to_the_saver() {
    let pipeline = DetectionPipeline::new(pipeline_config()).unwrap();
    let collector = Collector::default();
    let mut source = VecSource::meteor();

    let summary = AsyncDetectionPipeline::run(
        pipeline,
        &mut source,
        Box::new(collector.clone()),
        Box::new(collector.clone()),
    )
    .await
    .unwrap();

    assert_eq!(summary.stats.frames, FRAMES);
    assert_eq!(summary.stats.events, 1);
    assert_eq!(summary.stored, 1);
    assert_eq!(collector.stored.lock().unwrap().len(), 1);
    assert_eq!(collector.notified.lock().unwrap().len(), 1);
    assert!(summary.pipeline.session().tracker().global_events().is_empty());
}

#[tokio::test]
async fn replayed_png_directory_produces_one_event_directory() {
    let frames_dir = tempfile::tempdir().unwrap();
    for index in 0..FRAMES {
        meteor_frame(index)
            .save(frames_dir.path().join(format!("frame_{index:04}.png")))
            .unwrap();
    }
    let events_dir = tempfile::tempdir().unwrap();

    let mut source = DirectoryFrameSource::open(frames_dir.path(), 25.0, 8).unwrap();
    let pipeline = DetectionPipeline::new(pipeline_config()).unwrap();
    let summary = AsyncDetectionPipeline::run(
        pipeline,
        &mut source,
        Box::new(DirectoryStorage::new(events_dir.path())),
        Box::new(LogNotifier),
    )
    .await
    .unwrap();
    assert_eq!(summary.stored, 1);

    let saved: Vec<_> = std::fs::read_dir(events_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(saved.len(), 1);
    assert!(saved[0].ends_with("event_0000_f2"));

    let csv = std::fs::read_to_string(saved[0].join("trajectory.csv")).unwrap();
    assert_eq!(csv.lines().count(), 13);
    assert!(saved[0].join("ownership_map.png").exists());
}

#[tokio::test]
async fn single_frame_stream_shuts_down_cleanly() {
    let pipeline = DetectionPipeline::new(pipeline_config()).unwrap();
    let driver = AsyncDetectionPipeline::spawn(
        pipeline,
        Box::new(Collector::default()),
        Box::new(LogNotifier),
    );
    let frame = Frame::from_gray8(0, 0, meteor_frame(0));
    driver.submit(frame, 0).await.unwrap();
    let summary = driver.finish().await.unwrap();
    assert_eq!(summary.stats.frames, 1);
    assert_eq!(summary.stored, 0);
}
