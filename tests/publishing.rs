mod common;

use std::time::{Duration, Instant};

use anyhow::Result;

use common::{harness, human, wait_until, RecordingSinks, ScriptedOpener, FILL, WIDTH};
use livestream_kernel::detect::{
    BoundingBox, DetectionRecord, InferenceAdapter, StubDetector, StubPoseClassifier,
};
use livestream_kernel::{StreamParams, WorkerSettings};

fn every_frame(settings: &mut WorkerSettings) {
    settings.inference_interval = Duration::from_millis(1);
}

fn all_fill(frame: &[u8]) -> bool {
    !frame.is_empty() && frame.chunks_exact(3).all(|px| px == FILL)
}

fn pixel(frame: &[u8], x: u32, y: u32) -> [u8; 3] {
    let at = ((y * WIDTH + x) * 3) as usize;
    [frame[at], frame[at + 1], frame[at + 2]]
}

#[test]
fn frames_without_a_subject_are_never_published() -> Result<()> {
    let fire = DetectionRecord::new("fire", 0.95, BoundingBox::new(2, 2, 20, 20));
    let inference = InferenceAdapter::new(StubDetector::fixed(vec![fire]));
    let sinks = RecordingSinks::default();
    let h = harness(4, ScriptedOpener::frames(), sinks.clone(), inference, every_frame)?;

    h.manager.start_stream(1, StreamParams::new("stub://yard"))?;
    assert!(wait_until(Duration::from_secs(5), || sinks.frames() >= 20));
    std::thread::sleep(Duration::from_millis(100));

    assert!(h.transport.payloads().is_empty());
    assert!(all_fill(&sinks.last_frame()));
    assert_eq!(h.publisher.stats().sent, 0);

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn subject_detection_publishes_a_full_payload() -> Result<()> {
    let inference = InferenceAdapter::new(StubDetector::fixed(vec![human()]))
        .with_pose_classifier(StubPoseClassifier::new("Standing", 0.8));
    let sinks = RecordingSinks::default();
    let h = harness(4, ScriptedOpener::frames(), sinks.clone(), inference, |_| {})?;

    let params = StreamParams {
        location_id: Some(7),
        ..StreamParams::new("stub://lobby")
    };
    h.manager.start_stream(1, params)?;
    assert!(wait_until(Duration::from_secs(5), || !h.transport.payloads().is_empty()));

    let payload = h.transport.payloads().remove(0);
    assert_eq!(payload.cctv_id, 1);
    assert_eq!(payload.location_id, Some(7));
    assert_eq!(payload.video_url, "http://cdn.test/streams/cctv1/playlist.m3u8");
    assert_eq!(payload.ai_result.image_path, None);
    assert_eq!(payload.ai_result.summary.human_count, 1);
    assert_eq!(payload.ai_result.summary.total_objects, 1);

    let detection = &payload.ai_result.detections[0];
    assert_eq!(detection.class_name, "human");
    assert_eq!(detection.confidence, 0.9);
    assert_eq!(detection.bbox, BoundingBox::new(5, 5, 30, 40));
    assert_eq!(detection.pose.as_deref(), Some("Standing"));
    assert_eq!(detection.pose_score, Some(0.8));

    let json: serde_json::Value = serde_json::from_str(&payload.to_json()?)?;
    assert_eq!(json["cctvId"], 1);
    assert_eq!(json["locationId"], 7);
    assert!(json["aiResult"]["imagePath"].is_null());
    assert_eq!(json["aiResult"]["detections"][0]["box"]["x2"], 30);
    assert_eq!(json["aiResult"]["detections"][0]["poseScore"], 0.8);

    // The left edge of the box is drawn in the subject colour.
    assert!(wait_until(Duration::from_secs(5), || {
        let frame = sinks.last_frame();
        !frame.is_empty() && pixel(&frame, 5, 20) == [0, 255, 0]
    }));

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn publishing_is_limited_to_one_event_per_second() -> Result<()> {
    let inference = InferenceAdapter::new(StubDetector::fixed(vec![human()]));
    let h = harness(4, ScriptedOpener::frames(), RecordingSinks::default(), inference, every_frame)?;

    let started = Instant::now();
    h.manager.start_stream(1, StreamParams::new("stub://gate"))?;
    std::thread::sleep(Duration::from_millis(2500));
    h.manager.shutdown(Duration::from_secs(5))?;
    let elapsed = started.elapsed().as_secs_f64();

    let delivered = h.transport.payloads().len();
    assert!(delivered >= 2, "only {} deliveries", delivered);
    assert!(
        delivered as f64 <= elapsed.ceil() + 1.0,
        "{} deliveries in {:.2}s",
        delivered,
        elapsed
    );
    Ok(())
}

#[test]
fn overlay_clears_once_the_subject_leaves() -> Result<()> {
    let inference = InferenceAdapter::new(StubDetector::scripted(vec![vec![human()]]));
    let sinks = RecordingSinks::default();
    let h = harness(4, ScriptedOpener::frames(), sinks.clone(), inference, every_frame)?;

    h.manager.start_stream(1, StreamParams::new("stub://hall"))?;
    assert!(wait_until(Duration::from_secs(5), || sinks.frames() >= 10));

    assert!(all_fill(&sinks.last_frame()));
    assert!(wait_until(Duration::from_secs(2), || h.transport.payloads().len() == 1));
    std::thread::sleep(Duration::from_millis(1200));
    assert_eq!(h.transport.payloads().len(), 1);

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn detector_errors_do_not_interrupt_the_stream() -> Result<()> {
    let inference = InferenceAdapter::new(StubDetector::failing());
    let sinks = RecordingSinks::default();
    let h = harness(4, ScriptedOpener::frames(), sinks.clone(), inference, every_frame)?;

    h.manager.start_stream(1, StreamParams::new("stub://dock"))?;
    assert!(wait_until(Duration::from_secs(5), || sinks.frames() >= 20));
    assert!(h.transport.payloads().is_empty());
    assert!(h.manager.status(1)?.map(|s| s.running).unwrap_or(false));

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}
