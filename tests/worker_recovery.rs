mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Result};

use common::{
    harness, quiet_inference, wait_until, RecordingSinks, ScriptedOpener, Step, HEIGHT, WIDTH,
};
use livestream_kernel::{
    unix_secs, FrameSink, SinkFactory, SinkParams, SlotState, SourceInfo, StartOutcome,
    StreamManager, StreamParams, WorkerState,
};

fn params() -> StreamParams {
    StreamParams::new("stub://camera")
}

fn frame_count(manager: &StreamManager, id: u32) -> u64 {
    manager
        .status(id)
        .ok()
        .flatten()
        .map(|s| s.frame_count)
        .unwrap_or(0)
}

fn is_idle(manager: &StreamManager, id: u32) -> bool {
    manager
        .status(id)
        .ok()
        .flatten()
        .map(|s| s.state == SlotState::Idle)
        .unwrap_or(false)
}

#[test]
fn read_failures_trigger_a_reconnect_without_losing_the_sink() -> Result<()> {
    let opener = ScriptedOpener::frames().with_session(vec![Step::Frame; 10], Step::Fail);
    let opens = opener.opens.clone();
    let closes = opener.closes.clone();
    let sinks = RecordingSinks::default();
    let h = harness(4, opener, sinks.clone(), quiet_inference(), |_| {})?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(5), || frame_count(&h.manager, 1) >= 10));

    let mut last = 0;
    assert!(wait_until(Duration::from_secs(5), || {
        let now = frame_count(&h.manager, 1);
        assert!(now >= last, "frame count went backwards: {} -> {}", last, now);
        last = now;
        now > 20
    }));

    assert!(opens.load(Ordering::SeqCst) >= 2);
    assert!(closes.load(Ordering::SeqCst) >= 1);
    assert_eq!(sinks.starts(), 1);
    let status = h.manager.status(1)?.expect("slot 1");
    assert!(status.running);
    assert_eq!(status.worker_state, Some(WorkerState::Streaming));

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn pending_reads_count_as_failures() -> Result<()> {
    let opener = ScriptedOpener::frames().with_session(vec![Step::Frame; 2], Step::Pending);
    let opens = opener.opens.clone();
    let h = harness(4, opener, RecordingSinks::default(), quiet_inference(), |_| {})?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(5), || opens.load(Ordering::SeqCst) >= 2));
    assert!(wait_until(Duration::from_secs(5), || frame_count(&h.manager, 1) > 2));

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn slow_failing_reads_reconnect_within_the_failure_window() -> Result<()> {
    // Each failed read blocks for 400ms, so the 50 reads the window allows at
    // 50 fps would take 20s. The window is wall time since the last good frame.
    let opener = ScriptedOpener::frames().with_session(vec![Step::Frame; 5], Step::Stall(400));
    let opens = opener.opens.clone();
    let h = harness(4, opener, RecordingSinks::default(), quiet_inference(), |s| {
        s.read_failure_window = Duration::from_secs(1);
    })?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(4), || opens.load(Ordering::SeqCst) >= 2));

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn dead_source_reconnects_on_the_first_failed_read() -> Result<()> {
    let opener = ScriptedOpener::frames().with_session(vec![Step::Frame; 3], Step::Dead);
    let opens = opener.opens.clone();
    let closes = opener.closes.clone();
    let h = harness(4, opener, RecordingSinks::default(), quiet_inference(), |s| {
        s.read_failure_window = Duration::from_secs(60);
    })?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(2), || opens.load(Ordering::SeqCst) >= 2));
    assert!(closes.load(Ordering::SeqCst) >= 1);

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn broken_pipe_restarts_the_sink_in_place() -> Result<()> {
    let opener = ScriptedOpener::frames();
    let opens = opener.opens.clone();
    let sinks = RecordingSinks::default().break_after(5);
    let h = harness(4, opener, sinks.clone(), quiet_inference(), |_| {})?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(5), || sinks.frames() > 10));

    assert_eq!(sinks.starts(), 2);
    assert!(sinks.stops() >= 1);
    // Only the first start of the session may purge old segments.
    assert_eq!(sinks.resumes(), vec![false, true]);
    // The source session survives a sink restart.
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn failed_opens_back_off_until_the_source_appears() -> Result<()> {
    let opener = ScriptedOpener::frames().failing_first(3);
    let opens = opener.opens.clone();
    let h = harness(4, opener, RecordingSinks::default(), quiet_inference(), |s| {
        s.connect_backoff = Duration::from_millis(400);
    })?;

    let requested = unix_secs(SystemTime::now());
    assert_eq!(h.manager.start_stream(2, params())?, StartOutcome::Accepted);

    let status = h.manager.status(2)?.expect("slot 2");
    assert!(status.running);
    assert_eq!(status.started_at, None);
    assert_eq!(status.worker_state, Some(WorkerState::Connecting));

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(h.manager.status(2)?.and_then(|s| s.started_at), None);

    assert!(wait_until(Duration::from_secs(5), || {
        h.manager
            .status(2)
            .ok()
            .flatten()
            .map(|s| s.started_at.is_some() && s.frame_count > 0)
            .unwrap_or(false)
    }));
    let status = h.manager.status(2)?.expect("slot 2");
    let started_at = status.started_at.expect("started");
    // Three 400ms backoffs pass before the first successful open.
    assert!(started_at > requested, "{} <= {}", started_at, requested);
    assert_eq!(opens.load(Ordering::SeqCst), 4);

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

#[test]
fn end_of_stream_stops_the_worker() -> Result<()> {
    let opener = ScriptedOpener::frames().with_session(vec![Step::Frame; 3], Step::End);
    let opens = opener.opens.clone();
    let sinks = RecordingSinks::default();
    let h = harness(4, opener, sinks.clone(), quiet_inference(), |_| {})?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(5), || is_idle(&h.manager, 1)));

    let status = h.manager.status(1)?.expect("slot 1");
    assert!(!status.running);
    assert_eq!(status.frame_count, 3);
    assert_eq!(status.worker_state, Some(WorkerState::Stopped));
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert_eq!(sinks.stops(), 1);
    Ok(())
}

#[test]
fn unusable_output_root_fails_the_session() -> Result<()> {
    let opener = ScriptedOpener::frames();
    let opens = opener.opens.clone();
    let sinks = RecordingSinks::default();
    let h = harness(4, opener, sinks.clone(), quiet_inference(), |s| {
        let blocker = s.output_root.join("blocker");
        std::fs::write(&blocker, b"not a directory").expect("write blocker");
        s.output_root = blocker;
    })?;

    assert_eq!(h.manager.start_stream(1, params())?, StartOutcome::Accepted);
    assert!(wait_until(Duration::from_secs(5), || is_idle(&h.manager, 1)));
    assert_eq!(opens.load(Ordering::SeqCst), 0);
    assert_eq!(sinks.starts(), 0);
    Ok(())
}

#[test]
fn odd_source_geometry_is_cropped_to_even() -> Result<()> {
    let opener = ScriptedOpener::frames().with_info(SourceInfo {
        width: WIDTH + 1,
        height: HEIGHT + 1,
        fps: 50.0,
    });
    let sinks = RecordingSinks::default();
    let h = harness(4, opener, sinks.clone(), quiet_inference(), |_| {})?;

    h.manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(5), || sinks.frames() >= 3));
    assert_eq!(sinks.last_frame().len(), (WIDTH * HEIGHT * 3) as usize);

    h.manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}

/// Factory whose first `failures` starts fail.
struct FlakySinks {
    inner: RecordingSinks,
    failures: usize,
    attempts: Arc<AtomicUsize>,
}

impl SinkFactory for FlakySinks {
    fn start(&self, params: &SinkParams) -> Result<Box<dyn FrameSink>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(anyhow!("encoder not installed"));
        }
        self.inner.start(params)
    }
}

#[test]
fn failed_sink_start_is_retried_while_frames_keep_flowing() -> Result<()> {
    let recording = RecordingSinks::default();
    let attempts = Arc::new(AtomicUsize::new(0));
    let flaky = FlakySinks {
        inner: recording.clone(),
        failures: 1,
        attempts: Arc::clone(&attempts),
    };

    let dir = tempfile::tempdir()?;
    let mut settings = common::settings(dir.path());
    settings.reconnect_backoff = Duration::from_millis(200);
    let transport = common::RecordingTransport::default();
    let publisher = Arc::new(livestream_kernel::EventPublisher::start(
        Arc::new(transport),
        1,
        4,
    )?);
    let deps = livestream_kernel::PipelineDeps {
        sources: Arc::new(ScriptedOpener::frames()),
        sinks: Arc::new(flaky),
        inference: quiet_inference(),
        publisher,
    };
    let manager = StreamManager::new(1, settings, deps);

    manager.start_stream(1, params())?;
    assert!(wait_until(Duration::from_secs(5), || recording.frames() > 0));

    // Frames were counted during the outage even though none reached a sink.
    assert!(frame_count(&manager, 1) > recording.frames() as u64);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(recording.starts(), 1);

    manager.shutdown(Duration::from_secs(5))?;
    Ok(())
}
