#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Result};

use livestream_kernel::detect::{BoundingBox, DetectionRecord, InferenceAdapter, StubDetector};
use livestream_kernel::{
    DetectionPayload, EventPublisher, EventTransport, Frame, FrameSink, FrameSource,
    PipelineDeps, ReadOutcome, SinkError, SinkFactory, SinkParams, SourceInfo, SourceOpener,
    StreamManager, WorkerSettings,
};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;
pub const FILL: [u8; 3] = [10, 10, 10];

pub fn settings(output_root: &Path) -> WorkerSettings {
    WorkerSettings {
        default_fps: 50.0,
        default_width: WIDTH,
        default_height: HEIGHT,
        connect_backoff: Duration::from_millis(50),
        reconnect_backoff: Duration::from_millis(50),
        // 5 consecutive failures at 50 fps
        read_failure_window: Duration::from_millis(100),
        inference_interval: Duration::from_secs(1),
        publish_interval_secs: 1,
        frame_report_every: 1,
        health_log_every: 10_000,
        default_det_conf: 0.5,
        default_pose_conf: 0.3,
        output_root: output_root.to_path_buf(),
        stream_base_url: "http://cdn.test".to_string(),
    }
}

pub fn human() -> DetectionRecord {
    DetectionRecord::new("human", 0.9, BoundingBox::new(5, 5, 30, 40))
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Step {
    Frame,
    Pending,
    Fail,
    End,
    /// Block for this many milliseconds, then report no frame.
    Stall(u64),
    /// Report no frame and flag the source as dead.
    Dead,
}

/// Source that replays a script, then repeats a final step forever.
pub struct ScriptedSource {
    script: VecDeque<Step>,
    then: Step,
    info: SourceInfo,
    frame_delay: Duration,
    healthy: bool,
    closes: Arc<AtomicUsize>,
}

impl FrameSource for ScriptedSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        std::thread::sleep(self.frame_delay);
        match self.script.pop_front().unwrap_or(self.then) {
            Step::Frame => Ok(ReadOutcome::Frame(Frame::filled(
                self.info.width,
                self.info.height,
                FILL,
            )?)),
            Step::Pending => Ok(ReadOutcome::Pending),
            Step::Fail => Err(anyhow!("connection reset by peer")),
            Step::End => Ok(ReadOutcome::EndOfStream),
            Step::Stall(ms) => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(ReadOutcome::Pending)
            }
            Step::Dead => {
                self.healthy = false;
                Ok(ReadOutcome::Pending)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opener that fails a fixed number of times, then hands out scripted sessions.
pub struct ScriptedOpener {
    fail_first: usize,
    sessions: Mutex<VecDeque<(Vec<Step>, Step)>>,
    info: SourceInfo,
    frame_delay: Duration,
    pub opens: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedOpener {
    /// Every open succeeds and streams frames forever.
    pub fn frames() -> Self {
        Self {
            fail_first: 0,
            sessions: Mutex::new(VecDeque::new()),
            info: SourceInfo {
                width: WIDTH,
                height: HEIGHT,
                fps: 50.0,
            },
            frame_delay: Duration::from_millis(5),
            opens: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_first(mut self, attempts: usize) -> Self {
        self.fail_first = attempts;
        self
    }

    /// Queue a session: `script` first, then `then` forever.
    pub fn with_session(self, script: Vec<Step>, then: Step) -> Self {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push_back((script, then));
        }
        self
    }

    pub fn with_info(mut self, info: SourceInfo) -> Self {
        self.info = info;
        self
    }
}

impl SourceOpener for ScriptedOpener {
    fn open(&self, locator: &str) -> Result<Box<dyn FrameSource>> {
        let attempt = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(anyhow!("{}: connection refused", locator));
        }
        let (script, then) = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .pop_front()
            .unwrap_or((Vec::new(), Step::Frame));
        Ok(Box::new(ScriptedSource {
            script: script.into(),
            then,
            info: self.info,
            frame_delay: self.frame_delay,
            healthy: true,
            closes: Arc::clone(&self.closes),
        }))
    }
}

/// Gate shared between a test and a [`BlockingSource`].
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
    pub blocked: Arc<AtomicBool>,
}

impl Gate {
    pub fn release(&self) {
        let (open, cvar) = &*self.inner;
        if let Ok(mut open) = open.lock() {
            *open = true;
        }
        cvar.notify_all();
    }

    /// Block until released or `timeout`; sets `blocked` first.
    pub fn wait(&self, timeout: Duration) {
        self.blocked.store(true, Ordering::SeqCst);
        let (open, cvar) = &*self.inner;
        if let Ok(guard) = open.lock() {
            let _ = cvar.wait_timeout_while(guard, timeout, |open| !*open);
        }
    }
}

/// Source whose reads block after a few frames until the gate opens.
pub struct BlockingSource {
    frames_before_block: usize,
    gate: Gate,
}

impl FrameSource for BlockingSource {
    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: WIDTH,
            height: HEIGHT,
            fps: 50.0,
        }
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if self.frames_before_block == 0 {
            self.gate.wait(Duration::from_secs(30));
        } else {
            self.frames_before_block -= 1;
        }
        Ok(ReadOutcome::Frame(Frame::filled(WIDTH, HEIGHT, FILL)?))
    }

    fn close(&mut self) {}
}

pub struct BlockingOpener {
    pub gate: Gate,
    pub frames_before_block: usize,
}

impl SourceOpener for BlockingOpener {
    fn open(&self, _locator: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(BlockingSource {
            frames_before_block: self.frames_before_block,
            gate: self.gate.clone(),
        }))
    }
}

#[derive(Default)]
pub struct SinkCounters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub frames: AtomicUsize,
    break_at: Mutex<Option<usize>>,
    last_frame: Mutex<Vec<u8>>,
    resumed: Mutex<Vec<bool>>,
}

/// Sink factory that records everything written to it.
#[derive(Clone, Default)]
pub struct RecordingSinks {
    pub counters: Arc<SinkCounters>,
}

impl RecordingSinks {
    /// The first write after `frames` successful writes reports a broken pipe.
    pub fn break_after(self, frames: usize) -> Self {
        if let Ok(mut slot) = self.counters.break_at.lock() {
            *slot = Some(frames);
        }
        self
    }

    pub fn starts(&self) -> usize {
        self.counters.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> usize {
        self.counters.frames.load(Ordering::SeqCst)
    }

    /// `SinkParams::resume` of every start, in order.
    pub fn resumes(&self) -> Vec<bool> {
        self.counters
            .resumed
            .lock()
            .map(|resumed| resumed.clone())
            .unwrap_or_default()
    }

    pub fn last_frame(&self) -> Vec<u8> {
        self.counters
            .last_frame
            .lock()
            .map(|frame| frame.clone())
            .unwrap_or_default()
    }
}

impl SinkFactory for RecordingSinks {
    fn start(&self, params: &SinkParams) -> Result<Box<dyn FrameSink>> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut resumed) = self.counters.resumed.lock() {
            resumed.push(params.resume);
        }
        Ok(Box::new(RecordingSink {
            params: params.clone(),
            counters: Arc::clone(&self.counters),
            broken: false,
            stopped: false,
        }))
    }
}

pub struct RecordingSink {
    params: SinkParams,
    counters: Arc<SinkCounters>,
    broken: bool,
    stopped: bool,
}

impl FrameSink for RecordingSink {
    fn params(&self) -> &SinkParams {
        &self.params
    }

    fn write_frame(&mut self, bytes: &[u8]) -> std::result::Result<(), SinkError> {
        if self.broken {
            return Err(SinkError::BrokenPipe);
        }
        {
            let mut break_at = self
                .counters
                .break_at
                .lock()
                .map_err(|_| SinkError::BrokenPipe)?;
            if *break_at == Some(self.counters.frames.load(Ordering::SeqCst)) {
                *break_at = None;
                self.broken = true;
                return Err(SinkError::BrokenPipe);
            }
        }
        if let Ok(mut last) = self.counters.last_frame.lock() {
            *last = bytes.to_vec();
        }
        self.counters.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.counters.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Transport that keeps every delivered payload with its delivery time.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<(SystemTime, DetectionPayload)>>>,
}

impl RecordingTransport {
    pub fn payloads(&self) -> Vec<DetectionPayload> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(_, payload)| payload.clone()).collect())
            .unwrap_or_default()
    }
}

impl EventTransport for RecordingTransport {
    fn send(&self, payload: &DetectionPayload) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow!("poisoned"))?
            .push((SystemTime::now(), payload.clone()));
        Ok(())
    }
}

pub struct Harness {
    pub manager: StreamManager,
    pub sinks: RecordingSinks,
    pub transport: RecordingTransport,
    pub publisher: Arc<EventPublisher>,
    pub dir: tempfile::TempDir,
}

pub fn harness(
    max_slots: u32,
    opener: impl SourceOpener + 'static,
    sinks: RecordingSinks,
    inference: InferenceAdapter,
    tune: impl FnOnce(&mut WorkerSettings),
) -> Result<Harness> {
    let dir = tempfile::tempdir()?;
    let mut worker_settings = settings(dir.path());
    tune(&mut worker_settings);
    let transport = RecordingTransport::default();
    let publisher = Arc::new(EventPublisher::start(Arc::new(transport.clone()), 1, 16)?);
    let deps = PipelineDeps {
        sources: Arc::new(opener),
        sinks: Arc::new(sinks.clone()),
        inference,
        publisher: Arc::clone(&publisher),
    };
    Ok(Harness {
        manager: StreamManager::new(max_slots, worker_settings, deps),
        sinks,
        transport,
        publisher,
        dir,
    })
}

pub fn quiet_inference() -> InferenceAdapter {
    InferenceAdapter::new(StubDetector::new())
}
