//! Per-slot capture loop.
//!
//! `Connecting -> Streaming -> Reconnecting -> Stopped`. The stop signal is
//! checked before every step, so shutdown latency is bounded by one blocking
//! read or write plus one frame interval.

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::detect::DetectionRecord;
use crate::frame::{even_dimensions, Frame};
use crate::ingest::{FrameSource, ReadOutcome, SourceInfo};
use crate::overlay::OverlayRenderer;
use crate::publish::{DetectionPayload, PublishGate};
use crate::sink::{
    playlist_url, prepare_output_dir, slot_output_dir, FrameSink, SinkError, SinkParams,
};

use super::manager::PipelineDeps;
use super::signal::StopSignal;
use super::slot::SlotReporter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Tunables shared by every worker.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Used when the source reports no frame rate.
    pub default_fps: f64,
    pub default_width: u32,
    pub default_height: u32,
    /// Delay between failed opens before the first successful one.
    pub connect_backoff: Duration,
    /// Delay between failed reopens, and before retrying a failed sink start.
    pub reconnect_backoff: Duration,
    /// Reconnect after this long without a good frame at the expected rate.
    pub read_failure_window: Duration,
    /// Source time between inference passes.
    pub inference_interval: Duration,
    pub publish_interval_secs: u64,
    /// Report the frame count to the slot table every N frames.
    pub frame_report_every: u64,
    /// Emit a health log line every N frames.
    pub health_log_every: u64,
    pub default_det_conf: f32,
    pub default_pose_conf: f32,
    /// Segment root; each slot writes into `<output_root>/cctv<id>`.
    pub output_root: PathBuf,
    /// Public base URL for playback links.
    pub stream_base_url: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            default_fps: 30.0,
            default_width: 640,
            default_height: 480,
            connect_backoff: Duration::from_secs(2),
            reconnect_backoff: Duration::from_secs(2),
            read_failure_window: Duration::from_secs(2),
            inference_interval: Duration::from_secs(1),
            publish_interval_secs: 1,
            frame_report_every: 30,
            health_log_every: 300,
            default_det_conf: 0.5,
            default_pose_conf: 0.3,
            output_root: PathBuf::from("streams"),
            stream_base_url: "http://localhost:8000".to_string(),
        }
    }
}

impl WorkerSettings {
    /// Consecutive failed reads that trigger a reconnect at `fps`.
    pub fn failure_threshold(&self, fps: f64) -> u32 {
        let frames = (fps * self.read_failure_window.as_secs_f64()).ceil();
        if frames.is_finite() && frames >= 1.0 {
            frames.min(f64::from(u32::MAX)) as u32
        } else {
            1
        }
    }

    /// Run inference on every Nth frame at `fps`.
    pub fn inference_every(&self, fps: f64) -> u64 {
        let frames = (fps * self.inference_interval.as_secs_f64()).round();
        if frames.is_finite() && frames >= 1.0 {
            frames as u64
        } else {
            1
        }
    }
}

/// Resolved parameters of one session.
#[derive(Clone, Debug)]
pub(crate) struct SessionParams {
    pub(crate) source_url: String,
    pub(crate) location_id: Option<i64>,
    pub(crate) det_conf: f32,
    pub(crate) pose_conf: f32,
}

pub(crate) struct StreamWorker {
    id: u32,
    params: SessionParams,
    settings: WorkerSettings,
    deps: PipelineDeps,
    stop: StopSignal,
    reporter: SlotReporter,
    overlay: OverlayRenderer,
    gate: PublishGate,
    output_dir: PathBuf,
    video_url: String,
    source: Option<Box<dyn FrameSource>>,
    sink: Option<Box<dyn FrameSink>>,
    sink_retry_at: Option<Instant>,
    info: SourceInfo,
    last_detections: Vec<DetectionRecord>,
    pending: Option<DetectionPayload>,
    frame_count: u64,
    consecutive_failures: u32,
    last_good: Instant,
    sink_restarts: u64,
    state: WorkerState,
}

impl StreamWorker {
    pub(crate) fn new(
        id: u32,
        params: SessionParams,
        settings: WorkerSettings,
        deps: PipelineDeps,
        stop: StopSignal,
        reporter: SlotReporter,
    ) -> Self {
        let output_dir = slot_output_dir(&settings.output_root, id);
        let video_url = playlist_url(&settings.stream_base_url, id);
        let gate = PublishGate::new(settings.publish_interval_secs);
        let info = SourceInfo {
            width: settings.default_width,
            height: settings.default_height,
            fps: settings.default_fps,
        };
        Self {
            id,
            params,
            settings,
            deps,
            stop,
            reporter,
            overlay: OverlayRenderer::default(),
            gate,
            output_dir,
            video_url,
            source: None,
            sink: None,
            sink_retry_at: None,
            info,
            last_detections: Vec::new(),
            pending: None,
            frame_count: 0,
            consecutive_failures: 0,
            last_good: Instant::now(),
            sink_restarts: 0,
            state: WorkerState::Connecting,
        }
    }

    pub(crate) fn run(mut self) {
        log::info!(
            "slot {}: worker started for {} (det_conf={}, pose_conf={})",
            self.id,
            self.params.source_url,
            self.params.det_conf,
            self.params.pose_conf
        );
        if let Err(err) = prepare_output_dir(&self.output_dir) {
            log::error!("slot {}: {:#}", self.id, err);
            self.finish();
            return;
        }

        self.enter(WorkerState::Connecting);
        loop {
            if self.stop.is_set() {
                break;
            }
            let next = match self.state {
                WorkerState::Connecting | WorkerState::Reconnecting => self.connect(),
                WorkerState::Streaming => self.step(),
                WorkerState::Stopped => break,
            };
            if next != self.state {
                self.enter(next);
            }
        }
        self.finish();
    }

    fn enter(&mut self, state: WorkerState) {
        log::debug!("slot {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.reporter.set_worker_state(state);
    }

    fn connect(&mut self) -> WorkerState {
        let backoff = if self.state == WorkerState::Reconnecting {
            self.settings.reconnect_backoff
        } else {
            self.settings.connect_backoff
        };
        let mut attempt: u32 = 0;
        loop {
            if self.stop.is_set() {
                return WorkerState::Stopped;
            }
            attempt += 1;
            match self.deps.sources.open(&self.params.source_url) {
                Ok(source) => {
                    self.attach_source(source);
                    return WorkerState::Streaming;
                }
                Err(err) => {
                    log::warn!(
                        "slot {}: open attempt {} for {} failed: {:#}",
                        self.id,
                        attempt,
                        self.params.source_url,
                        err
                    );
                    if self.stop.wait(backoff) {
                        return WorkerState::Stopped;
                    }
                }
            }
        }
    }

    fn attach_source(&mut self, source: Box<dyn FrameSource>) {
        let native = source.info();
        let info = native.with_defaults(
            self.settings.default_fps,
            self.settings.default_width,
            self.settings.default_height,
        );
        let (width, height) = even_dimensions(info.width, info.height);
        self.info = SourceInfo {
            width,
            height,
            fps: info.fps,
        };
        log::info!(
            "slot {}: source open {}x{} @ {:.2} fps (native {}x{} @ {:.2})",
            self.id,
            width,
            height,
            info.fps,
            native.width,
            native.height,
            native.fps
        );
        self.source = Some(source);
        self.consecutive_failures = 0;
        self.last_good = Instant::now();
        self.reporter.mark_started(crate::unix_secs(SystemTime::now()));

        let geometry_changed = self
            .sink
            .as_ref()
            .map(|sink| !self.matches_sink(sink.params(), width, height))
            .unwrap_or(true);
        if geometry_changed {
            self.stop_sink();
            self.start_sink(width, height);
        }
    }

    fn matches_sink(&self, params: &SinkParams, width: u32, height: u32) -> bool {
        params.width == width && params.height == height && params.fps == self.info.fps
    }

    fn step(&mut self) -> WorkerState {
        let Some(source) = self.source.as_mut() else {
            return WorkerState::Reconnecting;
        };
        let outcome = source.read_frame();
        let healthy = source.is_healthy();
        match outcome {
            Ok(ReadOutcome::Frame(frame)) => {
                self.consecutive_failures = 0;
                self.process_frame(frame);
                // Measured after processing so a slow inference pass is not a stall.
                self.last_good = Instant::now();
                WorkerState::Streaming
            }
            Ok(ReadOutcome::Pending) => self.read_failed("no frame available", healthy),
            Ok(ReadOutcome::EndOfStream) => {
                log::info!(
                    "slot {}: source ended after {} frames",
                    self.id,
                    self.frame_count
                );
                WorkerState::Stopped
            }
            Err(err) => self.read_failed(&format!("{:#}", err), healthy),
        }
    }

    /// Count a failed read. Reconnects once the failures span the read
    /// failure window, either by count at the expected rate or by wall time
    /// since the last good frame, or at once if the source reports itself dead.
    fn read_failed(&mut self, reason: &str, healthy: bool) -> WorkerState {
        self.consecutive_failures += 1;
        let threshold = self.settings.failure_threshold(self.info.fps);
        let stalled_for = self.last_good.elapsed();
        if !healthy {
            log::warn!(
                "slot {}: source reports unhealthy (last: {}), reconnecting",
                self.id,
                reason
            );
            self.close_source();
            self.consecutive_failures = 0;
            return WorkerState::Reconnecting;
        }
        if self.consecutive_failures >= threshold
            || stalled_for >= self.settings.read_failure_window
        {
            log::warn!(
                "slot {}: {} consecutive read failures over {:?} (last: {}), reconnecting",
                self.id,
                self.consecutive_failures,
                stalled_for,
                reason
            );
            self.close_source();
            self.consecutive_failures = 0;
            return WorkerState::Reconnecting;
        }
        log::debug!(
            "slot {}: read failed ({}/{}): {}",
            self.id,
            self.consecutive_failures,
            threshold,
            reason
        );
        self.stop.wait(self.frame_interval());
        WorkerState::Streaming
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.info.fps.max(1.0))
    }

    fn process_frame(&mut self, frame: Frame) {
        let (width, height) = even_dimensions(frame.width, frame.height);
        let mut frame = if (width, height) == (frame.width, frame.height) {
            frame
        } else {
            match frame.crop(0, 0, width, height) {
                Ok(cropped) => cropped,
                Err(err) => {
                    log::warn!("slot {}: dropping frame: {:#}", self.id, err);
                    return;
                }
            }
        };

        let inference_every = self.settings.inference_every(self.info.fps);
        if self.frame_count % inference_every == 0 {
            self.run_inference(&frame);
        }
        self.frame_count += 1;

        self.overlay.render(&mut frame, &self.last_detections);
        self.write_frame(&frame);
        self.maybe_publish();

        if self.frame_count % self.settings.frame_report_every.max(1) == 0 {
            self.reporter.update_frame_count(self.frame_count);
        }
        if self.frame_count % self.settings.health_log_every.max(1) == 0 {
            log::info!(
                "slot {}: health frames={} state={:?} read_failures={} sink_restarts={} sink={}",
                self.id,
                self.frame_count,
                self.state,
                self.consecutive_failures,
                self.sink_restarts,
                if self.sink.is_some() { "up" } else { "down" }
            );
        }
    }

    fn run_inference(&mut self, frame: &Frame) {
        let pass = self
            .deps
            .inference
            .analyze(frame, self.params.det_conf, self.params.pose_conf);
        if !pass.pose_counts.is_empty() {
            log::info!("slot {}: poses {:?}", self.id, pass.pose_counts);
        }
        if pass.subject_present {
            log::debug!(
                "slot {}: frame {} detections {:?}",
                self.id,
                self.frame_count,
                pass.records.iter().map(crate::overlay::label_text).collect::<Vec<_>>()
            );
            self.pending = Some(DetectionPayload::new(
                self.id,
                self.params.location_id,
                self.video_url.clone(),
                &pass.records,
                pass.summary,
            ));
            self.last_detections = pass.records;
        } else {
            self.last_detections.clear();
            self.pending = None;
        }
    }

    fn write_frame(&mut self, frame: &Frame) {
        let sink_matches = self
            .sink
            .as_ref()
            .map(|sink| self.matches_sink(sink.params(), frame.width, frame.height));
        match sink_matches {
            Some(true) => {}
            Some(false) => {
                log::info!(
                    "slot {}: frame geometry changed to {}x{}, restarting sink",
                    self.id,
                    frame.width,
                    frame.height
                );
                self.stop_sink();
                self.start_sink(frame.width, frame.height);
            }
            None => {
                let due = self
                    .sink_retry_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    self.start_sink(frame.width, frame.height);
                }
            }
        }

        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.write_frame(frame.data()) {
            Ok(()) => {}
            Err(SinkError::BrokenPipe) => {
                log::warn!("slot {}: encoder pipe broken, restarting sink", self.id);
                self.stop_sink();
                if self.start_sink(frame.width, frame.height) {
                    if let Some(sink) = self.sink.as_mut() {
                        if let Err(err) = sink.write_frame(frame.data()) {
                            log::warn!("slot {}: write to new sink failed: {}", self.id, err);
                        }
                    }
                }
            }
            Err(err) => {
                log::warn!("slot {}: {}", self.id, err);
            }
        }
    }

    fn start_sink(&mut self, width: u32, height: u32) -> bool {
        let params = SinkParams {
            width,
            height,
            fps: self.info.fps,
            output_dir: self.output_dir.clone(),
            resume: self.sink_restarts > 0,
        };
        match self.deps.sinks.start(&params) {
            Ok(sink) => {
                if self.sink_restarts > 0 || self.frame_count > 0 {
                    log::info!("slot {}: sink restarted", self.id);
                }
                self.sink_restarts += 1;
                self.sink = Some(sink);
                self.sink_retry_at = None;
                true
            }
            Err(err) => {
                log::error!(
                    "slot {}: sink start failed, retrying in {:?}: {:#}",
                    self.id,
                    self.settings.reconnect_backoff,
                    err
                );
                self.sink_retry_at = Some(Instant::now() + self.settings.reconnect_backoff);
                false
            }
        }
    }

    fn maybe_publish(&mut self) {
        if self.pending.is_none() || !self.gate.try_acquire(SystemTime::now()) {
            return;
        }
        if let Some(payload) = self.pending.take() {
            if !self.deps.publisher.publish(payload) {
                log::debug!("slot {}: publish dropped", self.id);
            }
        }
    }

    fn close_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }

    fn stop_sink(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.stop();
        }
    }

    fn finish(&mut self) {
        self.close_source();
        self.stop_sink();
        self.reporter.update_frame_count(self.frame_count);
        self.enter(WorkerState::Stopped);
        log::info!(
            "slot {}: worker stopped after {} frames",
            self.id,
            self.frame_count
        );
    }
}
