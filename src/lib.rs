//! Live Stream Kernel
//!
//! This crate implements the live-stream lifecycle manager and frame pipeline for
//! camera analytics: per-slot capture loops, inference overlay, HLS republishing
//! through a child encoder process, and asynchronous detection event delivery.
//!
//! # Architecture
//!
//! - `ingest`: Frame sources (synthetic, RTSP, local files) behind `FrameSource`
//! - `sink`: Encoder sinks; the default launches an HLS-producing child process
//! - `detect`: Detector/pose-classifier capabilities and the `InferenceAdapter`
//! - `overlay`: Draws the last known detections onto outgoing frames
//! - `publish`: Rate-limited, fire-and-forget detection event delivery
//! - `stream`: `StreamManager` slot table and the per-slot `StreamWorker` loop
//! - `api`: Thin HTTP control surface over the manager
//!
//! Each running slot owns exactly one worker thread. The slot table is the only
//! state shared between threads; frames, detections and encoder handles are owned
//! by the worker that produced them.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod overlay;
pub mod publish;
pub mod sink;
pub mod stream;

pub use config::LiveStreamConfig;
pub use detect::{
    BoundingBox, DetectionRecord, DetectionSummary, InferenceAdapter, InferencePass,
    ObjectDetector, PoseClassifier, PoseEstimate,
};
pub use frame::{Frame, PixelFormat};
pub use ingest::{FrameSource, ReadOutcome, SourceInfo, SourceOpener, StandardSourceOpener};
pub use overlay::OverlayRenderer;
pub use publish::{DetectionPayload, EventPublisher, EventTransport, PublishGate};
pub use sink::{FrameSink, HlsEncoderFactory, SinkError, SinkFactory, SinkParams};
pub use stream::{
    PipelineDeps, SlotSnapshot, SlotState, StartOutcome, StopOutcome, StopSignal, StreamManager,
    StreamParams, WorkerSettings, WorkerState,
};

/// Whole seconds since the Unix epoch. Clocks set before 1970 report 0.
pub fn unix_secs(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
