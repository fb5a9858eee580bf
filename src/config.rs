use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sink::HlsEncoderFactory;
use crate::stream::WorkerSettings;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_EVENT_SINK_URL: &str = "http://localhost:8080";
const DEFAULT_STREAM_BASE_URL: &str = "http://localhost:8080";
const DEFAULT_OUTPUT_DIR: &str = "streams";
const DEFAULT_MODEL_SERVICE_URL: &str = "http://127.0.0.1:8001";
const DEFAULT_MAX_SLOTS: u32 = 4;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_CONNECT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_READ_FAILURE_WINDOW_SECS: f64 = 2.0;
const DEFAULT_INFERENCE_INTERVAL_SECS: f64 = 1.0;
const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 1;
const DEFAULT_FRAME_REPORT_EVERY: u64 = 30;
const DEFAULT_HEALTH_LOG_EVERY: u64 = 300;
const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";
const DEFAULT_SEGMENT_SECS: u32 = 2;
const DEFAULT_PLAYLIST_SIZE: u32 = 0;
const DEFAULT_CRF: u32 = 28;
const DEFAULT_ENCODER_STOP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_PUBLISHER_WORKERS: usize = 2;
const DEFAULT_PUBLISHER_CAPACITY: usize = 64;
const DEFAULT_PUBLISH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_DET_CONF: f32 = 0.5;
const DEFAULT_POSE_CONF: f32 = 0.3;
const DEFAULT_SUBJECT_CLASS: &str = "human";

#[derive(Debug, Deserialize, Default)]
struct LiveStreamConfigFile {
    api: Option<ApiConfigFile>,
    stream: Option<StreamConfigFile>,
    encoder: Option<EncoderConfigFile>,
    publisher: Option<PublisherConfigFile>,
    inference: Option<InferenceConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    base_url: Option<String>,
    output_dir: Option<PathBuf>,
    max_slots: Option<u32>,
    default_fps: Option<f64>,
    default_width: Option<u32>,
    default_height: Option<u32>,
    connect_backoff_ms: Option<u64>,
    reconnect_backoff_ms: Option<u64>,
    read_failure_window_secs: Option<f64>,
    inference_interval_secs: Option<f64>,
    publish_interval_secs: Option<u64>,
    frame_report_every: Option<u64>,
    health_log_every: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct EncoderConfigFile {
    program: Option<String>,
    segment_secs: Option<u32>,
    playlist_size: Option<u32>,
    crf: Option<u32>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PublisherConfigFile {
    event_sink_url: Option<String>,
    workers: Option<usize>,
    capacity: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct InferenceConfigFile {
    model_service_url: Option<String>,
    det_conf: Option<f32>,
    pose_conf: Option<f32>,
    subject_class: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LiveStreamConfig {
    pub api_addr: String,
    pub stream: StreamSettings,
    pub encoder: EncoderSettings,
    pub publisher: PublisherSettings,
    pub inference: InferenceSettings,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub base_url: String,
    pub output_dir: PathBuf,
    /// 0 means slots are created on demand.
    pub max_slots: u32,
    pub default_fps: f64,
    pub default_width: u32,
    pub default_height: u32,
    pub connect_backoff: Duration,
    pub reconnect_backoff: Duration,
    pub read_failure_window: Duration,
    pub inference_interval: Duration,
    pub publish_interval_secs: u64,
    pub frame_report_every: u64,
    pub health_log_every: u64,
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub program: String,
    pub segment_secs: u32,
    /// 0 keeps every segment in the playlist.
    pub playlist_size: u32,
    pub crf: u32,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub event_sink_url: String,
    pub workers: usize,
    pub capacity: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub model_service_url: String,
    pub det_conf: f32,
    pub pose_conf: f32,
    pub subject_class: String,
}

impl LiveStreamConfig {
    /// Defaults, then the JSON file named by `LIVESTREAM_CONFIG`, then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LIVESTREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`LiveStreamConfig::load`] with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LiveStreamConfigFile) -> Self {
        let api_addr = file
            .api
            .and_then(|api| api.addr)
            .unwrap_or_else(|| DEFAULT_API_ADDR.to_string());

        let stream = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            base_url: stream
                .base_url
                .unwrap_or_else(|| DEFAULT_STREAM_BASE_URL.to_string()),
            output_dir: stream
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            max_slots: stream.max_slots.unwrap_or(DEFAULT_MAX_SLOTS),
            default_fps: stream.default_fps.unwrap_or(DEFAULT_FPS),
            default_width: stream.default_width.unwrap_or(DEFAULT_WIDTH),
            default_height: stream.default_height.unwrap_or(DEFAULT_HEIGHT),
            connect_backoff: Duration::from_millis(
                stream
                    .connect_backoff_ms
                    .unwrap_or(DEFAULT_CONNECT_BACKOFF_MS),
            ),
            reconnect_backoff: Duration::from_millis(
                stream
                    .reconnect_backoff_ms
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
            ),
            read_failure_window: secs_f64(
                stream
                    .read_failure_window_secs
                    .unwrap_or(DEFAULT_READ_FAILURE_WINDOW_SECS),
            ),
            inference_interval: secs_f64(
                stream
                    .inference_interval_secs
                    .unwrap_or(DEFAULT_INFERENCE_INTERVAL_SECS),
            ),
            publish_interval_secs: stream
                .publish_interval_secs
                .unwrap_or(DEFAULT_PUBLISH_INTERVAL_SECS),
            frame_report_every: stream
                .frame_report_every
                .unwrap_or(DEFAULT_FRAME_REPORT_EVERY),
            health_log_every: stream.health_log_every.unwrap_or(DEFAULT_HEALTH_LOG_EVERY),
        };

        let encoder = file.encoder.unwrap_or_default();
        let encoder = EncoderSettings {
            program: encoder
                .program
                .unwrap_or_else(|| DEFAULT_ENCODER_PROGRAM.to_string()),
            segment_secs: encoder.segment_secs.unwrap_or(DEFAULT_SEGMENT_SECS),
            playlist_size: encoder.playlist_size.unwrap_or(DEFAULT_PLAYLIST_SIZE),
            crf: encoder.crf.unwrap_or(DEFAULT_CRF),
            stop_timeout: Duration::from_millis(
                encoder
                    .stop_timeout_ms
                    .unwrap_or(DEFAULT_ENCODER_STOP_TIMEOUT_MS),
            ),
        };

        let publisher = file.publisher.unwrap_or_default();
        let publisher = PublisherSettings {
            event_sink_url: publisher
                .event_sink_url
                .unwrap_or_else(|| DEFAULT_EVENT_SINK_URL.to_string()),
            workers: publisher.workers.unwrap_or(DEFAULT_PUBLISHER_WORKERS),
            capacity: publisher.capacity.unwrap_or(DEFAULT_PUBLISHER_CAPACITY),
            timeout: Duration::from_secs(
                publisher
                    .timeout_secs
                    .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_SECS),
            ),
        };

        let inference = file.inference.unwrap_or_default();
        let inference = InferenceSettings {
            model_service_url: inference
                .model_service_url
                .unwrap_or_else(|| DEFAULT_MODEL_SERVICE_URL.to_string()),
            det_conf: inference.det_conf.unwrap_or(DEFAULT_DET_CONF),
            pose_conf: inference.pose_conf.unwrap_or(DEFAULT_POSE_CONF),
            subject_class: inference
                .subject_class
                .unwrap_or_else(|| DEFAULT_SUBJECT_CLASS.to_string()),
        };

        Self {
            api_addr,
            stream,
            encoder,
            publisher,
            inference,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(url) = non_empty_env("EVENT_SINK_URL") {
            self.publisher.event_sink_url = url;
        }
        if let Some(url) = non_empty_env("STREAM_BASE_URL") {
            self.stream.base_url = url;
        }
        if let Some(dir) = non_empty_env("STREAM_OUTPUT_DIR") {
            self.stream.output_dir = PathBuf::from(dir);
        }
        if let Some(max_slots) = non_empty_env("LIVESTREAM_MAX_SLOTS") {
            self.stream.max_slots = max_slots.trim().parse().map_err(|_| {
                anyhow!("LIVESTREAM_MAX_SLOTS must be a non-negative integer (0 = unbounded)")
            })?;
        }
        if let Some(addr) = non_empty_env("LIVESTREAM_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(program) = non_empty_env("LIVESTREAM_ENCODER_PROGRAM") {
            self.encoder.program = program;
        }
        if let Some(url) = non_empty_env("MODEL_SERVICE_URL") {
            self.inference.model_service_url = url;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(self.stream.default_fps.is_finite() && self.stream.default_fps > 0.0) {
            return Err(anyhow!("stream.default_fps must be greater than zero"));
        }
        if self.stream.default_width == 0 || self.stream.default_height == 0 {
            return Err(anyhow!("stream default width and height must be non-zero"));
        }
        if self.encoder.segment_secs == 0 {
            return Err(anyhow!("encoder.segment_secs must be greater than zero"));
        }
        if self.publisher.workers == 0 {
            return Err(anyhow!("publisher.workers must be greater than zero"));
        }
        if self.publisher.capacity == 0 {
            return Err(anyhow!("publisher.capacity must be greater than zero"));
        }
        for (name, value) in [
            ("inference.det_conf", self.inference.det_conf),
            ("inference.pose_conf", self.inference.pose_conf),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if self.inference.subject_class.trim().is_empty() {
            return Err(anyhow!("inference.subject_class must not be empty"));
        }
        url::Url::parse(&self.stream.base_url)
            .map_err(|e| anyhow!("invalid STREAM_BASE_URL {}: {}", self.stream.base_url, e))?;
        url::Url::parse(&self.publisher.event_sink_url).map_err(|e| {
            anyhow!(
                "invalid EVENT_SINK_URL {}: {}",
                self.publisher.event_sink_url,
                e
            )
        })?;
        Ok(())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            default_fps: self.stream.default_fps,
            default_width: self.stream.default_width,
            default_height: self.stream.default_height,
            connect_backoff: self.stream.connect_backoff,
            reconnect_backoff: self.stream.reconnect_backoff,
            read_failure_window: self.stream.read_failure_window,
            inference_interval: self.stream.inference_interval,
            publish_interval_secs: self.stream.publish_interval_secs,
            frame_report_every: self.stream.frame_report_every,
            health_log_every: self.stream.health_log_every,
            default_det_conf: self.inference.det_conf,
            default_pose_conf: self.inference.pose_conf,
            output_root: self.stream.output_dir.clone(),
            stream_base_url: self.stream.base_url.clone(),
        }
    }

    pub fn encoder_factory(&self) -> HlsEncoderFactory {
        HlsEncoderFactory {
            program: self.encoder.program.clone(),
            segment_secs: self.encoder.segment_secs,
            playlist_size: self.encoder.playlist_size,
            crf: self.encoder.crf,
            stop_timeout: self.encoder.stop_timeout,
        }
    }
}

fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<LiveStreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
