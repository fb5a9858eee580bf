//! RTSP frame source.
//!
//! This module provides `RtspSource` for ingesting frames from IP cameras via RTSP.
//!
//! The RTSP source is responsible for:
//! - Connecting to camera streams
//! - Decoding video frames to packed BGR
//! - Reporting native resolution and frame rate
//! - Reporting stalls as `Pending` rather than as fatal errors
//!
//! `stub://name?width=W&height=H&fps=F&frames=N&realtime=false` URLs produce
//! synthetic frames without any network access.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};
use url::Url;

use super::{FrameSource, ReadOutcome, SourceInfo};
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate (frames per second), used for stall timeouts.
    pub target_fps: u32,
    /// Frame width for synthetic sources.
    pub width: u32,
    /// Frame height for synthetic sources.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if is_stub_url(&config.url) {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)?),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
            }
        }
    }

    /// Connect to the RTSP stream.
    pub fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }
}

impl FrameSource for RtspSource {
    fn info(&self) -> SourceInfo {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.info(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.info(),
        }
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read_frame(),
        }
    }

    fn close(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.close(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.is_healthy(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    fps: f64,
    /// End of stream after this many frames.
    frame_limit: Option<u64>,
    /// Sleep between frames to mimic a live camera.
    realtime: bool,
    connected: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticRtspSource {
    fn new(mut config: RtspConfig) -> Result<Self> {
        let url = Url::parse(&config.url).map_err(|e| anyhow!("invalid stub url: {}", e))?;
        let mut fps = config.target_fps as f64;
        let mut frame_limit = None;
        let mut realtime = true;
        for (key, value) in url.query_pairs() {
            match &*key {
                "width" => config.width = parse_param(&key, &value)?,
                "height" => config.height = parse_param(&key, &value)?,
                "fps" => fps = parse_param(&key, &value)?,
                "frames" => frame_limit = Some(parse_param(&key, &value)?),
                "realtime" => realtime = parse_param(&key, &value)?,
                _ => log::debug!("RtspSource: ignoring stub parameter {}", key),
            }
        }
        Ok(Self {
            config,
            fps,
            frame_limit,
            realtime,
            connected: false,
            frame_count: 0,
            last_frame_at: None,
        })
    }

    /// Synthetic sources are always reachable.
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn info(&self) -> SourceInfo {
        SourceInfo {
            width: self.config.width,
            height: self.config.height,
            fps: self.fps,
        }
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if !self.connected {
            return Err(anyhow!("synthetic source {} is closed", self.config.url));
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Ok(ReadOutcome::EndOfStream);
            }
        }
        if self.realtime && self.fps > 0.0 {
            let interval = Duration::from_secs_f64(1.0 / self.fps);
            if let Some(last) = self.last_frame_at {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let pixels = self.generate_synthetic_pixels();
        Ok(ReadOutcome::Frame(Frame::new(
            pixels,
            self.config.width,
            self.config.height,
        )?))
    }

    /// Generate a slowly shifting gradient so consecutive frames differ.
    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let pixel_count = (self.config.width as usize) * (self.config.height as usize) * 3;
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count) % 256) as u8;
        }
        pixels
    }

    fn close(&mut self) {
        self.connected = false;
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }
}

/// Scheme comparison is case-insensitive, so `STUB://cam` is synthetic too.
fn is_stub_url(url: &str) -> bool {
    Url::parse(url)
        .map(|url| url.scheme().eq_ignore_ascii_case("stub"))
        .unwrap_or(false)
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid stub parameter {}={}", key, value))
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    /// First sample pulled during connect to learn the negotiated caps.
    preroll: Option<Frame>,
    info: SourceInfo,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
    closed: bool,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Build `rtspsrc ! decodebin ! videoconvert ! appsink` producing BGR.
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=BGR ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "BGR")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            preroll: None,
            info: SourceInfo {
                width: 0,
                height: 0,
                fps: 0.0,
            },
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
            closed: false,
        })
    }

    /// Start the pipeline and wait for the first decoded sample.
    ///
    /// Fails if the camera does not deliver a frame within the connect timeout, so
    /// an unreachable camera is reported at open time rather than as endless stalls.
    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.connected_at = Some(Instant::now());

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_seconds(5));
        self.poll_bus();
        if let Some(err) = &self.last_error {
            let err = anyhow!("RTSP connect to {} failed: {}", self.config.url, err);
            self.close();
            return Err(err);
        }
        let Some(sample) = sample else {
            self.close();
            return Err(anyhow!("RTSP stream {} produced no frames", self.config.url));
        };
        let (frame, fps) = sample_to_frame(&sample)?;
        self.info = SourceInfo {
            width: frame.width,
            height: frame.height,
            fps,
        };
        self.preroll = Some(frame);
        log::info!(
            "RtspSource: connected to {} ({}x{} @ {:.2} fps)",
            self.config.url,
            self.info.width,
            self.info.height,
            self.info.fps
        );
        Ok(())
    }

    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read_frame(&mut self) -> Result<ReadOutcome> {
        if self.closed {
            return Err(anyhow!("RTSP source {} is closed", self.config.url));
        }
        if let Some(frame) = self.preroll.take() {
            self.frame_count += 1;
            self.last_frame_at = Some(Instant::now());
            return Ok(ReadOutcome::Frame(frame));
        }

        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(anyhow!("{}", err));
        }

        let timeout = self.frame_timeout();
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            return Ok(ReadOutcome::Pending);
        };
        let (frame, _) = sample_to_frame(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(ReadOutcome::Frame(frame))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.config.url, err);
        }
        log::info!(
            "RtspSource: closed {} after {} frames",
            self.config.url,
            self.frame_count
        );
    }

    fn is_healthy(&self) -> bool {
        if self.closed || self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        gstreamer::ClockTime::from_mseconds(base_ms.max(500) as u64)
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_frame(sample: &gstreamer::Sample) -> Result<(Frame, f64)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let fps_fraction = info.fps();
    let fps = if fps_fraction.denom() == 0 {
        0.0
    } else {
        fps_fraction.numer() as f64 / fps_fraction.denom() as f64
    };
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer is shorter than its caps")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            let end = start + row_bytes;
            pixels.extend_from_slice(
                data.get(start..end)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    Ok((Frame::new(pixels, width, height)?, fps))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
