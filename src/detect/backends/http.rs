//! Model-service backends speaking HTTP.
//!
//! Frames are JPEG-encoded and posted as a multipart form field named `file`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::detect::backend::ObjectDetector;
use crate::detect::result::{BoundingBox, DetectionRecord, PoseEstimate};
use crate::frame::Frame;

const JPEG_QUALITY: u8 = 85;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    detections: Vec<WireDetection>,
}

#[derive(Deserialize)]
struct WireDetection {
    class: String,
    confidence: f32,
    #[serde(rename = "box")]
    bbox: WireBox,
    /// Only present on `/predict_with_pose`, and only for humans.
    #[serde(default)]
    pose: Option<String>,
    #[serde(default)]
    pose_score: Option<f32>,
}

#[derive(Deserialize)]
struct WireBox {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

impl WireDetection {
    fn into_record(self) -> DetectionRecord {
        let record = DetectionRecord::new(
            self.class,
            self.confidence,
            BoundingBox::new(
                coord(self.bbox.x1),
                coord(self.bbox.y1),
                coord(self.bbox.x2),
                coord(self.bbox.y2),
            ),
        );
        match known_pose(self.pose, self.pose_score) {
            Some(estimate) => record.with_pose(estimate),
            None => record,
        }
    }
}

/// Object detector backed by the model service.
///
/// Plain detection posts to `/predict`. With [`HttpDetector::with_pose`] the
/// detector posts to `/predict_with_pose` instead, which classifies the pose
/// of every human in the same request.
pub struct HttpDetector {
    agent: ureq::Agent,
    base_url: String,
    with_pose: bool,
}

impl HttpDetector {
    pub fn new(base_url: &str) -> Self {
        Self {
            agent: build_agent(),
            base_url: base_url.trim_end_matches('/').to_string(),
            with_pose: false,
        }
    }

    pub fn with_pose(mut self) -> Self {
        self.with_pose = true;
        self
    }

    fn predict(&self, url: &str, frame: &Frame) -> Result<Vec<DetectionRecord>> {
        let response: PredictResponse = post_frame(&self.agent, url, frame)?;
        Ok(response
            .detections
            .into_iter()
            .map(WireDetection::into_record)
            .collect())
    }
}

impl ObjectDetector for HttpDetector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect(&self, frame: &Frame, conf_threshold: f32) -> Result<Vec<DetectionRecord>> {
        let url = format!("{}/predict?conf_threshold={}", self.base_url, conf_threshold);
        self.predict(&url, frame)
    }

    fn reports_pose(&self) -> bool {
        self.with_pose
    }

    fn detect_with_pose(
        &self,
        frame: &Frame,
        conf_threshold: f32,
        pose_conf_threshold: f32,
    ) -> Result<Vec<DetectionRecord>> {
        if !self.with_pose {
            return self.detect(frame, conf_threshold);
        }
        let url = format!(
            "{}/predict_with_pose?conf_threshold={}&pose_conf_threshold={}",
            self.base_url, conf_threshold, pose_conf_threshold
        );
        self.predict(&url, frame)
    }
}

fn build_agent() -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(DEFAULT_TIMEOUT).build()
}

fn coord(value: f64) -> i32 {
    if value.is_finite() {
        value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32
    } else {
        0
    }
}

// The service reports "Unknown (...)" labels instead of omitting the pose.
fn known_pose(label: Option<String>, score: Option<f32>) -> Option<PoseEstimate> {
    let label = label?;
    if label.is_empty() || label.starts_with("Unknown") {
        return None;
    }
    Some(PoseEstimate {
        label,
        score: score.unwrap_or(0.0),
    })
}

fn post_frame<T: DeserializeOwned>(agent: &ureq::Agent, url: &str, frame: &Frame) -> Result<T> {
    let jpeg = encode_jpeg(frame)?;
    let boundary = format!("----livestream{:016x}", rand::random::<u64>());
    let body = multipart_body(&boundary, &jpeg);
    let response = agent
        .post(url)
        .set(
            "Content-Type",
            &format!("multipart/form-data; boundary={}", boundary),
        )
        .send_bytes(&body)
        .with_context(|| format!("model service request to {} failed", url))?;
    response
        .into_json::<T>()
        .with_context(|| format!("model service response from {} is malformed", url))
}

fn multipart_body(boundary: &str, jpeg: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(jpeg.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"frame.jpg\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!("cannot encode an empty frame"));
    }
    let mut rgb = Vec::with_capacity(frame.byte_len());
    for px in frame.data().chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode(&rgb, frame.width, frame.height, ExtendedColorType::Rgb8)
        .context("jpeg encode")?;
    Ok(out)
}
