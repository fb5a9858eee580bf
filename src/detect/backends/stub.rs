use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::backend::{ObjectDetector, PoseClassifier};
use crate::detect::result::{DetectionRecord, PoseEstimate, CLASS_HUMAN};
use crate::frame::Frame;

/// Scripted detector for tests and demos.
///
/// Each call consumes the next scripted pass; once the script runs out every
/// call returns the fallback set. Records below the confidence threshold are
/// filtered the way a real model would.
pub struct StubDetector {
    script: Mutex<VecDeque<Vec<DetectionRecord>>>,
    fallback: Vec<DetectionRecord>,
    pose: Option<PoseEstimate>,
    delay: Option<Duration>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl StubDetector {
    /// Detector that never finds anything.
    pub fn new() -> Self {
        Self::fixed(Vec::new())
    }

    /// Detector that reports the same records on every call.
    pub fn fixed(records: Vec<DetectionRecord>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: records,
            pose: None,
            delay: None,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Detector that replays `passes` in order, then reports nothing.
    pub fn scripted(passes: Vec<Vec<DetectionRecord>>) -> Self {
        Self {
            script: Mutex::new(passes.into()),
            ..Self::new()
        }
    }

    /// Detector whose model is unavailable.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Report `label` on every subject record, as a combined detect and pose
    /// model does.
    pub fn with_pose(mut self, label: impl Into<String>, score: f32) -> Self {
        self.pose = Some(PoseEstimate {
            label: label.into(),
            score,
        });
        self
    }

    /// Block every call for `delay`, like a slow remote model.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Shared counter of `detect` calls.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDetector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, _frame: &Frame, conf_threshold: f32) -> Result<Vec<DetectionRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.fail {
            return Err(anyhow!("stub detector model unavailable"));
        }
        let scripted = self
            .script
            .lock()
            .map_err(|_| anyhow!("stub script lock poisoned"))?
            .pop_front();
        let records = scripted.unwrap_or_else(|| self.fallback.clone());
        Ok(records
            .into_iter()
            .filter(|record| record.confidence >= conf_threshold)
            .collect())
    }

    fn reports_pose(&self) -> bool {
        self.pose.is_some()
    }

    fn detect_with_pose(
        &self,
        frame: &Frame,
        conf_threshold: f32,
        pose_conf_threshold: f32,
    ) -> Result<Vec<DetectionRecord>> {
        let records = self.detect(frame, conf_threshold)?;
        let Some(pose) = self
            .pose
            .clone()
            .filter(|pose| pose.score >= pose_conf_threshold)
        else {
            return Ok(records);
        };
        Ok(records
            .into_iter()
            .map(|record| {
                if record.class_name == CLASS_HUMAN {
                    record.with_pose(pose.clone())
                } else {
                    record
                }
            })
            .collect())
    }
}

/// Pose classifier that returns one fixed label.
pub struct StubPoseClassifier {
    estimate: Option<PoseEstimate>,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl StubPoseClassifier {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            estimate: Some(PoseEstimate {
                label: label.into(),
                score,
            }),
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            estimate: None,
            fail: true,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl PoseClassifier for StubPoseClassifier {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn classify(&self, crop: &Frame, conf_threshold: f32) -> Result<Option<PoseEstimate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("stub pose model unavailable"));
        }
        if crop.width == 0 || crop.height == 0 {
            return Err(anyhow!("empty crop"));
        }
        Ok(self
            .estimate
            .clone()
            .filter(|estimate| estimate.score >= conf_threshold))
    }
}
