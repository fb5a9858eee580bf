use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::frame::Frame;

use super::backend::{ObjectDetector, PoseClassifier};
use super::result::{DetectionRecord, DetectionSummary, PoseEstimate, CLASS_HUMAN};

/// Detector shared by every worker. Calls are not serialized.
pub type SharedDetector = Arc<dyn ObjectDetector>;
pub type SharedPoseClassifier = Arc<dyn PoseClassifier>;

/// Output of one inference pass over a frame.
#[derive(Clone, Debug, Default)]
pub struct InferencePass {
    /// Records with boxes clamped to the frame.
    pub records: Vec<DetectionRecord>,
    pub summary: DetectionSummary,
    /// Pose label counts among subject records.
    pub pose_counts: BTreeMap<String, u32>,
    /// True when at least one subject record has a non-degenerate box.
    pub subject_present: bool,
}

/// Calls the detector and pose classifier and normalizes their output.
///
/// Failures never abort a pass: a detector error yields an empty pass and a
/// pose error leaves the affected record without pose fields.
///
/// With a separate pose classifier every subject crop is sent to it.
/// Without one, a detector that reports pose itself is asked for both in a
/// single call.
#[derive(Clone)]
pub struct InferenceAdapter {
    detector: SharedDetector,
    pose: Option<SharedPoseClassifier>,
    subject_class: String,
}

impl InferenceAdapter {
    pub fn new<D: ObjectDetector + 'static>(detector: D) -> Self {
        Self::from_shared(Arc::new(detector), None)
    }

    pub fn from_shared(detector: SharedDetector, pose: Option<SharedPoseClassifier>) -> Self {
        Self {
            detector,
            pose,
            subject_class: CLASS_HUMAN.to_string(),
        }
    }

    pub fn with_pose_classifier<P: PoseClassifier + 'static>(mut self, classifier: P) -> Self {
        self.pose = Some(Arc::new(classifier));
        self
    }

    /// Class eligible for pose classification (default `human`).
    pub fn with_subject_class(mut self, class: impl Into<String>) -> Self {
        self.subject_class = class.into();
        self
    }

    pub fn subject_class(&self) -> &str {
        &self.subject_class
    }

    /// Backends in use, for startup logs.
    pub fn describe(&self) -> String {
        let pose = match &self.pose {
            Some(classifier) => classifier.name(),
            None if self.detector.reports_pose() => self.detector.name(),
            None => "none",
        };
        format!(
            "detector={} pose={} subject={}",
            self.detector.name(),
            pose,
            self.subject_class
        )
    }

    pub fn detect(&self, frame: &Frame, conf_threshold: f32) -> Result<Vec<DetectionRecord>> {
        self.detector.detect(frame, conf_threshold)
    }

    pub fn classify_pose(&self, crop: &Frame, conf_threshold: f32) -> Result<Option<PoseEstimate>> {
        match &self.pose {
            Some(classifier) => classifier.classify(crop, conf_threshold),
            None => Ok(None),
        }
    }

    fn combined_pose(&self) -> bool {
        self.pose.is_none() && self.detector.reports_pose()
    }

    /// Run one full pass: detect, clamp, then classify pose for each subject.
    pub fn analyze(&self, frame: &Frame, det_conf: f32, pose_conf: f32) -> InferencePass {
        let combined = self.combined_pose();
        let detected = if combined {
            self.detector.detect_with_pose(frame, det_conf, pose_conf)
        } else {
            self.detect(frame, det_conf)
        };
        let detected = match detected {
            Ok(records) => records,
            Err(err) => {
                log::warn!("InferenceAdapter: detection failed: {:#}", err);
                return InferencePass::default();
            }
        };

        let mut pass = InferencePass::default();
        for mut record in detected {
            record.bbox = record.bbox.clamp_to(frame.width, frame.height);
            let reported = match (record.pose.take(), record.pose_score.take()) {
                (Some(label), Some(score)) if combined => Some(PoseEstimate { label, score }),
                _ => None,
            };
            if record.class_name == self.subject_class && !record.bbox.is_degenerate() {
                pass.subject_present = true;
                let estimate = if combined {
                    reported
                } else {
                    self.pose_for(frame, &record, pose_conf)
                };
                if let Some(estimate) = estimate {
                    *pass.pose_counts.entry(estimate.label.clone()).or_insert(0) += 1;
                    record = record.with_pose(estimate);
                }
            }
            pass.records.push(record);
        }
        pass.summary = DetectionSummary::from_records(&pass.records);
        pass
    }

    fn pose_for(
        &self,
        frame: &Frame,
        record: &DetectionRecord,
        pose_conf: f32,
    ) -> Option<PoseEstimate> {
        self.pose.as_ref()?;
        let bbox = record.bbox;
        // Clamped and non-degenerate, so every coordinate is in range.
        let crop = frame.crop(
            bbox.x1 as u32,
            bbox.y1 as u32,
            bbox.width() as u32,
            bbox.height() as u32,
        );
        let result = crop.and_then(|crop| self.classify_pose(&crop, pose_conf));
        match result {
            Ok(estimate) => estimate,
            Err(err) => {
                log::warn!("InferenceAdapter: pose classification failed: {:#}", err);
                None
            }
        }
    }
}
