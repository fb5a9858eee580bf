use anyhow::Result;

use crate::frame::Frame;

use super::result::{DetectionRecord, PoseEstimate};

/// Object detector capability.
///
/// One detector is shared by every worker and may be called from several
/// threads at once, so calls take `&self`. Implementations treat the frame as
/// read-only and must not retain it past the call. Boxes are reported in the
/// frame's pixel coordinates and may be out of range; the adapter clamps them.
pub trait ObjectDetector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect objects with confidence at or above `conf_threshold`.
    fn detect(&self, frame: &Frame, conf_threshold: f32) -> Result<Vec<DetectionRecord>>;

    /// True when [`ObjectDetector::detect_with_pose`] fills pose fields itself.
    fn reports_pose(&self) -> bool {
        false
    }

    /// Detect and classify subject pose in one call.
    fn detect_with_pose(
        &self,
        frame: &Frame,
        conf_threshold: f32,
        _pose_conf_threshold: f32,
    ) -> Result<Vec<DetectionRecord>> {
        self.detect(frame, conf_threshold)
    }
}

/// Pose classifier capability applied to a subject crop.
pub trait PoseClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Classify a crop. `Ok(None)` means no pose cleared `conf_threshold`.
    fn classify(&self, crop: &Frame, conf_threshold: f32) -> Result<Option<PoseEstimate>>;
}
