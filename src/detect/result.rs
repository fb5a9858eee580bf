use serde::{Deserialize, Serialize};

/// Class label that counts toward `fire_count`.
pub const CLASS_FIRE: &str = "fire";
/// Class label that counts toward `human_count`.
pub const CLASS_HUMAN: &str = "human";
/// Class label that counts toward `smoke_count`.
pub const CLASS_SMOKE: &str = "smoke";

/// Axis-aligned box in source-frame pixel coordinates.
///
/// Detectors may report boxes that extend past the frame or are inverted;
/// call [`BoundingBox::clamp_to`] before using a box to address pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Signed width; zero or negative for degenerate boxes.
    pub fn width(&self) -> i64 {
        i64::from(self.x2) - i64::from(self.x1)
    }

    /// Signed height; zero or negative for degenerate boxes.
    pub fn height(&self) -> i64 {
        i64::from(self.y2) - i64::from(self.y1)
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    /// Clamp every coordinate into `[0, width] x [0, height]`.
    ///
    /// Inverted boxes stay inverted, so the result is degenerate exactly when
    /// no pixel of the frame lies inside the box.
    pub fn clamp_to(&self, width: u32, height: u32) -> BoundingBox {
        let max_x = i32::try_from(width).unwrap_or(i32::MAX);
        let max_y = i32::try_from(height).unwrap_or(i32::MAX);
        BoundingBox {
            x1: self.x1.clamp(0, max_x),
            y1: self.y1.clamp(0, max_y),
            x2: self.x2.clamp(0, max_x),
            y2: self.y2.clamp(0, max_y),
        }
    }
}

/// One normalized detection.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub class_name: String,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub pose: Option<String>,
    pub pose_score: Option<f32>,
}

impl DetectionRecord {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
            pose: None,
            pose_score: None,
        }
    }

    pub fn with_pose(mut self, pose: PoseEstimate) -> Self {
        self.pose = Some(pose.label);
        self.pose_score = Some(pose.score);
        self
    }
}

/// Secondary classification of a subject crop.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseEstimate {
    pub label: String,
    pub score: f32,
}

/// Per-pass counts by class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DetectionSummary {
    pub fire_count: u32,
    pub human_count: u32,
    pub smoke_count: u32,
    pub total_objects: u32,
}

impl DetectionSummary {
    pub fn from_records(records: &[DetectionRecord]) -> Self {
        let mut summary = DetectionSummary::default();
        for record in records {
            match record.class_name.as_str() {
                CLASS_FIRE => summary.fire_count += 1,
                CLASS_HUMAN => summary.human_count += 1,
                CLASS_SMOKE => summary.smoke_count += 1,
                _ => {}
            }
            summary.total_objects += 1;
        }
        summary
    }
}
