use serde::Serialize;

use crate::detect::{BoundingBox, DetectionRecord, DetectionSummary};

/// Body of one `POST /detections/ai-analysis` request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionPayload {
    pub ai_result: AiResult,
    pub cctv_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<i64>,
    pub video_url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiResult {
    pub image_path: Option<String>,
    pub detections: Vec<PayloadDetection>,
    pub summary: PayloadSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadDetection {
    pub class_name: String,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pose_score: Option<f64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSummary {
    pub fire_count: u32,
    pub human_count: u32,
    pub smoke_count: u32,
    pub total_objects: u32,
}

impl From<DetectionSummary> for PayloadSummary {
    fn from(summary: DetectionSummary) -> Self {
        Self {
            fire_count: summary.fire_count,
            human_count: summary.human_count,
            smoke_count: summary.smoke_count,
            total_objects: summary.total_objects,
        }
    }
}

impl From<&DetectionRecord> for PayloadDetection {
    fn from(record: &DetectionRecord) -> Self {
        Self {
            class_name: record.class_name.clone(),
            confidence: json_number(record.confidence),
            bbox: record.bbox,
            pose: record.pose.clone(),
            pose_score: record.pose_score.map(json_number),
        }
    }
}

impl DetectionPayload {
    pub fn new(
        cctv_id: u32,
        location_id: Option<i64>,
        video_url: String,
        records: &[DetectionRecord],
        summary: DetectionSummary,
    ) -> Self {
        Self {
            ai_result: AiResult {
                image_path: None,
                detections: records.iter().map(PayloadDetection::from).collect(),
                summary: summary.into(),
            },
            cctv_id,
            location_id,
            video_url,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Plain JSON number for a model score: widened, rounded to 4 places, and
/// non-finite values mapped to 0 (JSON has no NaN).
fn json_number(value: f32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (f64::from(value) * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PoseEstimate;
    use serde_json::{json, Value};

    #[test]
    fn payload_matches_downstream_shape() -> anyhow::Result<()> {
        let records = vec![
            DetectionRecord::new("human", 0.9, BoundingBox::new(1, 2, 3, 4)).with_pose(
                PoseEstimate {
                    label: "Standing".to_string(),
                    score: 0.8,
                },
            ),
            DetectionRecord::new("fire", 0.5, BoundingBox::new(5, 6, 7, 8)),
        ];
        let summary = DetectionSummary::from_records(&records);
        let payload = DetectionPayload::new(
            2,
            Some(7),
            "http://cdn/streams/cctv2/playlist.m3u8".to_string(),
            &records,
            summary,
        );
        let value: Value = serde_json::from_str(&payload.to_json()?)?;
        assert_eq!(
            value,
            json!({
                "aiResult": {
                    "imagePath": null,
                    "detections": [
                        {"className": "human", "confidence": 0.9,
                         "box": {"x1": 1, "y1": 2, "x2": 3, "y2": 4},
                         "pose": "Standing", "poseScore": 0.8},
                        {"className": "fire", "confidence": 0.5,
                         "box": {"x1": 5, "y1": 6, "x2": 7, "y2": 8}}
                    ],
                    "summary": {"fireCount": 1, "humanCount": 1, "smokeCount": 0, "totalObjects": 2}
                },
                "cctvId": 2,
                "locationId": 7,
                "videoUrl": "http://cdn/streams/cctv2/playlist.m3u8"
            })
        );
        Ok(())
    }

    #[test]
    fn missing_location_is_omitted() -> anyhow::Result<()> {
        let payload = DetectionPayload::new(
            1,
            None,
            "u".to_string(),
            &[],
            DetectionSummary::default(),
        );
        let value: Value = serde_json::from_str(&payload.to_json()?)?;
        assert!(value.get("locationId").is_none());
        Ok(())
    }

    #[test]
    fn scores_become_plain_numbers() {
        assert_eq!(json_number(f32::NAN), 0.0);
        assert_eq!(json_number(f32::INFINITY), 0.0);
        assert_eq!(json_number(0.123456), 0.1235);
    }
}
