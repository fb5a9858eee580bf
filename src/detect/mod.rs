//! Inference capabilities and the adapter that normalizes their output.

mod adapter;
mod backend;
mod backends;
mod result;

pub use adapter::{InferenceAdapter, InferencePass, SharedDetector, SharedPoseClassifier};
pub use backend::{ObjectDetector, PoseClassifier};
#[cfg(feature = "backend-http")]
pub use backends::HttpDetector;
pub use backends::{StubDetector, StubPoseClassifier};
pub use result::{
    BoundingBox, DetectionRecord, DetectionSummary, PoseEstimate, CLASS_FIRE, CLASS_HUMAN,
    CLASS_SMOKE,
};
