pub mod stub;

#[cfg(feature = "backend-http")]
pub mod http;

pub use stub::{StubDetector, StubPoseClassifier};

#[cfg(feature = "backend-http")]
pub use http::HttpDetector;
