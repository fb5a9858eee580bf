use std::time::Duration;

use anyhow::{Context, Result};

use super::payload::DetectionPayload;

pub const AI_ANALYSIS_PATH: &str = "/detections/ai-analysis";

/// Delivers one payload to the downstream consumer.
///
/// Called from publisher pool threads, never from a stream worker.
pub trait EventTransport: Send + Sync {
    fn send(&self, payload: &DetectionPayload) -> Result<()>;
}

/// JSON-over-HTTP transport to `<base>/detections/ai-analysis`.
pub struct HttpTransport {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), AI_ANALYSIS_PATH),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl EventTransport for HttpTransport {
    fn send(&self, payload: &DetectionPayload) -> Result<()> {
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(payload)
            .with_context(|| format!("POST {} failed", self.endpoint))?;
        log::debug!(
            "HttpTransport: cctv{} delivered ({})",
            payload.cctv_id,
            response.status()
        );
        Ok(())
    }
}
