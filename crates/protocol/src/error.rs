use thiserror::Error;

#[derive(Debug, Error)]
pub enum LegisError {
    #[error("fixture replay miss: {0}")]
    FixtureMiss(String),
    #[error("retries exhausted for {url}: last status {status}")]
    RetriesExhausted { url: String, status: u16 },
    #[error("fan-out timed out after {0:.1}s")]
    FanOutTimeout(f64),
    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("not found: {0}")]
    NotFound(String),
}
