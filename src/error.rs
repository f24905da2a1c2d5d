use thiserror::Error;

use crate::clock::Window;

/// Errors that surface to the client or the operator. Transient upstream
/// failures (timeouts, 5xx, auth rejections, rate limiting) are handled
/// inside the dispatcher's failover loop and only appear here once every
/// candidate has been exhausted.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no provider available: {reason}")]
    NoProviderAvailable { reason: String },
    #[error("all {attempts} upstream attempts failed: {last_error}")]
    UpstreamExhausted { attempts: usize, last_error: String },
    #[error("hard limit exceeded on {scope} ({window}): {detail}")]
    LimitExceeded {
        scope: String,
        window: Window,
        detail: String,
    },
    #[error("upstream rejected request ({status}): {detail}")]
    UpstreamRequest { status: u16, detail: String },
    #[error("stream interrupted after {bytes_sent} bytes: {detail}")]
    StreamInterrupted { bytes_sent: u64, detail: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
