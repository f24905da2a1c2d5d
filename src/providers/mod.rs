//! Uniform send-one-request interface over the two upstream kinds.
//!
//! Both adapters classify their failures so the dispatcher can decide
//! between failover, forced cooldown, and surfacing to the client without
//! knowing transport details.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::types::{estimate_tokens, ChatCompletionRequest, ChatCompletionResponse};

mod http;
mod local;

pub use http::HttpProviderAdapter;
pub use local::LocalProcessAdapter;

/// Raw upstream bytes, forwarded to the client verbatim in streaming mode.
pub type ChunkStream = BoxStream<'static, Result<Bytes, UpstreamFailure>>;

/// Classified upstream failure. Everything except `Request` permits moving
/// on to the next routing candidate.
#[derive(Clone, Debug, Error)]
pub enum UpstreamFailure {
    /// Network trouble, timeout, 5xx, or a crashed process. Drives failover
    /// and the failure-threshold state machine.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// 401/403 from upstream. Authentication does not self-repair, so the
    /// provider is cooled immediately regardless of threshold.
    #[error("upstream auth rejected ({status}): {detail}")]
    Auth { status: u16, detail: String },
    /// Upstream 429. Cooldown deadline is raised to any Retry-After hint.
    #[error("upstream rate limited: {detail}")]
    RateLimited {
        retry_after_seconds: Option<u64>,
        detail: String,
    },
    /// Upstream rejected the request itself (other 4xx). The client's
    /// problem, not the provider's: surfaced without failover.
    #[error("upstream rejected request ({status}): {detail}")]
    Request { status: u16, detail: String },
    /// The adapter cannot serve this call shape at all. Permits failover
    /// without penalizing provider health.
    #[error("unsupported by provider: {0}")]
    Unsupported(String),
}

impl UpstreamFailure {
    pub fn allows_failover(&self) -> bool {
        !matches!(self, UpstreamFailure::Request { .. })
    }
}

/// Token accounting for one completed request, extracted from the upstream
/// body or estimated at one token per four characters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated: bool,
}

impl UsageReport {
    pub fn from_response(
        request: &ChatCompletionRequest,
        response: &ChatCompletionResponse,
    ) -> Self {
        match response.usage {
            Some(usage) => Self {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                estimated: false,
            },
            None => Self {
                input_tokens: estimate_tokens(request.content_chars()),
                output_tokens: estimate_tokens(response.content_chars()),
                estimated: true,
            },
        }
    }
}

/// Full upstream response for the unary path.
#[derive(Clone, Debug)]
pub struct UnaryReply {
    pub response: ChatCompletionResponse,
    pub usage: UsageReport,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn send_unary(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<UnaryReply, UpstreamFailure>;

    /// Opens the upstream stream. A returned stream means headers were
    /// accepted upstream; the caller owns the first-chunk commit decision.
    async fn send_streaming(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamFailure>;

    /// Out-of-band liveness probe. Feeds the health state machine only.
    async fn probe(&self) -> Result<(), UpstreamFailure>;
}
