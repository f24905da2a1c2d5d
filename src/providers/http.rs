//! Remote HTTP upstream adapter.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::config::{HttpProviderConfig, ProbeConfig};
use crate::error::SwitchboardError;
use crate::types::ChatCompletionRequest;

use super::{ChunkStream, ProviderAdapter, UnaryReply, UpstreamFailure, UsageReport};

const MAX_ERROR_SNIPPET_BYTES: usize = 2 * 1024;

pub struct HttpProviderAdapter {
    config: HttpProviderConfig,
    client: reqwest::Client,
    completions_url: String,
}

impl HttpProviderAdapter {
    pub fn new(config: HttpProviderConfig) -> Result<Self, SwitchboardError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|err| {
                SwitchboardError::Config(format!("http client for {}: {err}", config.base_url))
            })?;
        let completions_url = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );
        Ok(Self {
            config,
            client,
            completions_url,
        })
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(auth) = &self.config.auth_header {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        for (name, value) in &self.config.headers {
            builder = builder.header(name, value);
        }
        builder
    }

    async fn post_once(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let builder = self.apply_headers(self.client.post(&self.completions_url).json(request));
        let response = builder.send().await.map_err(transport_failure)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = snippet(&response.text().await.unwrap_or_default());
        Err(classify_status(status.as_u16(), retry_after, body))
    }
}

#[async_trait]
impl ProviderAdapter for HttpProviderAdapter {
    async fn send_unary(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<UnaryReply, UpstreamFailure> {
        let mut attempt = 0u32;
        loop {
            let result = self.post_once(request).await;
            match result {
                Ok(response) => {
                    let body = response
                        .json::<crate::types::ChatCompletionResponse>()
                        .await
                        .map_err(|err| {
                            UpstreamFailure::Transient(format!("invalid upstream body: {err}"))
                        })?;
                    let usage = UsageReport::from_response(request, &body);
                    return Ok(UnaryReply {
                        response: body,
                        usage,
                    });
                }
                Err(failure @ UpstreamFailure::Transient(_)) if attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(
                        url = %self.completions_url,
                        attempt,
                        error = %failure,
                        "retrying transient upstream failure"
                    );
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn send_streaming(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, UpstreamFailure> {
        let mut attempt = 0u32;
        loop {
            // Retries stop the moment a stream is obtained; after that any
            // failure belongs to the caller's no-failover regime.
            match self.post_once(request).await {
                Ok(response) => {
                    let stream = response
                        .bytes_stream()
                        .map(|chunk| chunk.map_err(transport_failure))
                        .boxed();
                    return Ok(stream);
                }
                Err(failure @ UpstreamFailure::Transient(_)) if attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(
                        url = %self.completions_url,
                        attempt,
                        error = %failure,
                        "retrying transient upstream failure before stream"
                    );
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    async fn probe(&self) -> Result<(), UpstreamFailure> {
        let Some(probe) = &self.config.probe else {
            return Ok(());
        };
        let url = probe_url(&self.config.base_url, probe);
        let builder = self
            .apply_headers(self.client.get(&url))
            .timeout(Duration::from_secs(probe.timeout_seconds));
        let response = builder.send().await.map_err(transport_failure)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(UpstreamFailure::Transient(format!(
                "probe {url} returned {status}"
            )))
        }
    }
}

fn probe_url(base_url: &str, probe: &ProbeConfig) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        probe.path.trim_start_matches('/')
    )
}

fn transport_failure(err: reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        UpstreamFailure::Transient(format!("timeout: {err}"))
    } else {
        UpstreamFailure::Transient(format!("transport: {err}"))
    }
}

fn classify_status(status: u16, retry_after_seconds: Option<u64>, detail: String) -> UpstreamFailure {
    match status {
        401 | 403 => UpstreamFailure::Auth { status, detail },
        429 => UpstreamFailure::RateLimited {
            retry_after_seconds,
            detail,
        },
        400..=499 => UpstreamFailure::Request { status, detail },
        _ => UpstreamFailure::Transient(format!("status {status}: {detail}")),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Bounded copy of an upstream error body, safe to log.
fn snippet(body: &str) -> String {
    if body.len() <= MAX_ERROR_SNIPPET_BYTES {
        return body.to_string();
    }
    let mut end = MAX_ERROR_SNIPPET_BYTES;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses_into_failure_kinds() {
        assert!(matches!(
            classify_status(401, None, String::new()),
            UpstreamFailure::Auth { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(429, Some(7), String::new()),
            UpstreamFailure::RateLimited {
                retry_after_seconds: Some(7),
                ..
            }
        ));
        assert!(matches!(
            classify_status(422, None, String::new()),
            UpstreamFailure::Request { status: 422, .. }
        ));
        assert!(matches!(
            classify_status(503, None, String::new()),
            UpstreamFailure::Transient(_)
        ));
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_ERROR_SNIPPET_BYTES);
        let cut = snippet(&long);
        assert!(cut.len() <= MAX_ERROR_SNIPPET_BYTES + '…'.len_utf8());
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn probe_url_joins_without_duplicate_slashes() {
        let probe = ProbeConfig {
            path: "/models".to_string(),
            ..ProbeConfig::default()
        };
        assert_eq!(
            probe_url("http://up.example/v1/", &probe),
            "http://up.example/v1/models"
        );
    }
}
