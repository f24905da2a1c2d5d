//! Inbound chat-completion handling.

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::dispatch::DispatchReply;
use crate::error::SwitchboardError;
use crate::types::ChatCompletionRequest;

use super::AppState;

const PROVIDER_HEADER: &str = "x-provider-id";
const SERVED_BY_HEADER: &str = "x-switchboard-provider";

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, headers, None, body).await
}

pub async fn completions_for_provider(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state, headers, Some(provider), body).await
}

async fn handle(
    state: AppState,
    headers: HeaderMap,
    path_provider: Option<String>,
    body: Bytes,
) -> Response {
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(&SwitchboardError::InvalidRequest(format!(
                "malformed body: {err}"
            )))
        }
    };
    if request.model.is_empty() {
        return error_response(&SwitchboardError::InvalidRequest(
            "model must not be empty".to_string(),
        ));
    }
    if request.messages.is_empty() {
        return error_response(&SwitchboardError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    // Path prefix and header selection behave identically; the path wins
    // when both are present.
    let selector = path_provider.or_else(|| {
        headers
            .get(PROVIDER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });
    let bearer_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match state
        .dispatcher
        .dispatch(request, selector.as_deref(), bearer_token)
        .await
    {
        Ok(DispatchReply::Unary {
            provider_id,
            response,
        }) => (
            [(SERVED_BY_HEADER, provider_id)],
            Json(response),
        )
            .into_response(),
        Ok(DispatchReply::Streaming(committed)) => {
            let mut response = Response::new(Body::from_stream(committed.stream));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(
                header::CACHE_CONTROL,
                header::HeaderValue::from_static("no-cache"),
            );
            if let Ok(value) = header::HeaderValue::from_str(&committed.provider_id) {
                headers.insert(SERVED_BY_HEADER, value);
            }
            response
        }
        Err(err) => error_response(&err),
    }
}

/// Vendor-neutral error body, the shape clients of the completion API
/// already parse.
pub(super) fn error_response(err: &SwitchboardError) -> Response {
    let (status, kind) = match err {
        SwitchboardError::InvalidRequest(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request_error")
        }
        SwitchboardError::LimitExceeded { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded")
        }
        SwitchboardError::NoProviderAvailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
        }
        SwitchboardError::UpstreamExhausted { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
        SwitchboardError::UpstreamRequest { status, .. } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
            "invalid_request_error",
        ),
        SwitchboardError::StreamInterrupted { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
        SwitchboardError::Config(_) | SwitchboardError::Io(_) | SwitchboardError::Json(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "api_error")
        }
    };

    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": kind,
            "code": status.as_u16(),
        }
    });
    (status, Json(body)).into_response()
}
