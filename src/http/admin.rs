//! Management REST API.
//!
//! Mutations rewrite the configuration document, validate it into a fresh
//! registry snapshot, persist with a `.bak` of the previous contents, and
//! swap atomically. A request in flight keeps the snapshot it started with.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::clock::Window;
use crate::config::{ConfigFile, LimitConfig, ProviderConfig};
use crate::error::SwitchboardError;
use crate::health::HealthSnapshot;
use crate::persist;

use super::chat::error_response;
use super::AppState;

/// Provider as reported by the management API: configuration plus the live
/// health record.
#[derive(Serialize)]
struct ProviderView {
    #[serde(flatten)]
    config: ProviderConfig,
    health: HealthSnapshot,
}

fn provider_view(state: &AppState, config: ProviderConfig) -> ProviderView {
    let health = state.health.snapshot(&config.id);
    ProviderView { config, health }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token() else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"message": "admin token required", "type": "unauthorized"}})),
        )
            .into_response())
    }
}

pub async fn liveness(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "providers": state.health.snapshot_all(),
    }))
    .into_response()
}

pub async fn list_providers(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let views: Vec<ProviderView> = state
        .config()
        .providers
        .into_iter()
        .map(|config| provider_view(&state, config))
        .collect();
    Json(views).into_response()
}

pub async fn get_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    match state
        .config()
        .providers
        .into_iter()
        .find(|provider| provider.id == id)
    {
        Some(config) => Json(provider_view(&state, config)).into_response(),
        None => not_found(&id),
    }
}

pub async fn create_provider(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(provider): Json<ProviderConfig>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let mut config = state.config();
    if config.providers.iter().any(|p| p.id == provider.id) {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": {"message": format!("provider {} already exists", provider.id)}})),
        )
            .into_response();
    }
    config.providers.push(provider.clone());
    match state.apply_config(config, true) {
        Ok(()) => (StatusCode::CREATED, Json(provider)).into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(provider): Json<ProviderConfig>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    if provider.id != id {
        return error_response(&SwitchboardError::InvalidRequest(
            "provider id in body must match the path".to_string(),
        ));
    }
    let mut config = state.config();
    let Some(slot) = config.providers.iter_mut().find(|p| p.id == id) else {
        return not_found(&id);
    };
    let was_enabled = slot.enabled;
    *slot = provider.clone();
    match state.apply_config(config, true) {
        Ok(()) => {
            // A manual disable takes effect for requests already holding the
            // old snapshot too, via the shared health record.
            if was_enabled != provider.enabled {
                state.health.set_disabled(&id, !provider.enabled);
            }
            Json(provider).into_response()
        }
        Err(err) => error_response(&err),
    }
}

pub async fn delete_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let mut config = state.config();
    if !config.providers.iter().any(|p| p.id == id) {
        return not_found(&id);
    }
    if let Some(holder) = config
        .virtual_providers
        .iter()
        .find(|v| v.members.iter().any(|m| m.provider == id))
    {
        return error_response(&SwitchboardError::InvalidRequest(format!(
            "provider {id} is a member of virtual provider {}",
            holder.id
        )));
    }
    config.providers.retain(|p| p.id != id);
    config.limits.retain(|limit| limit.scope != id);
    match state.apply_config(config, true) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

pub async fn usage(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    Json(state.counters.export()).into_response()
}

#[derive(Deserialize)]
pub struct ResetRequest {
    scope: String,
    #[serde(default)]
    windows: Vec<Window>,
}

pub async fn reset_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(reset): Json<ResetRequest>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }

    // Accept either a canonical scope key or a bare provider/virtual id.
    let key = if reset.scope.contains(':') {
        reset.scope.clone()
    } else {
        let snapshot = state.registry.load();
        if snapshot.provider(&reset.scope).is_some() {
            format!("provider:{}", reset.scope)
        } else if snapshot.virtual_provider(&reset.scope).is_some() {
            format!("virtual:{}", reset.scope)
        } else {
            return not_found(&reset.scope);
        }
    };

    let windows = if reset.windows.is_empty() {
        Window::ALL.to_vec()
    } else {
        reset.windows.clone()
    };
    state.counters.reset(&key, &windows);
    Json(json!({"status": "ok", "scope": key})).into_response()
}

pub async fn get_limits(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    Json(state.config().limits).into_response()
}

pub async fn put_limits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(limits): Json<Vec<LimitConfig>>,
) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let mut config = state.config();
    config.limits = limits;
    match state.apply_config(config, true) {
        Ok(()) => Json(state.config().limits).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Reloads the configuration file from disk and swaps it in, the restart
/// the UI exposes. Without a configured path this re-applies the in-memory
/// document, which still resets derived state.
pub async fn restart(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = require_admin(&state, &headers) {
        return denied;
    }
    let reloaded: Result<ConfigFile, SwitchboardError> = match state.config_path() {
        Some(path) => persist::load_config(path),
        None => Ok(state.config()),
    };
    let config = match reloaded {
        Ok(config) => config,
        Err(err) => return error_response(&err),
    };
    match state.apply_config(config, false) {
        Ok(()) => Json(json!({"status": "restarted"})).into_response(),
        Err(err) => error_response(&err),
    }
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"message": format!("unknown: {id}"), "type": "not_found"}})),
    )
        .into_response()
}
