//! On-disk configuration shapes.
//!
//! One JSON document with three top-level keys (`providers`,
//! `virtual_providers`, `limits`) describes the whole routing surface. The
//! registry turns a parsed document into an immutable snapshot; this module
//! only defines the shapes and their serde behavior.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::clock::Window;
use crate::health::CooldownPolicy;
use crate::limits::Severity;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub virtual_providers: Vec<VirtualProviderConfig>,
    #[serde(default)]
    pub limits: Vec<LimitConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub kind: ProviderKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Model names that resolve to this provider in addition to its id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingConfig>,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub cooldown: CooldownPolicy,
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderKind {
    Http(HttpProviderConfig),
    Local(LocalProviderConfig),
}

impl std::fmt::Debug for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Http(config) => f.debug_tuple("Http").field(config).finish(),
            ProviderKind::Local(config) => f.debug_tuple("Local").field(config).finish(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// Upstream base URL including the version segment, e.g.
    /// `https://api.example.com/v1`.
    pub base_url: String,
    /// Full `Authorization` header value sent upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Same-provider retries of transient failures within one routing
    /// attempt. Never applied once a stream has been obtained.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeConfig>,
}

fn default_timeout_seconds() -> u64 {
    300
}

impl std::fmt::Debug for HttpProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderConfig")
            .field("base_url", &self.base_url)
            .field("auth_header", &self.auth_header.as_ref().map(|_| "<redacted>"))
            .field("headers", &"<redacted>")
            .field("timeout_seconds", &self.timeout_seconds)
            .field("retries", &self.retries)
            .field("probe", &self.probe)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalProviderConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_process_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Cadence of the executable liveness check.
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
}

fn default_process_timeout_seconds() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_probe_path() -> String {
    "/models".to_string()
}

fn default_probe_interval_seconds() -> u64 {
    10
}

fn default_probe_timeout_seconds() -> u64 {
    2
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: default_probe_path(),
            interval_seconds: default_probe_interval_seconds(),
            timeout_seconds: default_probe_timeout_seconds(),
        }
    }
}

/// Price catalog entry: USD per million tokens, converted to integer
/// micro-USD by the registry at apply time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    pub input_usd_per_million: f64,
    pub output_usd_per_million: f64,
}

fn default_currency() -> String {
    "usd".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// At least two members; lower priority number is preferred.
    pub members: Vec<VirtualMember>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VirtualMember {
    pub provider: String,
    pub priority: i32,
}

/// A configured limit. `scope` names a base or virtual provider by id; the
/// registry resolves it to the canonical scope key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitConfig {
    pub scope: String,
    pub window: Window,
    pub metric: ConfigMetric,
    /// Metric units; for `cost`, micro-USD.
    pub threshold: u64,
    #[serde(default)]
    pub severity: Severity,
}

/// Configured metric. `Cost` is converted into a derived total-token rule at
/// apply time and never evaluated directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigMetric {
    Requests,
    InputTokens,
    OutputTokens,
    TotalTokens,
    Cost,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_http_provider() {
        let raw = r#"{
            "providers": [{
                "id": "openai",
                "kind": "http",
                "base_url": "https://api.openai.com/v1"
            }]
        }"#;
        let config: ConfigFile = serde_json::from_str(raw).unwrap();
        assert_eq!(config.providers.len(), 1);
        let provider = &config.providers[0];
        assert!(provider.enabled);
        assert_eq!(provider.failure_threshold, 3);
        match &provider.kind {
            ProviderKind::Http(http) => {
                assert_eq!(http.timeout_seconds, 300);
                assert_eq!(http.retries, 0);
            }
            other => panic!("expected http provider, got {other:?}"),
        }
    }

    #[test]
    fn parses_local_provider_and_cooldown_strategy() {
        let raw = r#"{
            "providers": [{
                "id": "llama",
                "kind": "local",
                "command": "/usr/local/bin/llama-cli",
                "args": ["--json"],
                "max_concurrent": 2,
                "cooldown": {"strategy": "exponential", "base_seconds": 1, "cap_seconds": 60}
            }]
        }"#;
        let config: ConfigFile = serde_json::from_str(raw).unwrap();
        let provider = &config.providers[0];
        assert!(matches!(provider.kind, ProviderKind::Local(_)));
        assert!(matches!(
            provider.cooldown,
            CooldownPolicy::Exponential {
                base_seconds: 1,
                cap_seconds: 60
            }
        ));
    }

    #[test]
    fn debug_redacts_auth_material() {
        let http = HttpProviderConfig {
            base_url: "https://api.example.com/v1".to_string(),
            auth_header: Some("Bearer sk-secret".to_string()),
            headers: BTreeMap::from([("x-api-key".to_string(), "secret".to_string())]),
            timeout_seconds: 30,
            retries: 0,
            probe: None,
        };
        let rendered = format!("{http:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn limit_severity_defaults_to_hard() {
        let raw = r#"{"scope": "a", "window": "minute", "metric": "requests", "threshold": 10}"#;
        let limit: LimitConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(limit.severity, Severity::Hard);
        assert_eq!(limit.metric, ConfigMetric::Requests);
    }

    #[test]
    fn config_round_trips_through_pretty_json() {
        let config = ConfigFile {
            providers: vec![ProviderConfig {
                id: "a".to_string(),
                display_name: "Provider A".to_string(),
                kind: ProviderKind::Http(HttpProviderConfig {
                    base_url: "http://localhost:9000/v1".to_string(),
                    auth_header: None,
                    headers: BTreeMap::new(),
                    timeout_seconds: 30,
                    retries: 1,
                    probe: Some(ProbeConfig::default()),
                }),
                enabled: true,
                models: vec!["gpt-test".to_string()],
                pricing: Some(PricingConfig {
                    currency: "usd".to_string(),
                    input_usd_per_million: 3.0,
                    output_usd_per_million: 15.0,
                }),
                failure_threshold: 3,
                cooldown: CooldownPolicy::default(),
            }],
            virtual_providers: vec![VirtualProviderConfig {
                id: "v".to_string(),
                display_name: String::new(),
                members: vec![
                    VirtualMember {
                        provider: "a".to_string(),
                        priority: 1,
                    },
                    VirtualMember {
                        provider: "b".to_string(),
                        priority: 2,
                    },
                ],
                models: Vec::new(),
            }],
            limits: vec![LimitConfig {
                scope: "a".to_string(),
                window: Window::Minute,
                metric: ConfigMetric::Requests,
                threshold: 10,
                severity: Severity::Hard,
            }],
        };

        let pretty = serde_json::to_string_pretty(&config).unwrap();
        let reparsed: ConfigFile = serde_json::from_str(&pretty).unwrap();
        assert_eq!(reparsed.providers[0].id, "a");
        assert_eq!(reparsed.virtual_providers[0].members.len(), 2);
        assert_eq!(reparsed.limits[0].threshold, 10);
    }
}
