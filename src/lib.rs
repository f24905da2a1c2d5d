//! Routing proxy for OpenAI-compatible chat completions.
//!
//! Every incoming request is resolved to exactly one upstream provider by a
//! priority-ordered fallback policy, dispatched (unary or streaming), and
//! accounted against every scope that owns it, with layered minute/day/month
//! limits and a per-provider health/cooldown state machine deciding who is
//! in rotation.

pub mod clock;
pub mod config;
pub mod costing;
pub mod counters;
pub mod dispatch;
mod error;
pub mod health;
pub mod http;
pub mod limits;
pub mod persist;
pub mod probe;
pub mod providers;
pub mod registry;
pub mod router;
pub mod types;
pub mod utils;

pub use clock::{Clock, SystemClock, Window};
pub use config::{
    ConfigFile, ConfigMetric, HttpProviderConfig, LimitConfig, LocalProviderConfig, PricingConfig,
    ProbeConfig, ProviderConfig, ProviderKind, VirtualMember, VirtualProviderConfig,
};
pub use counters::{CounterStore, Scope, UsageDelta, UsageSnapshot};
pub use dispatch::{DispatchReply, Dispatcher};
pub use error::{Result, SwitchboardError};
pub use health::{CooldownPolicy, HealthController, HealthPolicy, HealthSnapshot, HealthState};
pub use http::{router, AppState};
pub use limits::{Decision, LimitRule, Metric, Severity};
pub use providers::{ProviderAdapter, UnaryReply, UpstreamFailure, UsageReport};
pub use registry::{Registry, RegistrySnapshot};
pub use types::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, UsageInfo,
};
