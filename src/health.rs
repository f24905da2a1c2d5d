//! Per-provider health tracking and cooldown scheduling.
//!
//! Each base provider owns a small state machine: consecutive failures
//! degrade it, crossing the failure threshold starts a cooldown, and expiry
//! re-admits it on probation — one more failure re-enters cooldown with the
//! failure count retained so exponential backoff keeps growing, while a
//! single success clears everything.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Cooling,
    Disabled,
}

/// Cooldown scheduling strategy. Exponential doubles from `base_seconds`
/// for every failure past the threshold, capped at `cap_seconds`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum CooldownPolicy {
    Fixed { seconds: u64 },
    Exponential { base_seconds: u64, cap_seconds: u64 },
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        CooldownPolicy::Fixed { seconds: 30 }
    }
}

impl CooldownPolicy {
    /// Cooldown span for the given consecutive-failure count.
    fn span_seconds(&self, consecutive_failures: u32, failure_threshold: u32) -> u64 {
        match *self {
            CooldownPolicy::Fixed { seconds } => seconds,
            CooldownPolicy::Exponential {
                base_seconds,
                cap_seconds,
            } => {
                let exponent = consecutive_failures
                    .saturating_sub(failure_threshold)
                    .min(32);
                let grown = base_seconds.saturating_mul(1u64 << exponent);
                grown.min(cap_seconds)
            }
        }
    }
}

/// Per-provider failure policy, carried by the registry and passed in with
/// each event so the controller itself stays configuration-free.
#[derive(Clone, Copy, Debug)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub cooldown: CooldownPolicy,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: CooldownPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProviderHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub cooldown_until: Option<u64>,
    /// Set while re-admitted after a cooldown expired; the next failure
    /// re-enters cooldown immediately.
    pub probation: bool,
    pub last_probe_epoch_seconds: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            cooldown_until: None,
            probation: false,
            last_probe_epoch_seconds: None,
            last_error: None,
        }
    }
}

impl ProviderHealth {
    /// Cooling with an expired deadline becomes healthy-on-probation. The
    /// failure count is retained so backoff growth survives the promotion.
    fn promote_if_expired(&mut self, now: u64) {
        if self.state != HealthState::Cooling {
            return;
        }
        match self.cooldown_until {
            Some(until) if now >= until => {
                self.state = HealthState::Healthy;
                self.cooldown_until = None;
                self.probation = true;
            }
            _ => {}
        }
    }

    fn apply_success(&mut self, now: u64) {
        if self.state == HealthState::Disabled {
            return;
        }
        self.promote_if_expired(now);
        if self.state == HealthState::Cooling {
            // Still inside the cooldown deadline: ignored.
            return;
        }
        self.state = HealthState::Healthy;
        self.consecutive_failures = 0;
        self.probation = false;
        self.cooldown_until = None;
        self.last_error = None;
    }

    fn apply_failure(&mut self, now: u64, policy: &HealthPolicy, error: &str) {
        if self.state == HealthState::Disabled {
            return;
        }
        self.promote_if_expired(now);
        self.last_error = Some(error.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let enter_cooldown = match self.state {
            // Deadline extended per policy for failures observed mid-cooldown.
            HealthState::Cooling => true,
            _ => self.probation || self.consecutive_failures >= policy.failure_threshold,
        };

        if enter_cooldown {
            self.state = HealthState::Cooling;
            self.probation = false;
            let span = policy
                .cooldown
                .span_seconds(self.consecutive_failures, policy.failure_threshold);
            self.cooldown_until = Some(now.saturating_add(span));
        } else {
            self.state = HealthState::Degraded;
        }
    }

    /// Immediate cooldown regardless of threshold, used for upstream auth
    /// rejections and upstream rate-limit signals. `min_until` raises the
    /// deadline to honor a Retry-After hint.
    fn apply_forced_cooldown(
        &mut self,
        now: u64,
        policy: &HealthPolicy,
        min_until: Option<u64>,
        error: &str,
    ) {
        if self.state == HealthState::Disabled {
            return;
        }
        self.promote_if_expired(now);
        self.last_error = Some(error.to_string());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = HealthState::Cooling;
        self.probation = false;
        let span = policy
            .cooldown
            .span_seconds(self.consecutive_failures, policy.failure_threshold);
        let mut until = now.saturating_add(span);
        if let Some(min_until) = min_until {
            until = until.max(min_until);
        }
        self.cooldown_until = Some(until);
    }

    fn eligible(&mut self, now: u64) -> bool {
        self.promote_if_expired(now);
        matches!(self.state, HealthState::Healthy | HealthState::Degraded)
    }
}

/// Wire-friendly copy for the management surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub provider_id: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until_epoch_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_epoch_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct HealthController {
    clock: Arc<dyn Clock>,
    records: RwLock<HashMap<String, Arc<Mutex<ProviderHealth>>>>,
}

impl HealthController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: RwLock::new(HashMap::new()),
        }
    }

    fn record_cell(&self, provider_id: &str) -> Arc<Mutex<ProviderHealth>> {
        if let Some(cell) = self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider_id)
        {
            return Arc::clone(cell);
        }
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            records
                .entry(provider_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::default()))),
        )
    }

    /// Whether the provider may be selected right now. Promotes an expired
    /// cooldown to healthy-on-probation as a side effect.
    pub fn is_eligible(&self, provider_id: &str) -> bool {
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.eligible(self.clock.now_epoch_seconds())
    }

    pub fn on_success(&self, provider_id: &str) {
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.apply_success(self.clock.now_epoch_seconds());
    }

    pub fn on_failure(&self, provider_id: &str, policy: &HealthPolicy, error: &str) {
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.apply_failure(self.clock.now_epoch_seconds(), policy, error);
    }

    pub fn force_cooldown(
        &self,
        provider_id: &str,
        policy: &HealthPolicy,
        min_until_epoch_seconds: Option<u64>,
        error: &str,
    ) {
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.apply_forced_cooldown(
            self.clock.now_epoch_seconds(),
            policy,
            min_until_epoch_seconds,
            error,
        );
    }

    /// Manual disable removes the provider from rotation until re-enabled;
    /// re-enabling starts from a clean healthy record.
    pub fn set_disabled(&self, provider_id: &str, disabled: bool) {
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        if disabled {
            health.state = HealthState::Disabled;
            health.cooldown_until = None;
            health.probation = false;
        } else if health.state == HealthState::Disabled {
            *health = ProviderHealth::default();
        }
    }

    /// Probe outcomes feed the state machine like request outcomes but are
    /// never reflected in usage counters.
    pub fn on_probe(&self, provider_id: &str, policy: &HealthPolicy, result: Result<(), String>) {
        let now = self.clock.now_epoch_seconds();
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.last_probe_epoch_seconds = Some(now);
        match result {
            Ok(()) => health.apply_success(now),
            Err(error) => health.apply_failure(now, policy, &error),
        }
    }

    pub fn last_probe_epoch_seconds(&self, provider_id: &str) -> Option<u64> {
        let cell = self.record_cell(provider_id);
        let health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.last_probe_epoch_seconds
    }

    pub fn snapshot(&self, provider_id: &str) -> HealthSnapshot {
        let cell = self.record_cell(provider_id);
        let mut health = cell.lock().unwrap_or_else(|e| e.into_inner());
        health.promote_if_expired(self.clock.now_epoch_seconds());
        HealthSnapshot {
            provider_id: provider_id.to_string(),
            state: health.state,
            consecutive_failures: health.consecutive_failures,
            cooldown_until_epoch_seconds: health.cooldown_until,
            last_probe_epoch_seconds: health.last_probe_epoch_seconds,
            last_error: health.last_error.clone(),
        }
    }

    pub fn snapshot_all(&self) -> BTreeMap<String, HealthSnapshot> {
        let ids: Vec<String> = {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            records.keys().cloned().collect()
        };
        ids.into_iter()
            .map(|id| {
                let snapshot = self.snapshot(&id);
                (id, snapshot)
            })
            .collect()
    }

    /// Drops records for providers that no longer exist. A record is kept
    /// while any live registry snapshot can still reference the provider.
    pub fn retain(&self, provider_ids: &std::collections::HashSet<String>) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.retain(|id, _| provider_ids.contains(id));
    }
}
