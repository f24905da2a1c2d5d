//! Pure limit evaluation over a scope's rolled-forward counters.
//!
//! Pre-flight checks project the request count by one and compare token and
//! cost metrics at their already-accumulated values, since a request's token
//! usage is unknown until the upstream call returns. Token and cost limits
//! crossed by the completed request are caught post-flight and push the
//! serving provider into cooldown instead of rolling anything back.

use serde::{Deserialize, Serialize};

use crate::clock::Window;
use crate::counters::{CounterBucket, ScopeCounters};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    Requests,
    InputTokens,
    OutputTokens,
    TotalTokens,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Requests => "requests",
            Metric::InputTokens => "input-tokens",
            Metric::OutputTokens => "output-tokens",
            Metric::TotalTokens => "total-tokens",
        }
    }

    fn observed(&self, bucket: &CounterBucket) -> u64 {
        match self {
            Metric::Requests => bucket.requests,
            Metric::InputTokens => bucket.input_tokens,
            Metric::OutputTokens => bucket.output_tokens,
            Metric::TotalTokens => bucket.total_tokens(),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Hard,
    Soft,
}

/// A limit ready for evaluation. Cost limits from configuration have already
/// been converted into derived total-token rules by the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitRule {
    pub scope_key: String,
    pub window: Window,
    pub metric: Metric,
    pub threshold: u64,
    #[serde(default)]
    pub severity: Severity,
    /// Set when this rule was derived from a cost limit; kept for log and
    /// error detail so operators see the original intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from_cost_usd_micros: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LimitBreach {
    pub scope_key: String,
    pub window: Window,
    pub metric: Metric,
    pub threshold: u64,
    pub observed: u64,
    pub severity: Severity,
}

impl LimitBreach {
    pub fn detail(&self) -> String {
        format!(
            "{} {} {}: {} >= {}",
            self.scope_key, self.window, self.metric, self.observed, self.threshold
        )
    }
}

#[derive(Clone, Debug)]
pub enum Decision {
    Admit,
    AdmitWithWarning(Vec<LimitBreach>),
    Deny(Vec<LimitBreach>),
}

impl Decision {
    pub fn is_deny(&self) -> bool {
        matches!(self, Decision::Deny(_))
    }
}

/// Pre-flight evaluation of one scope. Any hard breach denies; soft breaches
/// alone admit with warnings. Breaches accumulate so a single log line can
/// carry every reason.
pub fn evaluate(counters: &ScopeCounters, rules: &[LimitRule]) -> Decision {
    let mut breaches = Vec::new();
    let mut hard = false;

    for rule in rules {
        let bucket = counters.bucket(rule.window);
        let breached = match rule.metric {
            // Projected post-request count: a threshold of N admits exactly N
            // requests per window.
            Metric::Requests => bucket.requests.saturating_add(1) > rule.threshold,
            _ => rule.metric.observed(bucket) >= rule.threshold,
        };
        if !breached {
            continue;
        }
        hard = hard || rule.severity == Severity::Hard;
        breaches.push(LimitBreach {
            scope_key: rule.scope_key.clone(),
            window: rule.window,
            metric: rule.metric,
            threshold: rule.threshold,
            observed: rule.metric.observed(bucket),
            severity: rule.severity,
        });
    }

    if breaches.is_empty() {
        Decision::Admit
    } else if hard {
        Decision::Deny(breaches)
    } else {
        Decision::AdmitWithWarning(breaches)
    }
}

/// Post-flight check: hard token (or derived cost) limits crossed by the
/// request that just completed. Request-count rules are excluded; they were
/// fully enforced pre-flight.
pub fn hard_breach_after(counters: &ScopeCounters, rules: &[LimitRule]) -> Option<LimitBreach> {
    rules
        .iter()
        .filter(|rule| rule.severity == Severity::Hard && rule.metric != Metric::Requests)
        .find_map(|rule| {
            let bucket = counters.bucket(rule.window);
            let observed = rule.metric.observed(bucket);
            (observed >= rule.threshold).then(|| LimitBreach {
                scope_key: rule.scope_key.clone(),
                window: rule.window,
                metric: rule.metric,
                threshold: rule.threshold,
                observed,
                severity: rule.severity,
            })
        })
}
