//! Request-to-provider resolution.
//!
//! Produces an ordered candidate list: an explicit selector pins a single
//! base provider, a model naming a base provider routes directly, and a
//! model naming a virtual provider yields its members by priority, filtered
//! to those currently eligible. Eligibility combines the enabled flag, the
//! health state machine, and pre-flight limit evaluation on every scope the
//! candidate would charge.

use crate::counters::{CounterStore, Scope};
use crate::error::SwitchboardError;
use crate::health::HealthController;
use crate::limits::{evaluate, Decision, LimitBreach, Severity};
use crate::registry::{ModelTarget, RegistrySnapshot};

/// One provider the dispatcher may try, with every scope it would charge.
/// The base provider scope is always first.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub provider_id: String,
    pub scopes: Vec<Scope>,
}

impl Candidate {
    fn direct(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            scopes: vec![Scope::Provider(provider_id.to_string())],
        }
    }

    fn via_virtual(virtual_id: &str, provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            scopes: vec![
                Scope::Provider(provider_id.to_string()),
                Scope::Virtual(virtual_id.to_string()),
                Scope::VirtualMember {
                    virtual_id: virtual_id.to_string(),
                    provider_id: provider_id.to_string(),
                },
            ],
        }
    }
}

#[derive(Clone, Debug)]
pub struct RoutingPlan {
    pub candidates: Vec<Candidate>,
    pub virtual_id: Option<String>,
}

/// Why a candidate was passed over.
#[derive(Clone, Debug)]
pub enum SkipReason {
    Disabled,
    Unhealthy,
    HardLimited(LimitBreach),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => f.write_str("disabled"),
            SkipReason::Unhealthy => f.write_str("cooling or disabled by health"),
            SkipReason::HardLimited(breach) => write!(f, "hard limit: {}", breach.detail()),
        }
    }
}

/// An empty plan caused purely by hard limits is a limit refusal (the
/// caller sees 429); anything else is provider unavailability (503).
fn refusal(context: &str, mut reasons: Vec<SkipReason>) -> SwitchboardError {
    let all_limited = !reasons.is_empty()
        && reasons
            .iter()
            .all(|reason| matches!(reason, SkipReason::HardLimited(_)));
    if all_limited {
        if let SkipReason::HardLimited(breach) = reasons.remove(0) {
            let detail = breach.detail();
            return SwitchboardError::LimitExceeded {
                scope: breach.scope_key,
                window: breach.window,
                detail,
            };
        }
    }
    let detail = reasons
        .iter()
        .map(|reason| reason.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    SwitchboardError::NoProviderAvailable {
        reason: if detail.is_empty() {
            context.to_string()
        } else {
            format!("{context}: {detail}")
        },
    }
}

/// Pre-flight eligibility for one candidate. Also used by the dispatcher to
/// re-check just before sending, since state may have moved since planning.
pub fn check_candidate(
    snapshot: &RegistrySnapshot,
    health: &HealthController,
    counters: &CounterStore,
    candidate: &Candidate,
) -> Result<(), SkipReason> {
    let Some(entry) = snapshot.provider(&candidate.provider_id) else {
        return Err(SkipReason::Disabled);
    };
    if !entry.config.enabled {
        return Err(SkipReason::Disabled);
    }
    if !health.is_eligible(&candidate.provider_id) {
        return Err(SkipReason::Unhealthy);
    }

    for scope in &candidate.scopes {
        let key = scope.key();
        let rules = snapshot.limits_for(&key);
        if rules.is_empty() {
            continue;
        }
        match evaluate(&counters.snapshot(scope), rules) {
            Decision::Admit => {}
            Decision::AdmitWithWarning(breaches) => {
                for breach in breaches {
                    tracing::warn!(
                        provider = %candidate.provider_id,
                        scope = %breach.scope_key,
                        window = %breach.window,
                        metric = %breach.metric,
                        observed = breach.observed,
                        threshold = breach.threshold,
                        "soft limit breached"
                    );
                }
            }
            Decision::Deny(mut breaches) => {
                let first_hard = breaches
                    .iter()
                    .position(|breach| breach.severity == Severity::Hard)
                    .unwrap_or(0);
                return Err(SkipReason::HardLimited(breaches.swap_remove(first_hard)));
            }
        }
    }
    Ok(())
}

/// Resolves one request to its routing plan.
///
/// `selector` is the explicit provider choice from the `X-Provider-ID`
/// header or the path prefix; it bypasses virtual-provider logic entirely
/// while keeping scope accounting and limits in force.
pub fn route(
    snapshot: &RegistrySnapshot,
    health: &HealthController,
    counters: &CounterStore,
    selector: Option<&str>,
    model: &str,
) -> Result<RoutingPlan, SwitchboardError> {
    if let Some(provider_id) = selector {
        if snapshot.provider(provider_id).is_none() {
            return Err(SwitchboardError::InvalidRequest(format!(
                "unknown provider: {provider_id}"
            )));
        }
        let candidate = Candidate::direct(provider_id);
        return match check_candidate(snapshot, health, counters, &candidate) {
            Ok(()) => Ok(RoutingPlan {
                candidates: vec![candidate],
                virtual_id: None,
            }),
            Err(reason) => Err(refusal(provider_id, vec![reason])),
        };
    }

    match snapshot.resolve_model(model) {
        Some(ModelTarget::Provider(provider_id)) => {
            let candidate = Candidate::direct(provider_id);
            match check_candidate(snapshot, health, counters, &candidate) {
                Ok(()) => Ok(RoutingPlan {
                    candidates: vec![candidate],
                    virtual_id: None,
                }),
                Err(reason) => Err(refusal(provider_id, vec![reason])),
            }
        }
        Some(ModelTarget::Virtual(virtual_id)) => {
            let Some(entry) = snapshot.virtual_provider(virtual_id) else {
                return Err(SwitchboardError::NoProviderAvailable {
                    reason: format!("virtual provider {virtual_id} missing from snapshot"),
                });
            };

            let mut candidates = Vec::new();
            let mut exclusions = Vec::new();
            for member_id in &entry.ordered_members {
                let candidate = Candidate::via_virtual(virtual_id, member_id);
                match check_candidate(snapshot, health, counters, &candidate) {
                    Ok(()) => candidates.push(candidate),
                    Err(reason) => {
                        tracing::debug!(
                            virtual_provider = %virtual_id,
                            member = %member_id,
                            reason = %reason,
                            "member excluded from routing plan"
                        );
                        exclusions.push(reason);
                    }
                }
            }

            if candidates.is_empty() {
                return Err(refusal(
                    &format!("no eligible member of {virtual_id}"),
                    exclusions,
                ));
            }
            Ok(RoutingPlan {
                candidates,
                virtual_id: Some(virtual_id.clone()),
            })
        }
        None => Err(SwitchboardError::InvalidRequest(format!(
            "unknown model: {model}"
        ))),
    }
}
