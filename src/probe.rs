//! Out-of-band health probing.
//!
//! A single loop walks the current registry snapshot once a second and
//! launches due probes: the configured HTTP health endpoint for remote
//! providers, an executable liveness check for local ones. Probe outcomes
//! feed the health state machine exactly like request outcomes but never
//! touch the usage counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::ProviderKind;
use crate::health::HealthController;
use crate::registry::{ProviderEntry, Registry};

/// Probe cadence for a provider, or `None` when it is not probed.
fn probe_interval_seconds(entry: &ProviderEntry) -> Option<u64> {
    match &entry.config.kind {
        ProviderKind::Http(http) => http.probe.as_ref().map(|probe| probe.interval_seconds),
        ProviderKind::Local(local) => Some(local.probe_interval_seconds),
    }
}

pub async fn run_probe_loop(
    registry: Arc<Registry>,
    health: Arc<HealthController>,
    clock: Arc<dyn Clock>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_started: HashMap<String, u64> = HashMap::new();

    loop {
        ticker.tick().await;
        let snapshot = registry.load();
        let now = clock.now_epoch_seconds();

        last_started.retain(|id, _| snapshot.provider(id).is_some());

        for (id, entry) in snapshot.providers() {
            if !entry.config.enabled {
                continue;
            }
            let Some(interval) = probe_interval_seconds(entry) else {
                continue;
            };
            let due = last_started
                .get(id)
                .map(|started| now >= started.saturating_add(interval.max(1)))
                .unwrap_or(true);
            if !due {
                continue;
            }
            last_started.insert(id.clone(), now);

            let id = id.clone();
            let entry = Arc::clone(entry);
            let health = Arc::clone(&health);
            tokio::spawn(async move {
                let result = entry
                    .adapter
                    .probe()
                    .await
                    .map_err(|failure| failure.to_string());
                if let Err(error) = &result {
                    tracing::debug!(provider = %id, error = %error, "probe failed");
                }
                health.on_probe(&id, &entry.policy, result);
            });
        }
    }
}
