//! Read-mostly catalog of providers, virtual providers, and limits.
//!
//! A configuration apply builds one immutable `RegistrySnapshot` and swaps
//! it behind the `Registry` handle. Requests clone the `Arc` once up front
//! and see a single coherent snapshot from start to finish, no matter how
//! many swaps happen while they run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::config::{ConfigFile, ConfigMetric, ProviderConfig, ProviderKind, VirtualProviderConfig};
use crate::costing::PricingRates;
use crate::counters::Scope;
use crate::error::{Result, SwitchboardError};
use crate::health::HealthPolicy;
use crate::limits::{LimitRule, Metric};
use crate::providers::{HttpProviderAdapter, LocalProcessAdapter, ProviderAdapter};

/// One base provider, fully instantiated: configuration, failure policy,
/// integer pricing, and the adapter that talks to it.
pub struct ProviderEntry {
    pub config: ProviderConfig,
    pub policy: HealthPolicy,
    pub pricing: Option<PricingRates>,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl ProviderEntry {
    pub fn cost_usd_micros(&self, input_tokens: u64, output_tokens: u64) -> u64 {
        self.pricing
            .as_ref()
            .map(|rates| rates.cost_usd_micros(input_tokens, output_tokens))
            .unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct VirtualEntry {
    pub config: VirtualProviderConfig,
    /// Members ordered by (priority ascending, id ascending).
    pub ordered_members: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelTarget {
    Provider(String),
    Virtual(String),
}

pub struct RegistrySnapshot {
    providers: BTreeMap<String, Arc<ProviderEntry>>,
    virtuals: BTreeMap<String, VirtualEntry>,
    limits_by_scope: HashMap<String, Vec<LimitRule>>,
    model_index: HashMap<String, ModelTarget>,
}

impl RegistrySnapshot {
    /// Builds a snapshot with real adapters.
    pub fn build(config: &ConfigFile) -> Result<Self> {
        Self::build_with(config, &|provider| match &provider.kind {
            ProviderKind::Http(http) => Ok(Arc::new(HttpProviderAdapter::new(http.clone())?)
                as Arc<dyn ProviderAdapter>),
            ProviderKind::Local(local) => {
                Ok(Arc::new(LocalProcessAdapter::new(local.clone())) as Arc<dyn ProviderAdapter>)
            }
        })
    }

    /// Adapter-injecting build, the seam the tests route mock upstreams
    /// through.
    pub fn build_with(
        config: &ConfigFile,
        adapter_for: &dyn Fn(&ProviderConfig) -> Result<Arc<dyn ProviderAdapter>>,
    ) -> Result<Self> {
        let mut providers = BTreeMap::new();
        for provider in &config.providers {
            if provider.id.is_empty() {
                return Err(SwitchboardError::Config(
                    "provider id must not be empty".to_string(),
                ));
            }
            let pricing = provider
                .pricing
                .as_ref()
                .map(PricingRates::from_config)
                .transpose()?;
            let entry = ProviderEntry {
                policy: HealthPolicy {
                    failure_threshold: provider.failure_threshold,
                    cooldown: provider.cooldown,
                },
                pricing,
                adapter: adapter_for(provider)?,
                config: provider.clone(),
            };
            if providers.insert(provider.id.clone(), Arc::new(entry)).is_some() {
                return Err(SwitchboardError::Config(format!(
                    "duplicate provider id: {}",
                    provider.id
                )));
            }
        }

        let mut virtuals = BTreeMap::new();
        for virtual_provider in &config.virtual_providers {
            let entry = Self::build_virtual(virtual_provider, &providers)?;
            if virtuals
                .insert(virtual_provider.id.clone(), entry)
                .is_some()
            {
                return Err(SwitchboardError::Config(format!(
                    "duplicate virtual provider id: {}",
                    virtual_provider.id
                )));
            }
        }

        let model_index = Self::build_model_index(&providers, &virtuals)?;
        let limits_by_scope = Self::build_limits(config, &providers, &virtuals)?;

        Ok(Self {
            providers,
            virtuals,
            limits_by_scope,
            model_index,
        })
    }

    fn build_virtual(
        config: &VirtualProviderConfig,
        providers: &BTreeMap<String, Arc<ProviderEntry>>,
    ) -> Result<VirtualEntry> {
        if config.members.len() < 2 {
            return Err(SwitchboardError::Config(format!(
                "virtual provider {} needs at least two members",
                config.id
            )));
        }
        let mut seen = HashSet::new();
        for member in &config.members {
            if !providers.contains_key(&member.provider) {
                return Err(SwitchboardError::Config(format!(
                    "virtual provider {} references unknown provider {}",
                    config.id, member.provider
                )));
            }
            if !seen.insert(member.provider.as_str()) {
                return Err(SwitchboardError::Config(format!(
                    "virtual provider {} lists {} twice",
                    config.id, member.provider
                )));
            }
        }

        let mut members: Vec<(i32, String)> = config
            .members
            .iter()
            .map(|member| (member.priority, member.provider.clone()))
            .collect();
        members.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        Ok(VirtualEntry {
            config: config.clone(),
            ordered_members: members.into_iter().map(|(_, id)| id).collect(),
        })
    }

    fn build_model_index(
        providers: &BTreeMap<String, Arc<ProviderEntry>>,
        virtuals: &BTreeMap<String, VirtualEntry>,
    ) -> Result<HashMap<String, ModelTarget>> {
        let mut index = HashMap::new();
        let mut claim = |name: &str, target: ModelTarget| -> Result<()> {
            if let Some(existing) = index.insert(name.to_string(), target.clone()) {
                if existing != target {
                    return Err(SwitchboardError::Config(format!(
                        "model name {name} maps to more than one target"
                    )));
                }
            }
            Ok(())
        };

        for (id, entry) in providers {
            claim(id, ModelTarget::Provider(id.clone()))?;
            for model in &entry.config.models {
                claim(model, ModelTarget::Provider(id.clone()))?;
            }
        }
        for (id, entry) in virtuals {
            claim(id, ModelTarget::Virtual(id.clone()))?;
            for model in &entry.config.models {
                claim(model, ModelTarget::Virtual(id.clone()))?;
            }
        }
        Ok(index)
    }

    /// Resolves configured limits to canonical scope keys. Cost limits are
    /// rewritten into derived total-token rules here, using the scope's most
    /// expensive per-token rate (for a virtual scope, the most expensive
    /// member).
    fn build_limits(
        config: &ConfigFile,
        providers: &BTreeMap<String, Arc<ProviderEntry>>,
        virtuals: &BTreeMap<String, VirtualEntry>,
    ) -> Result<HashMap<String, Vec<LimitRule>>> {
        let mut by_scope: HashMap<String, Vec<LimitRule>> = HashMap::new();

        for limit in &config.limits {
            let (scope, pricing): (Scope, Option<PricingRates>) =
                if providers.contains_key(&limit.scope) {
                    (
                        Scope::Provider(limit.scope.clone()),
                        providers[&limit.scope].pricing.clone(),
                    )
                } else if let Some(virtual_entry) = virtuals.get(&limit.scope) {
                    let priciest = virtual_entry
                        .ordered_members
                        .iter()
                        .filter_map(|id| providers.get(id).and_then(|p| p.pricing.clone()))
                        .max_by_key(|rates| {
                            rates
                                .input_usd_micros_per_million
                                .max(rates.output_usd_micros_per_million)
                        });
                    (Scope::Virtual(limit.scope.clone()), priciest)
                } else {
                    return Err(SwitchboardError::Config(format!(
                        "limit references unknown scope {}",
                        limit.scope
                    )));
                };

            let scope_key = scope.key();
            let rule = match limit.metric {
                ConfigMetric::Requests => Some((Metric::Requests, limit.threshold, None)),
                ConfigMetric::InputTokens => Some((Metric::InputTokens, limit.threshold, None)),
                ConfigMetric::OutputTokens => Some((Metric::OutputTokens, limit.threshold, None)),
                ConfigMetric::TotalTokens => Some((Metric::TotalTokens, limit.threshold, None)),
                ConfigMetric::Cost => {
                    let derived = pricing
                        .as_ref()
                        .and_then(|rates| rates.tokens_for_cost_usd_micros(limit.threshold));
                    match derived {
                        Some(tokens) => {
                            Some((Metric::TotalTokens, tokens, Some(limit.threshold)))
                        }
                        None => {
                            tracing::warn!(
                                scope = %scope_key,
                                threshold_usd_micros = limit.threshold,
                                "skipping cost limit: scope has no usable pricing"
                            );
                            None
                        }
                    }
                }
            };

            if let Some((metric, threshold, derived_from)) = rule {
                by_scope.entry(scope_key.clone()).or_default().push(LimitRule {
                    scope_key,
                    window: limit.window,
                    metric,
                    threshold,
                    severity: limit.severity,
                    derived_from_cost_usd_micros: derived_from,
                });
            }
        }

        Ok(by_scope)
    }

    pub fn provider(&self, id: &str) -> Option<&Arc<ProviderEntry>> {
        self.providers.get(id)
    }

    pub fn providers(&self) -> impl Iterator<Item = (&String, &Arc<ProviderEntry>)> {
        self.providers.iter()
    }

    pub fn provider_ids(&self) -> HashSet<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn virtual_provider(&self, id: &str) -> Option<&VirtualEntry> {
        self.virtuals.get(id)
    }

    pub fn resolve_model(&self, model: &str) -> Option<&ModelTarget> {
        self.model_index.get(model)
    }

    pub fn limits_for(&self, scope_key: &str) -> &[LimitRule] {
        self.limits_by_scope
            .get(scope_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Atomically swapped handle to the current snapshot.
pub struct Registry {
    inner: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Cheap clone of the current snapshot handle. Hold it for the duration
    /// of one request; it stays coherent across concurrent swaps.
    pub fn load(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn swap(&self, snapshot: RegistrySnapshot) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = Arc::new(snapshot);
    }
}
