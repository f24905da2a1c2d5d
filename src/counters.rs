//! Per-scope usage accounting across the minute/day/month windows.
//!
//! Buckets are rolled forward lazily: any access first discards counters
//! whose window has passed. There is no per-bucket history; the persisted
//! snapshot is the only retention and covers at most the current windows.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::clock::{window_start, Clock, Window};

/// A counter-accumulation target. Requests routed through a virtual provider
/// charge the member scope, the virtual scope, and the pair scope; direct
/// access charges the base scope only.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Provider(String),
    Virtual(String),
    VirtualMember {
        virtual_id: String,
        provider_id: String,
    },
}

impl Scope {
    pub fn key(&self) -> String {
        match self {
            Scope::Provider(id) => format!("provider:{id}"),
            Scope::Virtual(id) => format!("virtual:{id}"),
            Scope::VirtualMember {
                virtual_id,
                provider_id,
            } => format!("virtual:{virtual_id}/provider:{provider_id}"),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// One request's contribution. All five metrics advance together.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct UsageDelta {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: u64,
    pub cost_usd_micros: u64,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CounterBucket {
    pub window_start: u64,
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub errors: u64,
    pub cost_usd_micros: u64,
}

impl CounterBucket {
    fn apply(&mut self, delta: &UsageDelta) {
        self.requests = self.requests.saturating_add(delta.requests);
        self.input_tokens = self.input_tokens.saturating_add(delta.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(delta.output_tokens);
        self.errors = self.errors.saturating_add(delta.errors);
        self.cost_usd_micros = self.cost_usd_micros.saturating_add(delta.cost_usd_micros);
    }

    fn reset_to(&mut self, start: u64) {
        *self = CounterBucket {
            window_start: start,
            ..CounterBucket::default()
        };
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScopeCounters {
    pub minute: CounterBucket,
    pub day: CounterBucket,
    pub month: CounterBucket,
}

impl ScopeCounters {
    pub fn bucket(&self, window: Window) -> &CounterBucket {
        match window {
            Window::Minute => &self.minute,
            Window::Day => &self.day,
            Window::Month => &self.month,
        }
    }

    fn bucket_mut(&mut self, window: Window) -> &mut CounterBucket {
        match window {
            Window::Minute => &mut self.minute,
            Window::Day => &mut self.day,
            Window::Month => &mut self.month,
        }
    }

    /// Zeroes any bucket whose window has passed and stamps the latest legal
    /// boundary. Idempotent for a fixed `now`.
    fn roll_forward(&mut self, now: u64, offset: time::UtcOffset) {
        for window in Window::ALL {
            let boundary = window_start(window, now, offset);
            let bucket = self.bucket_mut(window);
            if bucket.window_start < boundary {
                bucket.reset_to(boundary);
            }
        }
    }
}

/// Point-in-time deep copy of the store, used for the 5-minute persistence
/// cycle and for startup import.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    #[serde(default)]
    pub saved_at_epoch_seconds: u64,
    #[serde(default)]
    pub scopes: BTreeMap<String, ScopeCounters>,
}

/// Concurrency-safe counter store. The outer map lock is held only long
/// enough to fetch a scope's cell; accumulation happens under the per-scope
/// mutex, and no lock is ever held across upstream I/O.
pub struct CounterStore {
    clock: Arc<dyn Clock>,
    scopes: RwLock<HashMap<String, Arc<Mutex<ScopeCounters>>>>,
}

impl CounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    fn cell(&self, key: &str) -> Arc<Mutex<ScopeCounters>> {
        if let Some(cell) = self.scopes.read().unwrap_or_else(|e| e.into_inner()).get(key) {
            return Arc::clone(cell);
        }
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            scopes
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ScopeCounters::default()))),
        )
    }

    /// Coherent copy of a scope's counters after roll-forward.
    pub fn snapshot(&self, scope: &Scope) -> ScopeCounters {
        self.snapshot_key(&scope.key())
    }

    pub fn snapshot_key(&self, key: &str) -> ScopeCounters {
        let cell = self.cell(key);
        let mut counters = cell.lock().unwrap_or_else(|e| e.into_inner());
        counters.roll_forward(self.clock.now_epoch_seconds(), self.clock.local_offset());
        counters.clone()
    }

    /// Applies `delta` to all three windows of `scope` atomically.
    pub fn record(&self, scope: &Scope, delta: &UsageDelta) {
        let cell = self.cell(&scope.key());
        let mut counters = cell.lock().unwrap_or_else(|e| e.into_inner());
        counters.roll_forward(self.clock.now_epoch_seconds(), self.clock.local_offset());
        for window in Window::ALL {
            counters.bucket_mut(window).apply(delta);
        }
    }

    /// Zeroes the selected windows and stamps the current boundary.
    pub fn reset(&self, key: &str, windows: &[Window]) {
        let now = self.clock.now_epoch_seconds();
        let offset = self.clock.local_offset();
        let cell = self.cell(key);
        let mut counters = cell.lock().unwrap_or_else(|e| e.into_inner());
        counters.roll_forward(now, offset);
        for window in windows {
            let boundary = window_start(*window, now, offset);
            counters.bucket_mut(*window).reset_to(boundary);
        }
    }

    pub fn export(&self) -> UsageSnapshot {
        let now = self.clock.now_epoch_seconds();
        let offset = self.clock.local_offset();
        let cells: Vec<(String, Arc<Mutex<ScopeCounters>>)> = {
            let scopes = self.scopes.read().unwrap_or_else(|e| e.into_inner());
            scopes
                .iter()
                .map(|(key, cell)| (key.clone(), Arc::clone(cell)))
                .collect()
        };

        let mut snapshot = UsageSnapshot {
            saved_at_epoch_seconds: now,
            scopes: BTreeMap::new(),
        };
        for (key, cell) in cells {
            let mut counters = cell.lock().unwrap_or_else(|e| e.into_inner());
            counters.roll_forward(now, offset);
            snapshot.scopes.insert(key, counters.clone());
        }
        snapshot
    }

    /// Replaces all state. Startup-only: concurrent writers would race the
    /// wholesale swap.
    pub fn import(&self, snapshot: UsageSnapshot) {
        let mut scopes = self.scopes.write().unwrap_or_else(|e| e.into_inner());
        scopes.clear();
        for (key, counters) in snapshot.scopes {
            scopes.insert(key, Arc::new(Mutex::new(counters)));
        }
    }
}
