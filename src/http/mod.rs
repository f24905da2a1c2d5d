//! HTTP surface: the inbound chat-completion endpoint and the management
//! REST API consumed by the UI.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::routing::{get, post};
use axum::Router;

use crate::clock::Clock;
use crate::config::ConfigFile;
use crate::counters::CounterStore;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::health::HealthController;
use crate::persist;
use crate::registry::{Registry, RegistrySnapshot};

mod admin;
mod chat;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub counters: Arc<CounterStore>,
    pub health: Arc<HealthController>,
    pub dispatcher: Arc<Dispatcher>,
    pub clock: Arc<dyn Clock>,
    config: Arc<Mutex<ConfigFile>>,
    config_path: Option<PathBuf>,
    admin_token: Option<String>,
}

impl AppState {
    pub fn new(config: ConfigFile, clock: Arc<dyn Clock>) -> Result<Self> {
        let snapshot = RegistrySnapshot::build(&config)?;
        let registry = Arc::new(Registry::new(snapshot));
        let counters = Arc::new(CounterStore::new(Arc::clone(&clock)));
        let health = Arc::new(HealthController::new(Arc::clone(&clock)));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&counters),
            Arc::clone(&health),
            Arc::clone(&clock),
        ));
        Ok(Self {
            registry,
            counters,
            health,
            dispatcher,
            clock,
            config: Arc::new(Mutex::new(config)),
            config_path: None,
            admin_token: None,
        })
    }

    /// Where configuration mutations are persisted. Without it the
    /// management API mutates the running process only.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn config(&self) -> ConfigFile {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    fn config_path(&self) -> Option<&std::path::Path> {
        self.config_path.as_deref()
    }

    /// Validates, optionally persists, then atomically publishes a new
    /// configuration. The swap happens last so a failed write never leaves
    /// the process and the file disagreeing.
    fn apply_config(&self, new_config: ConfigFile, persist_to_disk: bool) -> Result<()> {
        let snapshot = RegistrySnapshot::build(&new_config)?;
        if persist_to_disk {
            if let Some(path) = &self.config_path {
                persist::save_config(path, &new_config)?;
            }
        }
        {
            let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
            *config = new_config;
        }
        let provider_ids = snapshot.provider_ids();
        self.registry.swap(snapshot);
        self.health.retain(&provider_ids);
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(admin::liveness))
        .route("/v1/chat/completions", post(chat::completions))
        .route(
            "/:provider/v1/chat/completions",
            post(chat::completions_for_provider),
        )
        .route(
            "/api/providers",
            get(admin::list_providers).post(admin::create_provider),
        )
        .route(
            "/api/providers/:id",
            get(admin::get_provider)
                .put(admin::update_provider)
                .delete(admin::delete_provider),
        )
        .route("/api/usage", get(admin::usage))
        .route("/api/usage/reset", post(admin::reset_usage))
        .route("/api/limits", get(admin::get_limits).put(admin::put_limits))
        .route("/api/system/restart", post(admin::restart))
        .with_state(state)
}
