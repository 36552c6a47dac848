//! TestForge HTTP API server.

pub mod auth;
pub mod config;
pub mod routes;

use auth::UserStore;
use config::ServerConfig;
use routes::AppState;
use std::sync::Arc;
use testforge_common::{Database, Result};
use testforge_engine::{
    AccessControl, CompositionStore, Dispatcher, DispatcherConfig, ExecutionMachine,
    ExecutorRegistry,
};

/// Wire up the full application state from configuration: database, engine,
/// dispatcher, and user store, with the bootstrap admin seeded.
pub fn build_state(config: &ServerConfig) -> Result<AppState> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(&config.db_path)?;

    let store = CompositionStore::new(db.clone());
    let machine = ExecutionMachine::new(db.clone());
    let dispatcher = Dispatcher::new(
        store.clone(),
        machine,
        ExecutorRegistry::with_builtins(),
        DispatcherConfig {
            workers: config.workers,
            per_tenant_running_cap: config.per_tenant_running_cap,
            step_timeout_secs: config.step_timeout_secs,
            liveness_deadline_secs: config.liveness_deadline_secs,
            ..DispatcherConfig::default()
        },
    );

    let users = UserStore::new(db);
    users.seed_bootstrap_admin(config.bootstrap_admin_password.as_deref())?;

    Ok(AppState {
        store,
        dispatcher,
        access: Arc::new(AccessControl::new()),
        users,
    })
}
