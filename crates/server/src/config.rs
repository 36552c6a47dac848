//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use testforge_common::Result;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the API listens on.
    pub listen_addr: String,
    /// SQLite state database path.
    pub db_path: PathBuf,
    /// Execution worker tasks.
    pub workers: usize,
    /// Concurrent running executions allowed per tenant.
    pub per_tenant_running_cap: usize,
    /// Hard wall-clock limit per step, seconds.
    pub step_timeout_secs: u64,
    /// Running executions with no step progress for this long are failed.
    pub liveness_deadline_secs: u64,
    /// Password for the seeded `admin` user. A random one is generated and
    /// logged when unset.
    pub bootstrap_admin_password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: testforge_common::default_db_path(),
            workers: 4,
            per_tenant_running_cap: 4,
            step_timeout_secs: 60,
            liveness_deadline_secs: 300,
            bootstrap_admin_password: None,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| testforge_common::Error::Internal(format!("bad config file: {}", e)))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }
}
