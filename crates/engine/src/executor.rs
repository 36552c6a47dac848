//! Step executors.
//!
//! An executor turns one step instance into a result. Step definitions name
//! their executor; the dispatcher resolves it through the registry at run
//! time, so unknown executors fail the step rather than the process.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use testforge_common::{Error, Result, StepDefinition, StepResult};
use tracing::debug;

/// One pluggable step runner.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Executor name referenced by step definitions.
    fn name(&self) -> &str;

    /// Run one step. Parameters have already been validated against the
    /// definition's input schema at composition time.
    async fn execute(
        &self,
        definition: &StepDefinition,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<StepResult>;
}

/// Runtime registry of step executors, keyed by name.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Arc<RwLock<HashMap<String, Arc<dyn StepExecutor>>>>,
}

impl ExecutorRegistry {
    /// Registry with the built-in executors installed.
    pub fn with_builtins() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(SimulatedStepExecutor));
        registry.register(Arc::new(HttpStepExecutor::new()));
        registry
    }

    pub fn register(&self, executor: Arc<dyn StepExecutor>) {
        debug!("Registered step executor '{}'", executor.name());
        self.executors
            .write()
            .insert(executor.name().to_string(), executor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StepExecutor>> {
        self.executors
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Executor(format!("no executor registered for '{}'", name)))
    }
}

/// Built-in executor that records the action instead of driving a browser.
/// Keeps compositions runnable end to end without external infrastructure.
pub struct SimulatedStepExecutor;

#[async_trait]
impl StepExecutor for SimulatedStepExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(
        &self,
        definition: &StepDefinition,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<StepResult> {
        let echo = json!({
            "step": definition.name,
            "parameters": Value::Object(parameters.clone()),
        });
        Ok(StepResult {
            raw: format!("simulated {}", definition.name),
            parsed: Some(echo),
        })
    }
}

/// Built-in executor issuing an HTTP GET against the `url` parameter and
/// recording status and body.
pub struct HttpStepExecutor {
    client: reqwest::Client,
}

impl HttpStepExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepExecutor for HttpStepExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        _definition: &StepDefinition,
        parameters: &serde_json::Map<String, Value>,
    ) -> Result<StepResult> {
        let url = parameters
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Executor("missing 'url' parameter".to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Executor(format!("request to {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Executor(format!("reading body from {} failed: {}", url, e)))?;

        let parsed_body: Option<Value> = serde_json::from_str(&body).ok();
        Ok(StepResult {
            raw: body,
            parsed: Some(json!({
                "status": status,
                "body": parsed_body,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn navigate_def() -> StepDefinition {
        StepDefinition {
            id: "builtin:navigate".to_string(),
            tenant_id: None,
            name: "navigate".to_string(),
            description: String::new(),
            executor: "simulated".to_string(),
            input_schema: vec![],
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_simulated_echoes_parameters() {
        let exec = SimulatedStepExecutor;
        let params = json!({"url": "http://example.test"});
        let result = exec
            .execute(&navigate_def(), params.as_object().unwrap())
            .await
            .unwrap();
        assert_eq!(result.raw, "simulated navigate");
        let parsed = result.parsed.unwrap();
        assert_eq!(parsed["step"], "navigate");
        assert_eq!(parsed["parameters"]["url"], "http://example.test");
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ExecutorRegistry::with_builtins();
        assert!(registry.get("simulated").is_ok());
        assert!(registry.get("http").is_ok());
        assert!(matches!(registry.get("nope"), Err(Error::Executor(_))));
    }
}
