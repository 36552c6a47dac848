//! Core types for TestForge

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Isolation boundary for all test-authoring and execution data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Unique namespace identifier, validated against
    /// `^[a-z][a-z0-9_]{1,60}$`.
    pub schema_name: String,
    pub test_manager_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: String,
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// When set, a failed step does not stop the remaining steps of a run.
    #[serde(default)]
    pub continue_on_failure: bool,
    pub created_at: i64,
}

/// Parameter type accepted by a step definition input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Json,
}

/// One named input of a step definition's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
}

/// Reusable, schema-typed template for one automatable action.
///
/// Predefined definitions have `tenant_id = None` and are identical across
/// tenants; custom definitions belong to exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub tenant_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Name of the step executor responsible for this definition.
    pub executor: String,
    pub input_schema: Vec<ParamSpec>,
    pub created_at: i64,
}

/// A step definition bound to concrete parameter values inside a test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub step_definition_id: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

/// Ordered sequence of step instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub suite_id: String,
    pub name: String,
    pub steps: Vec<StepInstance>,
    pub created_at: i64,
}

/// Aggregate status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Queued behind the tenant's running cap, not yet accepted.
    Pending,
    Accepted,
    Running,
    Finished,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Finished | ExecutionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Accepted => "accepted",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Finished => "finished",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "accepted" => Some(ExecutionStatus::Accepted),
            "running" => Some(ExecutionStatus::Running),
            "finished" => Some(ExecutionStatus::Finished),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Finished => "finished",
            StepStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "running" => Some(StepStatus::Running),
            "finished" => Some(StepStatus::Finished),
            "failed" => Some(StepStatus::Failed),
            _ => None,
        }
    }
}

/// Result payload of a finished step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: String,
    pub step_index: usize,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// One run of a test case, with per-step results.
///
/// `tenant_id` is denormalized onto the execution so history stays
/// authorizable after its test case is deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub test_case_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub steps: Vec<StepExecution>,
}

/// Role of an authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System-level role, bypasses tenant scoping entirely.
    Admin,
    TestManager,
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::TestManager => "test_manager",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "test_manager" => Some(Role::TestManager),
            "editor" => Some(Role::Editor),
            "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// Resolved caller identity consumed by the access control checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub username: String,
    pub role: Role,
    pub tenant_id: Option<String>,
}

impl Principal {
    pub fn new(username: impl Into<String>, role: Role, tenant_id: Option<String>) -> Self {
        Self {
            username: username.into(),
            role,
            tenant_id,
        }
    }
}

/// Generate a fresh entity id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as epoch seconds.
pub fn now() -> i64 {
    now_epoch()
}
