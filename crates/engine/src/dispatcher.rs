//! Execution dispatcher.
//!
//! Owns the submission queue, the worker pool, per-tenant admission control,
//! cooperative cancellation, and startup recovery. Workers race for an
//! execution through the state machine's compare-and-set claim, so a queue
//! entry is a hint, never a grant.

use crate::access::{AccessControl, Scope};
use crate::executor::ExecutorRegistry;
use crate::machine::{derive_status, ExecutionMachine};
use crate::store::CompositionStore;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testforge_common::{
    Error, Execution, ExecutionStatus, Principal, Result, StepStatus, TestCase,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker tasks pulling from the submission queue.
    pub workers: usize,
    /// Concurrent running executions allowed per tenant.
    pub per_tenant_running_cap: usize,
    /// Hard wall-clock limit for a single step.
    pub step_timeout_secs: u64,
    /// A running execution with no step activity for this long is failed.
    pub liveness_deadline_secs: u64,
    /// Back-off before retrying an execution deferred by the tenant cap.
    pub requeue_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            per_tenant_running_cap: 4,
            step_timeout_secs: 60,
            liveness_deadline_secs: 300,
            requeue_delay_ms: 500,
        }
    }
}

/// Cancellation flags for in-flight executions, checked at step boundaries.
type CancelFlags = Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>;

#[derive(Clone)]
pub struct Dispatcher {
    store: CompositionStore,
    machine: ExecutionMachine,
    executors: ExecutorRegistry,
    access: Arc<AccessControl>,
    config: DispatcherConfig,
    queue: mpsc::UnboundedSender<String>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    cancels: CancelFlags,
}

impl Dispatcher {
    pub fn new(
        store: CompositionStore,
        machine: ExecutionMachine,
        executors: ExecutorRegistry,
        config: DispatcherConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        Self {
            store,
            machine,
            executors,
            access: Arc::new(AccessControl::new()),
            config,
            queue,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn machine(&self) -> &ExecutionMachine {
        &self.machine
    }

    /// Recover persisted state after a restart, then start the worker pool
    /// and the liveness sweeper.
    pub fn start(&self) -> Result<()> {
        for id in self.machine.recover()? {
            self.enqueue(id);
        }

        for worker in 0..self.config.workers {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                debug!("Execution worker {} started", worker);
                loop {
                    let next = { dispatcher.receiver.lock().await.recv().await };
                    match next {
                        Some(id) => dispatcher.process(&id).await,
                        None => break,
                    }
                }
            });
        }

        let dispatcher = self.clone();
        let sweep_every = Duration::from_secs(self.config.liveness_deadline_secs.max(2) / 2);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                ticker.tick().await;
                match dispatcher
                    .machine
                    .sweep_stalled(dispatcher.config.liveness_deadline_secs)
                {
                    Ok(swept) => {
                        for id in swept {
                            dispatcher.cancels.lock().remove(&id);
                        }
                    }
                    Err(e) => error!("Liveness sweep failed: {}", e),
                }
            }
        });

        info!(
            "Dispatcher started: {} workers, per-tenant cap {}, step timeout {}s",
            self.config.workers, self.config.per_tenant_running_cap, self.config.step_timeout_secs
        );
        Ok(())
    }

    /// Submit a test case for execution. The execution is recorded with its
    /// pending step rows before this returns, so the caller can poll
    /// immediately. Over the tenant cap the execution queues as pending
    /// instead of being rejected.
    pub fn submit(&self, principal: &Principal, test_case_id: &str) -> Result<Execution> {
        let tenant_id = self.store.tenant_of_test_case(test_case_id)?;
        self.access
            .authorize(principal, "execution:execute", &Scope::tenant(&tenant_id))?;

        let case = self.store.get_test_case(test_case_id)?;
        let at_cap =
            self.machine.running_count(&tenant_id)? >= self.config.per_tenant_running_cap;
        let status = if at_cap {
            ExecutionStatus::Pending
        } else {
            ExecutionStatus::Accepted
        };
        let execution = self.machine.create(&case, &tenant_id, status)?;
        self.enqueue(execution.id.clone());
        Ok(execution)
    }

    pub fn get(&self, principal: &Principal, id: &str) -> Result<Execution> {
        let execution = self.machine.get(id)?;
        self.access.authorize(
            principal,
            "execution:read",
            &Scope::tenant(&execution.tenant_id),
        )?;
        Ok(execution)
    }

    pub fn list(&self, principal: &Principal, tenant_id: &str) -> Result<Vec<Execution>> {
        self.access
            .authorize(principal, "execution:read", &Scope::tenant(tenant_id))?;
        self.machine.list(tenant_id)
    }

    pub fn delete(&self, principal: &Principal, id: &str) -> Result<()> {
        let execution = self.machine.get(id)?;
        self.access.authorize(
            principal,
            "execution:delete",
            &Scope::tenant(&execution.tenant_id),
        )?;
        self.machine.delete(id)
    }

    /// Request cancellation. Unclaimed executions are failed immediately;
    /// running ones get their flag set and stop at the next step boundary.
    pub fn cancel(&self, principal: &Principal, id: &str) -> Result<Execution> {
        let execution = self.machine.get(id)?;
        self.access.authorize(
            principal,
            "execution:execute",
            &Scope::tenant(&execution.tenant_id),
        )?;

        if execution.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "execution {} already {}",
                id, execution.status
            )));
        }

        if execution.status == ExecutionStatus::Running {
            if let Some(flag) = self.cancels.lock().get(id) {
                flag.store(true, Ordering::SeqCst);
                info!("Cancellation requested for running execution {}", id);
            } else {
                // Claimed by a dispatcher that is gone; fail it directly,
                // step rows included, so the record is terminal throughout
                self.fail_remaining_steps(&execution, "cancelled")?;
                self.machine
                    .finalize(id, ExecutionStatus::Failed, Some("cancelled"))?;
            }
        } else {
            // Not yet claimed; no worker will touch it after finalize
            self.fail_remaining_steps(&execution, "cancelled")?;
            self.machine
                .finalize(id, ExecutionStatus::Failed, Some("cancelled"))?;
        }

        self.machine.get(id)
    }

    fn enqueue(&self, id: String) {
        // Receiver lives as long as the dispatcher, send cannot fail
        let _ = self.queue.send(id);
    }

    fn requeue_later(&self, id: String) {
        let dispatcher = self.clone();
        let delay = Duration::from_millis(self.config.requeue_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            dispatcher.enqueue(id);
        });
    }

    /// Claim and run one queued execution. Claim losses against the tenant
    /// cap defer and retry; losses against another worker drop the entry.
    async fn process(&self, id: &str) {
        let execution = match self.machine.get(id) {
            Ok(e) => e,
            Err(Error::NotFound { .. }) => return,
            Err(e) => {
                error!("Loading execution {} failed: {}", id, e);
                return;
            }
        };
        if execution.status.is_terminal() || execution.status == ExecutionStatus::Running {
            return;
        }

        match self
            .machine
            .claim(id, &execution.tenant_id, self.config.per_tenant_running_cap)
        {
            Ok(true) => {}
            Ok(false) => {
                // Lost to the cap: defer. Lost to another worker: done here.
                if let Ok(current) = self.machine.get(id) {
                    if !current.status.is_terminal() && current.status != ExecutionStatus::Running {
                        if let Err(e) = self.machine.mark_pending(id) {
                            error!("Deferring execution {} failed: {}", id, e);
                        }
                        debug!("Tenant {} at running cap, deferring {}", execution.tenant_id, id);
                        self.requeue_later(id.to_string());
                    }
                }
                return;
            }
            Err(e) => {
                error!("Claiming execution {} failed: {}", id, e);
                return;
            }
        }

        if let Err(e) = self.run(&execution).await {
            // Stale writes mean the run was finalized out from under us by
            // cancel or the sweeper
            if !matches!(e, Error::StaleExecution { .. }) {
                error!("Execution {} aborted: {}", id, e);
                let _ = self
                    .machine
                    .finalize(id, ExecutionStatus::Failed, Some(&e.to_string()));
            }
        }
        self.cancels.lock().remove(id);
    }

    /// Drive one claimed execution through its steps.
    async fn run(&self, execution: &Execution) -> Result<()> {
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancels
            .lock()
            .insert(execution.id.clone(), cancel.clone());

        let case = match self.store.get_test_case(&execution.test_case_id) {
            Ok(c) => c,
            Err(Error::NotFound { .. }) => {
                self.fail_remaining_steps(execution, "test case deleted")?;
                return self.machine.finalize(
                    &execution.id,
                    ExecutionStatus::Failed,
                    Some("test case deleted"),
                );
            }
            Err(e) => return Err(e),
        };
        let continue_on_failure = self
            .store
            .get_suite(&case.suite_id)
            .map(|s| s.continue_on_failure)
            .unwrap_or(false);

        let mut first_error: Option<String> = None;
        for index in 0..case.steps.len() {
            if cancel.load(Ordering::SeqCst) {
                self.fail_remaining_steps(execution, "cancelled")?;
                return self
                    .machine
                    .finalize(&execution.id, ExecutionStatus::Failed, Some("cancelled"));
            }

            self.machine.mark_step_running(&execution.id, index)?;
            let outcome = self.run_step(&case, index).await;
            match outcome {
                Ok(result) => {
                    self.machine.complete_step(
                        &execution.id,
                        index,
                        StepStatus::Finished,
                        Some(result),
                        None,
                    )?;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        "Execution {} step {} failed: {}",
                        execution.id, index, message
                    );
                    self.machine.complete_step(
                        &execution.id,
                        index,
                        StepStatus::Failed,
                        None,
                        Some(&message),
                    )?;
                    if first_error.is_none() {
                        first_error = Some(message);
                    }
                    if !continue_on_failure {
                        break;
                    }
                }
            }
        }

        let final_steps = self.machine.get(&execution.id)?.steps;
        let status = match derive_status(&final_steps) {
            ExecutionStatus::Failed => ExecutionStatus::Failed,
            _ => ExecutionStatus::Finished,
        };
        self.machine
            .finalize(&execution.id, status, first_error.as_deref())
    }

    /// Run one step with its timeout, catching executor panics so a bad
    /// executor fails the step, not the worker.
    async fn run_step(
        &self,
        case: &TestCase,
        index: usize,
    ) -> Result<testforge_common::StepResult> {
        let instance = &case.steps[index];
        let definition = self.store.registry().get(&instance.step_definition_id)?;
        let executor = self.executors.get(&definition.executor)?;

        let fut = executor.execute(&definition, &instance.parameters);
        let timeout = Duration::from_secs(self.config.step_timeout_secs);
        match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
            Err(_) => Err(Error::Timeout {
                seconds: self.config.step_timeout_secs,
            }),
            Ok(Err(_panic)) => Err(Error::Executor(format!(
                "executor '{}' panicked",
                definition.executor
            ))),
            Ok(Ok(result)) => result,
        }
    }

    /// Mark every not-yet-terminal step of an execution failed.
    fn fail_remaining_steps(&self, execution: &Execution, reason: &str) -> Result<()> {
        let current = self.machine.get(&execution.id)?;
        for step in &current.steps {
            if matches!(step.status, StepStatus::Pending | StepStatus::Running) {
                self.machine.complete_step(
                    &execution.id,
                    step.step_index,
                    StepStatus::Failed,
                    None,
                    Some(reason),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepExecutor;
    use async_trait::async_trait;
    use serde_json::json;
    use testforge_common::{Database, Role, StepDefinition, StepResult};

    /// Scripted executor: fails when the step carries `fail = true`, panics
    /// when it carries `panic = true`, hangs when `hang = true`.
    struct ScriptedExecutor;

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        fn name(&self) -> &str {
            "simulated"
        }

        async fn execute(
            &self,
            definition: &StepDefinition,
            parameters: &serde_json::Map<String, serde_json::Value>,
        ) -> testforge_common::Result<StepResult> {
            if parameters.get("panic").and_then(|v| v.as_bool()) == Some(true) {
                panic!("scripted panic");
            }
            if parameters.get("hang").and_then(|v| v.as_bool()) == Some(true) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if parameters.get("fail").and_then(|v| v.as_bool()) == Some(true) {
                return Err(Error::Executor("scripted failure".to_string()));
            }
            Ok(StepResult {
                raw: format!("ok {}", definition.name),
                parsed: None,
            })
        }
    }

    struct Harness {
        store: CompositionStore,
        dispatcher: Dispatcher,
        manager: Principal,
        suite_id: String,
        tenant_id: String,
    }

    fn harness(config: DispatcherConfig, continue_on_failure: bool) -> Harness {
        let db = Database::open_memory().unwrap();
        let store = CompositionStore::new(db.clone());
        let machine = ExecutionMachine::new(db);
        let executors = ExecutorRegistry::default();
        executors.register(Arc::new(ScriptedExecutor));

        let tenant = store.create_tenant("Acme", "acme").unwrap();
        let project = store.create_project(&tenant.id, "Web", "").unwrap();
        let suite = store
            .create_suite(&project.id, "Smoke", "", continue_on_failure)
            .unwrap();
        store
            .registry()
            .register(
                &tenant.id,
                "scripted",
                "",
                "simulated",
                vec![
                    param("fail", testforge_common::ParamType::Boolean, false),
                    param("panic", testforge_common::ParamType::Boolean, false),
                    param("hang", testforge_common::ParamType::Boolean, false),
                ],
            )
            .unwrap();

        let dispatcher = Dispatcher::new(store.clone(), machine, executors, config);
        let manager = Principal::new("mgr", Role::TestManager, Some(tenant.id.clone()));
        Harness {
            store,
            dispatcher,
            manager,
            suite_id: suite.id,
            tenant_id: tenant.id,
        }
    }

    fn param(
        name: &str,
        param_type: testforge_common::ParamType,
        required: bool,
    ) -> testforge_common::ParamSpec {
        testforge_common::ParamSpec {
            name: name.to_string(),
            param_type,
            required,
        }
    }

    fn scripted_case(h: &Harness, name: &str, steps: Vec<serde_json::Value>) -> TestCase {
        let def_id = h
            .store
            .registry()
            .list(&h.tenant_id)
            .unwrap()
            .into_iter()
            .find(|d| d.name == "scripted")
            .unwrap()
            .id;
        let steps = steps
            .into_iter()
            .map(|v| testforge_common::StepInstance {
                step_definition_id: def_id.clone(),
                parameters: v.as_object().unwrap().clone(),
            })
            .collect();
        h.store.create_test_case(&h.suite_id, name, steps).unwrap()
    }

    async fn wait_terminal(d: &Dispatcher, p: &Principal, id: &str) -> Execution {
        for _ in 0..200 {
            let e = d.get(p, id).unwrap();
            if e.status.is_terminal() {
                return e;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("execution {id} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_successful_run() {
        let h = harness(DispatcherConfig::default(), false);
        h.dispatcher.start().unwrap();
        let case = scripted_case(&h, "all pass", vec![json!({}), json!({})]);

        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        assert_eq!(submitted.status, ExecutionStatus::Accepted);
        assert_eq!(submitted.steps.len(), 2);

        let done = wait_terminal(&h.dispatcher, &h.manager, &submitted.id).await;
        assert_eq!(done.status, ExecutionStatus::Finished);
        assert!(done.finished_at.is_some());
        assert!(done.steps.iter().all(|s| s.status == StepStatus::Finished));
    }

    #[tokio::test]
    async fn test_stop_on_first_failure() {
        let h = harness(DispatcherConfig::default(), false);
        h.dispatcher.start().unwrap();
        let case = scripted_case(
            &h,
            "fails mid",
            vec![json!({}), json!({"fail": true}), json!({})],
        );

        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &submitted.id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.steps[0].status, StepStatus::Finished);
        assert_eq!(done.steps[1].status, StepStatus::Failed);
        // Stop-on-failure leaves the rest untouched
        assert_eq!(done.steps[2].status, StepStatus::Pending);
        assert!(done.error.as_deref().unwrap_or("").contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_all_steps() {
        let h = harness(DispatcherConfig::default(), true);
        h.dispatcher.start().unwrap();
        let case = scripted_case(
            &h,
            "keeps going",
            vec![json!({"fail": true}), json!({})],
        );

        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &submitted.id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.steps[0].status, StepStatus::Failed);
        assert_eq!(done.steps[1].status, StepStatus::Finished);
    }

    #[tokio::test]
    async fn test_executor_panic_fails_step_not_worker() {
        let h = harness(DispatcherConfig::default(), false);
        h.dispatcher.start().unwrap();
        let panicking = scripted_case(&h, "panics", vec![json!({"panic": true})]);
        let healthy = scripted_case(&h, "healthy", vec![json!({})]);

        let a = h.dispatcher.submit(&h.manager, &panicking.id).unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &a.id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.steps[0].error.as_deref().unwrap_or("").contains("panicked"));

        // Worker pool survives the panic
        let b = h.dispatcher.submit(&h.manager, &healthy.id).unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &b.id).await;
        assert_eq!(done.status, ExecutionStatus::Finished);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let config = DispatcherConfig {
            step_timeout_secs: 1,
            ..DispatcherConfig::default()
        };
        let h = harness(config, false);
        h.dispatcher.start().unwrap();
        let case = scripted_case(&h, "hangs", vec![json!({"hang": true})]);

        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &submitted.id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.steps[0].error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn test_per_tenant_cap_queues_as_pending() {
        let config = DispatcherConfig {
            per_tenant_running_cap: 1,
            step_timeout_secs: 1,
            requeue_delay_ms: 50,
            ..DispatcherConfig::default()
        };
        let h = harness(config, false);
        h.dispatcher.start().unwrap();
        let slow = scripted_case(&h, "slow", vec![json!({"hang": true})]);
        let quick = scripted_case(&h, "quick", vec![json!({})]);

        let first = h.dispatcher.submit(&h.manager, &slow.id).unwrap();
        // Give the worker time to claim the slot
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            h.dispatcher.get(&h.manager, &first.id).unwrap().status,
            ExecutionStatus::Running
        );

        let second = h.dispatcher.submit(&h.manager, &quick.id).unwrap();
        assert_eq!(second.status, ExecutionStatus::Pending);
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Still held back by the cap
        let held = h.dispatcher.get(&h.manager, &second.id).unwrap();
        assert_ne!(held.status, ExecutionStatus::Finished);

        // Cancelling the hog frees the slot and the pending run proceeds
        h.dispatcher.cancel(&h.manager, &first.id).unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &second.id).await;
        assert_eq!(done.status, ExecutionStatus::Finished);
    }

    #[tokio::test]
    async fn test_cancel_before_claim() {
        let h = harness(DispatcherConfig::default(), false);
        // Workers intentionally not started
        let case = scripted_case(&h, "never runs", vec![json!({}), json!({})]);
        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();

        let cancelled = h.dispatcher.cancel(&h.manager, &submitted.id).unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
        assert!(cancelled.steps.iter().all(|s| s.status == StepStatus::Failed));

        // Cancelling a terminal execution conflicts
        assert!(matches!(
            h.dispatcher.cancel(&h.manager, &submitted.id),
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_orphaned_running_execution_fails_its_steps() {
        let h = harness(DispatcherConfig::default(), false);
        // Workers intentionally not started: claim the execution directly so
        // it looks like a run stranded by a dispatcher that went away
        let case = scripted_case(&h, "orphaned", vec![json!({}), json!({})]);
        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        h.dispatcher
            .machine()
            .claim(&submitted.id, &h.tenant_id, 4)
            .unwrap();
        h.dispatcher
            .machine()
            .mark_step_running(&submitted.id, 0)
            .unwrap();

        let cancelled = h.dispatcher.cancel(&h.manager, &submitted.id).unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Failed);
        assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
        // No step row is left pending or running
        assert!(cancelled.steps.iter().all(|s| s.status == StepStatus::Failed));
        assert_eq!(derive_status(&cancelled.steps), ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_running_stops_at_step_boundary() {
        let config = DispatcherConfig {
            step_timeout_secs: 2,
            ..DispatcherConfig::default()
        };
        let h = harness(config, false);
        h.dispatcher.start().unwrap();
        let case = scripted_case(&h, "long", vec![json!({"hang": true}), json!({})]);

        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.dispatcher.cancel(&h.manager, &submitted.id).unwrap();

        let done = wait_terminal(&h.dispatcher, &h.manager, &submitted.id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        // Second step never started
        assert_ne!(done.steps[1].status, StepStatus::Finished);
    }

    #[tokio::test]
    async fn test_authorization_enforced() {
        let h = harness(DispatcherConfig::default(), false);
        let case = scripted_case(&h, "guarded", vec![json!({})]);

        let viewer = Principal::new("viewer", Role::Viewer, Some(h.tenant_id.clone()));
        assert!(matches!(
            h.dispatcher.submit(&viewer, &case.id),
            Err(Error::Forbidden(_))
        ));

        let outsider = Principal::new("other", Role::TestManager, Some("other-tenant".to_string()));
        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        assert!(matches!(
            h.dispatcher.get(&outsider, &submitted.id),
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_test_case_fails_execution() {
        let h = harness(DispatcherConfig::default(), false);
        let case = scripted_case(&h, "doomed", vec![json!({})]);
        let submitted = h.dispatcher.submit(&h.manager, &case.id).unwrap();
        h.store.delete_test_case(&case.id).unwrap();

        h.dispatcher.start().unwrap();
        let done = wait_terminal(&h.dispatcher, &h.manager, &submitted.id).await;
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("test case deleted"));
    }
}
