//! Execution state machine.
//!
//! An execution is accepted, claimed into running by exactly one worker,
//! advanced step by step, and finalized into a terminal status exactly once.
//! `finished_at` is the commit point: once stamped, every later write against
//! the execution or its steps is rejected as stale.

use rusqlite::{params, OptionalExtension};
use testforge_common::{
    new_id, now, Database, Error, Execution, ExecutionStatus, Result, StepExecution, StepResult,
    StepStatus, TestCase,
};
use tracing::{info, warn};

/// Derive the aggregate status of an in-flight execution from its steps.
/// Any failed step dominates; all finished means finished; otherwise the run
/// is still in progress.
pub fn derive_status(steps: &[StepExecution]) -> ExecutionStatus {
    if steps.iter().any(|s| s.status == StepStatus::Failed) {
        ExecutionStatus::Failed
    } else if !steps.is_empty() && steps.iter().all(|s| s.status == StepStatus::Finished) {
        ExecutionStatus::Finished
    } else {
        ExecutionStatus::Running
    }
}

/// Persistence and transition rules for executions.
#[derive(Clone)]
pub struct ExecutionMachine {
    db: Database,
}

impl ExecutionMachine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record a submitted execution. The execution row and one pending step
    /// row per test case step are created in a single transaction, so a
    /// reader polling right after submit already sees the full step list.
    pub fn create(
        &self,
        case: &TestCase,
        tenant_id: &str,
        status: ExecutionStatus,
    ) -> Result<Execution> {
        let execution = Execution {
            id: new_id(),
            test_case_id: case.id.clone(),
            tenant_id: tenant_id.to_string(),
            status,
            error: None,
            started_at: now(),
            finished_at: None,
            steps: case
                .steps
                .iter()
                .enumerate()
                .map(|(index, _)| StepExecution {
                    id: new_id(),
                    step_index: index,
                    status: StepStatus::Pending,
                    result: None,
                    error: None,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
        };

        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO executions \
             (id, test_case_id, tenant_id, status, error, started_at, finished_at, created_at) \
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, ?5)",
            params![
                execution.id,
                execution.test_case_id,
                execution.tenant_id,
                execution.status.as_str(),
                execution.started_at,
            ],
        )?;
        for step in &execution.steps {
            tx.execute(
                "INSERT INTO execution_steps \
                 (id, execution_id, step_index, status, result_raw, result_parsed, \
                  error, started_at, finished_at) \
                 VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, NULL, NULL)",
                params![step.id, execution.id, step.step_index as i64, step.status.as_str()],
            )?;
        }
        tx.commit()?;

        info!(
            "Execution {} created for test case {} ({} steps, {})",
            execution.id,
            case.id,
            execution.steps.len(),
            execution.status
        );
        Ok(execution)
    }

    pub fn get(&self, id: &str) -> Result<Execution> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut execution = conn
            .query_row(
                "SELECT id, test_case_id, tenant_id, status, error, started_at, finished_at \
                 FROM executions WHERE id = ?1",
                params![id],
                execution_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::not_found("execution", id))?;

        let mut stmt = conn.prepare(
            "SELECT id, step_index, status, result_raw, result_parsed, error, \
                    started_at, finished_at \
             FROM execution_steps WHERE execution_id = ?1 ORDER BY step_index ASC",
        )?;
        let rows = stmt.query_map(params![id], step_from_row)?;
        execution.steps = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(execution)
    }

    /// List a tenant's executions, newest first, without step detail.
    pub fn list(&self, tenant_id: &str) -> Result<Vec<Execution>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, test_case_id, tenant_id, status, error, started_at, finished_at \
             FROM executions WHERE tenant_id = ?1 ORDER BY started_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![tenant_id], execution_from_row)?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    /// Atomically claim an execution for a worker. The compare-and-set moves
    /// accepted or pending to running only while the tenant is below its
    /// running cap; exactly one concurrent claimer can win. Returns false
    /// when the claim lost, either to another worker or to the cap.
    pub fn claim(&self, id: &str, tenant_id: &str, per_tenant_running_cap: usize) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let updated = conn.execute(
            "UPDATE executions SET status = 'running' \
             WHERE id = ?1 AND status IN ('accepted', 'pending') \
               AND (SELECT COUNT(*) FROM executions \
                    WHERE tenant_id = ?2 AND status = 'running') < ?3",
            params![id, tenant_id, per_tenant_running_cap as i64],
        )?;
        Ok(updated == 1)
    }

    /// Defer an accepted execution behind the tenant's running cap. No-op if
    /// the execution has moved on in the meantime.
    pub fn mark_pending(&self, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE executions SET status = 'pending' WHERE id = ?1 AND status = 'accepted'",
            params![id],
        )?;
        Ok(())
    }

    /// Move a pending step to running. Rejected as stale once the execution
    /// has been finalized.
    pub fn mark_step_running(&self, execution_id: &str, step_index: usize) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let updated = conn.execute(
            "UPDATE execution_steps SET status = 'running', started_at = ?1 \
             WHERE execution_id = ?2 AND step_index = ?3 AND status = 'pending' \
               AND (SELECT finished_at FROM executions WHERE id = ?2) IS NULL",
            params![now(), execution_id, step_index as i64],
        )?;
        if updated == 0 {
            return Err(Error::StaleExecution {
                id: execution_id.to_string(),
            });
        }
        Ok(())
    }

    /// Record a step's terminal outcome. The guard keys off the execution's
    /// `finished_at`, not its status: with continue-on-failure a later step
    /// still completes after an earlier one failed.
    pub fn complete_step(
        &self,
        execution_id: &str,
        step_index: usize,
        status: StepStatus,
        result: Option<StepResult>,
        error: Option<&str>,
    ) -> Result<()> {
        let (raw, parsed) = match &result {
            Some(r) => (
                Some(r.raw.clone()),
                r.parsed.as_ref().map(serde_json::to_string).transpose()?,
            ),
            None => (None, None),
        };

        let conn = self.db.connection();
        let conn = conn.lock();
        let updated = conn.execute(
            "UPDATE execution_steps \
             SET status = ?1, result_raw = ?2, result_parsed = ?3, error = ?4, finished_at = ?5 \
             WHERE execution_id = ?6 AND step_index = ?7 \
               AND (SELECT finished_at FROM executions WHERE id = ?6) IS NULL",
            params![status.as_str(), raw, parsed, error, now(), execution_id, step_index as i64],
        )?;
        if updated == 0 {
            return Err(Error::StaleExecution {
                id: execution_id.to_string(),
            });
        }
        Ok(())
    }

    /// Finalize an execution into a terminal status. Stamps `finished_at`
    /// exactly once; a second finalize attempt is stale.
    pub fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(status.is_terminal());
        let conn = self.db.connection();
        let conn = conn.lock();
        let updated = conn.execute(
            "UPDATE executions SET status = ?1, error = ?2, finished_at = ?3 \
             WHERE id = ?4 AND finished_at IS NULL",
            params![status.as_str(), error, now(), execution_id],
        )?;
        if updated == 0 {
            return Err(Error::StaleExecution {
                id: execution_id.to_string(),
            });
        }
        info!("Execution {} finalized as {}", execution_id, status);
        Ok(())
    }

    /// Delete an execution and its step records. Running executions must be
    /// cancelled first.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM executions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => return Err(Error::not_found("execution", id)),
            Some("running") => {
                return Err(Error::Conflict(format!(
                    "execution {} is running; cancel it before deleting",
                    id
                )))
            }
            Some(_) => {}
        }

        tx.execute("DELETE FROM execution_steps WHERE execution_id = ?1", params![id])?;
        tx.execute("DELETE FROM executions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    pub fn running_count(&self, tenant_id: &str) -> Result<usize> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE tenant_id = ?1 AND status = 'running'",
            params![tenant_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Startup recovery after an unclean shutdown. Executions stranded in
    /// running are failed with a timeout marker, their in-flight steps with
    /// them; accepted and pending executions are returned for re-enqueue.
    pub fn recover(&self) -> Result<Vec<String>> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let stranded: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM executions WHERE status = 'running'")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for id in &stranded {
            warn!("Recovering stranded execution {} as failed", id);
            tx.execute(
                "UPDATE execution_steps SET status = 'failed', \
                 error = 'timeout: dispatcher restart', finished_at = ?1 \
                 WHERE execution_id = ?2 AND status IN ('pending', 'running')",
                params![now(), id],
            )?;
            tx.execute(
                "UPDATE executions SET status = 'failed', \
                 error = 'timeout: dispatcher restart', finished_at = ?1 WHERE id = ?2",
                params![now(), id],
            )?;
        }

        let requeue: Vec<String> = {
            // rowid is insertion order; created_at is only second-granular
            let mut stmt = tx.prepare(
                "SELECT id FROM executions WHERE status IN ('accepted', 'pending') \
                 ORDER BY rowid ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;

        if !stranded.is_empty() || !requeue.is_empty() {
            info!(
                "Recovery: {} stranded executions failed, {} re-enqueued",
                stranded.len(),
                requeue.len()
            );
        }
        Ok(requeue)
    }

    /// Fail running executions with no step activity within the deadline.
    /// Progress is the latest step timestamp, falling back to the execution's
    /// own start. Returns the ids swept.
    pub fn sweep_stalled(&self, deadline_secs: u64) -> Result<Vec<String>> {
        let cutoff = now() - deadline_secs as i64;
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let stalled: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT e.id FROM executions e WHERE e.status = 'running' \
                 AND COALESCE((SELECT MAX(COALESCE(s.finished_at, s.started_at)) \
                               FROM execution_steps s WHERE s.execution_id = e.id \
                                 AND s.started_at IS NOT NULL), \
                              e.started_at) < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for id in &stalled {
            warn!("Execution {} exceeded liveness deadline, failing", id);
            tx.execute(
                "UPDATE execution_steps SET status = 'failed', \
                 error = 'timeout: no step progress', finished_at = ?1 \
                 WHERE execution_id = ?2 AND status IN ('pending', 'running')",
                params![now(), id],
            )?;
            tx.execute(
                "UPDATE executions SET status = 'failed', \
                 error = 'timeout: no step progress', finished_at = ?1 \
                 WHERE id = ?2 AND finished_at IS NULL",
                params![now(), id],
            )?;
        }
        tx.commit()?;
        Ok(stalled)
    }
}

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(3)?;
    Ok(Execution {
        id: row.get(0)?,
        test_case_id: row.get(1)?,
        tenant_id: row.get(2)?,
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
        error: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        steps: Vec::new(),
    })
}

fn step_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepExecution> {
    let status: String = row.get(2)?;
    let raw: Option<String> = row.get(3)?;
    let parsed: Option<String> = row.get(4)?;
    Ok(StepExecution {
        id: row.get(0)?,
        step_index: row.get::<_, i64>(1)? as usize,
        status: StepStatus::parse(&status).unwrap_or(StepStatus::Failed),
        result: raw.map(|raw| StepResult {
            raw,
            parsed: parsed.and_then(|p| serde_json::from_str(&p).ok()),
        }),
        error: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
    })
}
