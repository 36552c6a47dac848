//! SQLite database for TestForge state persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence.
///
/// All access goes through a single connection behind a mutex; multi-row
/// updates run inside one transaction so concurrent pollers never observe a
/// half-written execution.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that manage their own
    /// queries within the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Tenants: root of isolation
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                schema_name TEXT NOT NULL UNIQUE,
                test_manager_id TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tenants_schema ON tenants(schema_name);

            -- Projects, owned by one tenant
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_projects_tenant ON projects(tenant_id);

            -- Test suites, owned by one project
            CREATE TABLE IF NOT EXISTS test_suites (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                continue_on_failure INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suites_project ON test_suites(project_id);

            -- Test cases; the ordered step instances are stored as JSON
            CREATE TABLE IF NOT EXISTS test_cases (
                id TEXT PRIMARY KEY,
                suite_id TEXT NOT NULL,
                name TEXT NOT NULL,
                steps TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_test_cases_suite ON test_cases(suite_id);

            -- Tenant-custom step definitions (predefined ones live in memory)
            CREATE TABLE IF NOT EXISTS step_definitions (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                executor TEXT NOT NULL,
                input_schema TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_step_defs_tenant_name
                ON step_definitions(tenant_id, name);

            -- Executions; history is retained when the test case goes away
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                test_case_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_case ON executions(test_case_id);
            CREATE INDEX IF NOT EXISTS idx_executions_tenant_status
                ON executions(tenant_id, status);

            -- Per-step execution rows
            CREATE TABLE IF NOT EXISTS execution_steps (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                status TEXT NOT NULL,
                result_raw TEXT,
                result_parsed TEXT,
                error TEXT,
                started_at INTEGER,
                finished_at INTEGER,
                UNIQUE(execution_id, step_index)
            );
            CREATE INDEX IF NOT EXISTS idx_execution_steps_exec
                ON execution_steps(execution_id);

            -- Local users for Basic auth
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                password_sha256 TEXT NOT NULL,
                role TEXT NOT NULL,
                tenant_id TEXT,
                created_at INTEGER NOT NULL
            );

            -- Issued API keys, stored hashed
            CREATE TABLE IF NOT EXISTS api_keys (
                key_sha256 TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_init() {
        let db = Database::open_memory().unwrap();
        let conn = db.connection();
        let conn = conn.lock();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('tenants', 'projects', 'test_suites', 'test_cases', 'step_definitions', \
                  'executions', 'execution_steps', 'users', 'api_keys')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 9);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db")).unwrap();
        let conn = db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, schema_name, created_at) VALUES ('t1', 'T1', 't1', 0)",
            [],
        )
        .unwrap();
    }
}
