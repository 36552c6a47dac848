//! Test composition store.
//!
//! Tenant -> Project -> TestSuite -> TestCase, with the ordered step
//! instances of a test case validated against their step definitions at save
//! time. Mutations are transactional: a test case with an invalid step never
//! becomes visible to readers.

use crate::registry::{validate_parameters, StepRegistry};
use rusqlite::{params, OptionalExtension};
use testforge_common::{
    new_id, now, Database, Error, Project, Result, StepInstance, Tenant, TestCase, TestSuite,
};
use tracing::{debug, info};

/// Composition store over the shared state DB.
#[derive(Clone)]
pub struct CompositionStore {
    db: Database,
    registry: StepRegistry,
}

impl CompositionStore {
    pub fn new(db: Database) -> Self {
        let registry = StepRegistry::new(db.clone());
        Self { db, registry }
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    // ========================================================================
    // Tenants
    // ========================================================================

    /// Create a tenant. `schema_name` is sanitized from free-form input and
    /// then validated; duplicates are rejected.
    pub fn create_tenant(&self, name: &str, schema_name: &str) -> Result<Tenant> {
        if name.trim().is_empty() {
            return Err(Error::validation(None, "name", "must not be empty"));
        }
        let schema_name = sanitize_schema_name(schema_name);
        if !schema_name_valid(&schema_name) {
            return Err(Error::validation(
                None,
                "schema_name",
                format!("invalid schema name after sanitization: '{}'", schema_name),
            ));
        }

        let tenant = Tenant {
            id: new_id(),
            name: name.to_string(),
            schema_name,
            test_manager_id: None,
            created_at: now(),
        };

        let conn = self.db.connection();
        let conn = conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO tenants (id, name, schema_name, test_manager_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant.id,
                tenant.name,
                tenant.schema_name,
                tenant.test_manager_id,
                tenant.created_at
            ],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists {
                kind: "tenant".to_string(),
                id: tenant.schema_name,
            });
        }

        info!("Created tenant {} ({})", tenant.name, tenant.id);
        Ok(tenant)
    }

    pub fn get_tenant(&self, id: &str) -> Result<Tenant> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, name, schema_name, test_manager_id, created_at FROM tenants WHERE id = ?1",
            params![id],
            tenant_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("tenant", id))
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, schema_name, test_manager_id, created_at \
             FROM tenants ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], tenant_from_row)?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    pub fn update_tenant(
        &self,
        id: &str,
        name: Option<&str>,
        test_manager_id: Option<&str>,
    ) -> Result<Tenant> {
        let mut tenant = self.get_tenant(id)?;
        if let Some(name) = name {
            if name.trim().is_empty() {
                return Err(Error::validation(None, "name", "must not be empty"));
            }
            tenant.name = name.to_string();
        }
        if let Some(manager) = test_manager_id {
            tenant.test_manager_id = Some(manager.to_string());
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE tenants SET name = ?1, test_manager_id = ?2 WHERE id = ?3",
            params![tenant.name, tenant.test_manager_id, id],
        )?;
        Ok(tenant)
    }

    /// Irreversibly delete a tenant and everything beneath it: projects,
    /// suites, test cases, executions, custom step definitions, and users.
    /// A single transaction so readers never see a half-deleted tree.
    pub fn delete_tenant(&self, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let mut conn = conn.lock();
        let tx = conn.transaction()?;

        let existed: Option<String> = tx
            .query_row("SELECT id FROM tenants WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if existed.is_none() {
            return Err(Error::not_found("tenant", id));
        }

        tx.execute(
            "DELETE FROM execution_steps WHERE execution_id IN \
             (SELECT id FROM executions WHERE tenant_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM executions WHERE tenant_id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM test_cases WHERE suite_id IN \
             (SELECT s.id FROM test_suites s \
              JOIN projects p ON s.project_id = p.id WHERE p.tenant_id = ?1)",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM test_suites WHERE project_id IN \
             (SELECT id FROM projects WHERE tenant_id = ?1)",
            params![id],
        )?;
        tx.execute("DELETE FROM projects WHERE tenant_id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM step_definitions WHERE tenant_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM users WHERE tenant_id = ?1", params![id])?;
        tx.execute("DELETE FROM tenants WHERE id = ?1", params![id])?;

        tx.commit()?;
        info!("Deleted tenant {} and all owned entities", id);
        Ok(())
    }

    // ========================================================================
    // Projects
    // ========================================================================

    pub fn create_project(
        &self,
        tenant_id: &str,
        name: &str,
        description: &str,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(Error::validation(None, "name", "must not be empty"));
        }
        // Owning tenant must exist
        self.get_tenant(tenant_id)?;

        let project = Project {
            id: new_id(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: now(),
        };

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO projects (id, tenant_id, name, description, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id,
                project.tenant_id,
                project.name,
                project.description,
                project.created_at
            ],
        )?;

        debug!("Created project {} in tenant {}", project.id, tenant_id);
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Project> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, name, description, created_at FROM projects WHERE id = ?1",
            params![id],
            project_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("project", id))
    }

    pub fn list_projects(&self, tenant_id: &str) -> Result<Vec<Project>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, description, created_at \
             FROM projects WHERE tenant_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id], project_from_row)?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    // ========================================================================
    // Test suites
    // ========================================================================

    pub fn create_suite(
        &self,
        project_id: &str,
        name: &str,
        description: &str,
        continue_on_failure: bool,
    ) -> Result<TestSuite> {
        if name.trim().is_empty() {
            return Err(Error::validation(None, "name", "must not be empty"));
        }
        self.get_project(project_id)?;

        let suite = TestSuite {
            id: new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            continue_on_failure,
            created_at: now(),
        };

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO test_suites \
             (id, project_id, name, description, continue_on_failure, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                suite.id,
                suite.project_id,
                suite.name,
                suite.description,
                suite.continue_on_failure as i64,
                suite.created_at
            ],
        )?;

        debug!("Created suite {} in project {}", suite.id, project_id);
        Ok(suite)
    }

    pub fn get_suite(&self, id: &str) -> Result<TestSuite> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, project_id, name, description, continue_on_failure, created_at \
             FROM test_suites WHERE id = ?1",
            params![id],
            suite_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("test suite", id))
    }

    pub fn list_suites(&self, project_id: &str) -> Result<Vec<TestSuite>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, description, continue_on_failure, created_at \
             FROM test_suites WHERE project_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![project_id], suite_from_row)?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    // ========================================================================
    // Test cases
    // ========================================================================

    /// Create a test case. Each step instance is resolved against its step
    /// definition and its parameters validated; the first violation aborts
    /// with `Validation{step_index, field, reason}` and nothing is persisted.
    pub fn create_test_case(
        &self,
        suite_id: &str,
        name: &str,
        steps: Vec<StepInstance>,
    ) -> Result<TestCase> {
        if name.trim().is_empty() {
            return Err(Error::validation(None, "name", "must not be empty"));
        }
        self.get_suite(suite_id)?;

        for (index, step) in steps.iter().enumerate() {
            let def = self.registry.get(&step.step_definition_id).map_err(|e| match e {
                Error::NotFound { .. } => Error::validation(
                    Some(index),
                    "step_definition_id",
                    format!("unknown step definition '{}'", step.step_definition_id),
                ),
                other => other,
            })?;
            validate_parameters(&def, &step.parameters, index)?;
        }

        let case = TestCase {
            id: new_id(),
            suite_id: suite_id.to_string(),
            name: name.to_string(),
            steps,
            created_at: now(),
        };

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO test_cases (id, suite_id, name, steps, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                case.id,
                case.suite_id,
                case.name,
                serde_json::to_string(&case.steps)?,
                case.created_at
            ],
        )?;

        debug!("Created test case {} with {} steps", case.id, case.steps.len());
        Ok(case)
    }

    pub fn get_test_case(&self, id: &str) -> Result<TestCase> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.query_row(
            "SELECT id, suite_id, name, steps, created_at FROM test_cases WHERE id = ?1",
            params![id],
            case_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("test case", id))
    }

    pub fn list_test_cases(&self, suite_id: &str) -> Result<Vec<TestCase>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, suite_id, name, steps, created_at \
             FROM test_cases WHERE suite_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![suite_id], case_from_row)?;
        rows.map(|r| r.map_err(Error::from)).collect()
    }

    /// Delete a test case. Past executions are detached history and are
    /// retained.
    pub fn delete_test_case(&self, id: &str) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let deleted = conn.execute("DELETE FROM test_cases WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::not_found("test case", id));
        }
        debug!("Deleted test case {}", id);
        Ok(())
    }

    // ========================================================================
    // Scope resolution (Suite -> Project -> Tenant)
    // ========================================================================

    pub fn tenant_of_project(&self, project_id: &str) -> Result<String> {
        Ok(self.get_project(project_id)?.tenant_id)
    }

    pub fn tenant_of_suite(&self, suite_id: &str) -> Result<String> {
        let suite = self.get_suite(suite_id)?;
        self.tenant_of_project(&suite.project_id)
    }

    pub fn tenant_of_test_case(&self, test_case_id: &str) -> Result<String> {
        let case = self.get_test_case(test_case_id)?;
        self.tenant_of_suite(&case.suite_id)
    }

    pub fn tenant_of_step_definition(&self, def_id: &str) -> Result<Option<String>> {
        Ok(self.registry.get(def_id)?.tenant_id)
    }
}

fn tenant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        schema_name: row.get(2)?,
        test_manager_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn suite_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestSuite> {
    Ok(TestSuite {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        continue_on_failure: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

fn case_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestCase> {
    let steps_json: String = row.get(3)?;
    Ok(TestCase {
        id: row.get(0)?,
        suite_id: row.get(1)?,
        name: row.get(2)?,
        steps: serde_json::from_str(&steps_json).unwrap_or_default(),
        created_at: row.get(4)?,
    })
}

/// Best-effort canonicalization of a free-form schema name.
pub fn sanitize_schema_name(candidate: &str) -> String {
    let mut s: String = candidate
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if !s.starts_with(|c: char| c.is_ascii_lowercase()) {
        s = format!("t_{}", s);
    }
    s.truncate(60);
    s
}

pub fn schema_name_valid(schema: &str) -> bool {
    let mut chars = schema.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    schema.len() >= 2
        && schema.len() <= 61
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
