//! Step definition registry.
//!
//! Predefined definitions are a process-wide read-only table loaded at
//! startup; tenant-custom definitions are persisted. The two namespaces are
//! disjoint: a custom definition never shadows a predefined one.

use once_cell::sync::Lazy;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use testforge_common::{
    new_id, now, Database, Error, ParamSpec, ParamType, Result, StepDefinition,
};
use tracing::debug;

fn param(name: &str, param_type: ParamType, required: bool) -> ParamSpec {
    ParamSpec {
        name: name.to_string(),
        param_type,
        required,
    }
}

fn predefined(
    id: &str,
    name: &str,
    description: &str,
    executor: &str,
    schema: Vec<ParamSpec>,
) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        tenant_id: None,
        name: name.to_string(),
        description: description.to_string(),
        executor: executor.to_string(),
        input_schema: schema,
        created_at: 0,
    }
}

/// Process-wide predefined step definitions, identical across tenants.
/// Never mutated after init, so no locking is needed.
pub static PREDEFINED_STEPS: Lazy<Vec<StepDefinition>> = Lazy::new(|| {
    vec![
        predefined(
            "builtin:navigate",
            "navigate",
            "Open a URL in the driven browser",
            "simulated",
            vec![param("url", ParamType::String, true)],
        ),
        predefined(
            "builtin:click",
            "click",
            "Click the element matching a selector",
            "simulated",
            vec![
                param("selector", ParamType::String, true),
                param("timeout_ms", ParamType::Number, false),
            ],
        ),
        predefined(
            "builtin:fill",
            "fill",
            "Fill an input field with a value",
            "simulated",
            vec![
                param("selector", ParamType::String, true),
                param("value", ParamType::String, true),
            ],
        ),
        predefined(
            "builtin:wait",
            "wait",
            "Wait for an element to appear",
            "simulated",
            vec![
                param("selector", ParamType::String, true),
                param("timeout_ms", ParamType::Number, false),
            ],
        ),
        predefined(
            "builtin:assert_text",
            "assert_text",
            "Assert that an element contains the given text",
            "simulated",
            vec![
                param("selector", ParamType::String, true),
                param("text", ParamType::String, true),
            ],
        ),
        predefined(
            "builtin:http_request",
            "http_request",
            "Perform an HTTP GET and record status and body",
            "http",
            vec![param("url", ParamType::String, true)],
        ),
    ]
});

/// Registry of step definitions: predefined plus tenant-custom.
#[derive(Clone)]
pub struct StepRegistry {
    db: Database,
}

impl StepRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a tenant-custom step definition.
    pub fn register(
        &self,
        tenant_id: &str,
        name: &str,
        description: &str,
        executor: &str,
        input_schema: Vec<ParamSpec>,
    ) -> Result<StepDefinition> {
        if name.trim().is_empty() {
            return Err(Error::validation(None, "name", "must not be empty"));
        }
        validate_schema(&input_schema)?;

        if PREDEFINED_STEPS.iter().any(|d| d.name == name) {
            return Err(Error::Conflict(format!(
                "name '{}' is reserved by a predefined definition",
                name
            )));
        }

        let def = StepDefinition {
            id: new_id(),
            tenant_id: Some(tenant_id.to_string()),
            name: name.to_string(),
            description: description.to_string(),
            executor: if executor.trim().is_empty() {
                "simulated".to_string()
            } else {
                executor.to_string()
            },
            input_schema,
            created_at: now(),
        };

        let conn = self.db.connection();
        let conn = conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO step_definitions \
             (id, tenant_id, name, description, executor, input_schema, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                def.id,
                tenant_id,
                def.name,
                def.description,
                def.executor,
                serde_json::to_string(&def.input_schema)?,
                def.created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists {
                kind: "step definition".to_string(),
                id: name.to_string(),
            });
        }

        debug!("Registered step definition {} ({})", def.name, def.id);
        Ok(def)
    }

    /// Get a definition by id, predefined or custom.
    pub fn get(&self, id: &str) -> Result<StepDefinition> {
        if let Some(def) = PREDEFINED_STEPS.iter().find(|d| d.id == id) {
            return Ok(def.clone());
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        let row = conn
            .query_row(
                "SELECT id, tenant_id, name, description, executor, input_schema, created_at \
                 FROM step_definitions WHERE id = ?1",
                params![id],
                def_from_row,
            )
            .optional()?;
        row.ok_or_else(|| Error::not_found("step definition", id))
    }

    /// List definitions visible to a tenant: predefined first (table order),
    /// then the tenant's customs by creation order.
    pub fn list(&self, tenant_id: &str) -> Result<Vec<StepDefinition>> {
        let mut out: Vec<StepDefinition> = PREDEFINED_STEPS.clone();

        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, description, executor, input_schema, created_at \
             FROM step_definitions WHERE tenant_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![tenant_id], def_from_row)?;
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Update a custom definition. Schema changes are rejected with
    /// `Conflict` while any test case step still references the definition;
    /// description edits are always allowed. Predefined definitions are
    /// read-only.
    pub fn update(
        &self,
        id: &str,
        description: Option<&str>,
        input_schema: Option<Vec<ParamSpec>>,
    ) -> Result<StepDefinition> {
        if PREDEFINED_STEPS.iter().any(|d| d.id == id) {
            return Err(Error::Conflict(
                "predefined step definitions are read-only".to_string(),
            ));
        }

        let mut def = self.get(id)?;

        if let Some(schema) = input_schema {
            validate_schema(&schema)?;
            if self.is_referenced(id)? {
                return Err(Error::Conflict(format!(
                    "step definition {} is referenced by existing test cases; \
                     schema changes are not allowed",
                    id
                )));
            }
            def.input_schema = schema;
        }
        if let Some(desc) = description {
            def.description = desc.to_string();
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "UPDATE step_definitions SET description = ?1, input_schema = ?2 WHERE id = ?3",
            params![
                def.description,
                serde_json::to_string(&def.input_schema)?,
                id
            ],
        )?;
        Ok(def)
    }

    /// Whether any persisted test case step references the definition.
    pub fn is_referenced(&self, def_id: &str) -> Result<bool> {
        let conn = self.db.connection();
        let conn = conn.lock();
        // LIKE prefilter, then a real parse to rule out false positives.
        let mut stmt =
            conn.prepare("SELECT steps FROM test_cases WHERE steps LIKE '%' || ?1 || '%'")?;
        let rows = stmt.query_map(params![def_id], |row| row.get::<_, String>(0))?;
        for row in rows {
            let steps: Vec<testforge_common::StepInstance> = serde_json::from_str(&row?)?;
            if steps.iter().any(|s| s.step_definition_id == def_id) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn def_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepDefinition> {
    let schema_json: String = row.get(5)?;
    Ok(StepDefinition {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        executor: row.get(4)?,
        input_schema: serde_json::from_str(&schema_json).unwrap_or_default(),
        created_at: row.get(6)?,
    })
}

fn validate_schema(schema: &[ParamSpec]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for spec in schema {
        if spec.name.trim().is_empty() {
            return Err(Error::validation(None, "input_schema", "parameter name must not be empty"));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(Error::validation(
                None,
                "input_schema",
                format!("duplicate parameter name '{}'", spec.name),
            ));
        }
    }
    Ok(())
}

/// Validate a step instance's parameters against a definition's input schema.
///
/// Required fields must be present; values must be coercible to the declared
/// type; unknown parameter names are rejected. Fails fast on the first
/// violation.
pub fn validate_parameters(
    def: &StepDefinition,
    parameters: &serde_json::Map<String, Value>,
    step_index: usize,
) -> Result<()> {
    for spec in &def.input_schema {
        match parameters.get(&spec.name) {
            None => {
                if spec.required {
                    return Err(Error::validation(
                        Some(step_index),
                        &spec.name,
                        "required parameter is missing",
                    ));
                }
            }
            Some(value) => {
                if !coercible(value, spec.param_type) {
                    return Err(Error::validation(
                        Some(step_index),
                        &spec.name,
                        format!("value is not coercible to {:?}", spec.param_type),
                    ));
                }
            }
        }
    }

    for name in parameters.keys() {
        if !def.input_schema.iter().any(|s| &s.name == name) {
            return Err(Error::validation(
                Some(step_index),
                name,
                format!("unknown parameter for step definition '{}'", def.name),
            ));
        }
    }

    Ok(())
}

fn coercible(value: &Value, ty: ParamType) -> bool {
    match ty {
        ParamType::String => value.is_string(),
        ParamType::Number => match value {
            Value::Number(_) => true,
            Value::String(s) => s.parse::<f64>().is_ok(),
            _ => false,
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => true,
            Value::String(s) => s == "true" || s == "false",
            _ => false,
        },
        ParamType::Json => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> StepRegistry {
        StepRegistry::new(Database::open_memory().unwrap())
    }

    fn obj(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn test_register_and_list_order() {
        let reg = registry();
        reg.register("t1", "login", "", "simulated", vec![param("user", ParamType::String, true)])
            .unwrap();
        reg.register("t1", "checkout", "", "simulated", vec![])
            .unwrap();
        reg.register("t2", "other", "", "simulated", vec![]).unwrap();

        let defs = reg.list("t1").unwrap();
        let predefined_count = PREDEFINED_STEPS.len();
        assert_eq!(defs.len(), predefined_count + 2);
        // Predefined first, customs in creation order
        assert!(defs[..predefined_count].iter().all(|d| d.tenant_id.is_none()));
        assert_eq!(defs[predefined_count].name, "login");
        assert_eq!(defs[predefined_count + 1].name, "checkout");
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let reg = registry();
        assert!(matches!(
            reg.register("t1", "", "", "simulated", vec![]),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            reg.register(
                "t1",
                "dup",
                "",
                "simulated",
                vec![
                    param("a", ParamType::String, true),
                    param("a", ParamType::Number, false)
                ]
            ),
            Err(Error::Validation { .. })
        ));
        // Predefined names are reserved
        assert!(matches!(
            reg.register("t1", "navigate", "", "simulated", vec![]),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_duplicate_name_per_tenant() {
        let reg = registry();
        reg.register("t1", "login", "", "simulated", vec![]).unwrap();
        assert!(matches!(
            reg.register("t1", "login", "", "simulated", vec![]),
            Err(Error::AlreadyExists { .. })
        ));
        // Same name in another tenant is fine
        reg.register("t2", "login", "", "simulated", vec![]).unwrap();
    }

    #[test]
    fn test_predefined_read_only() {
        let reg = registry();
        assert!(matches!(
            reg.update("builtin:navigate", Some("new"), None),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_validate_parameters() {
        let def = predefined(
            "d",
            "d",
            "",
            "simulated",
            vec![
                param("url", ParamType::String, true),
                param("quantity", ParamType::Number, false),
                param("flag", ParamType::Boolean, false),
            ],
        );

        assert!(validate_parameters(&def, &obj(json!({"url": "http://x"})), 0).is_ok());
        assert!(
            validate_parameters(&def, &obj(json!({"url": "http://x", "quantity": "12"})), 0)
                .is_ok()
        );
        assert!(
            validate_parameters(&def, &obj(json!({"url": "http://x", "flag": "true"})), 0).is_ok()
        );

        // Missing required
        let err = validate_parameters(&def, &obj(json!({})), 3).unwrap_err();
        match err {
            Error::Validation {
                step_index, field, ..
            } => {
                assert_eq!(step_index, Some(3));
                assert_eq!(field, "url");
            }
            other => panic!("unexpected error: {other}"),
        }

        // Wrong type
        assert!(
            validate_parameters(&def, &obj(json!({"url": 7})), 0).is_err()
        );
        // Unknown parameter
        assert!(
            validate_parameters(&def, &obj(json!({"url": "x", "bogus": 1})), 0).is_err()
        );
    }
}
