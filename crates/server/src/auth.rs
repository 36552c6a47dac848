//! Authentication for the HTTP API.
//!
//! Two credential forms resolve to the same [`Principal`]: HTTP Basic
//! against the local user table, and an `x-api-key` header against issued
//! keys. Passwords and keys are stored as SHA-256 digests only.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use testforge_common::{now, sha256_hex, Database, Error, Principal, Result, Role};
use tracing::{info, warn};

/// Extension holding the authenticated caller.
#[derive(Clone)]
pub struct AuthPrincipal(pub Principal);

/// Local users and API keys in the shared state DB.
#[derive(Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        tenant_id: Option<&str>,
    ) -> Result<Principal> {
        if username.trim().is_empty() {
            return Err(Error::validation(None, "username", "must not be empty"));
        }
        if password.len() < 8 {
            return Err(Error::validation(
                None,
                "password",
                "must be at least 8 characters",
            ));
        }
        if role != Role::Admin && tenant_id.is_none() {
            return Err(Error::validation(
                None,
                "tenant_id",
                "required for tenant-scoped roles",
            ));
        }

        let conn = self.db.connection();
        let conn = conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, password_sha256, role, tenant_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![username, sha256_hex(password), role.as_str(), tenant_id, now()],
        )?;
        if inserted == 0 {
            return Err(Error::AlreadyExists {
                kind: "user".to_string(),
                id: username.to_string(),
            });
        }
        info!("Created user '{}' with role {}", username, role.as_str());
        Ok(Principal::new(username, role, tenant_id.map(String::from)))
    }

    pub fn authenticate_basic(&self, username: &str, password: &str) -> Result<Principal> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row: Option<(String, String, Option<String>)> = conn
            .query_row(
                "SELECT password_sha256, role, tenant_id FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (stored, role, tenant_id) =
            row.ok_or_else(|| Error::Forbidden("unknown user".to_string()))?;
        if stored != sha256_hex(password) {
            warn!("Failed Basic auth attempt for user '{}'", username);
            return Err(Error::Forbidden("bad credentials".to_string()));
        }
        let role = Role::parse(&role)
            .ok_or_else(|| Error::Internal(format!("user '{}' has unknown role", username)))?;
        Ok(Principal::new(username, role, tenant_id))
    }

    /// Issue an API key for an existing user. The clear-text key is returned
    /// exactly once; only its digest is stored.
    pub fn issue_api_key(&self, username: &str) -> Result<String> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let exists: Option<String> = conn
            .query_row(
                "SELECT username FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(Error::not_found("user", username));
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        let key = format!("tfk_{}", hex::encode(bytes));
        conn.execute(
            "INSERT INTO api_keys (key_sha256, username, created_at) VALUES (?1, ?2, ?3)",
            params![sha256_hex(&key), username, now()],
        )?;
        Ok(key)
    }

    pub fn authenticate_api_key(&self, key: &str) -> Result<Principal> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let row: Option<(String, String, Option<String>)> = conn
            .query_row(
                "SELECT u.username, u.role, u.tenant_id FROM api_keys k \
                 JOIN users u ON u.username = k.username WHERE k.key_sha256 = ?1",
                params![sha256_hex(key)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (username, role, tenant_id) =
            row.ok_or_else(|| Error::Forbidden("unknown api key".to_string()))?;
        let role = Role::parse(&role)
            .ok_or_else(|| Error::Internal(format!("user '{}' has unknown role", username)))?;
        Ok(Principal::new(username, role, tenant_id))
    }

    /// Seed the bootstrap admin on first start. No-op once any admin exists.
    pub fn seed_bootstrap_admin(&self, password: Option<&str>) -> Result<()> {
        {
            let conn = self.db.connection();
            let conn = conn.lock();
            let admins: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE role = 'admin'",
                [],
                |row| row.get(0),
            )?;
            if admins > 0 {
                return Ok(());
            }
        }

        match password {
            Some(password) => {
                self.create_user("admin", password, Role::Admin, None)?;
                info!("Bootstrap admin 'admin' created from configuration");
            }
            None => {
                let mut bytes = [0u8; 12];
                rand::thread_rng().fill(&mut bytes);
                let generated = hex::encode(bytes);
                self.create_user("admin", &generated, Role::Admin, None)?;
                // Printed once; there is no other way to retrieve it
                info!("Bootstrap admin 'admin' created with password: {}", generated);
            }
        }
        Ok(())
    }
}

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

fn resolve_principal(
    users: &UserStore,
    request: &Request,
) -> std::result::Result<Principal, Response> {
    if let Some(key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return users
            .authenticate_api_key(key)
            .map_err(|_| unauthorized("invalid api key"));
    }

    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized("missing credentials"))?;
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(|| unauthorized("unsupported authorization scheme"))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
        .ok_or_else(|| unauthorized("malformed basic credentials"))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| unauthorized("malformed basic credentials"))?;

    users
        .authenticate_basic(username, password)
        .map_err(|_| unauthorized("bad credentials"))
}

/// Middleware requiring authentication on every API route it wraps.
pub async fn require_auth(
    State(users): State<UserStore>,
    mut request: Request,
    next: Next,
) -> Response {
    match resolve_principal(&users, &request) {
        Ok(principal) => {
            request.extensions_mut().insert(AuthPrincipal(principal));
            next.run(request).await
        }
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> UserStore {
        UserStore::new(Database::open_memory().unwrap())
    }

    #[test]
    fn test_basic_auth_round_trip() {
        let store = users();
        store
            .create_user("alice", "s3cret-pass", Role::TestManager, Some("t1"))
            .unwrap();

        let principal = store.authenticate_basic("alice", "s3cret-pass").unwrap();
        assert_eq!(principal.role, Role::TestManager);
        assert_eq!(principal.tenant_id.as_deref(), Some("t1"));

        assert!(store.authenticate_basic("alice", "wrong").is_err());
        assert!(store.authenticate_basic("nobody", "s3cret-pass").is_err());
    }

    #[test]
    fn test_user_validation() {
        let store = users();
        assert!(store
            .create_user("bob", "short", Role::Viewer, Some("t1"))
            .is_err());
        // Tenant-scoped roles need a tenant
        assert!(store
            .create_user("bob", "long-enough", Role::Viewer, None)
            .is_err());
        store
            .create_user("bob", "long-enough", Role::Viewer, Some("t1"))
            .unwrap();
        assert!(matches!(
            store.create_user("bob", "long-enough", Role::Viewer, Some("t1")),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn test_api_key_round_trip() {
        let store = users();
        store
            .create_user("alice", "s3cret-pass", Role::Editor, Some("t1"))
            .unwrap();
        let key = store.issue_api_key("alice").unwrap();
        assert!(key.starts_with("tfk_"));

        let principal = store.authenticate_api_key(&key).unwrap();
        assert_eq!(principal.username, "alice");
        assert!(store.authenticate_api_key("tfk_bogus").is_err());
        assert!(store.issue_api_key("nobody").is_err());
    }

    #[test]
    fn test_bootstrap_admin_seeded_once() {
        let store = users();
        store.seed_bootstrap_admin(Some("bootstrap-pass")).unwrap();
        store.authenticate_basic("admin", "bootstrap-pass").unwrap();
        // Second seed is a no-op
        store.seed_bootstrap_admin(Some("other-pass")).unwrap();
        store.authenticate_basic("admin", "bootstrap-pass").unwrap();
    }
}
