//! Tenant-scoped access control.
//!
//! Every mutating and every cross-tenant operation goes through
//! [`AccessControl::authorize`]; authorization logic lives here and nowhere
//! else. The check is pure: callers resolve the owning tenant of the target
//! entity (walking Suite -> Project -> Tenant where needed) and pass it in.

use std::collections::{HashMap, HashSet};
use testforge_common::{Error, Principal, Result, Role};

/// Scope of the entity an operation targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// System-level target (tenant CRUD, cross-tenant listings).
    System,
    /// Entity owned by the given tenant.
    Tenant(String),
}

impl Scope {
    pub fn tenant(id: impl Into<String>) -> Self {
        Scope::Tenant(id.into())
    }
}

/// A role's permission grants within the policy table.
struct RolePolicy {
    role: Role,
    /// Permission strings of the form `resource:action`; `*` and
    /// `resource:*` wildcards are supported.
    permissions: Vec<&'static str>,
    inherits: Vec<Role>,
}

/// Policy engine evaluating `resource:action` permissions per role.
///
/// The role table is fixed at startup; there is no runtime mutation, so no
/// locking is needed.
pub struct PolicyEngine {
    role_permissions: HashMap<Role, HashSet<&'static str>>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        let policies = vec![
            RolePolicy {
                role: Role::Admin,
                permissions: vec!["*"],
                inherits: vec![],
            },
            RolePolicy {
                role: Role::Viewer,
                permissions: vec![
                    "tenant:read",
                    "project:read",
                    "suite:read",
                    "test:read",
                    "step_definition:read",
                    "execution:read",
                ],
                inherits: vec![],
            },
            RolePolicy {
                role: Role::Editor,
                permissions: vec![
                    "suite:create",
                    "test:create",
                    "test:update",
                    "step_definition:create",
                    "execution:execute",
                ],
                inherits: vec![Role::Viewer],
            },
            RolePolicy {
                role: Role::TestManager,
                permissions: vec![
                    "project:*",
                    "suite:*",
                    "test:*",
                    "step_definition:*",
                    "execution:*",
                ],
                inherits: vec![Role::Viewer],
            },
        ];

        let mut role_permissions: HashMap<Role, HashSet<&'static str>> = HashMap::new();

        // Direct permissions
        for policy in &policies {
            role_permissions
                .entry(policy.role)
                .or_default()
                .extend(policy.permissions.iter().copied());
        }

        // Single-level inheritance
        for policy in &policies {
            for parent in &policy.inherits {
                if let Some(parent_perms) = role_permissions.get(parent).cloned() {
                    if let Some(child_perms) = role_permissions.get_mut(&policy.role) {
                        child_perms.extend(parent_perms);
                    }
                }
            }
        }

        Self { role_permissions }
    }

    /// Check if a role has a specific permission.
    pub fn has_permission(&self, role: Role, permission: &str) -> bool {
        let Some(perms) = self.role_permissions.get(&role) else {
            return false;
        };
        if perms.contains("*") || perms.contains(permission) {
            return true;
        }
        // Resource wildcard, e.g. "test:*" matches "test:delete"
        if let Some((resource, _action)) = permission.split_once(':') {
            let wildcard = format!("{}:*", resource);
            if perms.contains(wildcard.as_str()) {
                return true;
            }
        }
        false
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Access control consumed by the composition store and the dispatcher.
pub struct AccessControl {
    engine: PolicyEngine,
}

impl AccessControl {
    pub fn new() -> Self {
        Self {
            engine: PolicyEngine::new(),
        }
    }

    /// Authorize `principal` to perform `permission` against an entity in
    /// `scope`. Failure yields `Forbidden`; no caller mutates state before
    /// this returns Ok.
    pub fn authorize(&self, principal: &Principal, permission: &str, scope: &Scope) -> Result<()> {
        // System-level role bypasses tenant scoping entirely
        if principal.role == Role::Admin {
            return Ok(());
        }

        match scope {
            Scope::System => {
                return Err(Error::Forbidden(format!(
                    "{} requires a system-level role",
                    permission
                )));
            }
            Scope::Tenant(tenant_id) => {
                if principal.tenant_id.as_deref() != Some(tenant_id.as_str()) {
                    return Err(Error::Forbidden(format!(
                        "user '{}' has no access to tenant {}",
                        principal.username, tenant_id
                    )));
                }
            }
        }

        if !self.engine.has_permission(principal.role, permission) {
            return Err(Error::Forbidden(format!(
                "role '{}' lacks permission {}",
                principal.role.as_str(),
                permission
            )));
        }

        Ok(())
    }
}

impl Default for AccessControl {
    fn default() -> Self {
        Self::new()
    }
}
