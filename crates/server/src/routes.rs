//! HTTP API routes.
//!
//! All resources live under `/api`. Every route except the health probe goes
//! through the auth middleware, which attaches the resolved [`Principal`];
//! handlers then authorize against the owning tenant before touching state.

use crate::auth::{self, AuthPrincipal, UserStore};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use testforge_common::{
    Error, ParamSpec, Principal, Role, StepInstance,
};
use testforge_engine::{AccessControl, CompositionStore, Dispatcher, Scope};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: CompositionStore,
    pub dispatcher: Dispatcher,
    pub access: Arc<AccessControl>,
    pub users: UserStore,
}

/// Error wrapper translating engine errors into HTTP responses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::AlreadyExists { .. } | Error::Conflict(_) | Error::StaleExecution { .. } => {
                StatusCode::CONFLICT
            }
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({ "error": self.0.to_string() });
        if let Error::Validation {
            step_index: Some(index),
            ..
        } = &self.0
        {
            body["step_index"] = serde_json::json!(index);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the API router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        // Tenants
        .route("/tenants", post(create_tenant).get(list_tenants))
        .route(
            "/tenants/:id",
            get(get_tenant).put(update_tenant).delete(delete_tenant),
        )
        // Projects
        .route(
            "/tenants/:id/projects",
            post(create_project).get(list_projects),
        )
        .route("/projects/:id", get(get_project))
        // Suites
        .route("/projects/:id/suites", post(create_suite).get(list_suites))
        .route("/suites/:id", get(get_suite))
        // Test cases
        .route("/suites/:id/tests", post(create_test).get(list_tests))
        .route("/tests/:id", get(get_test).delete(delete_test))
        // Step definitions
        .route(
            "/step-definitions",
            post(create_step_definition).get(list_step_definitions),
        )
        .route("/step-definitions/:id", put(update_step_definition))
        // Executions
        .route("/tests/:id/executions", post(submit_execution))
        .route("/executions", get(list_executions))
        .route(
            "/executions/:id",
            get(get_execution).delete(delete_execution),
        )
        .route("/executions/:id/cancel", post(cancel_execution))
        // Users and keys
        .route("/users", post(create_user))
        .route("/api-keys", post(issue_api_key))
        .route_layer(middleware::from_fn_with_state(
            state.users.clone(),
            auth::require_auth,
        ));

    let api = Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": testforge_common::VERSION,
    }))
}

// ============================================================================
// Tenants
// ============================================================================

#[derive(Deserialize)]
struct CreateTenantRequest {
    name: String,
    schema_name: String,
}

async fn create_tenant(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Json(req): Json<CreateTenantRequest>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "tenant:create", &Scope::System)?;
    let tenant = state.store.create_tenant(&req.name, &req.schema_name)?;
    Ok((StatusCode::CREATED, Json(tenant)).into_response())
}

async fn list_tenants(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "tenant:read", &Scope::System)?;
    Ok(Json(state.store.list_tenants()?).into_response())
}

async fn get_tenant(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "tenant:read", &Scope::tenant(&id))?;
    Ok(Json(state.store.get_tenant(&id)?).into_response())
}

#[derive(Deserialize)]
struct UpdateTenantRequest {
    name: Option<String>,
    test_manager_id: Option<String>,
}

async fn update_tenant(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTenantRequest>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "tenant:update", &Scope::System)?;
    let tenant = state
        .store
        .update_tenant(&id, req.name.as_deref(), req.test_manager_id.as_deref())?;
    Ok(Json(tenant).into_response())
}

async fn delete_tenant(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "tenant:delete", &Scope::System)?;
    state.store.delete_tenant(&id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// Projects and suites
// ============================================================================

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    #[serde(default)]
    description: String,
}

async fn create_project(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(tenant_id): Path<String>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "project:create", &Scope::tenant(&tenant_id))?;
    let project = state
        .store
        .create_project(&tenant_id, &req.name, &req.description)?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn list_projects(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "project:read", &Scope::tenant(&tenant_id))?;
    Ok(Json(state.store.list_projects(&tenant_id)?).into_response())
}

async fn get_project(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let project = state.store.get_project(&id)?;
    state
        .access
        .authorize(&principal, "project:read", &Scope::tenant(&project.tenant_id))?;
    Ok(Json(project).into_response())
}

#[derive(Deserialize)]
struct CreateSuiteRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    continue_on_failure: bool,
}

async fn create_suite(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(project_id): Path<String>,
    Json(req): Json<CreateSuiteRequest>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_project(&project_id)?;
    state
        .access
        .authorize(&principal, "suite:create", &Scope::tenant(&tenant_id))?;
    let suite = state.store.create_suite(
        &project_id,
        &req.name,
        &req.description,
        req.continue_on_failure,
    )?;
    Ok((StatusCode::CREATED, Json(suite)).into_response())
}

async fn list_suites(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(project_id): Path<String>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_project(&project_id)?;
    state
        .access
        .authorize(&principal, "suite:read", &Scope::tenant(&tenant_id))?;
    Ok(Json(state.store.list_suites(&project_id)?).into_response())
}

async fn get_suite(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_suite(&id)?;
    state
        .access
        .authorize(&principal, "suite:read", &Scope::tenant(&tenant_id))?;
    Ok(Json(state.store.get_suite(&id)?).into_response())
}

// ============================================================================
// Test cases
// ============================================================================

#[derive(Deserialize)]
struct CreateTestRequest {
    name: String,
    #[serde(default)]
    steps: Vec<StepInstance>,
}

async fn create_test(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(suite_id): Path<String>,
    Json(req): Json<CreateTestRequest>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_suite(&suite_id)?;
    state
        .access
        .authorize(&principal, "test:create", &Scope::tenant(&tenant_id))?;
    let case = state.store.create_test_case(&suite_id, &req.name, req.steps)?;
    Ok((StatusCode::CREATED, Json(case)).into_response())
}

async fn list_tests(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(suite_id): Path<String>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_suite(&suite_id)?;
    state
        .access
        .authorize(&principal, "test:read", &Scope::tenant(&tenant_id))?;
    Ok(Json(state.store.list_test_cases(&suite_id)?).into_response())
}

async fn get_test(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_test_case(&id)?;
    state
        .access
        .authorize(&principal, "test:read", &Scope::tenant(&tenant_id))?;
    Ok(Json(state.store.get_test_case(&id)?).into_response())
}

async fn delete_test(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let tenant_id = state.store.tenant_of_test_case(&id)?;
    state
        .access
        .authorize(&principal, "test:delete", &Scope::tenant(&tenant_id))?;
    state.store.delete_test_case(&id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ============================================================================
// Step definitions
// ============================================================================

/// Resolve the tenant a step-definition request operates in: the caller's own
/// tenant, or an explicit `tenant_id` query parameter for admins.
fn step_def_tenant(
    principal: &Principal,
    query_tenant: Option<String>,
) -> std::result::Result<String, ApiError> {
    query_tenant
        .or_else(|| principal.tenant_id.clone())
        .ok_or_else(|| {
            ApiError(Error::validation(
                None,
                "tenant_id",
                "required for callers without a tenant",
            ))
        })
}

#[derive(Deserialize)]
struct TenantQuery {
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
struct CreateStepDefinitionRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    executor: String,
    #[serde(default)]
    input_schema: Vec<ParamSpec>,
}

async fn create_step_definition(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Query(query): Query<TenantQuery>,
    Json(req): Json<CreateStepDefinitionRequest>,
) -> ApiResult<Response> {
    let tenant_id = step_def_tenant(&principal, query.tenant_id)?;
    state.access.authorize(
        &principal,
        "step_definition:create",
        &Scope::tenant(&tenant_id),
    )?;
    let def = state.store.registry().register(
        &tenant_id,
        &req.name,
        &req.description,
        &req.executor,
        req.input_schema,
    )?;
    Ok((StatusCode::CREATED, Json(def)).into_response())
}

async fn list_step_definitions(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Response> {
    let tenant_id = step_def_tenant(&principal, query.tenant_id)?;
    state.access.authorize(
        &principal,
        "step_definition:read",
        &Scope::tenant(&tenant_id),
    )?;
    Ok(Json(state.store.registry().list(&tenant_id)?).into_response())
}

#[derive(Deserialize)]
struct UpdateStepDefinitionRequest {
    description: Option<String>,
    input_schema: Option<Vec<ParamSpec>>,
}

async fn update_step_definition(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStepDefinitionRequest>,
) -> ApiResult<Response> {
    let scope = match state.store.tenant_of_step_definition(&id)? {
        Some(tenant_id) => Scope::tenant(tenant_id),
        // Predefined definitions are system-owned; update rejects them anyway
        None => Scope::System,
    };
    state
        .access
        .authorize(&principal, "step_definition:update", &scope)?;
    let def = state
        .store
        .registry()
        .update(&id, req.description.as_deref(), req.input_schema)?;
    Ok(Json(def).into_response())
}

// ============================================================================
// Executions
// ============================================================================

async fn submit_execution(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(test_case_id): Path<String>,
) -> ApiResult<Response> {
    let execution = state.dispatcher.submit(&principal, &test_case_id)?;
    Ok((StatusCode::ACCEPTED, Json(execution)).into_response())
}

async fn get_execution(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.dispatcher.get(&principal, &id)?).into_response())
}

async fn list_executions(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Query(query): Query<TenantQuery>,
) -> ApiResult<Response> {
    let tenant_id = step_def_tenant(&principal, query.tenant_id)?;
    Ok(Json(state.dispatcher.list(&principal, &tenant_id)?).into_response())
}

async fn delete_execution(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    state.dispatcher.delete(&principal, &id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn cancel_execution(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.dispatcher.cancel(&principal, &id)?).into_response())
}

// ============================================================================
// Users and API keys
// ============================================================================

#[derive(Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
    role: Role,
    tenant_id: Option<String>,
}

async fn create_user(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<Response> {
    state
        .access
        .authorize(&principal, "user:create", &Scope::System)?;
    let created = state.users.create_user(
        &req.username,
        &req.password,
        req.role,
        req.tenant_id.as_deref(),
    )?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn issue_api_key(
    State(state): State<AppState>,
    Extension(AuthPrincipal(principal)): Extension<AuthPrincipal>,
) -> ApiResult<Response> {
    let key = state.users.issue_api_key(&principal.username)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "api_key": key })),
    )
        .into_response())
}
