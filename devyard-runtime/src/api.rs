//! Axum HTTP API for environments, sessions, agents, and git operations.
//!
//! All failures share one envelope: `{success:false, error:"<kind>",
//! message?, suggestions?}`, with the taxonomy mapped onto status codes
//! (user-input/state 400, auth 401, not-found 404, conflict 409, upstream
//! and runtime 502, resource 503, everything invariant-shaped 500).

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::error;

use crate::auth::{self, CallerIdentity};
use crate::error::OrchestratorError;
use crate::gitops::GitOps;
use crate::pty::PtyBroker;
use crate::rate_limit;
use crate::service::{
    CreateAgentRequest, CreateEnvironmentRequest, CreateSessionRequest, EnvironmentService,
};
use crate::store::StateStore;
use crate::store::entity::{agents, environments, sessions};
use crate::terminal;

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

pub fn error_response(err: &OrchestratorError) -> Response {
    let (status, code, suggestions) = match err {
        OrchestratorError::UserInput(_) | OrchestratorError::State(_) => {
            (StatusCode::BAD_REQUEST, err.kind().to_string(), Vec::new())
        }
        OrchestratorError::Auth(_) => (StatusCode::UNAUTHORIZED, err.kind().to_string(), Vec::new()),
        OrchestratorError::NotFound(_) => {
            (StatusCode::NOT_FOUND, err.kind().to_string(), Vec::new())
        }
        OrchestratorError::Conflict { suggestions, .. } => {
            let code = if suggestions.is_empty() {
                "conflict"
            } else {
                "name-conflict"
            };
            (StatusCode::CONFLICT, code.to_string(), suggestions.clone())
        }
        OrchestratorError::Upstream(_) | OrchestratorError::Runtime(_) => {
            (StatusCode::BAD_GATEWAY, err.kind().to_string(), Vec::new())
        }
        OrchestratorError::Resource(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            err.kind().to_string(),
            Vec::new(),
        ),
        OrchestratorError::NoBranches(_)
        | OrchestratorError::Invariant(_)
        | OrchestratorError::Storage(_) => {
            if matches!(err, OrchestratorError::Invariant(_)) {
                error!("invariant violation: {err}");
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                err.kind().to_string(),
                Vec::new(),
            )
        }
    };

    let envelope = ErrorEnvelope {
        success: false,
        error: code,
        message: Some(err.message().to_string()),
        suggestions,
    };

    let mut response = (status, Json(envelope)).into_response();
    if err.retryable() {
        response
            .headers_mut()
            .insert("retry-after", axum::http::HeaderValue::from_static("30"));
    }
    response
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}

type ApiResult<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// State & caller extraction
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EnvironmentService>,
    pub gitops: Arc<GitOps>,
    pub broker: Arc<PtyBroker>,
    pub store: StateStore,
}

impl FromRequestParts<AppState> for CallerIdentity {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> std::result::Result<Self, Self::Rejection> {
        if let Some(token) = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(auth::extract_bearer_token)
        {
            return auth::resolve_bearer(&state.store, token)
                .await
                .map_err(|err| error_response(&err));
        }
        if let Some(user_id) = parts.headers.get("x-user-id").and_then(|v| v.to_str().ok()) {
            return auth::resolve_header(&state.store, user_id)
                .await
                .map_err(|err| error_response(&err));
        }
        Err(error_response(&OrchestratorError::Auth(
            "missing credentials: provide a bearer token or x-user-id".into(),
        )))
    }
}

// ---------------------------------------------------------------------------
// Wire representations
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvironmentView {
    id: String,
    user_id: String,
    name: String,
    repository_url: Option<String>,
    branch: String,
    sandbox_id: Option<String>,
    status: String,
    created_at: i64,
    updated_at: i64,
}

impl From<&environments::Model> for EnvironmentView {
    fn from(env: &environments::Model) -> Self {
        Self {
            id: env.id.clone(),
            user_id: env.user_id.clone(),
            name: env.name.clone(),
            repository_url: env.repository_url.clone(),
            branch: env.branch.clone(),
            sandbox_id: env.sandbox_id.clone(),
            status: env.status.clone(),
            created_at: env.created_at,
            updated_at: env.updated_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    id: String,
    environment_id: String,
    name: Option<String>,
    tmux_session: String,
    working_directory: String,
    branch: String,
    session_type: String,
    agent_id: Option<String>,
    status: String,
    created_at: i64,
    last_activity_at: i64,
}

impl From<&sessions::Model> for SessionView {
    fn from(session: &sessions::Model) -> Self {
        Self {
            id: session.id.clone(),
            environment_id: session.environment_id.clone(),
            name: session.name.clone(),
            tmux_session: session.tmux_session.clone(),
            working_directory: session.working_directory.clone(),
            branch: session.branch.clone(),
            session_type: session.session_type.clone(),
            agent_id: session.agent_id.clone(),
            status: session.status.clone(),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentView {
    id: String,
    name: String,
    kind: String,
    created_at: i64,
}

impl From<&agents::Model> for AgentView {
    fn from(agent: &agents::Model) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            kind: agent.kind.clone(),
            created_at: agent.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateEnvironmentBody {
    name: String,
    repository_url: Option<String>,
    branch: Option<String>,
}

async fn create_environment(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(body): Json<CreateEnvironmentBody>,
) -> ApiResult<Json<EnvironmentView>> {
    let env = state
        .service
        .create_environment(
            &caller,
            CreateEnvironmentRequest {
                name: body.name,
                repository_url: body.repository_url,
                branch: body.branch,
            },
        )
        .await?;
    Ok(Json(EnvironmentView::from(&env)))
}

async fn list_environments(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<EnvironmentView>>> {
    let envs = state.service.list_environments(&caller, &user_id).await?;
    Ok(Json(envs.iter().map(EnvironmentView::from).collect()))
}

async fn get_environment(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Json<EnvironmentView>> {
    let env = state.service.get_environment(&caller, &id).await?;
    Ok(Json(EnvironmentView::from(&env)))
}

async fn delete_environment(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.delete_environment(&caller, &id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Deserialize)]
struct CheckNameQuery {
    name: String,
}

async fn check_environment_name(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<CheckNameQuery>,
) -> ApiResult<Json<crate::names::NameAvailability>> {
    let availability = state
        .service
        .check_environment_name(&caller, &query.name)
        .await?;
    Ok(Json(availability))
}

// ---------------------------------------------------------------------------
// Session endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    environment_id: String,
    name: Option<String>,
    working_directory: Option<String>,
    session_type: Option<String>,
    agent_id: Option<String>,
    branch: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<SessionView>> {
    let session = state
        .service
        .create_session(
            &caller,
            CreateSessionRequest {
                environment_id: body.environment_id,
                name: body.name,
                working_directory: body.working_directory,
                session_type: body.session_type,
                agent_id: body.agent_id,
                branch: body.branch,
            },
        )
        .await?;
    Ok(Json(SessionView::from(&session)))
}

async fn list_sessions(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(environment_id): Path<String>,
) -> ApiResult<Json<Vec<SessionView>>> {
    let sessions = state.service.list_sessions(&caller, &environment_id).await?;
    Ok(Json(sessions.iter().map(SessionView::from).collect()))
}

async fn get_session(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let session = state.service.get_session(&caller, &id).await?;
    Ok(Json(SessionView::from(&session)))
}

async fn delete_session(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.delete_session(&caller, &id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckSessionNameQuery {
    environment_id: String,
    name: String,
}

async fn check_session_name(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<CheckSessionNameQuery>,
) -> ApiResult<Json<crate::names::NameAvailability>> {
    let availability = state
        .service
        .check_session_name(&caller, &query.environment_id, &query.name)
        .await?;
    Ok(Json(availability))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckBranchQuery {
    environment_id: String,
    branch: String,
}

async fn check_branch(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Query(query): Query<CheckBranchQuery>,
) -> ApiResult<Json<crate::names::NameAvailability>> {
    let availability = state
        .service
        .check_branch(&caller, &query.environment_id, &query.branch)
        .await?;
    Ok(Json(availability))
}

// ---------------------------------------------------------------------------
// Git endpoints
// ---------------------------------------------------------------------------

/// Resolve a session to (sandbox, worktree); sessions without one get a
/// `no worktree` state error.
async fn git_target(
    state: &AppState,
    caller: &CallerIdentity,
    session_id: &str,
) -> ApiResult<(String, String)> {
    let (session, env) = state
        .service
        .session_with_environment(caller, session_id)
        .await?;
    if env.repository_url.is_none() {
        return Err(OrchestratorError::State("no worktree".into()));
    }
    let sandbox = env.sandbox_id.ok_or_else(|| {
        OrchestratorError::State(format!("environment {} has no sandbox", env.id))
    })?;
    Ok((sandbox, session.working_directory))
}

async fn git_status(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(session_id): Path<String>,
) -> ApiResult<Json<crate::gitops::GitStatus>> {
    let (sandbox, workdir) = git_target(&state, &caller, &session_id).await?;
    Ok(Json(state.gitops.status(&sandbox, &workdir).await?))
}

#[derive(Deserialize)]
struct DiffQuery {
    file: Option<String>,
    staged: Option<bool>,
}

async fn git_diff(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(session_id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let (sandbox, workdir) = git_target(&state, &caller, &session_id).await?;
    let diff = state
        .gitops
        .diff(
            &sandbox,
            &workdir,
            query.file.as_deref(),
            query.staged.unwrap_or(false),
        )
        .await?;
    Ok(Json(serde_json::json!({ "diff": diff })))
}

#[derive(Deserialize)]
struct LogQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn git_log(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(session_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<crate::gitops::CommitInfo>>> {
    let (sandbox, workdir) = git_target(&state, &caller, &session_id).await?;
    let commits = state
        .gitops
        .log(
            &sandbox,
            &workdir,
            query.limit.unwrap_or(20).min(200),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(commits))
}

#[derive(Deserialize)]
struct CommitBody {
    message: String,
    files: Option<Vec<String>>,
}

async fn git_commit(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(session_id): Path<String>,
    Json(body): Json<CommitBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (sandbox, workdir) = git_target(&state, &caller, &session_id).await?;
    let hash = state
        .gitops
        .commit(
            &sandbox,
            &workdir,
            &body.message,
            body.files.as_deref(),
            &caller.user_id,
        )
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "hash": hash })))
}

#[derive(Deserialize)]
struct PushBody {
    remote: Option<String>,
    branch: Option<String>,
}

async fn git_push(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(session_id): Path<String>,
    Json(body): Json<PushBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let (sandbox, workdir) = git_target(&state, &caller, &session_id).await?;
    let output = state
        .gitops
        .push(
            &sandbox,
            &workdir,
            body.remote.as_deref().unwrap_or("origin"),
            body.branch.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "output": output })))
}

async fn git_repo_info(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(environment_id): Path<String>,
) -> ApiResult<Json<crate::repo::RepoInfo>> {
    let env = state.service.get_environment(&caller, &environment_id).await?;
    Ok(Json(state.service.repos().repo_info(&env).await?))
}

// ---------------------------------------------------------------------------
// Agent endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateAgentBody {
    name: String,
    kind: String,
    credential: Option<String>,
}

async fn create_agent(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Json(body): Json<CreateAgentBody>,
) -> ApiResult<Json<AgentView>> {
    let agent = state
        .service
        .create_agent(
            &caller,
            CreateAgentRequest {
                name: body.name,
                kind: body.kind,
                credential: body.credential,
            },
        )
        .await?;
    Ok(Json(AgentView::from(&agent)))
}

async fn list_agents(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<AgentView>>> {
    if caller.user_id != user_id {
        return Err(OrchestratorError::Auth(
            "cannot list another user's agents".into(),
        ));
    }
    let agents = state.service.list_agents(&caller).await?;
    Ok(Json(agents.iter().map(AgentView::from).collect()))
}

async fn delete_agent(
    State(state): State<AppState>,
    caller: CallerIdentity,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.service.delete_agent(&caller, &id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Auth bootstrap & health
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBody {
    user_id: String,
}

/// Development identity bootstrap. Production deployments front this with a
/// real identity provider and never expose the route.
async fn issue_token(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> ApiResult<Json<auth::IssuedToken>> {
    Ok(Json(auth::issue_token(&state.store, &body.user_id).await?))
}

async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let environments = state.store.environments_all().await?.len();
    Ok(Json(serde_json::json!({
        "status": "ok",
        "environments": environments,
    })))
}

// ---------------------------------------------------------------------------
// CORS
// ---------------------------------------------------------------------------

/// CORS policy from `DEVYARD_CORS_ALLOWED_ORIGINS`: a comma-separated
/// whitelist (credentials enabled), or wide open when the variable is unset
/// or `*` (development mode).
fn cors_layer() -> CorsLayer {
    use axum::http::{HeaderValue, Method, header};

    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let whitelist: Vec<HeaderValue> = std::env::var("DEVYARD_CORS_ALLOWED_ORIGINS")
        .ok()
        .filter(|value| !value.trim().is_empty() && value.trim() != "*")
        .map(|value| {
            value
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default();

    if whitelist.is_empty() {
        base.allow_origin(AllowOrigin::any())
    } else {
        base.allow_origin(AllowOrigin::list(whitelist))
            .allow_credentials(true)
    }
}

// ---------------------------------------------------------------------------
// Router builder
// ---------------------------------------------------------------------------

pub fn api_router(state: AppState) -> Router {
    let cors = cors_layer();

    let read_routes = Router::new()
        .route("/api/environments/check-name", get(check_environment_name))
        .route("/api/environments/user/{user_id}", get(list_environments))
        .route("/api/environments/{id}", get(get_environment))
        .route("/api/sessions/check-name", get(check_session_name))
        .route("/api/sessions/check-branch", get(check_branch))
        .route("/api/sessions/environment/{env_id}", get(list_sessions))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/git/status/{session_id}", get(git_status))
        .route("/api/git/diff/{session_id}", get(git_diff))
        .route("/api/git/log/{session_id}", get(git_log))
        .route("/api/git/repo/{env_id}", get(git_repo_info))
        .route("/api/agents/user/{user_id}", get(list_agents))
        .layer(middleware::from_fn(rate_limit::read_rate_limit));

    let write_routes = Router::new()
        .route("/api/environments", post(create_environment))
        .route(
            "/api/environments/{id}",
            axum::routing::delete(delete_environment),
        )
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", axum::routing::delete(delete_session))
        .route("/api/git/commit/{session_id}", post(git_commit))
        .route("/api/git/push/{session_id}", post(git_push))
        .route("/api/agents", post(create_agent))
        .route("/api/agents/{id}", axum::routing::delete(delete_agent))
        .route("/api/auth/token", post(issue_token))
        .layer(middleware::from_fn(rate_limit::write_rate_limit));

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/terminal/ws/{session_id}",
            get(terminal::terminal_ws),
        )
        .merge(read_routes)
        .merge(write_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        // Git pushes can legitimately run long; the WS upgrade itself
        // completes fast, so long-lived terminals are unaffected.
        .layer(tower_http::timeout::TimeoutLayer::new(
            std::time::Duration::from_secs(180),
        ))
        .layer(tower::limit::GlobalConcurrencyLimitLayer::new(1024))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::RepoStore;
    use crate::sandbox::mock::MockRuntime;
    use crate::sealer::ChaChaSealer;
    use crate::store::test_store;
    use crate::worktree::WorktreeManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serial_test::serial;
    use tower::util::ServiceExt;

    async fn app(dir: &std::path::Path) -> Router {
        let store = test_store(dir).await;
        let runtime = Arc::new(MockRuntime::new());
        let repos = Arc::new(RepoStore::new(store.clone()));
        let worktrees = Arc::new(WorktreeManager::new(runtime.clone()));
        let broker = Arc::new(PtyBroker::new(runtime.clone(), store.clone()));
        let service = Arc::new(EnvironmentService::new(
            runtime.clone(),
            store.clone(),
            repos,
            worktrees,
            broker.clone(),
            Arc::new(ChaChaSealer::from_secret("test")),
        ));
        let gitops = Arc::new(GitOps::new(runtime));
        api_router(AppState {
            service,
            gitops,
            broker,
            store,
        })
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-user-id", "user-1")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as_user(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-user-id", "user-1")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    #[serial]
    async fn health_is_unauthenticated() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    #[serial]
    async fn missing_identity_is_401_with_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .await
            .oneshot(
                Request::builder()
                    .uri("/api/environments/check-name?name=demo")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "auth");
    }

    #[tokio::test]
    #[serial]
    async fn create_environment_then_conflict_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let created = app
            .clone()
            .oneshot(post_json(
                "/api/environments",
                serde_json::json!({ "name": "demo" }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let env = body_json(created.into_body()).await;
        assert_eq!(env["name"], "demo");
        assert_eq!(env["status"], "running");

        let dup = app
            .oneshot(post_json(
                "/api/environments",
                serde_json::json!({ "name": "demo" }),
            ))
            .await
            .unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);
        let json = body_json(dup.into_body()).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "name-conflict");
        assert_eq!(json["suggestions"][0], "demo-2");
    }

    #[tokio::test]
    #[serial]
    async fn session_lifecycle_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let env = body_json(
            app.clone()
                .oneshot(post_json(
                    "/api/environments",
                    serde_json::json!({ "name": "demo" }),
                ))
                .await
                .unwrap()
                .into_body(),
        )
        .await;
        let env_id = env["id"].as_str().unwrap().to_string();

        let created = app
            .clone()
            .oneshot(post_json(
                "/api/sessions",
                serde_json::json!({ "environmentId": env_id }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let session = body_json(created.into_body()).await;
        assert_eq!(session["workingDirectory"], "/workspace");
        let session_id = session["id"].as_str().unwrap().to_string();

        let fetched = app
            .clone()
            .oneshot(get_as_user(&format!("/api/sessions/{session_id}")))
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);

        let deleted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/sessions/{session_id}"))
                    .header("x-user-id", "user-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        let again = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/sessions/{session_id}"))
                    .header("x-user-id", "user-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    #[serial]
    async fn git_status_without_repo_is_400_no_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let env = body_json(
            app.clone()
                .oneshot(post_json(
                    "/api/environments",
                    serde_json::json!({ "name": "demo" }),
                ))
                .await
                .unwrap()
                .into_body(),
        )
        .await;
        let session = body_json(
            app.clone()
                .oneshot(post_json(
                    "/api/sessions",
                    serde_json::json!({ "environmentId": env["id"] }),
                ))
                .await
                .unwrap()
                .into_body(),
        )
        .await;

        let response = app
            .oneshot(get_as_user(&format!(
                "/api/git/status/{}",
                session["id"].as_str().unwrap()
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response.into_body()).await;
        assert_eq!(json["error"], "state");
        assert_eq!(json["message"], "no worktree");
    }

    #[tokio::test]
    #[serial]
    async fn foreign_user_cannot_see_environment() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let env = body_json(
            app.clone()
                .oneshot(post_json(
                    "/api/environments",
                    serde_json::json!({ "name": "demo" }),
                ))
                .await
                .unwrap()
                .into_body(),
        )
        .await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/environments/{}", env["id"].as_str().unwrap()))
                    .header("x-user-id", "user-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    #[serial]
    async fn token_roundtrip_authenticates() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path()).await;

        let issued = body_json(
            app.clone()
                .oneshot(post_json(
                    "/api/auth/token",
                    serde_json::json!({ "userId": "user-3" }),
                ))
                .await
                .unwrap()
                .into_body(),
        )
        .await;
        let token = issued["token"].as_str().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/environments/user/user-3")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
