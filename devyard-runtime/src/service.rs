//! Environment service: use-case orchestration over the sandbox driver,
//! repository store, worktree manager, PTY broker, and state store.
//!
//! Every mutation takes the resolved caller identity and enforces
//! ownership; resources belonging to other users surface as `not-found`
//! rather than leaking their existence.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::auth::CallerIdentity;
use crate::config::{self, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::names::{self, NameAvailability};
use crate::pty::{PtyBroker, multiplexer_name};
use crate::repo::RepoStore;
use crate::sandbox::{ENVIRONMENT_LABEL, SandboxRuntime, SandboxSpec};
use crate::sealer::{Sealer, seal_to_string};
use crate::store::entity::{agents, environments, sessions};
use crate::store::{
    EnvironmentStatus, NewAgent, NewEnvironment, NewSession, SessionKind, SessionStatus,
    StateStore,
};
use crate::util::{now_ts, short_id};
use crate::worktree::{WorktreeManager, validate_branch_name};

#[derive(Clone, Debug, Default)]
pub struct CreateEnvironmentRequest {
    pub name: String,
    pub repository_url: Option<String>,
    pub branch: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct CreateSessionRequest {
    pub environment_id: String,
    pub name: Option<String>,
    pub working_directory: Option<String>,
    pub session_type: Option<String>,
    pub agent_id: Option<String>,
    pub branch: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct CreateAgentRequest {
    pub name: String,
    pub kind: String,
    pub credential: Option<String>,
}

pub struct EnvironmentService {
    runtime: Arc<dyn SandboxRuntime>,
    store: StateStore,
    repos: Arc<RepoStore>,
    worktrees: Arc<WorktreeManager>,
    broker: Arc<PtyBroker>,
    sealer: Arc<dyn Sealer>,
}

impl EnvironmentService {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: StateStore,
        repos: Arc<RepoStore>,
        worktrees: Arc<WorktreeManager>,
        broker: Arc<PtyBroker>,
        sealer: Arc<dyn Sealer>,
    ) -> Self {
        Self {
            runtime,
            store,
            repos,
            worktrees,
            broker,
            sealer,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn repos(&self) -> &RepoStore {
        &self.repos
    }

    // ── environments ────────────────────────────────────────────────────────

    pub async fn create_environment(
        &self,
        caller: &CallerIdentity,
        request: CreateEnvironmentRequest,
    ) -> Result<environments::Model> {
        names::validate_name(&request.name)?;
        let branch = request.branch.unwrap_or_else(|| "main".to_string());
        validate_branch_name(&branch)?;

        self.store.ensure_user(&caller.user_id, &caller.user_id).await?;

        // Pre-check for a friendly conflict with suggestions; the unique
        // index still catches the race underneath.
        let taken: HashSet<String> = self
            .store
            .environment_names_for_user(&caller.user_id)
            .await?
            .into_iter()
            .collect();
        if taken.contains(&request.name) {
            return Err(OrchestratorError::Conflict {
                message: format!("environment name '{}' is already taken", request.name),
                suggestions: names::suggest_names(&request.name, &taken, 3),
            });
        }

        let env_id = uuid::Uuid::new_v4().to_string();

        // Reserve the name first so a losing racer fails before any
        // container exists.
        let env = self
            .store
            .insert_environment(NewEnvironment {
                id: env_id.clone(),
                user_id: caller.user_id.clone(),
                name: request.name.clone(),
                repository_url: request.repository_url.clone(),
                branch: branch.clone(),
                sandbox_id: None,
                status: EnvironmentStatus::Starting,
            })
            .await
            .map_err(|err| match err {
                OrchestratorError::Conflict { message, .. } => OrchestratorError::Conflict {
                    message,
                    suggestions: names::suggest_names(&request.name, &taken, 3),
                },
                other => other,
            })?;

        match self.provision_environment(&env).await {
            Ok(sandbox_id) => {
                self.store
                    .set_environment_sandbox(&env.id, Some(&sandbox_id))
                    .await?;
                self.store
                    .set_environment_status(&env.id, EnvironmentStatus::Running)
                    .await?;
                info!("environment {} provisioned (sandbox {sandbox_id})", env.id);
                self.store
                    .environment_by_id(&env.id)
                    .await?
                    .ok_or_else(|| OrchestratorError::Storage("environment vanished".into()))
            }
            Err(err) => {
                // No partial environments: roll the row back and drop
                // whatever the half-finished provisioning left behind.
                warn!("provisioning failed for environment {}: {err}", env.id);
                if env.repository_url.is_some() {
                    let _ = self.repos.remove(&env.id).await;
                }
                let _ = self.store.mark_environment_deleted(&env.id).await;
                Err(err)
            }
        }
    }

    /// Clone the bare repo (when repo-backed) and create the sandbox with
    /// its rw mount. A runtime-side name collision gets one retry with a
    /// time-suffixed name before surfacing as conflict.
    async fn provision_environment(&self, env: &environments::Model) -> Result<String> {
        let config = OrchestratorConfig::load();

        let mut mounts = Vec::new();
        if env.repository_url.is_some() {
            self.repos.ensure_bare(env).await?;
            mounts.push(RepoStore::mount_spec(&env.id));
        }

        let mut labels = std::collections::HashMap::new();
        labels.insert(ENVIRONMENT_LABEL.to_string(), env.id.clone());

        let spec = SandboxSpec {
            name: format!("devyard-{}-{}", env.name, short_id()),
            image: config.sandbox_image.clone(),
            env: Vec::new(),
            labels,
            mounts,
        };

        match self.runtime.create(&spec).await {
            Ok(handle) => Ok(handle),
            Err(OrchestratorError::Conflict { .. }) => {
                let retry = SandboxSpec {
                    name: format!("devyard-{}-{}", env.name, now_ts()),
                    ..spec
                };
                self.runtime.create(&retry).await
            }
            Err(other) => Err(other),
        }
    }

    pub async fn list_environments(
        &self,
        caller: &CallerIdentity,
        user_id: &str,
    ) -> Result<Vec<environments::Model>> {
        if caller.user_id != user_id {
            return Err(OrchestratorError::Auth(
                "cannot list another user's environments".into(),
            ));
        }
        self.store.environments_for_user(user_id).await
    }

    pub async fn get_environment(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<environments::Model> {
        self.owned_environment(caller, id).await
    }

    /// Tear down sessions, sandbox, bare repo, then the row itself.
    /// Failures before the row flip leave state for a retry.
    pub async fn delete_environment(&self, caller: &CallerIdentity, id: &str) -> Result<()> {
        let env = self.owned_environment(caller, id).await?;

        for session in self.store.sessions_for_environment(&env.id).await? {
            if session.status == SessionStatus::Dead.as_str() {
                continue;
            }
            if let Err(err) = self.broker.close(&env, &session).await {
                warn!("closing session {} during env delete: {err}", session.id);
            }
            self.store
                .set_session_status(&session.id, SessionStatus::Dead)
                .await?;
        }

        if let Some(sandbox) = env.sandbox_id.as_deref() {
            match self.runtime.remove(sandbox, true).await {
                Ok(()) | Err(OrchestratorError::NotFound(_)) => {}
                Err(err) => {
                    error!("failed to remove sandbox {sandbox} for env {}: {err}", env.id);
                    self.store
                        .set_environment_status(&env.id, EnvironmentStatus::Error)
                        .await?;
                    return Err(err);
                }
            }
        }

        if env.repository_url.is_some() {
            self.repos.remove(&env.id).await?;
        }

        self.store.mark_environment_deleted(&env.id).await?;
        info!("environment {} deleted", env.id);
        Ok(())
    }

    pub async fn check_environment_name(
        &self,
        caller: &CallerIdentity,
        name: &str,
    ) -> Result<NameAvailability> {
        let taken: HashSet<String> = self
            .store
            .environment_names_for_user(&caller.user_id)
            .await?
            .into_iter()
            .collect();
        Ok(names::availability(name, &taken))
    }

    // ── sessions ────────────────────────────────────────────────────────────

    pub async fn create_session(
        &self,
        caller: &CallerIdentity,
        request: CreateSessionRequest,
    ) -> Result<sessions::Model> {
        let env = self
            .owned_environment(caller, &request.environment_id)
            .await?;

        if let Some(name) = request.name.as_deref() {
            names::validate_name(name)?;
            if self.store.session_name_taken(&env.id, name).await? {
                let taken: HashSet<String> = self
                    .store
                    .sessions_for_environment(&env.id)
                    .await?
                    .into_iter()
                    .filter(|s| s.status != SessionStatus::Dead.as_str())
                    .filter_map(|s| s.name)
                    .collect();
                return Err(OrchestratorError::Conflict {
                    message: format!("session name '{name}' is already taken"),
                    suggestions: names::suggest_names(name, &taken, 3),
                });
            }
        }

        let kind = match request.session_type.as_deref() {
            None => SessionKind::Shell,
            Some(raw) => SessionKind::parse(raw)?,
        };
        let agent_id = match kind {
            SessionKind::Shell => None,
            SessionKind::Agent => {
                let agent_id = request.agent_id.clone().ok_or_else(|| {
                    OrchestratorError::UserInput("agent sessions require an agentId".into())
                })?;
                let agent = self
                    .store
                    .agent_by_id(&agent_id)
                    .await?
                    .filter(|a| a.user_id == caller.user_id)
                    .ok_or_else(|| {
                        OrchestratorError::NotFound(format!("agent {agent_id} not found"))
                    })?;
                Some(agent.id)
            }
        };

        let branch = request.branch.unwrap_or_else(|| env.branch.clone());
        validate_branch_name(&branch)?;

        // One worktree per branch means one live session per branch.
        if let Some(existing) = self.store.session_for_branch(&env.id, &branch).await? {
            return Err(OrchestratorError::conflict(format!(
                "branch '{branch}' is in use by session {}",
                existing.id
            )));
        }

        let sandbox = self.ensure_sandbox_running(&env).await?;

        let working_directory = if env.repository_url.is_some() {
            self.worktrees.ensure_worktree(&env, &branch, &sandbox).await?
        } else {
            request
                .working_directory
                .unwrap_or_else(|| config::SANDBOX_WORKSPACE.to_string())
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let seed = request.name.clone().unwrap_or_else(|| branch.clone());
        let session = self
            .store
            .insert_session(NewSession {
                id: session_id.clone(),
                environment_id: env.id.clone(),
                name: request.name,
                tmux_session: multiplexer_name(&seed, &session_id),
                working_directory,
                branch,
                kind,
                agent_id,
            })
            .await?;

        // The multiplexer lives from creation on; the first attach only
        // connects to it. A failed spawn leaves no usable session behind.
        if let Err(err) = self
            .broker
            .ensure_multiplexer(&sandbox, &session, crate::sandbox::PtySize { cols: 80, rows: 24 })
            .await
        {
            let _ = self
                .store
                .set_session_status(&session.id, SessionStatus::Dead)
                .await;
            return Err(err);
        }

        info!("session {} created in environment {}", session.id, env.id);
        Ok(session)
    }

    pub async fn list_sessions(
        &self,
        caller: &CallerIdentity,
        environment_id: &str,
    ) -> Result<Vec<sessions::Model>> {
        let env = self.owned_environment(caller, environment_id).await?;
        self.store.sessions_for_environment(&env.id).await
    }

    pub async fn get_session(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<sessions::Model> {
        let (session, _env) = self.session_with_environment(caller, id).await?;
        Ok(session)
    }

    /// Session plus its (owned) environment; the pair every per-session
    /// operation starts from.
    pub async fn session_with_environment(
        &self,
        caller: &CallerIdentity,
        session_id: &str,
    ) -> Result<(sessions::Model, environments::Model)> {
        let session = self
            .store
            .session_by_id(session_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("session {session_id} not found")))?;
        let env = self
            .owned_environment(caller, &session.environment_id)
            .await
            .map_err(|_| OrchestratorError::NotFound(format!("session {session_id} not found")))?;
        Ok((session, env))
    }

    /// Explicit deletion: kill the multiplexer, prune the branch's worktree
    /// when this was its last session, and remove the row. A session the
    /// reaper already marked dead still deletes cleanly; its resources are
    /// gone, only the record remains.
    pub async fn delete_session(&self, caller: &CallerIdentity, id: &str) -> Result<()> {
        let (session, env) = self.session_with_environment(caller, id).await?;
        let already_dead = session.status == SessionStatus::Dead.as_str();

        if !already_dead {
            if let Err(err) = self.broker.close(&env, &session).await {
                warn!("killing multiplexer for session {}: {err}", session.id);
            }
        }

        // Prune the branch's worktree when this was its last session.
        if !already_dead
            && env.repository_url.is_some()
            && session.working_directory.starts_with(config::SANDBOX_WORKSPACE)
        {
            let others = self
                .store
                .other_sessions_on_branch(&env.id, &session.branch, &session.id)
                .await?;
            if others == 0 {
                if let Some(sandbox) = env.sandbox_id.as_deref() {
                    if let Err(err) = self
                        .worktrees
                        .remove_worktree(&env.id, &session.working_directory, sandbox)
                        .await
                    {
                        warn!(
                            "pruning worktree {} for session {}: {err}",
                            session.working_directory, session.id
                        );
                    }
                }
            }
        }

        self.store.delete_session_row(&session.id).await?;
        info!("session {} deleted", session.id);
        Ok(())
    }

    pub async fn check_session_name(
        &self,
        caller: &CallerIdentity,
        environment_id: &str,
        name: &str,
    ) -> Result<NameAvailability> {
        let env = self.owned_environment(caller, environment_id).await?;
        let taken: HashSet<String> = self
            .store
            .sessions_for_environment(&env.id)
            .await?
            .into_iter()
            .filter(|s| s.status != SessionStatus::Dead.as_str())
            .filter_map(|s| s.name)
            .collect();
        Ok(names::availability(name, &taken))
    }

    pub async fn check_branch(
        &self,
        caller: &CallerIdentity,
        environment_id: &str,
        branch: &str,
    ) -> Result<NameAvailability> {
        let env = self.owned_environment(caller, environment_id).await?;
        if let Err(err) = validate_branch_name(branch) {
            return Ok(NameAvailability {
                available: false,
                message: Some(err.message().to_string()),
                suggestions: Vec::new(),
            });
        }
        match self.store.session_for_branch(&env.id, branch).await? {
            Some(session) => Ok(NameAvailability {
                available: false,
                message: Some(format!(
                    "branch '{branch}' is in use by session {}",
                    session.id
                )),
                suggestions: Vec::new(),
            }),
            None => Ok(NameAvailability {
                available: true,
                message: None,
                suggestions: Vec::new(),
            }),
        }
    }

    // ── agents ──────────────────────────────────────────────────────────────

    pub async fn create_agent(
        &self,
        caller: &CallerIdentity,
        request: CreateAgentRequest,
    ) -> Result<agents::Model> {
        names::validate_name(&request.name)?;
        if request.kind.trim().is_empty() {
            return Err(OrchestratorError::UserInput("agent kind is required".into()));
        }
        self.store.ensure_user(&caller.user_id, &caller.user_id).await?;

        let agent = self
            .store
            .insert_agent(NewAgent {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: caller.user_id.clone(),
                name: request.name,
                kind: request.kind,
            })
            .await?;

        if let Some(credential) = request.credential.as_deref() {
            let sealed = seal_to_string(self.sealer.as_ref(), credential)?;
            self.store.put_agent_credential(&agent.id, &sealed).await?;
        }
        Ok(agent)
    }

    pub async fn list_agents(&self, caller: &CallerIdentity) -> Result<Vec<agents::Model>> {
        self.store.agents_for_user(&caller.user_id).await
    }

    pub async fn delete_agent(&self, caller: &CallerIdentity, id: &str) -> Result<()> {
        let agent = self
            .store
            .agent_by_id(id)
            .await?
            .filter(|a| a.user_id == caller.user_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("agent {id} not found")))?;
        if self.store.agent_in_use(&agent.id).await? {
            return Err(OrchestratorError::conflict(format!(
                "agent {} is referenced by a live session",
                agent.id
            )));
        }
        self.store.delete_agent(&agent.id).await
    }

    // ── shared helpers ──────────────────────────────────────────────────────

    async fn owned_environment(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<environments::Model> {
        self.store
            .environment_by_id(id)
            .await?
            .filter(|env| env.user_id == caller.user_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("environment {id} not found")))
    }

    async fn ensure_sandbox_running(&self, env: &environments::Model) -> Result<String> {
        let sandbox = env.sandbox_id.clone().ok_or_else(|| {
            OrchestratorError::State(format!("environment {} has no sandbox", env.id))
        })?;
        let running = self
            .runtime
            .inspect(&sandbox)
            .await
            .map(|s| s.running)
            .unwrap_or(false);
        if !running {
            self.runtime.start(&sandbox).await?;
            self.store
                .set_environment_status(&env.id, EnvironmentStatus::Running)
                .await?;
        }
        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecOutput;
    use crate::sandbox::mock::MockRuntime;
    use crate::sealer::{ChaChaSealer, open_from_string};
    use crate::store::test_store;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Arc<MockRuntime>,
        store: StateStore,
        service: EnvironmentService,
        caller: CallerIdentity,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let runtime = Arc::new(MockRuntime::new());
        let service = EnvironmentService::new(
            runtime.clone(),
            store.clone(),
            Arc::new(RepoStore::new(store.clone())),
            Arc::new(WorktreeManager::new(runtime.clone())),
            Arc::new(PtyBroker::new(runtime.clone(), store.clone())),
            Arc::new(ChaChaSealer::from_secret("test")),
        );
        Fixture {
            _dir: dir,
            runtime,
            store,
            service,
            caller: CallerIdentity {
                user_id: "user-1".to_string(),
            },
        }
    }

    fn env_request(name: &str) -> CreateEnvironmentRequest {
        CreateEnvironmentRequest {
            name: name.to_string(),
            repository_url: None,
            branch: None,
        }
    }

    #[tokio::test]
    async fn create_environment_provisions_sandbox() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();

        assert_eq!(env.status, "running");
        assert!(env.sandbox_id.is_some());
        assert_eq!(fx.runtime.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_name_conflicts_with_suggestions_and_no_sandbox() {
        let fx = fixture().await;
        fx.service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();

        let err = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::Conflict { suggestions, .. } => {
                assert_eq!(suggestions, vec!["demo-2", "demo-3", "demo-4"]);
            }
            other => panic!("expected conflict, got {other}"),
        }
        // The loser left no second container behind.
        assert_eq!(fx.runtime.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sandbox_name_collision_retries_once() {
        let fx = fixture().await;
        *fx.runtime.fail_create.lock().unwrap() = Some("name already in use".into());
        *fx.runtime.fail_create_once.lock().unwrap() = true;

        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();
        assert_eq!(env.status, "running");
    }

    #[tokio::test]
    async fn failed_provisioning_rolls_back_the_row() {
        let fx = fixture().await;
        *fx.runtime.fail_create.lock().unwrap() = Some("daemon unreachable".into());

        let err = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // Name is free again for the next attempt.
        *fx.runtime.fail_create.lock().unwrap() = None;
        fx.service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_session_defaults_to_workspace() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();

        let session = fx
            .service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(session.working_directory, "/workspace");
        assert_eq!(session.status, "inactive");
        assert!(session.tmux_session.starts_with("dy-main-"));
    }

    #[tokio::test]
    async fn repo_backed_session_binds_worktree_path() {
        let fx = fixture().await;
        fx.store.ensure_user("user-1", "alice").await.unwrap();
        let env = fx
            .store
            .insert_environment(NewEnvironment {
                id: "e-repo".into(),
                user_id: "user-1".into(),
                name: "repo-env".into(),
                repository_url: Some("https://example.com/repo.git".into()),
                branch: "main".into(),
                sandbox_id: Some("sbx".into()),
                status: EnvironmentStatus::Running,
            })
            .await
            .unwrap();
        fx.runtime.set_running("sbx", true);
        // Healthy worktree already present on the branch.
        fx.runtime
            .on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        fx.runtime
            .on("symbolic-ref --short HEAD", ExecOutput::ok("main\n"));

        let session = fx
            .service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(session.working_directory, "/workspace");
    }

    #[tokio::test]
    async fn second_session_on_branch_is_rejected() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();

        fx.service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = fx
            .service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
        assert!(err.message().contains("in use"));
    }

    #[tokio::test]
    async fn delete_session_twice_is_not_found() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();
        let session = fx
            .service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.service.delete_session(&fx.caller, &session.id).await.unwrap();
        let err = fx
            .service
            .delete_session(&fx.caller, &session.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[tokio::test]
    async fn reaped_dead_session_still_deletes_cleanly() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();
        let session = fx
            .service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // The reaper noticed the multiplexer die and marked the row dead.
        fx.store
            .set_session_status(&session.id, SessionStatus::Dead)
            .await
            .unwrap();

        fx.service.delete_session(&fx.caller, &session.id).await.unwrap();
        assert!(fx.store.session_by_id(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_environment_cascades() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();
        let session = fx
            .service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.service.delete_environment(&fx.caller, &env.id).await.unwrap();

        assert!(fx.store.environment_by_id(&env.id).await.unwrap().is_none());
        assert_eq!(
            fx.store.session_by_id(&session.id).await.unwrap().unwrap().status,
            "dead"
        );
        assert!(fx.runtime.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_environment_reads_as_not_found() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();

        let stranger = CallerIdentity {
            user_id: "user-2".to_string(),
        };
        let err = fx
            .service
            .get_environment(&stranger, &env.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[tokio::test]
    async fn agent_credentials_are_sealed_at_rest() {
        let fx = fixture().await;
        let agent = fx
            .service
            .create_agent(
                &fx.caller,
                CreateAgentRequest {
                    name: "coder".into(),
                    kind: "claude".into(),
                    credential: Some("sk-secret-key".into()),
                },
            )
            .await
            .unwrap();

        let blob = fx
            .store
            .agent_credential(&agent.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!blob.contains("sk-secret-key"));

        let sealer = ChaChaSealer::from_secret("test");
        assert_eq!(open_from_string(&sealer, &blob).unwrap(), "sk-secret-key");
    }

    #[tokio::test]
    async fn agent_in_use_cannot_be_deleted() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();
        let agent = fx
            .service
            .create_agent(
                &fx.caller,
                CreateAgentRequest {
                    name: "coder".into(),
                    kind: "claude".into(),
                    credential: None,
                },
            )
            .await
            .unwrap();
        fx.service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    session_type: Some("agent".into()),
                    agent_id: Some(agent.id.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = fx
            .service
            .delete_agent(&fx.caller, &agent.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn branch_availability_reflects_live_sessions() {
        let fx = fixture().await;
        let env = fx
            .service
            .create_environment(&fx.caller, env_request("demo"))
            .await
            .unwrap();

        let before = fx
            .service
            .check_branch(&fx.caller, &env.id, "main")
            .await
            .unwrap();
        assert!(before.available);

        fx.service
            .create_session(
                &fx.caller,
                CreateSessionRequest {
                    environment_id: env.id.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = fx
            .service
            .check_branch(&fx.caller, &env.id, "main")
            .await
            .unwrap();
        assert!(!after.available);
    }
}
