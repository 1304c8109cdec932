//! Background reaper: periodic reconciliation of recorded state against
//! runtime reality.
//!
//! Each tick marks sessions whose tmux session vanished as dead, removes
//! worktrees no session references, restarts sandboxes the DB believes are
//! running (with capped exponential backoff for repeat offenders), and
//! revokes expired refresh tokens. `reconcile_on_startup` runs once before
//! the loop to absorb whatever happened while the orchestrator was down.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config;
use crate::error::OrchestratorError;
use crate::pty::PtyBroker;
use crate::sandbox::SandboxRuntime;
use crate::store::entity::environments;
use crate::store::{EnvironmentStatus, SessionStatus, StateStore};
use crate::util::now_ts;
use crate::worktree::WorktreeManager;

/// Sessions younger than this are skipped by dead-session detection; their
/// multiplexer spawn may still be in flight.
const SPAWN_GRACE_SECS: i64 = 60;
/// First restart retry delay; doubles per failure.
const RESTART_BACKOFF_BASE_SECS: i64 = 5;
/// Restart retries never wait longer than this.
const RESTART_BACKOFF_CAP_SECS: i64 = 300;

#[derive(Clone, Copy, Debug, Default)]
struct RestartBackoff {
    attempts: u32,
    next_retry_at: i64,
}

pub struct Reaper {
    runtime: Arc<dyn SandboxRuntime>,
    store: StateStore,
    broker: Arc<PtyBroker>,
    worktrees: Arc<WorktreeManager>,
    restart_backoff: DashMap<String, RestartBackoff>,
}

impl Reaper {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: StateStore,
        broker: Arc<PtyBroker>,
        worktrees: Arc<WorktreeManager>,
    ) -> Self {
        Self {
            runtime,
            store,
            broker,
            worktrees,
            restart_backoff: DashMap::new(),
        }
    }

    /// Run the periodic loop until the shutdown signal flips.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.tick().await,
                    _ = shutdown.changed() => {
                        info!("reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    pub async fn tick(&self) {
        self.reap_dead_sessions().await;
        self.reap_dangling_worktrees().await;
        self.restart_stopped_sandboxes().await;
        self.revoke_expired_tokens().await;
    }

    /// Sync DB environment status with container reality after a restart.
    pub async fn reconcile_on_startup(&self) {
        let envs = match self.store.environments_all().await {
            Ok(envs) => envs,
            Err(err) => {
                error!("reconcile: failed to read environments: {err}");
                return;
            }
        };

        for env in envs {
            let Some(sandbox) = env.sandbox_id.as_deref() else {
                continue;
            };
            match self.runtime.inspect(sandbox).await {
                Err(OrchestratorError::NotFound(_)) => {
                    warn!(
                        "reconcile: sandbox {sandbox} for environment {} is gone",
                        env.id
                    );
                    let _ = self
                        .store
                        .set_environment_status(&env.id, EnvironmentStatus::Error)
                        .await;
                }
                Err(err) => {
                    warn!("reconcile: inspect failed for environment {}: {err}", env.id);
                }
                Ok(status) => {
                    let recorded_running = env.status == EnvironmentStatus::Running.as_str();
                    if status.running && !recorded_running {
                        info!("reconcile: environment {} is actually running", env.id);
                        let _ = self
                            .store
                            .set_environment_status(&env.id, EnvironmentStatus::Running)
                            .await;
                    } else if !status.running && recorded_running {
                        info!("reconcile: environment {} is actually stopped", env.id);
                        let _ = self
                            .store
                            .set_environment_status(&env.id, EnvironmentStatus::Stopped)
                            .await;
                    }
                }
            }
        }
    }

    async fn running_environments(&self) -> Vec<(environments::Model, String)> {
        let envs = match self.store.environments_all().await {
            Ok(envs) => envs,
            Err(err) => {
                error!("reaper: failed to read environments: {err}");
                return Vec::new();
            }
        };
        let mut running = Vec::new();
        for env in envs {
            let Some(sandbox) = env.sandbox_id.clone() else {
                continue;
            };
            match self.runtime.inspect(&sandbox).await {
                Ok(status) if status.running => running.push((env, sandbox)),
                _ => {}
            }
        }
        running
    }

    async fn reap_dead_sessions(&self) {
        let now = now_ts();
        for (env, sandbox) in self.running_environments().await {
            let alive = match self.broker.list_multiplexer_sessions(&sandbox).await {
                Ok(names) => names,
                Err(err) => {
                    warn!("reaper: listing tmux sessions in {sandbox}: {err}");
                    continue;
                }
            };
            let sessions = match self.store.sessions_for_environment(&env.id).await {
                Ok(sessions) => sessions,
                Err(err) => {
                    error!("reaper: reading sessions for {}: {err}", env.id);
                    continue;
                }
            };
            for session in sessions {
                if session.status == SessionStatus::Dead.as_str() {
                    continue;
                }
                if now - session.created_at < SPAWN_GRACE_SECS {
                    continue;
                }
                if !alive.iter().any(|name| name == &session.tmux_session) {
                    info!(
                        "reaper: session {} lost its multiplexer ({}), marking dead",
                        session.id, session.tmux_session
                    );
                    let _ = self
                        .store
                        .set_session_status(&session.id, SessionStatus::Dead)
                        .await;
                }
            }
        }
    }

    async fn reap_dangling_worktrees(&self) {
        for (env, sandbox) in self.running_environments().await {
            if env.repository_url.is_none() {
                continue;
            }
            let trees = match self.worktrees.list_worktrees(&env.id, &sandbox).await {
                Ok(trees) => trees,
                Err(err) => {
                    warn!("reaper: listing worktrees for {}: {err}", env.id);
                    continue;
                }
            };
            let live_paths: Vec<String> = match self.store.sessions_for_environment(&env.id).await {
                Ok(sessions) => sessions
                    .into_iter()
                    .filter(|s| s.status != SessionStatus::Dead.as_str())
                    .map(|s| s.working_directory)
                    .collect(),
                Err(err) => {
                    error!("reaper: reading sessions for {}: {err}", env.id);
                    continue;
                }
            };
            for tree in trees {
                if !tree.path.starts_with(config::SANDBOX_WORKSPACE) {
                    continue;
                }
                if live_paths.iter().any(|path| path == &tree.path) {
                    continue;
                }
                info!(
                    "reaper: removing dangling worktree {} in environment {}",
                    tree.path, env.id
                );
                if let Err(err) = self
                    .worktrees
                    .remove_worktree(&env.id, &tree.path, &sandbox)
                    .await
                {
                    warn!("reaper: removing worktree {}: {err}", tree.path);
                }
            }
        }
    }

    async fn restart_stopped_sandboxes(&self) {
        let envs = match self.store.environments_all().await {
            Ok(envs) => envs,
            Err(err) => {
                error!("reaper: failed to read environments: {err}");
                return;
            }
        };
        let now = now_ts();

        for env in envs {
            if env.status != EnvironmentStatus::Running.as_str() {
                continue;
            }
            let Some(sandbox) = env.sandbox_id.as_deref() else {
                continue;
            };

            match self.runtime.inspect(sandbox).await {
                Ok(status) if status.running => {
                    self.restart_backoff.remove(&env.id);
                    continue;
                }
                Ok(_) => {}
                Err(OrchestratorError::NotFound(_)) => {
                    warn!(
                        "reaper: sandbox {sandbox} for environment {} no longer exists",
                        env.id
                    );
                    let _ = self
                        .store
                        .set_environment_status(&env.id, EnvironmentStatus::Error)
                        .await;
                    self.restart_backoff.remove(&env.id);
                    continue;
                }
                Err(err) => {
                    warn!("reaper: inspect failed for environment {}: {err}", env.id);
                    continue;
                }
            }

            let backoff = self
                .restart_backoff
                .get(&env.id)
                .map(|entry| *entry)
                .unwrap_or_default();
            if backoff.next_retry_at > now {
                continue;
            }

            match self.runtime.start(sandbox).await {
                Ok(()) => {
                    info!("reaper: restarted sandbox {sandbox} for environment {}", env.id);
                    self.restart_backoff.remove(&env.id);
                }
                Err(err) => {
                    let attempts = backoff.attempts + 1;
                    let delay = (RESTART_BACKOFF_BASE_SECS << attempts.min(16))
                        .min(RESTART_BACKOFF_CAP_SECS);
                    warn!(
                        "reaper: restart of sandbox {sandbox} failed (attempt {attempts}, next in {delay}s): {err}"
                    );
                    self.restart_backoff.insert(
                        env.id.clone(),
                        RestartBackoff {
                            attempts,
                            next_retry_at: now + delay,
                        },
                    );
                }
            }
        }
    }

    async fn revoke_expired_tokens(&self) {
        match self.store.revoke_expired_tokens().await {
            Ok(0) => {}
            Ok(count) => info!("reaper: revoked {count} expired refresh tokens"),
            Err(err) => error!("reaper: token revocation failed: {err}"),
        }
    }
}
