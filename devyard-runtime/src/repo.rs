//! Repository store: host-side bare clones and their sandbox mounts.
//!
//! Every repository-backed environment gets exactly one bare clone at
//! `<state>/repos/<env-id>`, bind-mounted **read-write** into that
//! environment's sandbox at `/data/repos/<env-id>`. The mount must stay
//! writable: `git worktree add` records metadata under `worktrees/` inside
//! the bare repo, and a read-only mount breaks worktree creation at a
//! distance.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{self, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::keyed_lock::KeyedMutex;
use crate::sandbox::MountSpec;
use crate::store::StateStore;
use crate::store::entity::environments;
use crate::util::now_ts;

/// Summary of an environment's bare repository, served by
/// `GET /api/git/repo/:envId`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RepoInfo {
    pub path: String,
    pub branches: Vec<String>,
    #[serde(rename = "currentBranch")]
    pub current_branch: String,
    #[serde(rename = "remoteUrl")]
    pub remote_url: String,
}

pub struct RepoStore {
    store: StateStore,
    locks: KeyedMutex,
}

impl RepoStore {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            locks: KeyedMutex::new(),
        }
    }

    /// Stable host path of an environment's bare clone.
    pub fn host_path(environment_id: &str) -> PathBuf {
        config::repos_dir().join(environment_id)
    }

    /// Fixed in-sandbox path of the mounted bare repo.
    pub fn sandbox_path(environment_id: &str) -> String {
        format!("{}/{}", config::SANDBOX_REPO_ROOT, environment_id)
    }

    /// Bind-mount spec handed to the sandbox driver at creation.
    /// Always read-write; see module docs.
    pub fn mount_spec(environment_id: &str) -> MountSpec {
        MountSpec {
            host_path: Self::host_path(environment_id),
            sandbox_path: Self::sandbox_path(environment_id),
            read_only: false,
        }
    }

    /// Ensure the bare clone exists for `env`, cloning on first call.
    ///
    /// When `DEVYARD_FETCH_TTL_SECS` is non-zero and the clone is older than
    /// the TTL, refs are refreshed from upstream. Serialized per environment
    /// so concurrent session creation cannot race the initial clone.
    pub async fn ensure_bare(&self, env: &environments::Model) -> Result<PathBuf> {
        let remote_url = env.repository_url.as_deref().ok_or_else(|| {
            OrchestratorError::State(format!("environment {} has no repository", env.id))
        })?;

        let _guard = self.locks.lock(&format!("repo/{}", env.id)).await;
        let config = OrchestratorConfig::load();
        let path = Self::host_path(&env.id);

        if !path.join("HEAD").exists() {
            clone_bare(remote_url, &path, config.git_timeout).await?;
        }

        let record = self
            .store
            .upsert_bare_repo(&env.id, &path.display().to_string(), remote_url)
            .await?;

        if config.fetch_ttl_secs > 0
            && record.last_fetched_at + config.fetch_ttl_secs <= now_ts()
        {
            fetch_bare(&path, config.git_timeout).await?;
            self.store.touch_bare_repo_fetched(&env.id).await?;
        }

        Ok(path)
    }

    /// Update the bare clone's refs from upstream.
    pub async fn fetch(&self, env: &environments::Model) -> Result<()> {
        let _guard = self.locks.lock(&format!("repo/{}", env.id)).await;
        let path = Self::host_path(&env.id);
        if !path.join("HEAD").exists() {
            return Err(OrchestratorError::NotFound(format!(
                "no bare repository for environment {}",
                env.id
            )));
        }
        fetch_bare(&path, OrchestratorConfig::load().git_timeout).await?;
        self.store.touch_bare_repo_fetched(&env.id).await?;
        Ok(())
    }

    /// Branches, HEAD branch, and remote of the bare clone (host-side view).
    pub async fn repo_info(&self, env: &environments::Model) -> Result<RepoInfo> {
        let record = self
            .store
            .bare_repo_for_environment(&env.id)
            .await?
            .ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "no bare repository for environment {}",
                    env.id
                ))
            })?;

        let path = PathBuf::from(&record.host_path);
        let branches = run_git(
            &path,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            None,
        )
        .await?
        .lines()
        .map(str::to_string)
        .collect();

        Ok(RepoInfo {
            path: Self::sandbox_path(&env.id),
            branches,
            current_branch: env.branch.clone(),
            remote_url: record.remote_url,
        })
    }

    /// Delete the bare clone and its record. Called from environment
    /// deletion after the sandbox is gone.
    pub async fn remove(&self, environment_id: &str) -> Result<()> {
        let _guard = self.locks.lock(&format!("repo/{environment_id}")).await;
        let path = Self::host_path(environment_id);
        if path.exists() {
            tokio::fs::remove_dir_all(&path).await.map_err(|err| {
                OrchestratorError::Storage(format!(
                    "failed to remove bare repo {}: {err}",
                    path.display()
                ))
            })?;
        }
        self.store.delete_bare_repo(environment_id).await?;
        Ok(())
    }
}

async fn clone_bare(remote_url: &str, path: &Path, timeout: Duration) -> Result<()> {
    let path_arg = path.display().to_string();
    run_git_in(
        None,
        &["clone", "--bare", remote_url, path_arg.as_str()],
        Some(timeout),
    )
    .await?;
    // Bare clones get no fetch refspec by default; set one so later fetches
    // update local heads the worktree layer branches from.
    run_git(
        path,
        &[
            "config",
            "remote.origin.fetch",
            "+refs/heads/*:refs/heads/*",
        ],
        None,
    )
    .await?;
    Ok(())
}

async fn fetch_bare(path: &Path, timeout: Duration) -> Result<()> {
    run_git(path, &["fetch", "origin", "--prune"], Some(timeout)).await?;
    Ok(())
}

async fn run_git(repo: &Path, args: &[&str], timeout: Option<Duration>) -> Result<String> {
    let repo_arg = repo.display().to_string();
    let mut full_args = vec!["-C", repo_arg.as_str()];
    full_args.extend_from_slice(args);
    run_git_in(None, &full_args, timeout).await
}

/// Run host-side git, returning trimmed-right stdout.
///
/// Failures are classified: unreachable remotes are `upstream`, disk
/// exhaustion is `resource`, everything else `storage`.
async fn run_git_in(
    cwd: Option<&Path>,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<String> {
    let mut command = Command::new("git");
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let run = async {
        let output = command.output().await.map_err(|err| {
            OrchestratorError::Storage(format!("failed to spawn git: {err}"))
        })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            Err(classify_git_failure(&stderr, args))
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
            OrchestratorError::Upstream(format!(
                "git {} timed out after {}s",
                args.first().copied().unwrap_or(""),
                limit.as_secs()
            ))
        })?,
        None => run.await,
    }
}

fn classify_git_failure(stderr: &str, args: &[&str]) -> OrchestratorError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("could not resolve host")
        || lowered.contains("unable to access")
        || lowered.contains("connection refused")
        || lowered.contains("connection timed out")
        || lowered.contains("could not read from remote")
    {
        OrchestratorError::Upstream(format!("git {}: {stderr}", args.join(" ")))
    } else if lowered.contains("no space left") {
        OrchestratorError::Resource(format!("git {}: {stderr}", args.join(" ")))
    } else {
        OrchestratorError::Storage(format!("git {}: {stderr}", args.join(" ")))
    }
}
