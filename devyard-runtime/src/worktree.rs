//! Worktree manager: converges in-sandbox working trees to the desired
//! (environment, branch) state.
//!
//! All git steps run inside the target sandbox through the driver's exec.
//! The bare repository mounted at `/data/repos/<env-id>` is the object
//! store; each branch gets exactly one working tree. Reconciliation is
//! serialized per (environment, branch) by a keyed mutex, so concurrent
//! callers observe one winner plus idempotent successes.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::keyed_lock::KeyedMutex;
use crate::repo::RepoStore;
use crate::sandbox::{ExecSpec, SandboxRuntime};
use crate::store::entity::environments;
use crate::util::shell_escape;

/// How many numeric suffixes we try when two branches slug to the same path.
const MAX_SLUG_SUFFIX: usize = 5;

/// One entry of `git worktree list --porcelain`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: String,
    pub branch: Option<String>,
}

/// What currently sits at a candidate worktree path.
#[derive(Clone, Debug, PartialEq, Eq)]
enum PathState {
    Absent,
    /// An empty directory; `worktree add` accepts it (the `/workspace`
    /// mount point of a fresh container starts out this way).
    EmptyDir,
    /// A valid worktree checked out on the expected branch.
    Match,
    /// A valid worktree, but for a different branch.
    OtherBranch(String),
    /// Exists, non-empty, and not a git worktree.
    NotWorktree,
}

pub struct WorktreeManager {
    runtime: Arc<dyn SandboxRuntime>,
    locks: KeyedMutex,
}

impl WorktreeManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            runtime,
            locks: KeyedMutex::new(),
        }
    }

    /// Materialize a working tree for `branch` inside `sandbox` and return
    /// its in-sandbox path. Idempotent: an existing healthy worktree for the
    /// branch is returned as-is.
    pub async fn ensure_worktree(
        &self,
        env: &environments::Model,
        branch: &str,
        sandbox: &str,
    ) -> Result<String> {
        validate_branch_name(branch)?;

        let _guard = self.locks.lock(&format!("{}/{branch}", env.id)).await;
        let budget = OrchestratorConfig::load().worktree_timeout;

        tokio::time::timeout(budget, self.reconcile(env, branch, sandbox))
            .await
            .map_err(|_| {
                OrchestratorError::Runtime(format!(
                    "worktree creation for branch '{branch}' timed out after {}s",
                    budget.as_secs()
                ))
            })?
    }

    async fn reconcile(
        &self,
        env: &environments::Model,
        branch: &str,
        sandbox: &str,
    ) -> Result<String> {
        let bare = RepoStore::sandbox_path(&env.id);

        // 1. The bare repo must be mounted where we expect it.
        let mounted = self
            .runtime
            .exec(sandbox, ExecSpec::new(["test", "-d", bare.as_str()]))
            .await?;
        if !mounted.success() {
            return Err(OrchestratorError::Invariant(format!(
                "bare repository mount missing at {bare}"
            )));
        }

        // 2. The mount must be writable: worktree add writes metadata under
        //    `<bare>/worktrees/`. Probe with a sentinel file.
        let sentinel = format!(
            "touch {bare}/.write-probe && rm -f {bare}/.write-probe",
            bare = shell_escape(&bare)
        );
        let probe = self
            .runtime
            .exec(sandbox, ExecSpec::new(["sh", "-c", sentinel.as_str()]))
            .await?;
        if !probe.success() {
            if probe.stderr.contains("Read-only file system") {
                return Err(readonly_mount_error(&bare));
            }
            return Err(OrchestratorError::Runtime(format!(
                "write probe failed in {bare}: {}",
                probe.stderr.trim()
            )));
        }

        // 3/4. Walk candidate paths for the branch; return early on an
        //      existing healthy worktree.
        let mut target: Option<String> = None;
        for path in candidate_paths(env, branch) {
            match self.check_path(sandbox, &path, branch).await? {
                PathState::Match => return Ok(path),
                PathState::Absent | PathState::EmptyDir => {
                    target = Some(path);
                    break;
                }
                // Occupied by someone else; try the next suffix.
                PathState::OtherBranch(_) | PathState::NotWorktree => continue,
            }
        }
        let path = target.ok_or_else(|| {
            OrchestratorError::conflict(format!(
                "all candidate worktree paths for branch '{branch}' are occupied"
            ))
        })?;

        // 5. The bare repo needs at least one local branch to anchor the
        //    worktree. A brand-new upstream may be empty: fetch once, then
        //    give up with a caller-actionable error.
        let mut branches = self.local_branches(sandbox, &bare).await?;
        if branches.is_empty() {
            self.runtime
                .exec(
                    sandbox,
                    ExecSpec::new(["git", "--git-dir", bare.as_str(), "fetch", "origin"])
                        .with_timeout(OrchestratorConfig::load().git_timeout),
                )
                .await?;
            branches = self.local_branches(sandbox, &bare).await?;
        }
        if branches.is_empty() {
            return Err(OrchestratorError::NoBranches(format!(
                "repository for environment {} has no branches; push an initial commit and retry",
                env.id
            )));
        }

        // 6. Create the worktree, branching from the default when the
        //    requested branch does not exist locally yet.
        let add = if branches.iter().any(|b| b == branch) {
            ExecSpec::new([
                "git", "-C", bare.as_str(), "worktree", "add", path.as_str(), branch,
            ])
        } else {
            let base = if branches.iter().any(|b| b == &env.branch) {
                env.branch.as_str()
            } else {
                branches[0].as_str()
            };
            ExecSpec::new([
                "git", "-C", bare.as_str(), "worktree", "add", "-b", branch, path.as_str(), base,
            ])
        };

        let created = self
            .runtime
            .exec(sandbox, add.with_timeout(Duration::from_secs(30)))
            .await?;
        if !created.success() {
            let stderr = created.stderr.trim().to_string();
            if stderr.contains("Read-only file system") {
                // Step 2 passed but the add still hit EROFS: the mount
                // changed underneath us. Fatal either way.
                return Err(readonly_mount_error(&bare));
            }
            if stderr.contains("No space left on device") {
                return Err(OrchestratorError::Resource(format!(
                    "worktree add failed: {stderr}"
                )));
            }
            if stderr.contains("already exists") {
                return match self.check_path(sandbox, &path, branch).await? {
                    PathState::Match => Ok(path),
                    _ => Err(OrchestratorError::conflict(format!(
                        "worktree path {path} is occupied: {stderr}"
                    ))),
                };
            }
            // Leave nothing half-created behind for the reaper to chew on.
            self.prune(sandbox, &bare).await;
            return Err(OrchestratorError::Runtime(format!(
                "worktree creation failed for branch '{branch}': {stderr}"
            )));
        }

        // 7. Trust but verify.
        match self.check_path(sandbox, &path, branch).await? {
            PathState::Match => Ok(path),
            state => {
                self.prune(sandbox, &bare).await;
                Err(OrchestratorError::Runtime(format!(
                    "worktree at {path} failed verification after create ({state:?})"
                )))
            }
        }
    }

    /// Remove the worktree at `path` and prune stale metadata. Used on
    /// session deletion and by the reaper for dangling trees.
    pub async fn remove_worktree(&self, env_id: &str, path: &str, sandbox: &str) -> Result<()> {
        let bare = RepoStore::sandbox_path(env_id);

        // Never let a path outside the workspace sneak into rm -rf.
        if !path.starts_with(config::SANDBOX_WORKSPACE) {
            return Err(OrchestratorError::Invariant(format!(
                "refusing to remove non-workspace path {path}"
            )));
        }

        let _ = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["git", "-C", bare.as_str(), "worktree", "remove", "--force", path]),
            )
            .await;
        // rm -rf only the nested per-branch trees; the /workspace root stays
        // a (possibly empty) directory for the container.
        if path != config::SANDBOX_WORKSPACE {
            let _ = self
                .runtime
                .exec(sandbox, ExecSpec::new(["rm", "-rf", path]))
                .await;
        } else {
            let clear = format!(
                "find {} -mindepth 1 -maxdepth 1 -exec rm -rf {{}} +",
                shell_escape(config::SANDBOX_WORKSPACE)
            );
            let _ = self
                .runtime
                .exec(sandbox, ExecSpec::new(["sh", "-c", clear.as_str()]))
                .await;
        }
        self.prune(sandbox, &bare).await;
        Ok(())
    }

    /// Worktrees currently registered in the bare repo, bare entry excluded.
    pub async fn list_worktrees(&self, env_id: &str, sandbox: &str) -> Result<Vec<WorktreeInfo>> {
        let bare = RepoStore::sandbox_path(env_id);
        let output = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["git", "-C", bare.as_str(), "worktree", "list", "--porcelain"]),
            )
            .await?;
        if !output.success() {
            return Err(OrchestratorError::Runtime(format!(
                "worktree list failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_worktree_list(&output.stdout))
    }

    async fn prune(&self, sandbox: &str, bare: &str) {
        let _ = self
            .runtime
            .exec(sandbox, ExecSpec::new(["git", "-C", bare, "worktree", "prune"]))
            .await;
    }

    async fn local_branches(&self, sandbox: &str, bare: &str) -> Result<Vec<String>> {
        let output = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new([
                    "git",
                    "--git-dir",
                    bare,
                    "for-each-ref",
                    "--format=%(refname:short)",
                    "refs/heads",
                ]),
            )
            .await?;
        if !output.success() {
            return Err(OrchestratorError::Runtime(format!(
                "branch listing failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn check_path(&self, sandbox: &str, path: &str, branch: &str) -> Result<PathState> {
        let exists = self
            .runtime
            .exec(sandbox, ExecSpec::new(["test", "-e", path]))
            .await?;
        if !exists.success() {
            return Ok(PathState::Absent);
        }

        let inside = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["git", "-C", path, "rev-parse", "--is-inside-work-tree"]),
            )
            .await?;
        if !inside.success() || inside.stdout.trim() != "true" {
            let listing = format!("ls -A {}", shell_escape(path));
            let contents = self
                .runtime
                .exec(sandbox, ExecSpec::new(["sh", "-c", listing.as_str()]))
                .await?;
            return if contents.success() && contents.stdout.trim().is_empty() {
                Ok(PathState::EmptyDir)
            } else {
                Ok(PathState::NotWorktree)
            };
        }

        let head = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["git", "-C", path, "symbolic-ref", "--short", "HEAD"]),
            )
            .await?;
        let actual = head.stdout.trim();
        if head.success() && actual == branch {
            Ok(PathState::Match)
        } else {
            Ok(PathState::OtherBranch(actual.to_string()))
        }
    }
}

fn readonly_mount_error(bare: &str) -> OrchestratorError {
    OrchestratorError::Invariant(format!(
        "{bare} mounted read-only; worktrees require rw"
    ))
}

/// Candidate in-sandbox paths for a branch's worktree, most canonical first.
///
/// The branch the environment was created with owns `/workspace`; other
/// branches live at `/workspace/<slug>`, with numeric suffixes resolving
/// slug collisions between distinct branches.
fn candidate_paths(env: &environments::Model, branch: &str) -> Vec<String> {
    if branch == env.branch {
        return vec![config::SANDBOX_WORKSPACE.to_string()];
    }
    let slug = slugify_branch(branch);
    let mut paths = vec![format!("{}/{slug}", config::SANDBOX_WORKSPACE)];
    for n in 2..=MAX_SLUG_SUFFIX {
        paths.push(format!("{}/{slug}-{n}", config::SANDBOX_WORKSPACE));
    }
    paths
}

/// Lowercase and replace anything outside `[a-z0-9._-]` with `-`.
pub fn slugify_branch(branch: &str) -> String {
    branch
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Reject branch names git itself would refuse, before any exec happens.
pub fn validate_branch_name(branch: &str) -> Result<()> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
        || branch.contains('\\')
        || branch
            .chars()
            .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '['));
    if invalid {
        return Err(OrchestratorError::UserInput(format!(
            "invalid branch name '{branch}'"
        )));
    }
    Ok(())
}

fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut trees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;
    let mut is_bare = false;

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(tree) = current.take() {
                if !is_bare {
                    trees.push(tree);
                }
            }
            is_bare = false;
            current = Some(WorktreeInfo {
                path: path.to_string(),
                branch: None,
            });
        } else if line == "bare" {
            is_bare = true;
        } else if let Some(branch) = line.strip_prefix("branch refs/heads/") {
            if let Some(tree) = current.as_mut() {
                tree.branch = Some(branch.to_string());
            }
        }
    }
    if let Some(tree) = current {
        if !is_bare {
            trees.push(tree);
        }
    }
    trees
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockRuntime;
    use crate::sandbox::ExecOutput;
    use crate::store::entity::environments;

    fn test_env() -> environments::Model {
        environments::Model {
            id: "e1".to_string(),
            user_id: "user-1".to_string(),
            name: "demo".to_string(),
            repository_url: Some("https://example.com/repo.git".to_string()),
            branch: "main".to_string(),
            sandbox_id: Some("sbx".to_string()),
            status: "running".to_string(),
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
        }
    }

    fn manager(runtime: Arc<MockRuntime>) -> WorktreeManager {
        WorktreeManager::new(runtime)
    }

    #[test]
    fn slugs_lowercase_and_replace() {
        assert_eq!(slugify_branch("Feature/My-Thing"), "feature-my-thing");
        assert_eq!(slugify_branch("fix_v1.2"), "fix_v1.2");
        assert_eq!(slugify_branch("weird branch!"), "weird-branch-");
    }

    #[test]
    fn branch_validation() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("feature/login-form").is_ok());
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name("-flag").is_err());
        assert!(validate_branch_name("a..b").is_err());
        assert!(validate_branch_name("has space").is_err());
        assert!(validate_branch_name("x.lock").is_err());
    }

    #[test]
    fn default_branch_owns_workspace() {
        let env = test_env();
        assert_eq!(candidate_paths(&env, "main"), vec!["/workspace"]);
        let others = candidate_paths(&env, "Feature/X");
        assert_eq!(others[0], "/workspace/feature-x");
        assert_eq!(others[1], "/workspace/feature-x-2");
    }

    #[test]
    fn worktree_list_parse_skips_bare() {
        let output = "worktree /data/repos/e1\nbare\n\nworktree /workspace\nHEAD abc123\nbranch refs/heads/main\n\nworktree /workspace/feat\nHEAD def456\nbranch refs/heads/feat\n";
        let trees = parse_worktree_list(output);
        assert_eq!(
            trees,
            vec![
                WorktreeInfo {
                    path: "/workspace".to_string(),
                    branch: Some("main".to_string())
                },
                WorktreeInfo {
                    path: "/workspace/feat".to_string(),
                    branch: Some("feat".to_string())
                },
            ]
        );
    }

    #[tokio::test]
    async fn creates_worktree_for_default_branch() {
        let runtime = Arc::new(MockRuntime::new());
        // Path absent on the first check, present and healthy after create.
        runtime.on_n("test -e /workspace", ExecOutput::fail(1, ""), 1);
        runtime.on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        runtime.on("symbolic-ref --short HEAD", ExecOutput::ok("main\n"));
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));

        let mgr = manager(runtime.clone());
        let path = mgr
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap();

        assert_eq!(path, "/workspace");
        assert_eq!(runtime.exec_count("worktree add /workspace main"), 1);
    }

    #[tokio::test]
    async fn empty_workspace_dir_is_usable() {
        let runtime = Arc::new(MockRuntime::new());
        // /workspace exists (container mount point) but is an empty dir.
        runtime.on_n(
            "rev-parse --is-inside-work-tree",
            ExecOutput::fail(128, "fatal: not a git repository"),
            1,
        );
        runtime.on("ls -A", ExecOutput::ok("\n"));
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));
        runtime.on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        runtime.on("symbolic-ref --short HEAD", ExecOutput::ok("main\n"));

        let path = manager(runtime.clone())
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap();
        assert_eq!(path, "/workspace");
        assert_eq!(runtime.exec_count("worktree add /workspace main"), 1);
    }

    #[tokio::test]
    async fn second_call_is_idempotent() {
        let runtime = Arc::new(MockRuntime::new());
        // Path already exists as a healthy worktree on the right branch.
        runtime.on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        runtime.on("symbolic-ref --short HEAD", ExecOutput::ok("main\n"));

        let mgr = manager(runtime.clone());
        let path = mgr
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap();

        assert_eq!(path, "/workspace");
        assert_eq!(runtime.exec_count("worktree add"), 0);
    }

    #[tokio::test]
    async fn missing_mount_is_invariant() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on("test -d /data/repos/e1", ExecOutput::fail(1, ""));

        let err = manager(runtime)
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invariant");
        assert!(err.message().contains("/data/repos/e1"));
    }

    #[tokio::test]
    async fn readonly_mount_fails_fast() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on(
            "touch",
            ExecOutput::fail(1, "touch: /data/repos/e1/.write-probe: Read-only file system"),
        );

        let err = manager(runtime.clone())
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invariant");
        assert!(err.message().contains("/data/repos/e1"));
        assert!(err.message().contains("rw"));
        // Fail-fast: no worktree mutation was attempted.
        assert_eq!(runtime.exec_count("worktree add"), 0);
    }

    #[tokio::test]
    async fn empty_repo_fetches_once_then_fails() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on_n("test -e", ExecOutput::fail(1, ""), 1);
        runtime.on("for-each-ref", ExecOutput::ok(""));

        let err = manager(runtime.clone())
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no-branches-available");
        assert_eq!(runtime.exec_count("fetch origin"), 1);
    }

    #[tokio::test]
    async fn fetch_recovers_new_branches() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on_n("test -e", ExecOutput::fail(1, ""), 1);
        runtime.on_n("for-each-ref", ExecOutput::ok(""), 1);
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));
        runtime.on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        runtime.on("symbolic-ref --short HEAD", ExecOutput::ok("main\n"));

        let path = manager(runtime.clone())
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap();
        assert_eq!(path, "/workspace");
        assert_eq!(runtime.exec_count("fetch origin"), 1);
    }

    #[tokio::test]
    async fn new_branch_is_created_from_default() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on_n("test -e /workspace/feature-x", ExecOutput::fail(1, ""), 1);
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));
        runtime.on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        runtime.on("symbolic-ref --short HEAD", ExecOutput::ok("feature/x\n"));

        let path = manager(runtime.clone())
            .ensure_worktree(&test_env(), "feature/x", "sbx")
            .await
            .unwrap();

        assert_eq!(path, "/workspace/feature-x");
        assert_eq!(
            runtime.exec_count("worktree add -b feature/x /workspace/feature-x main"),
            1
        );
    }

    #[tokio::test]
    async fn already_exists_resolves_to_existing_worktree() {
        let runtime = Arc::new(MockRuntime::new());
        // Absent at first check, but the add races something and reports
        // "already exists"; the re-check then finds a healthy worktree.
        runtime.on_n("test -e /workspace", ExecOutput::fail(1, ""), 1);
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));
        runtime.on(
            "worktree add",
            ExecOutput::fail(128, "fatal: '/workspace' already exists"),
        );
        runtime.on("rev-parse --is-inside-work-tree", ExecOutput::ok("true\n"));
        runtime.on("symbolic-ref --short HEAD", ExecOutput::ok("main\n"));

        let path = manager(runtime)
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap();
        assert_eq!(path, "/workspace");
    }

    #[tokio::test]
    async fn disk_full_is_resource() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on_n("test -e /workspace", ExecOutput::fail(1, ""), 1);
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));
        runtime.on(
            "worktree add",
            ExecOutput::fail(128, "fatal: could not create work tree: No space left on device"),
        );

        let err = manager(runtime)
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "resource");
    }

    #[tokio::test]
    async fn failed_create_prunes_leftovers() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on_n("test -e /workspace", ExecOutput::fail(1, ""), 1);
        runtime.on("for-each-ref", ExecOutput::ok("main\n"));
        runtime.on("worktree add", ExecOutput::fail(128, "fatal: index corrupt"));

        let err = manager(runtime.clone())
            .ensure_worktree(&test_env(), "main", "sbx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert_eq!(runtime.exec_count("worktree prune"), 1);
    }

    #[tokio::test]
    async fn remove_refuses_paths_outside_workspace() {
        let runtime = Arc::new(MockRuntime::new());
        let err = manager(runtime)
            .remove_worktree("e1", "/etc", "sbx")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invariant");
    }
}
