use once_cell::sync::OnceCell;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// In-sandbox root under which bare repositories are bind-mounted.
pub const SANDBOX_REPO_ROOT: &str = "/data/repos";
/// Canonical worktree path for the branch an environment was created with.
pub const SANDBOX_WORKSPACE: &str = "/workspace";

/// Runtime configuration loaded once at startup from environment variables.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Image used for sandbox containers.
    pub sandbox_image: String,
    /// Optional docker host override (`DOCKER_HOST`).
    pub docker_host: Option<String>,
    /// Pull `sandbox_image` on first use.
    pub pull_image: bool,
    /// Listen port of the HTTP/WebSocket API.
    pub api_port: u16,
    /// SQLite connection URL for the state store.
    pub database_url: String,
    /// Timeout for a single in-sandbox exec.
    pub exec_timeout: Duration,
    /// Timeout for git operations that touch the network (clone, fetch, push).
    pub git_timeout: Duration,
    /// Overall budget for one worktree reconciliation.
    pub worktree_timeout: Duration,
    /// Period of the background reaper.
    pub reaper_interval: Duration,
    /// Coalescing window for PTY resize events.
    pub resize_debounce: Duration,
    /// Re-fetch bare repos older than this during `ensure_bare`. Zero
    /// disables automatic fetching.
    pub fetch_ttl_secs: i64,
    /// Refresh token lifetime.
    pub token_ttl_secs: i64,
}

static CONFIG: OnceCell<OrchestratorConfig> = OnceCell::new();

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    /// Cached after the first call; subsequent calls return the same config.
    pub fn load() -> &'static OrchestratorConfig {
        CONFIG.get_or_init(|| {
            let sandbox_image = env::var("DEVYARD_SANDBOX_IMAGE")
                .unwrap_or_else(|_| crate::DEFAULT_SANDBOX_IMAGE.to_string());
            let docker_host = env::var("DOCKER_HOST").ok();
            let pull_image = env::var("DEVYARD_PULL_IMAGE")
                .ok()
                .and_then(|v| v.parse::<bool>().ok())
                .unwrap_or(true);
            let api_port = env::var("DEVYARD_API_PORT")
                .ok()
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(crate::DEFAULT_API_PORT);
            let database_url = env::var("DEVYARD_DATABASE_URL").unwrap_or_else(|_| {
                format!("sqlite://{}?mode=rwc", state_dir().join("devyard.db").display())
            });

            OrchestratorConfig {
                sandbox_image,
                docker_host,
                pull_image,
                api_port,
                database_url,
                exec_timeout: Duration::from_secs(env_u64("DEVYARD_EXEC_TIMEOUT_SECS", 30)),
                git_timeout: Duration::from_secs(env_u64("DEVYARD_GIT_TIMEOUT_SECS", 120)),
                worktree_timeout: Duration::from_secs(env_u64("DEVYARD_WORKTREE_TIMEOUT_SECS", 60)),
                reaper_interval: Duration::from_secs(env_u64("DEVYARD_REAPER_INTERVAL_SECS", 30)),
                resize_debounce: Duration::from_millis(env_u64("DEVYARD_RESIZE_DEBOUNCE_MS", 50)),
                fetch_ttl_secs: env_u64("DEVYARD_FETCH_TTL_SECS", 0) as i64,
                token_ttl_secs: env_u64("DEVYARD_TOKEN_TTL_SECS", 30 * 86400) as i64,
            }
        })
    }
}

/// Resolve the state directory from `DEVYARD_STATE_DIR`, defaulting to
/// `./devyard-state`.
///
/// Creates the directory with restrictive permissions (0o700) if it doesn't
/// exist; bare repos and the SQLite file live under it.
pub fn state_dir() -> PathBuf {
    let dir = env::var("DEVYARD_STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("devyard-state"));

    if !dir.exists() {
        std::fs::create_dir_all(&dir).ok();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }

    dir
}

/// Host directory holding bare repositories, `<state>/repos`.
pub fn repos_dir() -> PathBuf {
    let dir = state_dir().join("repos");
    if !dir.exists() {
        std::fs::create_dir_all(&dir).ok();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
    dir
}
