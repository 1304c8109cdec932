use std::fmt;

/// Errors returned by orchestrator operations.
///
/// Variants follow the propagation taxonomy: the first four map to 4xx
/// responses and are never retried; `Resource`, `Upstream`, and `Runtime`
/// map to 5xx and may be retried by the reaper; `Invariant` signals a broken
/// deployment (e.g. a read-only bare-repo mount) and requires operator
/// action.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Malformed request, invalid name or branch.
    UserInput(String),
    /// Missing environment/session/agent/bare repo.
    NotFound(String),
    /// Uniqueness violation or sandbox name collision. Optionally carries
    /// alternative name suggestions for the caller.
    Conflict {
        message: String,
        suggestions: Vec<String>,
    },
    /// Operation not valid in the current state (no worktree, sandbox not
    /// running, dead session).
    State(String),
    /// Disk full, out of memory.
    Resource(String),
    /// Network failure reaching the upstream repository.
    Upstream(String),
    /// The bare repository has no local branches even after a fetch.
    NoBranches(String),
    /// Container runtime unreachable or exec failure.
    Runtime(String),
    /// Broken invariant (readonly mount, branch/worktree mismatch).
    Invariant(String),
    /// Authentication failure (invalid or missing token).
    Auth(String),
    /// Internal storage/state error.
    Storage(String),
}

impl OrchestratorError {
    pub fn conflict(message: impl Into<String>) -> Self {
        OrchestratorError::Conflict {
            message: message.into(),
            suggestions: Vec::new(),
        }
    }

    /// Stable machine-readable kind, used in the HTTP error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::UserInput(_) => "user-input",
            OrchestratorError::NotFound(_) => "not-found",
            OrchestratorError::Conflict { .. } => "conflict",
            OrchestratorError::State(_) => "state",
            OrchestratorError::Resource(_) => "resource",
            OrchestratorError::Upstream(_) => "upstream",
            OrchestratorError::NoBranches(_) => "no-branches-available",
            OrchestratorError::Runtime(_) => "runtime",
            OrchestratorError::Invariant(_) => "invariant",
            OrchestratorError::Auth(_) => "auth",
            OrchestratorError::Storage(_) => "storage",
        }
    }

    /// Whether the reaper is allowed to retry the failed operation.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Resource(_)
                | OrchestratorError::Upstream(_)
                | OrchestratorError::Runtime(_)
        )
    }

    pub fn message(&self) -> &str {
        match self {
            OrchestratorError::UserInput(msg)
            | OrchestratorError::NotFound(msg)
            | OrchestratorError::State(msg)
            | OrchestratorError::Resource(msg)
            | OrchestratorError::Upstream(msg)
            | OrchestratorError::NoBranches(msg)
            | OrchestratorError::Runtime(msg)
            | OrchestratorError::Invariant(msg)
            | OrchestratorError::Auth(msg)
            | OrchestratorError::Storage(msg) => msg,
            OrchestratorError::Conflict { message, .. } => message,
        }
    }
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::UserInput(msg) => write!(f, "invalid input: {msg}"),
            OrchestratorError::NotFound(msg) => write!(f, "not found: {msg}"),
            OrchestratorError::Conflict { message, .. } => write!(f, "conflict: {message}"),
            OrchestratorError::State(msg) => write!(f, "invalid state: {msg}"),
            OrchestratorError::Resource(msg) => write!(f, "resource exhausted: {msg}"),
            OrchestratorError::Upstream(msg) => write!(f, "upstream error: {msg}"),
            OrchestratorError::NoBranches(msg) => write!(f, "no branches available: {msg}"),
            OrchestratorError::Runtime(msg) => write!(f, "runtime error: {msg}"),
            OrchestratorError::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            OrchestratorError::Auth(msg) => write!(f, "auth error: {msg}"),
            OrchestratorError::Storage(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl From<OrchestratorError> for String {
    fn from(err: OrchestratorError) -> Self {
        err.to_string()
    }
}

impl From<sea_orm::DbErr> for OrchestratorError {
    fn from(err: sea_orm::DbErr) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE constraint failed") {
            OrchestratorError::conflict(text)
        } else {
            OrchestratorError::Storage(text)
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(OrchestratorError::UserInput("x".into()).kind(), "user-input");
        assert_eq!(OrchestratorError::conflict("x").kind(), "conflict");
        assert_eq!(OrchestratorError::Invariant("x".into()).kind(), "invariant");
    }

    #[test]
    fn retryable_classes() {
        assert!(OrchestratorError::Upstream("net".into()).retryable());
        assert!(OrchestratorError::Runtime("docker".into()).retryable());
        assert!(!OrchestratorError::NotFound("env".into()).retryable());
        assert!(!OrchestratorError::Invariant("ro mount".into()).retryable());
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        let err = sea_orm::DbErr::Custom(
            "error returned from database: UNIQUE constraint failed: environments.name".into(),
        );
        assert_eq!(OrchestratorError::from(err).kind(), "conflict");
    }
}
