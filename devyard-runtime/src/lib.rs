//! Environment, session, and worktree lifecycle engine for devyard.
//!
//! This crate provides the orchestrator core: the sandbox driver over the
//! container runtime, host-side bare repository management, in-sandbox
//! worktree reconciliation, the tmux-backed PTY broker, the SQLite state
//! store, the HTTP/WebSocket surface, and the background reaper.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod gitops;
pub mod keyed_lock;
pub mod names;
pub mod pty;
pub mod rate_limit;
pub mod reaper;
pub mod repo;
pub mod sandbox;
pub mod sealer;
pub mod service;
pub mod store;
pub mod terminal;
pub mod util;
pub mod worktree;

pub use api::{AppState, api_router};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use reaper::Reaper;
pub use sandbox::{DockerRuntime, SandboxRuntime};
pub use service::EnvironmentService;
pub use store::StateStore;

pub const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/devyard/sandbox:latest";
pub const DEFAULT_API_PORT: u16 = 8920;
