//! State store: durable record of environments, sessions, and agents.
//!
//! A thin typed-query layer over SQLite (sea-orm). Uniqueness is enforced by
//! the database itself (a partial unique index covers non-dead session
//! names, a filtered unique index covers live environment names), so
//! concurrent read-then-insert races surface as `conflict` instead of
//! corrupting state. No business logic lives here.

pub mod entity;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};

use crate::error::{OrchestratorError, Result};
use crate::util::now_ts;
use entity::{
    agent_credentials, agents, bare_repos, environments, refresh_tokens, sessions, users,
};

// ─────────────────────────────────────────────────────────────────────────────
// Status vocabularies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvironmentStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl EnvironmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Starting => "starting",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Stopped => "stopped",
            EnvironmentStatus::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Inactive,
    Dead,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Inactive => "inactive",
            SessionStatus::Dead => "dead",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    Shell,
    Agent,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Shell => "shell",
            SessionKind::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "shell" => Ok(SessionKind::Shell),
            "agent" => Ok(SessionKind::Agent),
            other => Err(OrchestratorError::UserInput(format!(
                "unknown session type '{other}'"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Insert parameter structs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct NewEnvironment {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub repository_url: Option<String>,
    pub branch: String,
    pub sandbox_id: Option<String>,
    pub status: EnvironmentStatus,
}

#[derive(Clone, Debug)]
pub struct NewSession {
    pub id: String,
    pub environment_id: String,
    pub name: Option<String>,
    pub tmux_session: String,
    pub working_directory: String,
    pub branch: String,
    pub kind: SessionKind,
    pub agent_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewAgent {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub kind: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema bootstrap
// ─────────────────────────────────────────────────────────────────────────────

/// Idempotent DDL run at startup. Proper migrations are an external concern;
/// the orchestrator only guarantees its own tables and indexes exist.
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_credentials (
        agent_id TEXT PRIMARY KEY REFERENCES agents(id),
        sealed_blob TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS environments (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        repository_url TEXT,
        branch TEXT NOT NULL,
        sandbox_id TEXT,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        deleted_at INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_environments_owner_name
        ON environments (user_id, name) WHERE deleted_at IS NULL",
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        environment_id TEXT NOT NULL REFERENCES environments(id),
        name TEXT,
        tmux_session TEXT NOT NULL,
        working_directory TEXT NOT NULL,
        branch TEXT NOT NULL,
        session_type TEXT NOT NULL,
        agent_id TEXT REFERENCES agents(id),
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        last_activity_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_env_name
        ON sessions (environment_id, name)
        WHERE status != 'dead' AND name IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS bare_repos (
        environment_id TEXT PRIMARY KEY REFERENCES environments(id),
        host_path TEXT NOT NULL,
        remote_url TEXT NOT NULL,
        last_fetched_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS refresh_tokens (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        token_hash TEXT NOT NULL UNIQUE,
        expires_at INTEGER NOT NULL,
        revoked_at INTEGER,
        created_at INTEGER NOT NULL
    )",
    // Written by the external repository-discovery flow; devyard only
    // guarantees the table exists.
    "CREATE TABLE IF NOT EXISTS github_repositories (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL REFERENCES users(id),
        full_name TEXT NOT NULL,
        clone_url TEXT NOT NULL,
        default_branch TEXT NOT NULL,
        fetched_at INTEGER NOT NULL
    )",
];

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct StateStore {
    db: DatabaseConnection,
}

impl StateStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let db = Database::connect(url).await?;
        Ok(Self { db })
    }

    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            self.db.execute_unprepared(statement).await?;
        }
        Ok(())
    }

    // ── users ───────────────────────────────────────────────────────────────

    /// Fetch-or-create a user row for an externally-issued identity.
    pub async fn ensure_user(&self, id: &str, name: &str) -> Result<users::Model> {
        if let Some(user) = users::Entity::find_by_id(id).one(&self.db).await? {
            return Ok(user);
        }
        let user = users::ActiveModel {
            id: Set(id.to_string()),
            name: Set(name.to_string()),
            created_at: Set(now_ts()),
        };
        Ok(user.insert(&self.db).await?)
    }

    pub async fn user_by_id(&self, id: &str) -> Result<Option<users::Model>> {
        Ok(users::Entity::find_by_id(id).one(&self.db).await?)
    }

    // ── environments ────────────────────────────────────────────────────────

    pub async fn insert_environment(&self, new: NewEnvironment) -> Result<environments::Model> {
        let now = now_ts();
        let row = environments::ActiveModel {
            id: Set(new.id),
            user_id: Set(new.user_id),
            name: Set(new.name),
            repository_url: Set(new.repository_url),
            branch: Set(new.branch),
            sandbox_id: Set(new.sandbox_id),
            status: Set(new.status.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
        };
        Ok(row.insert(&self.db).await?)
    }

    /// Fetch a non-deleted environment.
    pub async fn environment_by_id(&self, id: &str) -> Result<Option<environments::Model>> {
        Ok(environments::Entity::find_by_id(id)
            .filter(environments::Column::DeletedAt.is_null())
            .one(&self.db)
            .await?)
    }

    pub async fn environments_for_user(&self, user_id: &str) -> Result<Vec<environments::Model>> {
        Ok(environments::Entity::find()
            .filter(environments::Column::UserId.eq(user_id))
            .filter(environments::Column::DeletedAt.is_null())
            .order_by_asc(environments::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    /// All non-deleted environments, for reconciliation.
    pub async fn environments_all(&self) -> Result<Vec<environments::Model>> {
        Ok(environments::Entity::find()
            .filter(environments::Column::DeletedAt.is_null())
            .all(&self.db)
            .await?)
    }

    /// Names already taken by the owner's non-deleted environments.
    pub async fn environment_names_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .environments_for_user(user_id)
            .await?
            .into_iter()
            .map(|env| env.name)
            .collect())
    }

    pub async fn set_environment_status(&self, id: &str, status: EnvironmentStatus) -> Result<()> {
        environments::Entity::update_many()
            .col_expr(environments::Column::Status, Expr::value(status.as_str()))
            .col_expr(environments::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(environments::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_environment_sandbox(&self, id: &str, sandbox_id: Option<&str>) -> Result<()> {
        environments::Entity::update_many()
            .col_expr(
                environments::Column::SandboxId,
                Expr::value(sandbox_id.map(str::to_string)),
            )
            .col_expr(environments::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(environments::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Soft-delete, freeing the (owner, name) slot for reuse.
    pub async fn mark_environment_deleted(&self, id: &str) -> Result<()> {
        environments::Entity::update_many()
            .col_expr(environments::Column::DeletedAt, Expr::value(now_ts()))
            .col_expr(environments::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(environments::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── sessions ────────────────────────────────────────────────────────────

    pub async fn insert_session(&self, new: NewSession) -> Result<sessions::Model> {
        let now = now_ts();
        let row = sessions::ActiveModel {
            id: Set(new.id),
            environment_id: Set(new.environment_id),
            name: Set(new.name),
            tmux_session: Set(new.tmux_session),
            working_directory: Set(new.working_directory),
            branch: Set(new.branch),
            session_type: Set(new.kind.as_str().to_string()),
            agent_id: Set(new.agent_id),
            status: Set(SessionStatus::Inactive.as_str().to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            last_activity_at: Set(now),
        };
        Ok(row.insert(&self.db).await?)
    }

    pub async fn session_by_id(&self, id: &str) -> Result<Option<sessions::Model>> {
        Ok(sessions::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn sessions_for_environment(
        &self,
        environment_id: &str,
    ) -> Result<Vec<sessions::Model>> {
        Ok(sessions::Entity::find()
            .filter(sessions::Column::EnvironmentId.eq(environment_id))
            .order_by_asc(sessions::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn sessions_non_dead(&self) -> Result<Vec<sessions::Model>> {
        Ok(sessions::Entity::find()
            .filter(sessions::Column::Status.ne(SessionStatus::Dead.as_str()))
            .all(&self.db)
            .await?)
    }

    pub async fn session_name_taken(&self, environment_id: &str, name: &str) -> Result<bool> {
        let count = sessions::Entity::find()
            .filter(sessions::Column::EnvironmentId.eq(environment_id))
            .filter(sessions::Column::Name.eq(name))
            .filter(sessions::Column::Status.ne(SessionStatus::Dead.as_str()))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    /// The non-dead session currently bound to `branch`, if any.
    pub async fn session_for_branch(
        &self,
        environment_id: &str,
        branch: &str,
    ) -> Result<Option<sessions::Model>> {
        Ok(sessions::Entity::find()
            .filter(sessions::Column::EnvironmentId.eq(environment_id))
            .filter(sessions::Column::Branch.eq(branch))
            .filter(sessions::Column::Status.ne(SessionStatus::Dead.as_str()))
            .one(&self.db)
            .await?)
    }

    /// Number of non-dead sessions on `branch` excluding `session_id`.
    /// Used to decide whether deleting a session may prune its worktree.
    pub async fn other_sessions_on_branch(
        &self,
        environment_id: &str,
        branch: &str,
        session_id: &str,
    ) -> Result<u64> {
        Ok(sessions::Entity::find()
            .filter(sessions::Column::EnvironmentId.eq(environment_id))
            .filter(sessions::Column::Branch.eq(branch))
            .filter(sessions::Column::Status.ne(SessionStatus::Dead.as_str()))
            .filter(sessions::Column::Id.ne(session_id))
            .count(&self.db)
            .await?)
    }

    pub async fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sessions::Entity::update_many()
            .col_expr(sessions::Column::Status, Expr::value(status.as_str()))
            .col_expr(sessions::Column::UpdatedAt, Expr::value(now_ts()))
            .filter(sessions::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Hard-delete a session row. Explicit deletion removes the record;
    /// the reaper only ever marks rows dead.
    pub async fn delete_session_row(&self, id: &str) -> Result<()> {
        sessions::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn touch_session(&self, id: &str) -> Result<()> {
        sessions::Entity::update_many()
            .col_expr(sessions::Column::LastActivityAt, Expr::value(now_ts()))
            .filter(sessions::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Test-only: rewrite a session's creation timestamp so reaper grace
    /// periods can be exercised.
    #[cfg(test)]
    pub(crate) async fn backdate_session(&self, id: &str, created_at: i64) -> Result<()> {
        sessions::Entity::update_many()
            .col_expr(sessions::Column::CreatedAt, Expr::value(created_at))
            .filter(sessions::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── bare repos ──────────────────────────────────────────────────────────

    pub async fn upsert_bare_repo(
        &self,
        environment_id: &str,
        host_path: &str,
        remote_url: &str,
    ) -> Result<bare_repos::Model> {
        if let Some(existing) = bare_repos::Entity::find_by_id(environment_id)
            .one(&self.db)
            .await?
        {
            return Ok(existing);
        }
        let row = bare_repos::ActiveModel {
            environment_id: Set(environment_id.to_string()),
            host_path: Set(host_path.to_string()),
            remote_url: Set(remote_url.to_string()),
            last_fetched_at: Set(now_ts()),
        };
        Ok(row.insert(&self.db).await?)
    }

    pub async fn bare_repo_for_environment(
        &self,
        environment_id: &str,
    ) -> Result<Option<bare_repos::Model>> {
        Ok(bare_repos::Entity::find_by_id(environment_id)
            .one(&self.db)
            .await?)
    }

    pub async fn touch_bare_repo_fetched(&self, environment_id: &str) -> Result<()> {
        bare_repos::Entity::update_many()
            .col_expr(bare_repos::Column::LastFetchedAt, Expr::value(now_ts()))
            .filter(bare_repos::Column::EnvironmentId.eq(environment_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_bare_repo(&self, environment_id: &str) -> Result<()> {
        bare_repos::Entity::delete_by_id(environment_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    // ── agents ──────────────────────────────────────────────────────────────

    pub async fn insert_agent(&self, new: NewAgent) -> Result<agents::Model> {
        let now = now_ts();
        let row = agents::ActiveModel {
            id: Set(new.id),
            user_id: Set(new.user_id),
            name: Set(new.name),
            kind: Set(new.kind),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(row.insert(&self.db).await?)
    }

    pub async fn agent_by_id(&self, id: &str) -> Result<Option<agents::Model>> {
        Ok(agents::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn agents_for_user(&self, user_id: &str) -> Result<Vec<agents::Model>> {
        Ok(agents::Entity::find()
            .filter(agents::Column::UserId.eq(user_id))
            .order_by_asc(agents::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn delete_agent(&self, id: &str) -> Result<()> {
        // Dead sessions may still point at the agent; unlink them so the
        // foreign key lets the row go.
        sessions::Entity::update_many()
            .col_expr(sessions::Column::AgentId, Expr::value(Option::<String>::None))
            .filter(sessions::Column::AgentId.eq(id))
            .exec(&self.db)
            .await?;
        agent_credentials::Entity::delete_by_id(id)
            .exec(&self.db)
            .await?;
        agents::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    /// Whether any non-dead session still references the agent.
    pub async fn agent_in_use(&self, agent_id: &str) -> Result<bool> {
        let count = sessions::Entity::find()
            .filter(sessions::Column::AgentId.eq(agent_id))
            .filter(sessions::Column::Status.ne(SessionStatus::Dead.as_str()))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    pub async fn put_agent_credential(&self, agent_id: &str, sealed_blob: &str) -> Result<()> {
        if agent_credentials::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .is_some()
        {
            agent_credentials::Entity::update_many()
                .col_expr(
                    agent_credentials::Column::SealedBlob,
                    Expr::value(sealed_blob),
                )
                .col_expr(agent_credentials::Column::UpdatedAt, Expr::value(now_ts()))
                .filter(agent_credentials::Column::AgentId.eq(agent_id))
                .exec(&self.db)
                .await?;
            return Ok(());
        }
        let row = agent_credentials::ActiveModel {
            agent_id: Set(agent_id.to_string()),
            sealed_blob: Set(sealed_blob.to_string()),
            updated_at: Set(now_ts()),
        };
        row.insert(&self.db).await?;
        Ok(())
    }

    pub async fn agent_credential(&self, agent_id: &str) -> Result<Option<String>> {
        Ok(agent_credentials::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .map(|row| row.sealed_blob))
    }

    // ── refresh tokens ──────────────────────────────────────────────────────

    pub async fn insert_refresh_token(
        &self,
        id: &str,
        user_id: &str,
        token_hash: &str,
        expires_at: i64,
    ) -> Result<()> {
        let row = refresh_tokens::ActiveModel {
            id: Set(id.to_string()),
            user_id: Set(user_id.to_string()),
            token_hash: Set(token_hash.to_string()),
            expires_at: Set(expires_at),
            revoked_at: Set(None),
            created_at: Set(now_ts()),
        };
        row.insert(&self.db).await?;
        Ok(())
    }

    /// Look up a live (non-revoked, non-expired) token by hash.
    pub async fn live_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<refresh_tokens::Model>> {
        Ok(refresh_tokens::Entity::find()
            .filter(refresh_tokens::Column::TokenHash.eq(token_hash))
            .filter(refresh_tokens::Column::RevokedAt.is_null())
            .filter(refresh_tokens::Column::ExpiresAt.gt(now_ts()))
            .one(&self.db)
            .await?)
    }

    pub async fn revoke_token(&self, id: &str) -> Result<()> {
        refresh_tokens::Entity::update_many()
            .col_expr(refresh_tokens::Column::RevokedAt, Expr::value(now_ts()))
            .filter(refresh_tokens::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Mark expired tokens revoked; returns how many were touched.
    pub async fn revoke_expired_tokens(&self) -> Result<u64> {
        let result = refresh_tokens::Entity::update_many()
            .col_expr(refresh_tokens::Column::RevokedAt, Expr::value(now_ts()))
            .filter(refresh_tokens::Column::RevokedAt.is_null())
            .filter(refresh_tokens::Column::ExpiresAt.lte(now_ts()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

}

#[cfg(test)]
pub(crate) async fn test_store(dir: &std::path::Path) -> StateStore {
    let url = format!("sqlite://{}?mode=rwc", dir.join("test.db").display());
    let store = StateStore::connect(&url).await.unwrap();
    store.init_schema().await.unwrap();
    store
}
