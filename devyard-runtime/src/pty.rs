//! PTY broker: tmux sessions inside sandboxes, bridged to byte streams.
//!
//! Every DB session owns one tmux session inside its sandbox. The broker
//! spawns it on first attach (serialized per tmux name), attaches each
//! client through its own TTY exec (tmux itself provides display sharing
//! and input serialization), and forwards debounced resize events. Client
//! disconnects detach without touching the tmux session; only explicit
//! deletion kills it.

use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::BoxStream;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::keyed_lock::KeyedMutex;
use crate::sandbox::{ExecSpec, PtySize, SandboxRuntime};
use crate::store::entity::{environments, sessions};
use crate::store::{SessionStatus, StateStore};

/// tmux session names: `dy-<seed>-<id8>`, seed sanitized to `[A-Za-z0-9_-]`.
pub fn multiplexer_name(seed: &str, session_id: &str) -> String {
    let sanitized: String = seed
        .chars()
        .take(20)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let short_id: String = session_id.chars().take(8).collect();
    format!("dy-{sanitized}-{short_id}")
}

#[derive(Clone, Copy, Debug)]
pub struct MultiplexerStatus {
    pub exists: bool,
    /// tmux `#{session_activity}` (unix seconds), when available.
    pub last_activity: Option<i64>,
}

/// One attached client. Dropping the stream halves detaches: the TTY exec
/// sees its connection close while the tmux session lives on.
pub struct PtyStream {
    pub output: BoxStream<'static, Result<Vec<u8>>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    resize_tx: mpsc::UnboundedSender<PtySize>,
}

impl std::fmt::Debug for PtyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyStream").finish_non_exhaustive()
    }
}

impl PtyStream {
    /// Queue a resize; events within the debounce window coalesce and only
    /// the latest size reaches the PTY.
    pub fn resize(&self, size: PtySize) {
        let _ = self.resize_tx.send(size);
    }
}

pub struct PtyBroker {
    runtime: Arc<dyn SandboxRuntime>,
    store: StateStore,
    locks: KeyedMutex,
    attachers: DashMap<String, usize>,
}

impl PtyBroker {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, store: StateStore) -> Self {
        Self {
            runtime,
            store,
            locks: KeyedMutex::new(),
            attachers: DashMap::new(),
        }
    }

    /// Ensure the session's tmux session exists and attach to it.
    pub async fn open(
        &self,
        env: &environments::Model,
        session: &sessions::Model,
        size: PtySize,
    ) -> Result<PtyStream> {
        let sandbox = self.ensure_sandbox_running(env).await?;
        self.ensure_multiplexer(&sandbox, session, size).await?;

        let pty = self
            .runtime
            .attach_pty(
                &sandbox,
                vec![
                    "tmux".to_string(),
                    "attach-session".to_string(),
                    "-t".to_string(),
                    session.tmux_session.clone(),
                ],
                None,
                size,
            )
            .await?;

        // Debounce pump: coalesce resize bursts, apply only the last size.
        let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<PtySize>();
        let runtime = self.runtime.clone();
        let exec_id = pty.exec_id.clone();
        let window = OrchestratorConfig::load().resize_debounce;
        tokio::spawn(async move {
            let mut latest: Option<PtySize> = None;
            loop {
                if latest.is_none() {
                    match resize_rx.recv().await {
                        Some(size) => latest = Some(size),
                        None => break,
                    }
                    continue;
                }
                match tokio::time::timeout(window, resize_rx.recv()).await {
                    Ok(Some(size)) => latest = Some(size),
                    Ok(None) => {
                        if let Some(size) = latest.take() {
                            let _ = runtime.resize_pty(&exec_id, size).await;
                        }
                        break;
                    }
                    Err(_) => {
                        if let Some(size) = latest.take() {
                            if let Err(err) = runtime.resize_pty(&exec_id, size).await {
                                warn!("resize failed for exec {exec_id}: {err}");
                            }
                        }
                    }
                }
            }
        });

        *self.attachers.entry(session.id.clone()).or_insert(0) += 1;
        self.store
            .set_session_status(&session.id, SessionStatus::Active)
            .await?;
        self.store.touch_session(&session.id).await?;

        Ok(PtyStream {
            output: pty.output,
            input: pty.input,
            resize_tx,
        })
    }

    /// Bookkeeping after a client goes away: the session turns inactive
    /// once its last attacher detaches.
    pub async fn detached(&self, session_id: &str) {
        let remaining = {
            let mut entry = self.attachers.entry(session_id.to_string()).or_insert(0);
            *entry = entry.saturating_sub(1);
            *entry
        };
        if remaining == 0 {
            self.attachers.remove(session_id);
            if let Ok(Some(session)) = self.store.session_by_id(session_id).await {
                if session.status == SessionStatus::Active.as_str() {
                    let _ = self
                        .store
                        .set_session_status(session_id, SessionStatus::Inactive)
                        .await;
                }
            }
        }
        let _ = self.store.touch_session(session_id).await;
    }

    /// Kill the tmux session. Only called on explicit session deletion;
    /// detach paths never end up here.
    pub async fn close(&self, env: &environments::Model, session: &sessions::Model) -> Result<()> {
        let Some(sandbox) = env.sandbox_id.as_deref() else {
            return Ok(());
        };
        let _ = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["tmux", "kill-session", "-t", session.tmux_session.as_str()]),
            )
            .await;
        self.attachers.remove(&session.id);
        Ok(())
    }

    pub async fn inspect(
        &self,
        env: &environments::Model,
        session: &sessions::Model,
    ) -> Result<MultiplexerStatus> {
        let Some(sandbox) = env.sandbox_id.as_deref() else {
            return Ok(MultiplexerStatus {
                exists: false,
                last_activity: None,
            });
        };
        let has = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["tmux", "has-session", "-t", session.tmux_session.as_str()]),
            )
            .await?;
        if !has.success() {
            return Ok(MultiplexerStatus {
                exists: false,
                last_activity: None,
            });
        }
        let activity = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new([
                    "tmux",
                    "display-message",
                    "-p",
                    "-t",
                    session.tmux_session.as_str(),
                    "#{session_activity}",
                ]),
            )
            .await?;
        Ok(MultiplexerStatus {
            exists: true,
            last_activity: activity.stdout.trim().parse::<i64>().ok(),
        })
    }

    /// Names of all tmux sessions alive in a sandbox. A missing tmux server
    /// means no sessions, not an error.
    pub async fn list_multiplexer_sessions(&self, sandbox: &str) -> Result<Vec<String>> {
        let output = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["tmux", "list-sessions", "-F", "#{session_name}"]),
            )
            .await?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// The sandbox must be running before anything can attach. One start
    /// attempt is made for stopped sandboxes; a second failure is terminal
    /// for this open.
    async fn ensure_sandbox_running(&self, env: &environments::Model) -> Result<String> {
        let sandbox = env.sandbox_id.clone().ok_or_else(|| {
            OrchestratorError::State(format!("environment {} has no sandbox", env.id))
        })?;

        let running = match self.runtime.inspect(&sandbox).await {
            Ok(status) => status.running,
            Err(_) => false,
        };
        if running {
            return Ok(sandbox);
        }

        self.runtime.start(&sandbox).await.map_err(|err| {
            OrchestratorError::Runtime(format!("sandbox unreachable: {err}"))
        })?;
        let status = self.runtime.inspect(&sandbox).await.map_err(|err| {
            OrchestratorError::Runtime(format!("sandbox unreachable: {err}"))
        })?;
        if !status.running {
            return Err(OrchestratorError::Runtime(format!(
                "sandbox unreachable: {sandbox} did not start"
            )));
        }
        Ok(sandbox)
    }

    /// Spawn-if-missing, serialized per tmux name so concurrent opens
    /// produce exactly one `new-session`. Also called at session creation
    /// so the multiplexer exists before the first attach.
    pub async fn ensure_multiplexer(
        &self,
        sandbox: &str,
        session: &sessions::Model,
        size: PtySize,
    ) -> Result<()> {
        let _guard = self
            .locks
            .lock(&format!("tmux/{}", session.tmux_session))
            .await;

        let has = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["tmux", "has-session", "-t", session.tmux_session.as_str()]),
            )
            .await?;
        if has.success() {
            return Ok(());
        }

        let cols = size.cols.to_string();
        let rows = size.rows.to_string();
        let spawn = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new([
                    "tmux",
                    "new-session",
                    "-d",
                    "-s",
                    session.tmux_session.as_str(),
                    "-c",
                    session.working_directory.as_str(),
                    "-x",
                    cols.as_str(),
                    "-y",
                    rows.as_str(),
                ]),
            )
            .await?;
        if !spawn.success() {
            return Err(OrchestratorError::Runtime(format!(
                "multiplexer session failed to spawn: {}",
                spawn.stderr.trim()
            )));
        }

        let verify = self
            .runtime
            .exec(
                sandbox,
                ExecSpec::new(["tmux", "has-session", "-t", session.tmux_session.as_str()]),
            )
            .await?;
        if !verify.success() {
            return Err(OrchestratorError::Runtime(
                "multiplexer session missing after spawn".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecOutput;
    use crate::sandbox::mock::MockRuntime;
    use crate::store::{NewEnvironment, NewSession, SessionKind, test_store};
    use tokio::io::AsyncWriteExt;

    #[test]
    fn multiplexer_names_are_sanitized_and_stable() {
        let name = multiplexer_name("My Branch!", "abc123def456");
        assert_eq!(name, "dy-My_Branch_-abc123de");
        assert_eq!(name, multiplexer_name("My Branch!", "abc123def456"));
    }

    #[test]
    fn multiplexer_names_truncate_long_seeds() {
        let name = multiplexer_name(&"x".repeat(60), "abcdefgh");
        assert!(name.len() < 40);
    }

    async fn fixtures(
        runtime: Arc<MockRuntime>,
        dir: &std::path::Path,
    ) -> (PtyBroker, environments::Model, sessions::Model) {
        let store = test_store(dir).await;
        store.ensure_user("user-1", "alice").await.unwrap();
        let env = store
            .insert_environment(NewEnvironment {
                id: "e1".into(),
                user_id: "user-1".into(),
                name: "demo".into(),
                repository_url: None,
                branch: "main".into(),
                sandbox_id: Some("sbx".into()),
                status: crate::store::EnvironmentStatus::Running,
            })
            .await
            .unwrap();
        let session = store
            .insert_session(NewSession {
                id: "s1".into(),
                environment_id: "e1".into(),
                name: Some("work".into()),
                tmux_session: "dy-work-s1".into(),
                working_directory: "/workspace".into(),
                branch: "main".into(),
                kind: SessionKind::Shell,
                agent_id: None,
            })
            .await
            .unwrap();
        runtime.set_running("sbx", true);
        (PtyBroker::new(runtime, store), env, session)
    }

    #[tokio::test]
    async fn open_spawns_missing_multiplexer_and_echoes() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on_n("has-session", ExecOutput::fail(1, "no such session"), 1);
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;

        let mut stream = broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();

        assert_eq!(runtime.exec_count("new-session -d -s dy-work-s1"), 1);

        // The mock PTY echoes input back.
        stream.input.write_all(b"echo hi\n").await.unwrap();
        use futures_util::StreamExt;
        let chunk = stream.output.next().await.unwrap().unwrap();
        assert_eq!(chunk, b"echo hi\n");
    }

    #[tokio::test]
    async fn open_reuses_existing_multiplexer() {
        let runtime = Arc::new(MockRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;

        broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();
        assert_eq!(runtime.exec_count("new-session"), 0);
    }

    #[tokio::test]
    async fn resize_bursts_coalesce_to_last() {
        let runtime = Arc::new(MockRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;

        let stream = broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();

        for cols in [90, 100, 110, 120] {
            stream.resize(PtySize { cols, rows: 30 });
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        // Only the last size of the burst reaches the PTY.
        let applied: Vec<PtySize> = runtime.resize_log.lock().unwrap().clone();
        assert_eq!(applied, vec![PtySize { cols: 120, rows: 30 }]);
    }

    #[tokio::test]
    async fn spawn_failure_is_runtime_error() {
        let runtime = Arc::new(MockRuntime::new());
        runtime.on("has-session", ExecOutput::fail(1, "no such session"));
        runtime.on(
            "new-session",
            ExecOutput::fail(1, "error connecting to /tmp/tmux-0/default"),
        );
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;

        let err = broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert!(err.message().contains("multiplexer"));
    }

    #[tokio::test]
    async fn stopped_sandbox_gets_one_start_attempt() {
        let runtime = Arc::new(MockRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;
        runtime.set_running("sbx", false);

        broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();
        let status = runtime.inspect("sbx").await.unwrap();
        assert!(status.running);
    }

    #[tokio::test]
    async fn last_detach_marks_session_inactive() {
        let runtime = Arc::new(MockRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;
        let store = test_store(dir.path()).await;

        broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();
        broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();

        broker.detached("s1").await;
        assert_eq!(
            store.session_by_id("s1").await.unwrap().unwrap().status,
            "active"
        );

        broker.detached("s1").await;
        assert_eq!(
            store.session_by_id("s1").await.unwrap().unwrap().status,
            "inactive"
        );
    }

    #[tokio::test]
    async fn kill_only_on_explicit_close() {
        let runtime = Arc::new(MockRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let (broker, env, session) = fixtures(runtime.clone(), dir.path()).await;

        broker
            .open(&env, &session, PtySize { cols: 80, rows: 24 })
            .await
            .unwrap();
        broker.detached("s1").await;
        assert_eq!(runtime.exec_count("kill-session"), 0);

        broker.close(&env, &session).await.unwrap();
        assert_eq!(runtime.exec_count("kill-session dy-work-s1"), 0);
        assert_eq!(runtime.exec_count("kill-session -t dy-work-s1"), 1);
    }
}
