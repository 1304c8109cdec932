//! devyard server: wires the orchestrator core together and serves the API.

use std::sync::Arc;

use devyard_runtime::api::AppState;
use devyard_runtime::gitops::GitOps;
use devyard_runtime::pty::PtyBroker;
use devyard_runtime::repo::RepoStore;
use devyard_runtime::sealer::ChaChaSealer;
use devyard_runtime::worktree::WorktreeManager;
use devyard_runtime::{
    DockerRuntime, EnvironmentService, OrchestratorConfig, Reaper, SandboxRuntime, StateStore,
    api_router,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_log();

    let config = OrchestratorConfig::load();
    info!("starting devyard (state dir {})", devyard_runtime::config::state_dir().display());

    // State store first: everything else records into it.
    let store = StateStore::connect(&config.database_url).await?;
    store.init_schema().await?;

    let runtime: Arc<dyn SandboxRuntime> = Arc::new(DockerRuntime::connect(config).await?);
    let repos = Arc::new(RepoStore::new(store.clone()));
    let worktrees = Arc::new(WorktreeManager::new(runtime.clone()));
    let broker = Arc::new(PtyBroker::new(runtime.clone(), store.clone()));
    let sealer = Arc::new(ChaChaSealer::from_env());
    let service = Arc::new(EnvironmentService::new(
        runtime.clone(),
        store.clone(),
        repos,
        worktrees.clone(),
        broker.clone(),
        sealer,
    ));
    let gitops = Arc::new(GitOps::new(runtime.clone()));

    // Absorb whatever drifted while we were down, then keep repairing.
    let reaper = Arc::new(Reaper::new(
        runtime,
        store.clone(),
        broker.clone(),
        worktrees,
    ));
    reaper.reconcile_on_startup().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reaper_handle = reaper.spawn(config.reaper_interval, shutdown_rx);

    let state = AppState {
        service,
        gitops,
        broker,
        store,
    };
    let router = api_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let serve = axum::serve(listener, router).with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {err}");
        }
        info!("shutdown signal received");
    });

    if let Err(err) = serve.await {
        error!("server error: {err}");
    }

    // Stop background tasks after the listener drains.
    let _ = shutdown_tx.send(true);
    let _ = reaper_handle.await;
    info!("devyard stopped");

    Ok(())
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("devyard=info,tower_http=info,warn"));
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .is_err()
    {}
}
