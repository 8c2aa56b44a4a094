//! Realm Game Server
//!
//! Runs the world tick on its own task and accepts 317 revision game
//! connections until Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use realm_server::config::{LogFormat, ServerConfig};
use realm_server::game::content::ContentDefinitions;
use realm_server::game::persistence::{JsonFileStore, PlayerStore, SaveWorker};
use realm_server::game::world::{World, WorldSettings};
use realm_server::net::handler::accept_connections;
use realm_server::state::AppState;
use realm_server::{REVISION, VERSION};

/// Logins waiting for the world; the world admits a bounded number per tick
const LOGIN_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load().await?;
    init_logging(config.log_format);

    info!(version = VERSION, revision = REVISION, "Realm game server starting");
    info!(path = %config.config_path.display(), "Configuration loaded");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let store: Arc<dyn PlayerStore> = Arc::new(JsonFileStore::new(config.saved_players_path()));
    let (saves, save_task) = SaveWorker::spawn(store.clone());
    let content = ContentDefinitions::load(&config.definitions_path())?;

    let (login_tx, login_rx) = mpsc::channel(LOGIN_QUEUE_CAPACITY);
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        login_tx,
        shutdown_tx.clone(),
    )?);
    info!("Application state initialized");

    let mut world = World::new(WorldSettings::from_config(&config))
        .with_content(Arc::new(content))
        .with_saves(saves)
        .with_sessions(state.registry.clone())
        .with_logins(login_rx);

    let world_shutdown_tx = shutdown_tx.clone();
    let mut world_shutdown_rx = shutdown_tx.subscribe();
    let world_handle = tokio::spawn(async move {
        if let Err(e) = world.run(&mut world_shutdown_rx).await {
            error!(error = %e, "Game world stopped on an invariant violation");
            let _ = world_shutdown_tx.send(());
        }
    });

    let game_addr = format!("{}:{}", config.bind_address, config.game_port);
    let listener = TcpListener::bind(&game_addr).await?;
    info!(address = %game_addr, "Game server listening");

    let acceptor_state = state.clone();
    let mut acceptor_shutdown_rx = shutdown_tx.subscribe();
    let acceptor_handle = tokio::spawn(async move {
        accept_connections(listener, acceptor_state, &mut acceptor_shutdown_rx).await;
    });

    info!(world_id = config.world_id, "World is ready for connections");

    wait_for_shutdown(shutdown_tx.clone(), shutdown_tx.subscribe()).await;
    info!("Shutting down server...");

    if let Err(e) = acceptor_handle.await {
        error!(error = %e, "Acceptor task failed");
    }
    if let Err(e) = world_handle.await {
        error!(error = %e, "World task failed");
    }

    state.registry.disconnect_all();
    info!("All sessions disconnected");

    // the world owned the last save queue, so the worker drains and exits
    if let Err(e) = save_task.await {
        error!(error = %e, "Save worker failed");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,realm_server=debug"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for Ctrl+C, SIGTERM or a shutdown raised elsewhere
async fn wait_for_shutdown(
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        _ = shutdown_rx.recv() => {
            return;
        }
    }

    let _ = shutdown_tx.send(());
}
