//! Application state module
//!
//! State shared by every connection task. Nothing here is world state; the
//! world is owned by the tick task and only reached through `logins`.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::crypto::LoginKey;
use crate::game::persistence::PlayerStore;
use crate::game::world::PendingLogin;
use crate::net::session::SessionRegistry;
use crate::protocol::login::LoginDecoder;

/// Application state shared across all connections
pub struct AppState {
    pub config: ServerConfig,
    /// Connected sessions and logged in usernames
    pub registry: Arc<SessionRegistry>,
    pub login_decoder: LoginDecoder,
    pub store: Arc<dyn PlayerStore>,
    /// Hand-off of authenticated logins to the world
    pub logins: mpsc::Sender<PendingLogin>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn PlayerStore>,
        logins: mpsc::Sender<PendingLogin>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> anyhow::Result<Self> {
        let login_decoder = LoginDecoder::new(Self::login_key(&config)?);

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(config.max_connections_per_ip)),
            login_decoder,
            store,
            logins,
            shutdown_tx,
            config,
        })
    }

    /// RSA key for the login block. Development mode reads it as plaintext.
    fn login_key(config: &ServerConfig) -> anyhow::Result<Option<Arc<LoginKey>>> {
        if config.dev_mode {
            info!("Development mode - login blocks are read as plaintext");
            return Ok(None);
        }

        match (&config.rsa.modulus, &config.rsa.private_exponent) {
            (Some(modulus), Some(exponent)) => {
                let key = LoginKey::from_hex(modulus, exponent)?;
                info!(bits = key.bits(), "RSA login key loaded");
                Ok(Some(Arc::new(key)))
            }
            _ => {
                warn!("No RSA key configured - login blocks are read as plaintext");
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("login_decoder", &self.login_decoder)
            .finish_non_exhaustive()
    }
}
