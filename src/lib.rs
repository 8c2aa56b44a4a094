//! Realm Game Server Library
//!
//! A tick-driven world simulation for a 317 revision game server, with the
//! networking, login and persistence around it.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `crypto` - ISAAC stream ciphers and RSA login decryption
//! - `error` - Error types and result definitions
//! - `game` - World, entities, regions, actions and update broadcasting
//! - `net` - Framing, sessions and connection handling
//! - `protocol` - Login exchange and game messages

pub mod config;
pub mod crypto;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use protocol::login::REVISION;
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
