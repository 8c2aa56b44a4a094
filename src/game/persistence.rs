//! Player persistence
//!
//! Saves are plain snapshots taken on the tick thread and written by a
//! background worker, so the tick never waits on the filesystem. Loading
//! happens on the login path before the player reaches the world.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::game::mob::{Appearance, PlayerRights};
use crate::game::position::{Position, DEFAULT_SPAWN};

/// Hitpoints of a fresh account
const STARTING_HITPOINTS: u16 = 10;

/// Combat level of a fresh account
const STARTING_COMBAT_LEVEL: u16 = 3;

/// Everything persisted about one player
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSave {
    pub id: Uuid,
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    #[serde(default)]
    pub rights: PlayerRights,
    pub position: Position,
    #[serde(default)]
    pub appearance: Appearance,
    #[serde(default)]
    pub running: bool,
    pub hitpoints: u16,
    pub max_hitpoints: u16,
    pub combat_level: u16,
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
}

impl PlayerSave {
    /// A brand new account at the default spawn
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: player_id(&username),
            username,
            password_hash: password_hash.into(),
            rights: PlayerRights::default(),
            position: DEFAULT_SPAWN,
            appearance: Appearance::default(),
            running: false,
            hitpoints: STARTING_HITPOINTS,
            max_hitpoints: STARTING_HITPOINTS,
            combat_level: STARTING_COMBAT_LEVEL,
            last_saved: None,
        }
    }
}

/// Stable id derived from the username
pub fn player_id(username: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, username.as_bytes())
}

/// Hash a password into a PHC string
pub fn hash_password(password: &str) -> Result<String, PersistenceError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| PersistenceError::Hash(e.to_string()))
}

/// Check a password against a stored PHC string
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Result of looking up an account
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Loaded {
        credential_ok: bool,
        save: Box<PlayerSave>,
    },
    NotFound,
    /// The record exists but can't be read
    Corrupt(String),
}

/// Save/load collaborator
pub trait PlayerStore: Send + Sync {
    fn save(&self, save: &PlayerSave) -> Result<(), PersistenceError>;

    fn load(&self, username: &str, password: &str) -> LoadOutcome;
}

/// One pretty-printed JSON document per player
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    directory: PathBuf,
}

impl JsonFileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path_for(&self, username: &str) -> PathBuf {
        self.directory.join(format!("{}.json", username))
    }
}

impl PlayerStore for JsonFileStore {
    fn save(&self, save: &PlayerSave) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.directory)?;
        let json = serde_json::to_string_pretty(save)?;

        // write then rename so a crash never leaves half a document behind
        let path = self.path_for(&save.username);
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &path)?;

        debug!(player = %save.username, path = %path.display(), "Player saved");
        Ok(())
    }

    fn load(&self, username: &str, password: &str) -> LoadOutcome {
        let path = self.path_for(username);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return LoadOutcome::NotFound,
            Err(e) => return LoadOutcome::Corrupt(e.to_string()),
        };

        match serde_json::from_str::<PlayerSave>(&contents) {
            Ok(save) => LoadOutcome::Loaded {
                credential_ok: verify_password(password, &save.password_hash),
                save: Box::new(save),
            },
            Err(e) => {
                warn!(player = %username, error = %e, "Unreadable player save");
                LoadOutcome::Corrupt(e.to_string())
            }
        }
    }
}

/// Sending half of the save worker's channel
#[derive(Debug, Clone)]
pub struct SaveQueue {
    sender: mpsc::UnboundedSender<PlayerSave>,
}

impl SaveQueue {
    pub fn submit(&self, save: PlayerSave) -> Result<(), PersistenceError> {
        self.sender
            .send(save)
            .map_err(|_| PersistenceError::WorkerStopped)
    }
}

/// Background task performing saves off the tick thread
pub struct SaveWorker;

impl SaveWorker {
    /// Start the worker. It exits once every `SaveQueue` clone is dropped
    /// and the backlog has been written.
    pub fn spawn(store: Arc<dyn PlayerStore>) -> (SaveQueue, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<PlayerSave>();

        let handle = tokio::spawn(async move {
            let mut written = 0u64;
            while let Some(save) = receiver.recv().await {
                let store = store.clone();
                let username = save.username.clone();
                match tokio::task::spawn_blocking(move || store.save(&save)).await {
                    Ok(Ok(())) => written += 1,
                    Ok(Err(e)) => error!(player = %username, error = %e, "Failed to save player"),
                    Err(e) => error!(player = %username, error = %e, "Save task panicked"),
                }
            }
            info!(written, "Save worker stopped");
        });

        (SaveQueue { sender }, handle)
    }
}
