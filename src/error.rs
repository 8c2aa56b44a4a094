//! Error handling module
//!
//! Defines the error taxonomy for the realm server. Protocol and network
//! errors are session-local, world errors split into fatal invariant
//! violations and recoverable validation failures, and persistence errors are
//! converted into login response codes at the boundary.

use std::io;

use thiserror::Error;

use crate::game::entity::{EntityId, EntityState};
use crate::game::position::RegionCoordinates;

/// Main error type for the realm server
#[derive(Error, Debug)]
pub enum ServerError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Simulation errors
    #[error("World error: {0}")]
    World(#[from] WorldError),

    /// Save/load errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Outbound channel closed for session {0}")]
    OutboundClosed(u64),

    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Write error: {0}")]
    WriteError(String),
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("Invalid packet size: expected {expected}, got {actual}")]
    InvalidPacketSize { expected: usize, actual: usize },

    #[error("Invalid revision: expected {expected}, got {actual}")]
    InvalidRevision { expected: u16, actual: u16 },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid handshake opcode: {0}")]
    InvalidHandshake(u8),

    #[error("Invalid login type: {0}")]
    InvalidLoginType(u8),

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid string encoding")]
    InvalidStringEncoding,

    #[error("Server session key mismatch")]
    SessionKeyMismatch,

    #[error("RSA decryption failed")]
    RsaDecryptionFailed,

    #[error("Invalid RSA block magic: {0}")]
    InvalidRsaBlock(u8),
}

/// Simulation errors.
///
/// Invariant violations are programming errors and stop the world; the rest
/// are validation failures that only affect the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    #[error("{entity} is already in state {state:?}")]
    StateUnchanged { entity: EntityId, state: EntityState },

    #[error("{0} cannot be set to IDLE")]
    IdleNotSettable(EntityId),

    #[error("{entity} is already a member of region {region}")]
    DuplicatePlacement {
        entity: EntityId,
        region: RegionCoordinates,
    },

    #[error("{entity} records region {recorded:?} but region index holds {actual:?}")]
    RegionMismatch {
        entity: EntityId,
        recorded: Option<RegionCoordinates>,
        actual: Option<RegionCoordinates>,
    },

    #[error("Coordinate out of bounds: ({x}, {y}, {plane})")]
    OutOfBounds { x: i32, y: i32, plane: i32 },

    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("{0} is inactive and cannot be placed")]
    Inactive(EntityId),

    #[error("World is full")]
    WorldFull,
}

impl WorldError {
    /// Whether this error means world state may be corrupt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorldError::StateUnchanged { .. }
                | WorldError::IdleNotSettable(_)
                | WorldError::DuplicatePlacement { .. }
                | WorldError::RegionMismatch { .. }
        )
    }
}

/// Persistence collaborator errors
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Password hashing failed: {0}")]
    Hash(String),

    #[error("Save worker is not running")]
    WorkerStopped,
}

/// Result type alias for realm operations
pub type Result<T> = std::result::Result<T, ServerError>;

/// Login response codes (317 protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginResponse {
    /// Exchange data
    ExchangeData = 0,
    /// Delay for 2 seconds and retry
    Delay = 1,
    /// Successful login
    Success = 2,
    /// Invalid username or password
    InvalidCredentials = 3,
    /// Account disabled
    AccountDisabled = 4,
    /// Account already logged in
    AlreadyLoggedIn = 5,
    /// Game has been updated
    GameUpdated = 6,
    /// World is full
    WorldFull = 7,
    /// Login server offline
    LoginServerOffline = 8,
    /// Too many connections from address
    LoginLimitExceeded = 9,
    /// Bad session ID
    BadSessionId = 10,
    /// Could not complete login
    CouldNotCompleteLogin = 13,
    /// Server being updated
    ServerUpdating = 14,
}

impl LoginResponse {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<&PersistenceError> for LoginResponse {
    fn from(_: &PersistenceError) -> Self {
        LoginResponse::CouldNotCompleteLogin
    }
}

impl From<&WorldError> for LoginResponse {
    fn from(err: &WorldError) -> Self {
        match err {
            WorldError::WorldFull => LoginResponse::WorldFull,
            _ => LoginResponse::CouldNotCompleteLogin,
        }
    }
}
