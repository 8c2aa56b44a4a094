//! Handshake and login block
//!
//! 1. Client sends the login handshake opcode and a byte of its name hash
//! 2. Server answers with a fixed header and a random server key
//! 3. Client sends the login type, the block length and the login block,
//!    whose secure part is RSA encrypted (plaintext in development mode)
//! 4. Server answers with a response code, plus rights on success

use std::sync::Arc;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::crypto::{LoginKey, SessionKeys};
use crate::error::{LoginResponse, ProtocolError};
use crate::net::buffer::{Order, PacketReader, PacketWriter};

/// First byte of a game login
pub const HANDSHAKE_OPCODE: u8 = 14;

/// Supported client revision
pub const REVISION: u16 = 317;

/// Leading byte of the login block
const BLOCK_MAGIC: u8 = 255;

/// Leading byte of the secure block
const SECURE_BLOCK_MAGIC: u8 = 10;

/// Archive checksums sent with the login block
const ARCHIVE_COUNT: usize = 9;

pub const MAX_USERNAME_LENGTH: usize = 12;
pub const MAX_PASSWORD_LENGTH: usize = 20;

/// Login types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoginType {
    /// Fresh login
    New = 16,
    /// Client lost its connection and is coming back
    Reconnect = 18,
}

impl LoginType {
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            16 => Ok(Self::New),
            18 => Ok(Self::Reconnect),
            other => Err(ProtocolError::InvalidLoginType(other)),
        }
    }
}

/// Server reply to the handshake: eight ignored bytes, status 0, server key
pub fn handshake_response(server_key: u64) -> Bytes {
    let mut out = PacketWriter::with_capacity(17);
    out.put_bytes(&[0; 8]).put_u8(0).put_long(server_key);
    out.freeze()
}

/// Everything the client tells us in the login block
#[derive(Clone, PartialEq, Eq)]
pub struct LoginBlock {
    pub login_type: LoginType,
    pub low_memory: bool,
    pub keys: SessionKeys,
    pub uid: u32,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for LoginBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginBlock")
            .field("login_type", &self.login_type)
            .field("low_memory", &self.low_memory)
            .field("uid", &self.uid)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Parses login blocks, decrypting the secure part when a key is configured
#[derive(Debug, Clone, Default)]
pub struct LoginDecoder {
    key: Option<Arc<LoginKey>>,
}

impl LoginDecoder {
    pub fn new(key: Option<Arc<LoginKey>>) -> Self {
        Self { key }
    }

    /// Parse a login block. `server_key` is the key issued in the handshake;
    /// the client must echo it back.
    pub fn decode(
        &self,
        login_type: LoginType,
        block: Bytes,
        server_key: u64,
    ) -> Result<LoginBlock, ProtocolError> {
        let mut reader = PacketReader::new(block);

        let magic = reader.get_u8()?;
        if magic != BLOCK_MAGIC {
            return Err(ProtocolError::MalformedPacket(format!(
                "Login block magic {magic}"
            )));
        }

        let revision = reader.get_short()?;
        if revision != REVISION {
            return Err(ProtocolError::InvalidRevision {
                expected: REVISION,
                actual: revision,
            });
        }

        let low_memory = reader.get_u8()? == 1;
        for _ in 0..ARCHIVE_COUNT {
            reader.get_int(Order::Big)?;
        }

        let secure_length = reader.get_u8()? as usize;
        if secure_length != reader.remaining() {
            return Err(ProtocolError::InvalidPacketSize {
                expected: secure_length,
                actual: reader.remaining(),
            });
        }
        let secure = reader.get_bytes(secure_length)?;
        let secure = match &self.key {
            Some(key) => Bytes::from(key.decrypt(&secure)?),
            None => secure,
        };

        let mut reader = PacketReader::new(secure);
        let magic = reader.get_u8()?;
        if magic != SECURE_BLOCK_MAGIC {
            return Err(ProtocolError::InvalidRsaBlock(magic));
        }

        let client = reader.get_long()?;
        let echoed = reader.get_long()?;
        if echoed != server_key {
            return Err(ProtocolError::SessionKeyMismatch);
        }

        let uid = reader.get_int(Order::Big)?;
        let username = reader.get_string()?;
        let password = reader.get_string()?;
        debug!(username = %username, ?login_type, "Parsed login block");

        Ok(LoginBlock {
            login_type,
            low_memory,
            keys: SessionKeys::new(client, server_key),
            uid,
            username,
            password,
        })
    }
}

/// Lower case letters, digits, underscores and spaces
static USERNAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_ ]+$").expect("username pattern is valid"));

/// Check the credential format and normalise the username.
///
/// The normalised name is lower case with spaces replaced by underscores.
pub fn validate_credentials(username: &str, password: &str) -> Result<String, LoginResponse> {
    let username = username.trim().to_lowercase();
    let valid_name = (1..=MAX_USERNAME_LENGTH).contains(&username.len())
        && USERNAME_REGEX.is_match(&username);
    let valid_password = (1..=MAX_PASSWORD_LENGTH).contains(&password.len());

    if !valid_name || !valid_password {
        return Err(LoginResponse::InvalidCredentials);
    }
    Ok(username.replace(' ', "_"))
}

/// Final byte(s) of the login exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginReply {
    Accepted { rights: u8 },
    Rejected(LoginResponse),
}

impl LoginReply {
    pub fn encode(&self) -> Bytes {
        match *self {
            LoginReply::Accepted { rights } => {
                let mut out = PacketWriter::with_capacity(3);
                out.put_u8(LoginResponse::Success.as_u8())
                    .put_u8(rights)
                    .put_u8(0);
                out.freeze()
            }
            LoginReply::Rejected(code) => Bytes::copy_from_slice(&[code.as_u8()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Build a plaintext login block the way the client would
    fn login_block(client: u64, server: u64, username: &str, password: &str) -> Bytes {
        let mut secure = PacketWriter::new();
        secure
            .put_u8(SECURE_BLOCK_MAGIC)
            .put_long(client)
            .put_long(server)
            .put_int(1234, Order::Big)
            .put_string(username)
            .put_string(password);
        let secure = secure.freeze();

        let mut block = PacketWriter::new();
        block.put_u8(BLOCK_MAGIC).put_short(REVISION).put_u8(0);
        for _ in 0..ARCHIVE_COUNT {
            block.put_int(0, Order::Big);
        }
        block.put_u8(secure.len() as u8).put_bytes(&secure);
        block.freeze()
    }

    #[test]
    fn test_login_type() {
        assert_eq!(LoginType::from_u8(16).unwrap(), LoginType::New);
        assert_eq!(LoginType::from_u8(18).unwrap(), LoginType::Reconnect);
        assert!(LoginType::from_u8(15).is_err());
    }

    #[test]
    fn test_handshake_response_layout() {
        let response = handshake_response(0x0102_0304_0506_0708);
        assert_eq!(response.len(), 17);
        assert!(response[..9].iter().all(|&b| b == 0));
        assert_eq!(&response[9..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_decode_plaintext_block() {
        let block = login_block(77, 99, "Alice", "secret");
        let parsed = LoginDecoder::default()
            .decode(LoginType::New, block, 99)
            .unwrap();

        assert_eq!(parsed.username, "Alice");
        assert_eq!(parsed.password, "secret");
        assert_eq!(parsed.uid, 1234);
        assert_eq!(parsed.keys, SessionKeys::new(77, 99));
    }

    #[test]
    fn test_server_key_must_match() {
        let block = login_block(77, 98, "alice", "secret");
        assert!(matches!(
            LoginDecoder::default().decode(LoginType::New, block, 99),
            Err(ProtocolError::SessionKeyMismatch)
        ));
    }

    #[test]
    fn test_wrong_revision() {
        let mut block = login_block(1, 2, "alice", "secret").to_vec();
        block[2] = 0x3e; // 318
        assert!(matches!(
            LoginDecoder::default().decode(LoginType::New, Bytes::from(block), 2),
            Err(ProtocolError::InvalidRevision { actual: 318, .. })
        ));
    }

    #[test]
    fn test_validate_credentials() {
        assert_eq!(validate_credentials(" Zezima ", "pw").unwrap(), "zezima");
        assert_eq!(validate_credentials("mod ash", "pw").unwrap(), "mod_ash");
        assert!(validate_credentials("", "pw").is_err());
        assert!(validate_credentials("thirteenchars", "pw").is_err());
        assert!(validate_credentials("bad-name", "pw").is_err());
        assert!(validate_credentials("alice", "").is_err());
        assert!(validate_credentials("alice", &"x".repeat(21)).is_err());
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(
            LoginReply::Accepted { rights: 2 }.encode().as_ref(),
            &[2, 2, 0]
        );
        assert_eq!(
            LoginReply::Rejected(LoginResponse::AlreadyLoggedIn)
                .encode()
                .as_ref(),
            &[5]
        );
    }
}
