//! Networking module
//!
//! Everything between the socket and the world:
//! - Byte and bit level packet buffers
//! - Ciphered frame encoding and decoding
//! - Sessions and the session registry
//! - Per-connection reader and writer tasks
//! - Connection acceptance and the login exchange

pub mod buffer;
pub mod codec;
pub mod handler;
pub mod session;
pub mod transport;
