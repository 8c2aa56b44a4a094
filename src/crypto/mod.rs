//! Cryptography module
//!
//! - ISAAC keystream ciphers for frame encryption
//! - RSA for the secure part of the login block

pub mod isaac;
pub mod rsa;

pub use isaac::{CipherPair, Isaac, SessionKeys};
pub use rsa::LoginKey;
