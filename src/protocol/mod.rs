//! Protocol module
//!
//! The 317 revision game protocol:
//! - Handshake and login block
//! - Inbound message sizes, decoding and handlers
//! - Outbound message writers

pub mod login;
pub mod messages;
pub mod outbound;
