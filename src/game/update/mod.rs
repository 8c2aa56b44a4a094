//! Per-tick synchronization of mobs to every observing player

pub mod blocks;
pub mod engine;
pub mod flags;
pub mod priority;

pub use engine::{EngineSettings, UpdateEngine, Viewport};
pub use flags::{UpdateFlags, UpdateState};
