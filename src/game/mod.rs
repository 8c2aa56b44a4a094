//! Game module
//!
//! The tick-driven simulation:
//! - World management (game tick, logins, logouts, autosave)
//! - Entities, lifecycle states and the region index
//! - Mobs, walking and actions
//! - Player and npc synchronization
//! - Persistence and content definitions

pub mod action;
pub mod content;
pub mod entity;
pub mod events;
pub mod mob;
pub mod persistence;
pub mod position;
pub mod region;
pub mod update;
pub mod world;

pub use entity::{EntityId, EntityKind, EntityState};
pub use events::{Event, EventDispatcher, HandlerRegistry};
pub use mob::{Mob, Npc, Player};
pub use position::Position;
pub use world::{PendingLogin, World, WorldContext, WorldSettings};
