//! Entity lifecycle
//!
//! Every simulated actor embeds an `EntityCore`. It owns the lifecycle state
//! machine and is the only way to move an actor, so region membership and the
//! recorded position can never drift apart.

use std::fmt;

use tracing::trace;

use crate::error::WorldError;
use crate::game::events::Event;
use crate::game::position::{Position, RegionCoordinates};
use crate::game::world::WorldContext;

/// Which entity table an id refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Player,
    Npc,
}

/// Handle to a mob; the region index stores these instead of references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub kind: EntityKind,
    pub index: u16,
}

impl EntityId {
    pub fn new(kind: EntityKind, index: u16) -> Self {
        Self { kind, index }
    }

    pub fn player(index: u16) -> Self {
        Self::new(EntityKind::Player, index)
    }

    pub fn npc(index: u16) -> Self {
        Self::new(EntityKind::Npc, index)
    }

    pub fn is_player(&self) -> bool {
        self.kind == EntityKind::Player
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityKind::Player => write!(f, "player#{}", self.index),
            EntityKind::Npc => write!(f, "npc#{}", self.index),
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityState {
    /// Constructed but not yet in the world
    #[default]
    Idle,
    /// Simulated and visible
    Active,
    /// Removed from the world
    Inactive,
}

/// The callback fired by an accepted state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Activate,
    Deactivate,
}

impl Transition {
    /// Transition table: which callback entering `state` fires
    fn entering(state: EntityState) -> Option<Transition> {
        match state {
            EntityState::Idle => None,
            EntityState::Active => Some(Transition::Activate),
            EntityState::Inactive => Some(Transition::Deactivate),
        }
    }
}

/// Identity, position and lifecycle shared by every mob
#[derive(Debug, Clone)]
pub struct EntityCore {
    id: EntityId,
    position: Option<Position>,
    region: Option<RegionCoordinates>,
    state: EntityState,
}

impl EntityCore {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            position: None,
            region: None,
            state: EntityState::Idle,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Last position set, if the entity was ever placed
    pub fn position(&self) -> Option<Position> {
        self.position
    }

    /// Region the entity is currently a member of
    pub fn region(&self) -> Option<RegionCoordinates> {
        self.region
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == EntityState::Active
    }

    /// Only the region index writes these two fields.
    pub(crate) fn set_placement(&mut self, position: Position, region: Option<RegionCoordinates>) {
        self.position = Some(position);
        self.region = region;
    }

    pub(crate) fn clear_region(&mut self) {
        self.region = None;
    }

    fn actor(&self) -> Option<EntityId> {
        self.id.is_player().then_some(self.id)
    }

    /// Move to a new lifecycle state.
    ///
    /// Setting the current state again, or setting IDLE, is a programming
    /// error. Entering INACTIVE evicts the entity from the region index.
    pub fn set_state(
        &mut self,
        state: EntityState,
        ctx: &mut WorldContext,
    ) -> Result<Transition, WorldError> {
        if state == self.state {
            return Err(WorldError::StateUnchanged {
                entity: self.id,
                state,
            });
        }
        let transition = Transition::entering(state).ok_or(WorldError::IdleNotSettable(self.id))?;

        self.state = state;
        trace!(entity = %self.id, ?state, "State changed");

        match transition {
            Transition::Activate => {
                ctx.post(Event::Activated(self.id), self.actor());
            }
            Transition::Deactivate => {
                ctx.regions_mut().evict(self)?;
                ctx.post(Event::Deactivated(self.id), self.actor());
            }
        }
        Ok(transition)
    }

    /// Move to `position`, keeping region membership consistent.
    ///
    /// The position change event is posted once the region index already
    /// reflects the move.
    pub fn set_position(
        &mut self,
        position: Position,
        ctx: &mut WorldContext,
    ) -> Result<(), WorldError> {
        if self.state == EntityState::Inactive {
            return Err(WorldError::Inactive(self.id));
        }

        let from = self.position;
        ctx.regions_mut().place(self, position)?;
        ctx.post(
            Event::PositionChanged {
                entity: self.id,
                from,
                to: position,
            },
            self.actor(),
        );
        Ok(())
    }
}
