//! Update flags
//!
//! Dirty bits a mob raises during the tick, each paired with the payload the
//! block encoder needs. Everything here is cleared for every mob at the end
//! of the tick, whether or not any observer actually received it.

use bitflags::bitflags;

use crate::game::entity::{EntityId, EntityKind};
use crate::game::position::{Direction, Position};

bitflags! {
    /// What changed about a mob since the last engine-wide reset
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u16 {
        const APPEARANCE = 1 << 0;
        const ANIMATION = 1 << 1;
        const GRAPHICS = 1 << 2;
        const CHAT = 1 << 3;
        const FACE_ENTITY = 1 << 4;
        const FACE_COORDINATE = 1 << 5;
        const PRIMARY_HIT = 1 << 6;
        const SECONDARY_HIT = 1 << 7;
        const FORCED_MOVEMENT = 1 << 8;
        const FORCED_CHAT = 1 << 9;
        /// Npc only: changes the displayed definition
        const TRANSFORM = 1 << 10;
    }
}

/// Animation to play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Animation {
    /// Animation id, 65535 resets
    pub id: u16,
    pub delay: u8,
}

impl Animation {
    pub fn new(id: u16, delay: u8) -> Self {
        Self { id, delay }
    }

    pub fn reset() -> Self {
        Self {
            id: u16::MAX,
            delay: 0,
        }
    }
}

/// Spot graphic to play
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Graphic {
    pub id: u16,
    pub height: u16,
    pub delay: u16,
}

impl Graphic {
    pub fn new(id: u16, height: u16, delay: u16) -> Self {
        Self { id, height, delay }
    }
}

/// Splat shown on a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum HitType {
    #[default]
    Block = 0,
    Normal = 1,
    Poison = 2,
    Disease = 3,
}

/// One hit splat with the victim's hitpoints after it landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub damage: u8,
    pub kind: HitType,
    pub hitpoints: u8,
    pub max_hitpoints: u8,
}

/// A public chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub color: u8,
    pub effects: u8,
    pub rights: u8,
    /// Packed text exactly as the client sent it
    pub text: Vec<u8>,
}

/// Scripted movement between two tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedMovement {
    pub start: Position,
    pub end: Position,
    pub duration_x: u16,
    pub duration_y: u16,
    pub direction: Direction,
}

impl ForcedMovement {
    /// Slide from `start` to `end` along the x axis
    pub fn along_x(start: Position, end: Position, duration: u16) -> Self {
        let direction = if end.x() < start.x() {
            Direction::West
        } else {
            Direction::East
        };
        Self {
            start,
            end,
            duration_x: duration,
            duration_y: 0,
            direction,
        }
    }

    /// Slide from `start` to `end` along the y axis
    pub fn along_y(start: Position, end: Position, duration: u16) -> Self {
        let direction = if end.y() < start.y() {
            Direction::South
        } else {
            Direction::North
        };
        Self {
            start,
            end,
            duration_x: 0,
            duration_y: duration,
            direction,
        }
    }
}

/// Mob to turn towards. Encodes players with a 32768 offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceTarget(pub Option<EntityId>);

impl FaceTarget {
    pub fn wire_index(&self) -> u16 {
        match self.0 {
            None => u16::MAX,
            Some(id) if id.kind == EntityKind::Player => id.index + 32768,
            Some(id) => id.index,
        }
    }
}

/// Flags plus payloads for one mob this tick
#[derive(Debug, Clone, Default)]
pub struct UpdateState {
    pub flags: UpdateFlags,
    pub animation: Option<Animation>,
    pub graphic: Option<Graphic>,
    pub primary_hit: Option<Hit>,
    pub secondary_hit: Option<Hit>,
    pub chat: Option<ChatMessage>,
    pub face_target: Option<FaceTarget>,
    pub face_position: Option<Position>,
    pub forced_chat: Option<String>,
    pub forced_movement: Option<ForcedMovement>,
    pub transform: Option<u16>,
}

impl UpdateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn flag(&mut self, flag: UpdateFlags) {
        self.flags |= flag;
    }

    pub fn set_animation(&mut self, animation: Animation) {
        self.animation = Some(animation);
        self.flags |= UpdateFlags::ANIMATION;
    }

    pub fn set_graphic(&mut self, graphic: Graphic) {
        self.graphic = Some(graphic);
        self.flags |= UpdateFlags::GRAPHICS;
    }

    /// Record a hit in the first free splat slot.
    ///
    /// Returns false when both slots are already used this tick.
    pub fn push_hit(&mut self, hit: Hit) -> bool {
        if self.primary_hit.is_none() {
            self.primary_hit = Some(hit);
            self.flags |= UpdateFlags::PRIMARY_HIT;
            true
        } else if self.secondary_hit.is_none() {
            self.secondary_hit = Some(hit);
            self.flags |= UpdateFlags::SECONDARY_HIT;
            true
        } else {
            false
        }
    }

    pub fn set_chat(&mut self, chat: ChatMessage) {
        self.chat = Some(chat);
        self.flags |= UpdateFlags::CHAT;
    }

    pub fn set_face_target(&mut self, target: Option<EntityId>) {
        self.face_target = Some(FaceTarget(target));
        self.flags |= UpdateFlags::FACE_ENTITY;
    }

    pub fn set_face_position(&mut self, position: Position) {
        self.face_position = Some(position);
        self.flags |= UpdateFlags::FACE_COORDINATE;
    }

    pub fn set_forced_chat(&mut self, text: impl Into<String>) {
        self.forced_chat = Some(text.into());
        self.flags |= UpdateFlags::FORCED_CHAT;
    }

    pub fn set_forced_movement(&mut self, movement: ForcedMovement) {
        self.forced_movement = Some(movement);
        self.flags |= UpdateFlags::FORCED_MOVEMENT;
    }

    pub fn set_transform(&mut self, definition: u16) {
        self.transform = Some(definition);
        self.flags |= UpdateFlags::TRANSFORM;
    }

    /// Drop all flags and payloads
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
