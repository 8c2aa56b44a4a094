//! Mobs: players and npcs
//!
//! `Mob` is the state every moving actor shares: lifecycle core, update
//! flags, action slot and walking queue. `Player` and `Npc` wrap it and are
//! stored in fixed-capacity `MobList`s whose slot index is the wire index.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::WorldError;
use crate::game::action::ActionSlot;
use crate::game::content::ContentDefinitions;
use crate::game::entity::{EntityCore, EntityId, EntityState};
use crate::game::events::Event;
use crate::game::persistence::PlayerSave;
use crate::game::position::{Direction, Position};
use crate::game::update::engine::Viewport;
use crate::game::update::flags::{Hit, HitType, UpdateFlags, UpdateState};
use crate::game::world::WorldContext;
use crate::net::session::GameSession;
use crate::protocol::outbound::OutboundMessage;

/// A mob hit within this many ticks counts as in combat
pub const COMBAT_TIMEOUT_TICKS: u64 = 8;

/// Longest path a walking queue accepts
pub const MAX_WALKING_STEPS: usize = 50;

/// Highest player index. 2047 is the end of the player addition list.
pub const MAX_PLAYERS: u16 = 2046;

/// Highest npc index. Npc indices are sent in 14 bits and 16383 ends the list.
pub const MAX_NPCS: u16 = 16382;

/// Directions moved during the current tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Movement {
    pub primary: Option<Direction>,
    pub secondary: Option<Direction>,
    /// Placed without walking; observers must re-place the mob
    pub teleported: bool,
}

impl Movement {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Single-tile steps still to be walked
#[derive(Debug, Clone, Default)]
pub struct WalkingQueue {
    steps: VecDeque<Position>,
    running: bool,
}

impl WalkingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the queue with a path from `from` through `waypoints`.
    ///
    /// Each waypoint is reached by diagonal then straight single-tile steps.
    /// The path is cut at `MAX_WALKING_STEPS` tiles.
    pub fn set_path(&mut self, from: Position, waypoints: &[Position], running: bool) {
        self.steps.clear();
        self.running = running;

        let mut last = from;
        'path: for waypoint in waypoints {
            if waypoint.plane() != from.plane() {
                break;
            }
            while last != *waypoint {
                if self.steps.len() >= MAX_WALKING_STEPS {
                    break 'path;
                }
                let dx = (waypoint.x() - last.x()).signum();
                let dy = (waypoint.y() - last.y()).signum();
                let Ok(next) = last.translate(dx, dy) else {
                    break 'path;
                };
                self.steps.push_back(next);
                last = next;
            }
        }
    }

    pub fn next_step(&mut self) -> Option<Position> {
        self.steps.pop_front()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// State shared by players and npcs
#[derive(Debug)]
pub struct Mob {
    core: EntityCore,
    pub update: UpdateState,
    pub actions: ActionSlot,
    pub walking: WalkingQueue,
    pub movement: Movement,
    size: u8,
    combat_level: u16,
    hitpoints: u16,
    max_hitpoints: u16,
    last_hit_tick: Option<u64>,
}

impl Mob {
    pub fn new(id: EntityId, size: u8, combat_level: u16, max_hitpoints: u16) -> Self {
        Self {
            core: EntityCore::new(id),
            update: UpdateState::new(),
            actions: ActionSlot::new(),
            walking: WalkingQueue::new(),
            movement: Movement::default(),
            size: size.max(1),
            combat_level,
            hitpoints: max_hitpoints,
            max_hitpoints,
            last_hit_tick: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.core.id()
    }

    pub fn core(&self) -> &EntityCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut EntityCore {
        &mut self.core
    }

    pub fn position(&self) -> Option<Position> {
        self.core.position()
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn combat_level(&self) -> u16 {
        self.combat_level
    }

    pub fn set_combat_level(&mut self, level: u16) {
        self.combat_level = level;
    }

    pub fn hitpoints(&self) -> u16 {
        self.hitpoints
    }

    pub fn max_hitpoints(&self) -> u16 {
        self.max_hitpoints
    }

    pub fn set_hitpoints(&mut self, hitpoints: u16) {
        self.hitpoints = hitpoints.min(self.max_hitpoints);
    }

    /// Hit within the last `COMBAT_TIMEOUT_TICKS` ticks
    pub fn in_combat(&self, now: u64) -> bool {
        self.last_hit_tick
            .is_some_and(|tick| now.saturating_sub(tick) < COMBAT_TIMEOUT_TICKS)
    }

    /// Land a hit: lower hitpoints, fill a splat slot and post the event.
    ///
    /// Returns the splat, or `None` when both slots were already used this
    /// tick; the hitpoints are lowered either way.
    pub fn damage(
        &mut self,
        attacker: Option<EntityId>,
        amount: u8,
        ctx: &mut WorldContext,
    ) -> Option<Hit> {
        let dealt = (amount as u16).min(self.hitpoints);
        self.hitpoints -= dealt;
        self.last_hit_tick = Some(ctx.tick());

        let hit = Hit {
            damage: dealt as u8,
            kind: if dealt == 0 {
                HitType::Block
            } else {
                HitType::Normal
            },
            hitpoints: self.hitpoints.min(u8::MAX as u16) as u8,
            max_hitpoints: self.max_hitpoints.min(u8::MAX as u16) as u8,
        };
        let shown = self.update.push_hit(hit);

        let victim = self.id();
        ctx.post(
            Event::Combat {
                attacker,
                victim,
                damage: hit.damage,
            },
            victim.is_player().then_some(victim),
        );
        shown.then_some(hit)
    }

    /// Mark as fighting without taking a hit
    pub(crate) fn engage(&mut self, tick: u64) {
        self.last_hit_tick = Some(tick);
    }

    /// Take the next one or two steps off the walking queue
    pub(crate) fn advance(&mut self, running: bool, ctx: &mut WorldContext) -> Result<(), WorldError> {
        let run = running || self.walking.is_running();
        self.movement.primary = self.take_step(ctx)?;
        if run && self.movement.primary.is_some() {
            self.movement.secondary = self.take_step(ctx)?;
        }
        Ok(())
    }

    fn take_step(&mut self, ctx: &mut WorldContext) -> Result<Option<Direction>, WorldError> {
        let (Some(current), Some(next)) = (self.position(), self.walking.next_step()) else {
            return Ok(None);
        };
        let Some(direction) = Direction::from_delta(next.x() - current.x(), next.y() - current.y())
        else {
            trace!(entity = %self.id(), "Discarding empty step");
            self.walking.clear();
            return Ok(None);
        };
        self.core.set_position(next, ctx)?;
        Ok(Some(direction))
    }

    /// Place without walking
    pub(crate) fn teleport(&mut self, position: Position, ctx: &mut WorldContext) -> Result<(), WorldError> {
        self.walking.clear();
        self.core.set_position(position, ctx)?;
        self.movement.teleported = true;
        Ok(())
    }
}

/// Access to the shared mob state of a concrete actor
pub trait Actor {
    fn mob(&self) -> &Mob;

    fn mob_mut(&mut self) -> &mut Mob;
}

/// Staff level shown next to chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PlayerRights {
    #[default]
    Player = 0,
    Moderator = 1,
    Administrator = 2,
}

impl PlayerRights {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    #[default]
    Male,
    Female,
}

/// Body styles and colours
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    pub gender: Gender,
    /// hair, beard, torso, arms, hands, legs, feet
    pub styles: [u16; 7],
    /// hair, torso, legs, feet, skin
    pub colors: [u8; 5],
}

impl Default for Appearance {
    fn default() -> Self {
        Self {
            gender: Gender::Male,
            styles: [0, 10, 18, 26, 33, 36, 42],
            colors: [0; 5],
        }
    }
}

/// A logged-in player
#[derive(Debug)]
pub struct Player {
    mob: Mob,
    save: PlayerSave,
    session: Option<GameSession>,
    /// Origin of the map area last sent to the client
    pub(crate) map_base: Option<Position>,
    /// A new map area was sent this tick
    pub(crate) region_changed: bool,
    pub(crate) local_players: Viewport,
    pub(crate) local_npcs: Viewport,
}

impl Player {
    pub fn new(index: u16, save: PlayerSave, session: Option<GameSession>) -> Self {
        let mut mob = Mob::new(
            EntityId::player(index),
            1,
            save.combat_level,
            save.max_hitpoints,
        );
        mob.set_hitpoints(save.hitpoints);
        Self {
            mob,
            save,
            session,
            map_base: None,
            region_changed: false,
            local_players: Viewport::new(),
            local_npcs: Viewport::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.mob.id()
    }

    pub fn username(&self) -> &str {
        &self.save.username
    }

    pub fn rights(&self) -> PlayerRights {
        self.save.rights
    }

    pub fn appearance(&self) -> &Appearance {
        &self.save.appearance
    }

    pub fn set_appearance(&mut self, appearance: Appearance) {
        self.save.appearance = appearance;
        self.mob.update.flag(UpdateFlags::APPEARANCE);
    }

    pub fn is_running(&self) -> bool {
        self.save.running
    }

    pub fn set_running(&mut self, running: bool) {
        self.save.running = running;
    }

    pub fn session(&self) -> Option<&GameSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut GameSession> {
        self.session.as_mut()
    }

    /// Queue `message` on the session, if one is attached.
    ///
    /// A frame that can't be encoded leaves the cipher out of step, so the
    /// session is marked for disconnect.
    pub fn send(&mut self, message: &impl OutboundMessage) {
        let frame = message.write(self);
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session.queue(&frame) {
            warn!(player = %self.save.username, opcode = frame.opcode, error = %e, "Failed to queue message");
            session.handle().signal_disconnect();
        }
    }

    /// Ids currently shown to this player
    pub fn local_players(&self) -> &Viewport {
        &self.local_players
    }

    pub fn local_npcs(&self) -> &Viewport {
        &self.local_npcs
    }

    /// Persistable copy of the current state
    pub fn snapshot(&self) -> PlayerSave {
        let mut save = self.save.clone();
        if let Some(position) = self.mob.position() {
            save.position = position;
        }
        save.hitpoints = self.mob.hitpoints();
        save.max_hitpoints = self.mob.max_hitpoints();
        save.combat_level = self.mob.combat_level();
        save.last_saved = Some(chrono::Utc::now());
        save
    }

    /// Where the player should appear on login
    pub fn saved_position(&self) -> Position {
        self.save.position
    }
}

impl Actor for Player {
    fn mob(&self) -> &Mob {
        &self.mob
    }

    fn mob_mut(&mut self) -> &mut Mob {
        &mut self.mob
    }
}

/// A non-player character
#[derive(Debug)]
pub struct Npc {
    mob: Mob,
    definition_id: u16,
    spawn: Position,
}

impl Npc {
    /// Build from content definitions; unknown ids get size 1, level 0
    pub fn new(index: u16, definition_id: u16, spawn: Position, content: &ContentDefinitions) -> Self {
        let definition = content.npcs.lookup(definition_id);
        let size = definition.map_or(1, |d| d.size);
        let level = definition.map_or(0, |d| d.combat_level);
        let hitpoints = content
            .npc_combat
            .lookup(definition_id)
            .map_or(1, |c| c.hitpoints);

        Self {
            mob: Mob::new(EntityId::npc(index), size, level, hitpoints),
            definition_id,
            spawn,
        }
    }

    pub fn id(&self) -> EntityId {
        self.mob.id()
    }

    pub fn definition_id(&self) -> u16 {
        self.definition_id
    }

    pub fn spawn(&self) -> Position {
        self.spawn
    }

    /// Show as another definition
    pub fn transform(&mut self, definition_id: u16) {
        self.definition_id = definition_id;
        self.mob.update.set_transform(definition_id);
    }
}

impl Actor for Npc {
    fn mob(&self) -> &Mob {
        &self.mob
    }

    fn mob_mut(&mut self) -> &mut Mob {
        &mut self.mob
    }
}

/// Fixed-capacity table handing out the lowest free index, starting at 1
#[derive(Debug)]
pub struct MobList<T> {
    slots: Vec<Option<T>>,
    free: BTreeSet<u16>,
}

impl<T> MobList<T> {
    pub fn new(capacity: u16) -> Self {
        Self {
            slots: std::iter::repeat_with(|| None)
                .take(capacity as usize + 1)
                .collect(),
            free: (1..=capacity).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    pub fn len(&self) -> usize {
        self.capacity() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Allocate an index and store what `build` makes for it
    pub fn insert_with(&mut self, build: impl FnOnce(u16) -> T) -> Result<u16, WorldError> {
        let index = self.free.pop_first().ok_or(WorldError::WorldFull)?;
        self.slots[index as usize] = Some(build(index));
        Ok(index)
    }

    pub fn remove(&mut self, index: u16) -> Option<T> {
        let removed = self.slots.get_mut(index as usize)?.take();
        if removed.is_some() {
            self.free.insert(index);
        }
        removed
    }

    pub fn get(&self, index: u16) -> Option<&T> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// Occupied slots in index order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|t| (i as u16, t)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u16, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|t| (i as u16, t)))
    }

    pub fn indices(&self) -> Vec<u16> {
        self.iter().map(|(index, _)| index).collect()
    }
}

impl<T: Actor> MobList<T> {
    /// Indices of mobs currently in the ACTIVE state
    pub fn active_indices(&self) -> Vec<u16> {
        self.iter()
            .filter(|(_, mob)| mob.mob().core().state() == EntityState::Active)
            .map(|(index, _)| index)
            .collect()
    }

    /// Reset per-tick flags and movement
    pub fn clear_updates(&mut self) {
        for (_, actor) in self.iter_mut() {
            let mob = actor.mob_mut();
            mob.update.clear();
            mob.movement.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn pos(x: i32, y: i32) -> Position {
        Position::new(x, y, 0).unwrap()
    }

    #[test]
    fn test_mob_list_reuses_lowest_index() {
        let mut list: MobList<u32> = MobList::new(3);
        assert_eq!(list.insert_with(|i| i as u32).unwrap(), 1);
        assert_eq!(list.insert_with(|i| i as u32).unwrap(), 2);
        assert_eq!(list.insert_with(|i| i as u32).unwrap(), 3);
        assert!(list.is_full());
        assert_eq!(list.insert_with(|i| i as u32), Err(WorldError::WorldFull));

        assert_eq!(list.remove(2), Some(2));
        assert_eq!(list.remove(2), None);
        assert_eq!(list.len(), 2);
        assert_eq!(list.insert_with(|_| 99).unwrap(), 2);
        assert_eq!(list.indices(), vec![1, 2, 3]);
        assert_eq!(list.get(2), Some(&99));
        assert_eq!(list.get(0), None);
    }

    #[test]
    fn test_walking_queue_interpolates() {
        let mut queue = WalkingQueue::new();
        queue.set_path(pos(3200, 3200), &[pos(3203, 3201), pos(3203, 3203)], false);

        let steps: Vec<_> = std::iter::from_fn(|| queue.next_step()).collect();
        assert_eq!(
            steps,
            vec![
                pos(3201, 3201),
                pos(3202, 3201),
                pos(3203, 3201),
                pos(3203, 3202),
                pos(3203, 3203),
            ]
        );
    }

    #[test]
    fn test_walking_queue_is_capped() {
        let mut queue = WalkingQueue::new();
        queue.set_path(pos(3200, 3200), &[pos(3300, 3200)], true);
        assert_eq!(queue.len(), MAX_WALKING_STEPS);
        assert!(queue.is_running());
    }

    #[test]
    fn test_walking_queue_ignores_other_plane() {
        let mut queue = WalkingQueue::new();
        let upstairs = Position::new(3201, 3200, 1).unwrap();
        queue.set_path(pos(3200, 3200), &[upstairs], false);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_in_combat_window() {
        let mut mob = Mob::new(EntityId::npc(1), 1, 2, 10);
        assert!(!mob.in_combat(0));
        mob.engage(10);
        assert!(mob.in_combat(10));
        assert!(mob.in_combat(17));
        assert!(!mob.in_combat(18));
    }

    #[test]
    fn test_damage_clamps_and_fills_slots() {
        let mut ctx = WorldContext::default();
        let mut mob = Mob::new(EntityId::npc(1), 1, 2, 5);

        let first = mob.damage(None, 3, &mut ctx).unwrap();
        assert_eq!(first.hitpoints, 2);
        let second = mob.damage(None, 9, &mut ctx).unwrap();
        assert_eq!(second.damage, 2);
        assert_eq!(mob.hitpoints(), 0);
        assert_eq!(mob.damage(None, 1, &mut ctx), None);
        assert!(mob
            .update
            .flags
            .contains(UpdateFlags::PRIMARY_HIT | UpdateFlags::SECONDARY_HIT));
    }

    #[test]
    fn test_player_snapshot_tracks_position() {
        let save = PlayerSave::new("alice", "hash");
        let mut ctx = WorldContext::default();
        let mut player = Player::new(1, save, None);
        player
            .mob_mut()
            .core_mut()
            .set_position(pos(3000, 3000), &mut ctx)
            .unwrap();

        let snapshot = player.snapshot();
        assert_eq!(snapshot.position, pos(3000, 3000));
        assert!(snapshot.last_saved.is_some());
    }

    #[test]
    fn test_npc_uses_definitions() {
        use crate::game::content::{DefinitionTable, NpcDefinition};
        let content = ContentDefinitions {
            npcs: DefinitionTable::from_definitions(vec![NpcDefinition {
                id: 50,
                name: "King Black Dragon".into(),
                size: 5,
                combat_level: 276,
            }]),
            ..Default::default()
        };
        let npc = Npc::new(4, 50, pos(2270, 4700), &content);
        assert_eq!(npc.mob().size(), 5);
        assert_eq!(npc.mob().combat_level(), 276);

        let unknown = Npc::new(5, 7, pos(2270, 4700), &content);
        assert_eq!(unknown.mob().size(), 1);
    }
}
