//! Update broadcast engine
//!
//! Runs once per tick after all movement. It works in three passes:
//!
//! 1. snapshot every active mob and encode its update block once,
//! 2. build the player and npc packets for every observer in parallel from
//!    the snapshot alone,
//! 3. store the new viewports and queue the packets, one observer at a time.
//!
//! Mobs that would push an observer past its per-tick addition budget are
//! remembered as deferred and compete again on the next tick.

use std::collections::{HashMap, HashSet};
use std::mem;

use bytes::Bytes;
use rayon::prelude::*;
use tracing::trace;

use crate::game::entity::{EntityId, EntityKind};
use crate::game::mob::{Actor, MobList, Movement, Npc, Player};
use crate::game::position::Position;
use crate::game::region::RegionIndex;
use crate::game::update::blocks::{encode_npc_block, encode_player_block};
use crate::game::update::flags::UpdateFlags;
use crate::game::update::priority::{rank_candidates, Candidate};
use crate::net::buffer::PacketWriter;
use crate::protocol::outbound::{NpcUpdateMessage, PlayerUpdateMessage};

/// Marks the end of the player addition list
const PLAYER_LIST_END: u32 = 2047;

/// Marks the end of the npc addition list
const NPC_LIST_END: u32 = 16383;

/// Mobs of one kind an observer currently has on screen
#[derive(Debug, Clone, Default)]
pub struct Viewport {
    local: Vec<EntityId>,
    members: HashSet<EntityId>,
    deferred: Vec<EntityId>,
}

impl Viewport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local mobs in wire order
    pub fn ids(&self) -> &[EntityId] {
        &self.local
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Visible mobs left out last tick for lack of budget
    pub fn deferred(&self) -> &[EntityId] {
        &self.deferred
    }

    fn replace(&mut self, local: Vec<EntityId>, deferred: Vec<EntityId>) {
        self.members = local.iter().copied().collect();
        self.local = local;
        self.deferred = deferred;
    }
}

/// Budget knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// New local mobs per kind and observer per tick
    pub additions_per_tick: usize,
    /// Local mobs per kind an observer can hold
    pub max_local_mobs: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            additions_per_tick: 15,
            max_local_mobs: 255,
        }
    }
}

/// Per-tick facts about one mob
#[derive(Debug, Clone, Copy)]
struct MobView {
    id: EntityId,
    position: Position,
    size: u8,
    combat_level: u16,
    in_combat: bool,
    movement: Movement,
    definition_id: u16,
}

#[derive(Debug, Default)]
struct PlayerBlocks {
    /// Sent to the player itself: never echoes its own chat
    own: Option<Bytes>,
    update: Option<Bytes>,
    /// Sent when the player is added: always carries the appearance
    added: Option<Bytes>,
}

#[derive(Debug, Default)]
struct Snapshot {
    players: HashMap<EntityId, MobView>,
    npcs: HashMap<EntityId, MobView>,
    player_blocks: HashMap<EntityId, PlayerBlocks>,
    npc_blocks: HashMap<EntityId, Bytes>,
}

impl Snapshot {
    fn capture(players: &MobList<Player>, npcs: &MobList<Npc>, tick: u64) -> Self {
        let mut snapshot = Snapshot::default();

        for (_, player) in players.iter() {
            let Some(view) = view_of(player, 0, tick) else {
                continue;
            };
            let flags = player.mob().update.flags;
            snapshot.player_blocks.insert(
                view.id,
                PlayerBlocks {
                    own: encode_player_block(player, flags - UpdateFlags::CHAT),
                    update: encode_player_block(player, flags),
                    added: encode_player_block(player, flags | UpdateFlags::APPEARANCE),
                },
            );
            snapshot.players.insert(view.id, view);
        }

        for (_, npc) in npcs.iter() {
            let Some(view) = view_of(npc, npc.definition_id(), tick) else {
                continue;
            };
            if let Some(block) = encode_npc_block(npc, npc.mob().update.flags) {
                snapshot.npc_blocks.insert(view.id, block);
            }
            snapshot.npcs.insert(view.id, view);
        }
        snapshot
    }

    fn views(&self, kind: EntityKind) -> &HashMap<EntityId, MobView> {
        match kind {
            EntityKind::Player => &self.players,
            EntityKind::Npc => &self.npcs,
        }
    }

    fn block(&self, id: EntityId, added: bool) -> Option<&Bytes> {
        match id.kind {
            EntityKind::Player => {
                let blocks = self.player_blocks.get(&id)?;
                if added {
                    blocks.added.as_ref()
                } else {
                    blocks.update.as_ref()
                }
            }
            EntityKind::Npc => self.npc_blocks.get(&id),
        }
    }
}

fn view_of(actor: &impl Actor, definition_id: u16, tick: u64) -> Option<MobView> {
    let mob = actor.mob();
    if !mob.is_active() {
        return None;
    }
    Some(MobView {
        id: mob.id(),
        position: mob.position()?,
        size: mob.size(),
        combat_level: mob.combat_level(),
        in_combat: mob.in_combat(tick),
        movement: mob.movement,
        definition_id,
    })
}

/// One observer's input to the parallel pass
#[derive(Debug)]
struct Observer {
    index: u16,
    id: EntityId,
    position: Position,
    map_base: Position,
    region_changed: bool,
    movement: Movement,
    players: Viewport,
    npcs: Viewport,
}

/// One observer's output of the parallel pass
#[derive(Debug)]
pub struct ObserverUpdate {
    pub index: u16,
    pub players: Viewport,
    pub npcs: Viewport,
    pub player_packet: Bytes,
    pub npc_packet: Bytes,
}

/// Result of refreshing one viewport
struct Refresh {
    /// Previous locals in order; `None` when removed
    previous: Vec<(EntityId, Option<MobView>)>,
    added: Vec<MobView>,
    deferred: Vec<EntityId>,
}

impl Refresh {
    fn apply_to(&self, viewport: &mut Viewport) {
        let local = self
            .previous
            .iter()
            .filter_map(|(_, view)| view.map(|v| v.id))
            .chain(self.added.iter().map(|v| v.id))
            .collect();
        viewport.replace(local, self.deferred.clone());
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpdateEngine {
    settings: EngineSettings,
}

impl UpdateEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Build and queue this tick's update packets for every active player
    pub fn run(
        &self,
        players: &mut MobList<Player>,
        npcs: &MobList<Npc>,
        regions: &RegionIndex,
        tick: u64,
    ) {
        for update in self.build(players, npcs, regions, tick) {
            let Some(player) = players.get_mut(update.index) else {
                continue;
            };
            player.local_players = update.players;
            player.local_npcs = update.npcs;
            player.send(&PlayerUpdateMessage(update.player_packet));
            player.send(&NpcUpdateMessage(update.npc_packet));
        }
    }

    /// Compute every observer's packets without queueing them.
    ///
    /// The observers' viewports are moved into the returned updates.
    pub fn build(
        &self,
        players: &mut MobList<Player>,
        npcs: &MobList<Npc>,
        regions: &RegionIndex,
        tick: u64,
    ) -> Vec<ObserverUpdate> {
        let snapshot = Snapshot::capture(players, npcs, tick);

        let observers: Vec<Observer> = players
            .iter_mut()
            .filter_map(|(index, player)| {
                let view = snapshot.players.get(&player.id())?;
                Some(Observer {
                    index,
                    id: view.id,
                    position: view.position,
                    map_base: player.map_base.unwrap_or(view.position),
                    region_changed: player.region_changed,
                    movement: view.movement,
                    players: mem::take(&mut player.local_players),
                    npcs: mem::take(&mut player.local_npcs),
                })
            })
            .collect();

        observers
            .into_par_iter()
            .map(|observer| self.observe(observer, &snapshot, regions))
            .collect()
    }

    fn observe(&self, mut observer: Observer, snapshot: &Snapshot, regions: &RegionIndex) -> ObserverUpdate {
        let players = self.refresh(&observer, &observer.players, EntityKind::Player, snapshot, regions);
        let npcs = self.refresh(&observer, &observer.npcs, EntityKind::Npc, snapshot, regions);

        let player_packet = self.player_packet(&observer, &players, snapshot);
        let npc_packet = self.npc_packet(&observer, &npcs, snapshot);
        players.apply_to(&mut observer.players);
        npcs.apply_to(&mut observer.npcs);

        trace!(
            observer = %observer.id,
            players = observer.players.len(),
            npcs = observer.npcs.len(),
            deferred = observer.players.deferred().len() + observer.npcs.deferred().len(),
            "Viewport refreshed"
        );
        ObserverUpdate {
            index: observer.index,
            players: observer.players,
            npcs: observer.npcs,
            player_packet,
            npc_packet,
        }
    }

    /// Drop locals that left view and pick this tick's additions
    fn refresh(
        &self,
        observer: &Observer,
        viewport: &Viewport,
        kind: EntityKind,
        snapshot: &Snapshot,
        regions: &RegionIndex,
    ) -> Refresh {
        let views = snapshot.views(kind);

        let previous: Vec<(EntityId, Option<MobView>)> = viewport
            .ids()
            .iter()
            .map(|id| {
                let kept = views.get(id).copied().filter(|view| {
                    !view.movement.teleported && view.position.is_viewable(&observer.position)
                });
                (*id, kept)
            })
            .collect();
        let retained = previous.iter().filter(|(_, view)| view.is_some()).count();

        let candidates: Vec<Candidate> = regions
            .surrounding(observer.position.region_coordinates())
            .filter(|id| id.kind == kind && *id != observer.id && !viewport.contains(*id))
            .filter_map(|id| views.get(&id))
            .filter(|view| view.position.is_viewable(&observer.position))
            .map(|view| Candidate {
                id: view.id,
                distance: view.position.distance(&observer.position),
                size: view.size,
                combat_level: view.combat_level,
                in_combat: view.in_combat,
            })
            .collect();

        let room = self.settings.max_local_mobs.saturating_sub(retained);
        let budget = self.settings.additions_per_tick.min(room);
        let (chosen, overflow) = rank_candidates(candidates, budget);

        Refresh {
            previous,
            added: chosen.iter().filter_map(|c| views.get(&c.id).copied()).collect(),
            deferred: overflow.into_iter().map(|c| c.id).collect(),
        }
    }

    fn player_packet(&self, observer: &Observer, refresh: &Refresh, snapshot: &Snapshot) -> Bytes {
        let mut bits = PacketWriter::new();
        let mut blocks = PacketWriter::new();
        bits.start_bit_access();

        let own = snapshot
            .player_blocks
            .get(&observer.id)
            .and_then(|b| b.own.as_ref());
        if observer.movement.teleported || observer.region_changed {
            let base = &observer.map_base;
            bits.put_bits(1, 1)
                .put_bits(2, 3)
                .put_bits(2, observer.position.plane() as u32)
                .put_bits(1, 1)
                .put_bits(1, own.is_some() as u32)
                .put_bits(7, observer.position.local_y(base) as u32)
                .put_bits(7, observer.position.local_x(base) as u32);
        } else {
            put_movement(&mut bits, &observer.movement, own.is_some());
        }
        if let Some(block) = own {
            blocks.put_bytes(block);
        }

        put_locals(&mut bits, &mut blocks, refresh, snapshot);

        for view in &refresh.added {
            let block = snapshot.block(view.id, true);
            let (dx, dy) = offset(&view.position, &observer.position);
            bits.put_bits(11, view.id.index as u32)
                .put_bits(1, block.is_some() as u32)
                .put_bits(1, 1)
                .put_bits(5, dy)
                .put_bits(5, dx);
            if let Some(block) = block {
                blocks.put_bytes(block);
            }
        }

        if !blocks.is_empty() {
            bits.put_bits(11, PLAYER_LIST_END);
        }
        bits.end_bit_access();
        bits.put_bytes(blocks.as_bytes());
        bits.freeze()
    }

    fn npc_packet(&self, observer: &Observer, refresh: &Refresh, snapshot: &Snapshot) -> Bytes {
        let mut bits = PacketWriter::new();
        let mut blocks = PacketWriter::new();
        bits.start_bit_access();

        put_locals(&mut bits, &mut blocks, refresh, snapshot);

        for view in &refresh.added {
            let block = snapshot.block(view.id, true);
            let (dx, dy) = offset(&view.position, &observer.position);
            bits.put_bits(14, view.id.index as u32)
                .put_bits(5, dy)
                .put_bits(5, dx)
                .put_bits(1, 0)
                .put_bits(12, view.definition_id as u32)
                .put_bits(1, block.is_some() as u32);
            if let Some(block) = block {
                blocks.put_bytes(block);
            }
        }

        if !blocks.is_empty() {
            bits.put_bits(14, NPC_LIST_END);
        }
        bits.end_bit_access();
        bits.put_bytes(blocks.as_bytes());
        bits.freeze()
    }
}

/// Local count, then a movement or removal entry per previous local
fn put_locals(bits: &mut PacketWriter, blocks: &mut PacketWriter, refresh: &Refresh, snapshot: &Snapshot) {
    bits.put_bits(8, refresh.previous.len() as u32);
    for (id, view) in &refresh.previous {
        match view {
            Some(view) => {
                let block = snapshot.block(*id, false);
                put_movement(bits, &view.movement, block.is_some());
                if let Some(block) = block {
                    blocks.put_bytes(block);
                }
            }
            None => {
                bits.put_bits(1, 1).put_bits(2, 3);
            }
        }
    }
}

fn put_movement(bits: &mut PacketWriter, movement: &Movement, update: bool) {
    match (movement.primary, movement.secondary) {
        (Some(first), Some(second)) => {
            bits.put_bits(1, 1)
                .put_bits(2, 2)
                .put_bits(3, first.id())
                .put_bits(3, second.id())
                .put_bits(1, update as u32);
        }
        (Some(direction), None) => {
            bits.put_bits(1, 1)
                .put_bits(2, 1)
                .put_bits(3, direction.id())
                .put_bits(1, update as u32);
        }
        _ if update => {
            bits.put_bits(1, 1).put_bits(2, 0);
        }
        _ => {
            bits.put_bits(1, 0);
        }
    }
}

/// Five-bit two's complement offsets of `other` from `observer`
fn offset(other: &Position, observer: &Position) -> (u32, u32) {
    let dx = (other.x() - observer.x()) & 0x1f;
    let dy = (other.y() - observer.y()) & 0x1f;
    (dx as u32, dy as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::mob::{MAX_NPCS, MAX_PLAYERS};

    #[test]
    fn test_highest_indices_fit_before_list_end() {
        assert!(u32::from(MAX_PLAYERS) < PLAYER_LIST_END);
        assert!(u32::from(MAX_NPCS) < NPC_LIST_END);
        assert!(NPC_LIST_END < 1 << 14);
        assert!(PLAYER_LIST_END < 1 << 11);
    }

    #[test]
    fn test_offset_wraps_negative() {
        let observer = Position::new(3200, 3200, 0).unwrap();
        let other = Position::new(3199, 3215, 0).unwrap();
        assert_eq!(offset(&other, &observer), (31, 15));
    }

    #[test]
    fn test_idle_movement_is_one_bit() {
        let mut bits = PacketWriter::new();
        bits.start_bit_access();
        put_movement(&mut bits, &Movement::default(), false);
        bits.end_bit_access();
        assert_eq!(bits.as_bytes(), &[0]);
    }

    #[test]
    fn test_update_only_movement() {
        let mut bits = PacketWriter::new();
        bits.start_bit_access();
        put_movement(&mut bits, &Movement::default(), true);
        bits.end_bit_access();
        // 1, 00
        assert_eq!(bits.as_bytes(), &[0b1000_0000]);
    }

    #[test]
    fn test_viewport_replace() {
        let mut viewport = Viewport::new();
        viewport.replace(vec![EntityId::npc(1), EntityId::npc(2)], vec![EntityId::npc(3)]);
        assert_eq!(viewport.len(), 2);
        assert!(viewport.contains(EntityId::npc(2)));
        assert!(!viewport.contains(EntityId::npc(3)));
        assert_eq!(viewport.deferred(), &[EntityId::npc(3)]);
    }
}
