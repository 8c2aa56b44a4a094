//! World module
//!
//! Owns every simulated mob and advances them one tick at a time. All world
//! state is mutated from the tick alone; the network side only reaches in
//! through session queues and the login channel.
//!
//! Tick order:
//! 1. admit pending logins
//! 2. drain each session's inbound queue, or queue a logout on disconnect
//! 3. run actions, players first
//! 4. advance walking queues
//! 5. send map regions, then build and queue update packets
//! 6. flush every session once
//! 7. clear update flags
//! 8. remove logged out players
//! 9. autosave

use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{LoginResponse, WorldError};
use crate::game::action::{self, Action};
use crate::game::content::ContentDefinitions;
use crate::game::entity::{EntityId, EntityKind, EntityState};
use crate::game::events::{Event, EventDispatcher, HandlerRegistry};
use crate::game::mob::{Actor, Mob, MobList, Npc, Player, MAX_NPCS, MAX_PLAYERS};
use crate::game::persistence::{PlayerSave, SaveQueue};
use crate::game::position::{Direction, Position};
use crate::game::region::RegionIndex;
use crate::game::update::flags::{ChatMessage, Hit, UpdateFlags};
use crate::game::update::{EngineSettings, UpdateEngine};
use crate::net::session::{GameSession, SessionRegistry};
use crate::protocol::messages::{InboundMessage, MessageRepository};
use crate::protocol::outbound::{LogoutMessage, RegionMessage, SystemMessage};

/// Standard game tick rate in milliseconds
pub const TICK_RATE_MS: u64 = 600;

/// Default autosave interval in ticks (5 minutes = 500 ticks at 600ms)
pub const AUTOSAVE_INTERVAL_TICKS: u64 = 500;

/// Logins admitted per tick; the rest wait for the next one
pub const LOGINS_PER_TICK: usize = 50;

/// Local coordinates a player may reach before a new map area is sent
const MAP_AREA_MIN: i32 = 16;
const MAP_AREA_MAX: i32 = 88;

/// World settings
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// World ID (1-255)
    pub world_id: u8,
    pub name: String,
    pub tick_rate_ms: u64,
    pub max_players: u16,
    pub max_npcs: u16,
    /// Ticks between autosaves, `None` to disable
    pub autosave_interval: Option<u64>,
    pub update: EngineSettings,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            world_id: 1,
            name: "Realm".to_string(),
            tick_rate_ms: TICK_RATE_MS,
            max_players: MAX_PLAYERS,
            max_npcs: MAX_NPCS,
            autosave_interval: Some(AUTOSAVE_INTERVAL_TICKS),
            update: EngineSettings::default(),
        }
    }
}

impl WorldSettings {
    pub fn new(world_id: u8) -> Self {
        Self {
            world_id,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_update(mut self, update: EngineSettings) -> Self {
        self.update = update;
        self
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            world_id: config.world_id,
            name: config.server_name.clone(),
            tick_rate_ms: config.tick_rate_ms,
            max_players: config.max_players.min(MAX_PLAYERS),
            max_npcs: MAX_NPCS,
            autosave_interval: config.autosave_interval_ticks(),
            update: EngineSettings {
                additions_per_tick: config.update.additions_per_tick,
                max_local_mobs: config.update.max_local_mobs,
            },
        }
    }
}

/// A login that passed the credential checks and waits for a player slot
#[derive(Debug)]
pub struct PendingLogin {
    pub save: PlayerSave,
    pub session: GameSession,
    /// Receives the player index, or the code to reject the login with
    pub reply: oneshot::Sender<Result<u16, LoginResponse>>,
}

/// Shared services every mob needs while it changes state
pub struct WorldContext {
    regions: RegionIndex,
    events: Arc<dyn EventDispatcher>,
    content: Arc<ContentDefinitions>,
    tick: u64,
}

impl WorldContext {
    pub fn with_dispatcher(events: Arc<dyn EventDispatcher>) -> Self {
        Self {
            regions: RegionIndex::new(),
            events,
            content: Arc::new(ContentDefinitions::default()),
            tick: 0,
        }
    }

    pub fn regions(&self) -> &RegionIndex {
        &self.regions
    }

    pub fn regions_mut(&mut self) -> &mut RegionIndex {
        &mut self.regions
    }

    pub fn content(&self) -> &Arc<ContentDefinitions> {
        &self.content
    }

    /// Ticks completed or in progress
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Fire and forget
    pub fn post(&self, event: Event, actor: Option<EntityId>) {
        self.events.post(event, actor);
    }
}

impl Default for WorldContext {
    fn default() -> Self {
        Self::with_dispatcher(Arc::new(HandlerRegistry::new()))
    }
}

impl std::fmt::Debug for WorldContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldContext")
            .field("regions", &self.regions.len())
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

/// Game world - owns the mobs and runs the tick
pub struct World {
    settings: WorldSettings,
    ctx: WorldContext,
    players: MobList<Player>,
    npcs: MobList<Npc>,
    engine: UpdateEngine,
    messages: MessageRepository,
    logouts: Vec<EntityId>,
    logins: Option<mpsc::Receiver<PendingLogin>>,
    saves: Option<SaveQueue>,
    sessions: Option<Arc<SessionRegistry>>,
    ticks_since_autosave: u64,
}

impl World {
    pub fn new(settings: WorldSettings) -> Self {
        info!(world_id = settings.world_id, name = %settings.name, "Creating game world");
        Self {
            ctx: WorldContext::default(),
            players: MobList::new(settings.max_players.min(MAX_PLAYERS)),
            npcs: MobList::new(settings.max_npcs.min(MAX_NPCS)),
            engine: UpdateEngine::new(settings.update),
            messages: MessageRepository::new(),
            logouts: Vec::new(),
            logins: None,
            saves: None,
            sessions: None,
            ticks_since_autosave: 0,
            settings,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventDispatcher>) -> Self {
        self.ctx.events = events;
        self
    }

    pub fn with_content(mut self, content: Arc<ContentDefinitions>) -> Self {
        self.ctx.content = content;
        self
    }

    pub fn with_saves(mut self, saves: SaveQueue) -> Self {
        self.saves = Some(saves);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_logins(mut self, logins: mpsc::Receiver<PendingLogin>) -> Self {
        self.logins = Some(logins);
        self
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn context(&self) -> &WorldContext {
        &self.ctx
    }

    pub fn regions(&self) -> &RegionIndex {
        self.ctx.regions()
    }

    pub fn tick(&self) -> u64 {
        self.ctx.tick()
    }

    pub fn players(&self) -> &MobList<Player> {
        &self.players
    }

    pub fn npcs(&self) -> &MobList<Npc> {
        &self.npcs
    }

    pub fn player(&self, id: EntityId) -> Option<&Player> {
        match id.kind {
            EntityKind::Player => self.players.get(id.index),
            EntityKind::Npc => None,
        }
    }

    pub fn player_mut(&mut self, id: EntityId) -> Option<&mut Player> {
        match id.kind {
            EntityKind::Player => self.players.get_mut(id.index),
            EntityKind::Npc => None,
        }
    }

    pub fn npc(&self, id: EntityId) -> Option<&Npc> {
        match id.kind {
            EntityKind::Npc => self.npcs.get(id.index),
            EntityKind::Player => None,
        }
    }

    pub fn npc_mut(&mut self, id: EntityId) -> Option<&mut Npc> {
        match id.kind {
            EntityKind::Npc => self.npcs.get_mut(id.index),
            EntityKind::Player => None,
        }
    }

    pub fn mob(&self, id: EntityId) -> Option<&Mob> {
        match id.kind {
            EntityKind::Player => self.players.get(id.index).map(Actor::mob),
            EntityKind::Npc => self.npcs.get(id.index).map(Actor::mob),
        }
    }

    pub fn mob_mut(&mut self, id: EntityId) -> Option<&mut Mob> {
        match id.kind {
            EntityKind::Player => self.players.get_mut(id.index).map(Actor::mob_mut),
            EntityKind::Npc => self.npcs.get_mut(id.index).map(Actor::mob_mut),
        }
    }

    /// Place a player at its saved position and activate it
    pub fn register_player(
        &mut self,
        save: PlayerSave,
        session: Option<GameSession>,
    ) -> Result<EntityId, WorldError> {
        let position = save.position;
        let index = self
            .players
            .insert_with(|index| Player::new(index, save, session))?;
        let id = EntityId::player(index);

        if let Err(e) = self.activate(id, position) {
            if !e.is_fatal() {
                self.players.remove(index);
            }
            return Err(e);
        }
        if let Some(player) = self.players.get_mut(index) {
            player.mob_mut().update.flag(UpdateFlags::APPEARANCE);
            info!(player = %player.username(), index, "Player registered");
        }
        self.ctx.post(Event::Login(id), Some(id));
        Ok(id)
    }

    /// Add an npc built from its content definition
    pub fn spawn_npc(&mut self, definition_id: u16, position: Position) -> Result<EntityId, WorldError> {
        let content = self.ctx.content.clone();
        let index = self
            .npcs
            .insert_with(|index| Npc::new(index, definition_id, position, &content))?;
        let id = EntityId::npc(index);

        if let Err(e) = self.activate(id, position) {
            if !e.is_fatal() {
                self.npcs.remove(index);
            }
            return Err(e);
        }
        debug!(npc = %id, definition_id, %position, "Npc spawned");
        Ok(id)
    }

    /// Deactivate an npc and free its index
    pub fn despawn_npc(&mut self, id: EntityId) -> Result<(), WorldError> {
        if id.kind != EntityKind::Npc {
            return Err(WorldError::EntityNotFound(id));
        }
        let npc = self
            .npcs
            .get_mut(id.index)
            .ok_or(WorldError::EntityNotFound(id))?;
        npc.mob_mut()
            .core_mut()
            .set_state(EntityState::Inactive, &mut self.ctx)?;
        self.npcs.remove(id.index);
        Ok(())
    }

    fn activate(&mut self, id: EntityId, position: Position) -> Result<(), WorldError> {
        let mob = match id.kind {
            EntityKind::Player => self.players.get_mut(id.index).map(Actor::mob_mut),
            EntityKind::Npc => self.npcs.get_mut(id.index).map(Actor::mob_mut),
        }
        .ok_or(WorldError::EntityNotFound(id))?;
        mob.core_mut().set_position(position, &mut self.ctx)?;
        mob.core_mut().set_state(EntityState::Active, &mut self.ctx)?;
        Ok(())
    }

    /// Move a mob directly. A one tile move is shown as a walk step,
    /// anything else as a teleport.
    pub fn move_mob(&mut self, id: EntityId, position: Position) -> Result<(), WorldError> {
        let mob = match id.kind {
            EntityKind::Player => self.players.get_mut(id.index).map(Actor::mob_mut),
            EntityKind::Npc => self.npcs.get_mut(id.index).map(Actor::mob_mut),
        }
        .ok_or(WorldError::EntityNotFound(id))?;

        let step = mob.position().and_then(|from| {
            let (dx, dy) = (position.x() - from.x(), position.y() - from.y());
            let adjacent = from.plane() == position.plane() && dx.abs() <= 1 && dy.abs() <= 1;
            if adjacent {
                Direction::from_delta(dx, dy)
            } else {
                None
            }
        });

        match step {
            Some(direction) if mob.movement.primary.is_none() => {
                mob.core_mut().set_position(position, &mut self.ctx)?;
                mob.movement.primary = Some(direction);
                Ok(())
            }
            _ => mob.teleport(position, &mut self.ctx),
        }
    }

    pub fn teleport(&mut self, id: EntityId, position: Position) -> Result<(), WorldError> {
        let mob = match id.kind {
            EntityKind::Player => self.players.get_mut(id.index).map(Actor::mob_mut),
            EntityKind::Npc => self.npcs.get_mut(id.index).map(Actor::mob_mut),
        }
        .ok_or(WorldError::EntityNotFound(id))?;
        mob.teleport(position, &mut self.ctx)
    }

    /// Deal `amount` damage to `victim`; the attacker counts as in combat too
    pub fn hit(
        &mut self,
        attacker: Option<EntityId>,
        victim: EntityId,
        amount: u8,
    ) -> Result<Option<Hit>, WorldError> {
        let target = match victim.kind {
            EntityKind::Player => self.players.get_mut(victim.index).map(Actor::mob_mut),
            EntityKind::Npc => self.npcs.get_mut(victim.index).map(Actor::mob_mut),
        }
        .ok_or(WorldError::EntityNotFound(victim))?;
        let hit = target.damage(attacker, amount, &mut self.ctx);

        let tick = self.ctx.tick;
        if let Some(mob) = attacker.and_then(|id| self.mob_mut(id)) {
            mob.engage(tick);
        }
        Ok(hit)
    }

    /// Remove `player` at the end of this tick. Repeated calls are ignored.
    pub fn queue_logout(&mut self, player: EntityId) {
        if player.is_player() && !self.logouts.contains(&player) {
            self.logouts.push(player);
        }
    }

    /// Replace the mob's current action
    pub fn submit_action(&mut self, id: EntityId, action: Action) -> Result<(), WorldError> {
        self.mob_mut(id)
            .ok_or(WorldError::EntityNotFound(id))?
            .actions
            .submit(action);
        Ok(())
    }

    pub fn cancel_action(&mut self, id: EntityId) {
        if let Some(mob) = self.mob_mut(id) {
            mob.actions.cancel();
        }
    }

    pub fn post(&self, event: Event, actor: Option<EntityId>) {
        self.ctx.post(event, actor);
    }

    /// Public chat from `player`
    pub fn chat(
        &mut self,
        player: EntityId,
        color: u8,
        effects: u8,
        text: Vec<u8>,
    ) -> Result<(), WorldError> {
        let target = self
            .player_mut(player)
            .ok_or(WorldError::EntityNotFound(player))?;
        let rights = target.rights().as_u8();
        target.mob_mut().update.set_chat(ChatMessage {
            color,
            effects,
            rights,
            text: text.clone(),
        });
        self.ctx.post(Event::Chat { text }, Some(player));
        Ok(())
    }

    /// Line of text in `player`'s chat box
    pub fn send_message(
        &mut self,
        player: EntityId,
        text: impl Into<String>,
    ) -> Result<(), WorldError> {
        self.player_mut(player)
            .ok_or(WorldError::EntityNotFound(player))?
            .send(&SystemMessage::new(text));
        Ok(())
    }

    /// Replace `player`'s walking queue with a path through `waypoints`
    pub fn walk(
        &mut self,
        player: EntityId,
        waypoints: &[(i32, i32)],
        run: bool,
    ) -> Result<(), WorldError> {
        let target = self
            .player_mut(player)
            .ok_or(WorldError::EntityNotFound(player))?;
        let Some(from) = target.mob().position() else {
            return Ok(());
        };

        let path = waypoints
            .iter()
            .map(|&(x, y)| Position::new(x, y, from.plane()))
            .collect::<Result<Vec<_>, _>>()?;

        let mob = target.mob_mut();
        mob.actions.cancel_weak();
        mob.walking.set_path(from, &path, run);
        Ok(())
    }

    /// Advance the world by one tick.
    ///
    /// Only invariant violations come back as errors; everything else is
    /// logged and contained to the mob or session that caused it.
    pub fn process_tick(&mut self) -> Result<(), WorldError> {
        self.ctx.tick += 1;
        let tick = self.ctx.tick;

        self.admit_logins();
        self.process_sessions()?;
        self.process_actions()?;
        self.process_walking()?;
        self.process_regions();

        self.engine
            .run(&mut self.players, &self.npcs, self.ctx.regions(), tick);

        self.flush_sessions();

        self.players.clear_updates();
        self.npcs.clear_updates();
        for (_, player) in self.players.iter_mut() {
            player.region_changed = false;
        }

        self.process_logouts()?;
        self.autosave();
        Ok(())
    }

    fn admit_logins(&mut self) {
        let Some(logins) = self.logins.as_mut() else {
            return;
        };
        let mut pending = Vec::new();
        while pending.len() < LOGINS_PER_TICK {
            match logins.try_recv() {
                Ok(login) => pending.push(login),
                Err(_) => break,
            }
        }

        for PendingLogin {
            save,
            session,
            reply,
        } in pending
        {
            let username = save.username.clone();
            let outcome = self
                .register_player(save, Some(session))
                .map(|id| id.index)
                .map_err(|e| {
                    warn!(player = %username, error = %e, "Login rejected by world");
                    LoginResponse::from(&e)
                });

            // the connection went away while waiting
            if let Err(Ok(index)) = reply.send(outcome) {
                self.queue_logout(EntityId::player(index));
            }
        }
    }

    fn process_sessions(&mut self) -> Result<(), WorldError> {
        for index in self.players.indices() {
            let id = EntityId::player(index);
            let Some(session) = self.players.get_mut(index).and_then(Player::session_mut) else {
                continue;
            };

            if session.poll_disconnect() {
                debug!(player = %id, "Session disconnected");
                self.queue_logout(id);
                continue;
            }

            let dropped = session.handle().take_dropped();
            if dropped > 0 {
                debug!(player = %id, dropped, "Inbound messages dropped");
            }

            let mut messages = Vec::new();
            while let Some(message) = session.dequeue() {
                messages.push(message);
            }

            for message in messages {
                let handler = self.messages.handler(message.opcode);
                let decoded = match InboundMessage::decode(&message) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(player = %id, opcode = message.opcode, error = %e, "Malformed message");
                        if let Some(session) = self.players.get(index).and_then(Player::session) {
                            session.handle().signal_disconnect();
                        }
                        self.queue_logout(id);
                        break;
                    }
                };
                match handler(self, id, decoded) {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(player = %id, opcode = message.opcode, error = %e, "Message handler failed"),
                }
            }
        }
        Ok(())
    }

    fn process_actions(&mut self) -> Result<(), WorldError> {
        for index in self.players.active_indices() {
            action::process(self, EntityId::player(index))?;
        }
        for index in self.npcs.active_indices() {
            action::process(self, EntityId::npc(index))?;
        }
        Ok(())
    }

    fn process_walking(&mut self) -> Result<(), WorldError> {
        for (_, player) in self.players.iter_mut() {
            let running = player.is_running();
            advance(player.mob_mut(), running, &mut self.ctx)?;
        }
        for (_, npc) in self.npcs.iter_mut() {
            advance(npc.mob_mut(), false, &mut self.ctx)?;
        }
        Ok(())
    }

    /// Send a new map area to players that are about to leave theirs
    fn process_regions(&mut self) {
        for (_, player) in self.players.iter_mut() {
            let Some(position) = player.mob().position() else {
                continue;
            };
            if !player.mob().is_active() {
                continue;
            }
            let stale = player.map_base.map_or(true, |base| {
                let (x, y) = (position.local_x(&base), position.local_y(&base));
                !(MAP_AREA_MIN..MAP_AREA_MAX).contains(&x) || !(MAP_AREA_MIN..MAP_AREA_MAX).contains(&y)
            });
            if stale {
                player.map_base = Some(position);
                player.region_changed = true;
                player.send(&RegionMessage { position });
            }
        }
    }

    fn flush_sessions(&mut self) {
        for (_, player) in self.players.iter_mut() {
            if let Some(session) = player.session_mut() {
                session.flush();
            }
        }
    }

    fn process_logouts(&mut self) -> Result<(), WorldError> {
        for id in mem::take(&mut self.logouts) {
            let Some(player) = self.players.get_mut(id.index) else {
                continue;
            };

            self.ctx.post(Event::Logout(id), Some(id));
            if player.mob().is_active() {
                player
                    .mob_mut()
                    .core_mut()
                    .set_state(EntityState::Inactive, &mut self.ctx)?;
            }
            player.send(&LogoutMessage);
            if let Some(session) = player.session_mut() {
                session.flush();
            }

            let save = player.snapshot();
            let Some(player) = self.players.remove(id.index) else {
                continue;
            };
            if let Some(saves) = &self.saves {
                if let Err(e) = saves.submit(save) {
                    error!(player = %player.username(), error = %e, "Failed to queue save");
                }
            }
            if let Some(session) = player.session() {
                if let Some(registry) = &self.sessions {
                    registry.release_username(session.id(), player.username());
                }
                session.handle().signal_disconnect();
            }
            info!(player = %player.username(), index = id.index, "Player logged out");
        }
        Ok(())
    }

    fn autosave(&mut self) {
        let (Some(interval), Some(saves)) = (self.settings.autosave_interval, &self.saves) else {
            return;
        };
        self.ticks_since_autosave += 1;
        if self.ticks_since_autosave < interval {
            return;
        }
        self.ticks_since_autosave = 0;

        let mut saved = 0;
        for (_, player) in self.players.iter() {
            match saves.submit(player.snapshot()) {
                Ok(()) => saved += 1,
                Err(e) => error!(player = %player.username(), error = %e, "Failed to queue autosave"),
            }
        }
        if saved > 0 {
            info!(saved, "Autosave queued");
        }
    }

    /// Log every player out and save them
    pub fn shutdown(&mut self) -> Result<(), WorldError> {
        for index in self.players.indices() {
            self.queue_logout(EntityId::player(index));
        }
        self.process_logouts()
    }

    /// Run ticks until shutdown is signalled or an invariant breaks
    pub async fn run(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> Result<(), WorldError> {
        info!(
            world_id = self.settings.world_id,
            tick_rate_ms = self.settings.tick_rate_ms,
            autosave = ?self.settings.autosave_interval,
            "Starting game world"
        );
        let tick_rate = Duration::from_millis(self.settings.tick_rate_ms);
        let mut tick_interval = interval(tick_rate);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = tick_interval.tick() => {
                    let started = Instant::now();
                    if let Err(e) = self.process_tick() {
                        error!(tick = self.tick(), error = %e, "Invariant violated, stopping world");
                        break Err(e);
                    }

                    let elapsed = started.elapsed();
                    if elapsed > tick_rate {
                        warn!(tick = self.tick(), elapsed_ms = elapsed.as_millis() as u64, "Tick overran");
                    }
                    if self.tick() % 1000 == 0 {
                        debug!(tick = self.tick(), players = self.players.len(), npcs = self.npcs.len(), "Game tick milestone");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
            }
        };

        if outcome.is_ok() {
            info!(players = self.players.len(), "Saving players before shutdown");
            self.shutdown()?;
        }
        info!(total_ticks = self.tick(), "Game world stopped");
        outcome
    }
}

/// Walk one mob. Non-fatal failures stop its walk instead of the tick.
fn advance(mob: &mut Mob, running: bool, ctx: &mut WorldContext) -> Result<(), WorldError> {
    if let Err(e) = mob.advance(running, ctx) {
        if e.is_fatal() {
            return Err(e);
        }
        warn!(entity = %mob.id(), error = %e, "Walk interrupted");
        mob.walking.clear();
    }
    Ok(())
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("settings", &self.settings)
            .field("tick", &self.tick())
            .field("players", &self.players.len())
            .field("npcs", &self.npcs.len())
            .field("pending_logouts", &self.logouts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::events::{EventKind, Flow};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    fn pos(x: i32, y: i32) -> Position {
        Position::new(x, y, 0).unwrap()
    }

    fn save_at(name: &str, position: Position) -> PlayerSave {
        let mut save = PlayerSave::new(name, "hash");
        save.position = position;
        save
    }

    #[test]
    fn test_world_settings_default() {
        let settings = WorldSettings::default();
        assert_eq!(settings.world_id, 1);
        assert_eq!(settings.tick_rate_ms, TICK_RATE_MS);
        assert_eq!(settings.update.additions_per_tick, 15);
    }

    #[test]
    fn test_settings_from_config() {
        let config = ServerConfig::default();
        let settings = WorldSettings::from_config(&config);
        assert_eq!(settings.max_players, 2000);
        assert_eq!(settings.autosave_interval, Some(500));
    }

    #[test]
    fn test_register_player_places_and_activates() {
        let mut world = World::new(WorldSettings::default());
        let id = world
            .register_player(save_at("alice", pos(3222, 3218)), None)
            .unwrap();

        let mob = world.mob(id).unwrap();
        assert!(mob.is_active());
        assert!(mob.update.flags.contains(UpdateFlags::APPEARANCE));
        assert_eq!(world.regions().locate(id), Some(pos(3222, 3218).region_coordinates()));
    }

    #[test]
    fn test_logout_removes_and_evicts() {
        let mut world = World::new(WorldSettings::default());
        let id = world
            .register_player(save_at("alice", pos(3222, 3218)), None)
            .unwrap();
        world.queue_logout(id);
        world.queue_logout(id);
        world.process_tick().unwrap();

        assert!(world.player(id).is_none());
        assert_eq!(world.regions().locate(id), None);
        assert!(world.players().is_empty());
    }

    #[test]
    fn test_flags_cleared_after_tick() {
        let mut world = World::new(WorldSettings::default());
        let id = world
            .register_player(save_at("alice", pos(3222, 3218)), None)
            .unwrap();
        world.chat(id, 0, 0, vec![1, 2]).unwrap();
        world.process_tick().unwrap();
        assert!(world.mob(id).unwrap().update.flags.is_empty());
    }

    #[test]
    fn test_walk_moves_one_tile_per_tick() {
        let mut world = World::new(WorldSettings::default());
        let id = world
            .register_player(save_at("alice", pos(3200, 3200)), None)
            .unwrap();
        world.walk(id, &[(3203, 3200)], false).unwrap();

        world.process_tick().unwrap();
        assert_eq!(world.mob(id).unwrap().position(), Some(pos(3201, 3200)));
        world.process_tick().unwrap();
        world.process_tick().unwrap();
        assert_eq!(world.mob(id).unwrap().position(), Some(pos(3203, 3200)));
        world.process_tick().unwrap();
        assert_eq!(world.mob(id).unwrap().position(), Some(pos(3203, 3200)));
    }

    #[test]
    fn test_running_takes_two_steps() {
        let mut world = World::new(WorldSettings::default());
        let id = world
            .register_player(save_at("alice", pos(3200, 3200)), None)
            .unwrap();
        world.walk(id, &[(3200, 3205)], true).unwrap();
        world.process_tick().unwrap();
        assert_eq!(world.mob(id).unwrap().position(), Some(pos(3200, 3202)));
    }

    #[test]
    fn test_move_across_region_posts_one_event() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        {
            let log = log.clone();
            registry.register(EventKind::PositionChanged, move |event, _| {
                log.lock().push(event.clone());
                Flow::Continue
            });
        }
        let mut world = World::new(WorldSettings::default()).with_events(Arc::new(registry));
        let id = world.spawn_npc(1, pos(3263, 3200)).unwrap();
        log.lock().clear();

        world.move_mob(id, pos(3264, 3200)).unwrap();
        assert_eq!(world.regions().locate(id), Some(pos(3264, 3200).region_coordinates()));
        assert!(!world
            .regions()
            .region(pos(3263, 3200).region_coordinates())
            .unwrap()
            .contains(id));
        assert_eq!(
            log.lock().as_slice(),
            &[Event::PositionChanged {
                entity: id,
                from: Some(pos(3263, 3200)),
                to: pos(3264, 3200),
            }]
        );
        assert_eq!(world.mob(id).unwrap().movement.primary, Some(Direction::East));
    }

    #[test]
    fn test_despawn_npc_frees_index() {
        let mut world = World::new(WorldSettings::default());
        let id = world.spawn_npc(1, pos(3200, 3200)).unwrap();
        world.despawn_npc(id).unwrap();
        assert!(world.npc(id).is_none());
        assert_eq!(world.regions().locate(id), None);
        assert_eq!(world.spawn_npc(1, pos(3200, 3200)).unwrap(), id);
    }

    #[test]
    fn test_hit_puts_both_sides_in_combat() {
        let mut world = World::new(WorldSettings::default());
        let player = world
            .register_player(save_at("fighter", pos(3200, 3200)), None)
            .unwrap();
        let npc = world.spawn_npc(1, pos(3201, 3200)).unwrap();
        world.process_tick().unwrap();

        let hit = world.hit(Some(player), npc, 0).unwrap().unwrap();
        assert_eq!(hit.damage, 0);
        let tick = world.tick();
        assert!(world.mob(npc).unwrap().in_combat(tick));
        assert!(world.mob(player).unwrap().in_combat(tick));
        assert!(world.mob(npc).unwrap().update.flags.contains(UpdateFlags::PRIMARY_HIT));

        assert_eq!(
            world.hit(None, EntityId::npc(99), 1),
            Err(WorldError::EntityNotFound(EntityId::npc(99)))
        );
    }

    #[test]
    fn test_npc_indices_stop_below_list_end() {
        let settings = WorldSettings {
            max_npcs: u16::MAX,
            ..Default::default()
        };
        let mut world = World::new(settings);
        let observer = world
            .register_player(save_at("observer", pos(3200, 3200)), None)
            .unwrap();
        for _ in 1..MAX_NPCS {
            world.spawn_npc(1, pos(2000, 2000)).unwrap();
        }
        let last = world.spawn_npc(1, pos(3201, 3200)).unwrap();
        assert_eq!(last.index, MAX_NPCS);
        assert_eq!(
            world.spawn_npc(1, pos(3201, 3200)),
            Err(WorldError::WorldFull)
        );

        world.process_tick().unwrap();
        assert!(world.player(observer).unwrap().local_npcs().contains(last));
    }

    #[test]
    fn test_full_world_rejects() {
        let settings = WorldSettings {
            max_players: 1,
            ..Default::default()
        };
        let mut world = World::new(settings);
        world
            .register_player(save_at("alice", pos(3200, 3200)), None)
            .unwrap();
        assert_eq!(
            world.register_player(save_at("bob", pos(3200, 3200)), None),
            Err(WorldError::WorldFull)
        );
    }
}
