//! Integration tests for the world tick
//!
//! These tests drive a `World` through whole ticks and check:
//! - Viewport growth under the per-tick addition budget
//! - Region bookkeeping when mobs cross region boundaries
//! - Session message handling, disconnects and logout saves

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, oneshot};

use realm_server::crypto::Isaac;
use realm_server::error::{LoginResponse, PersistenceError};
use realm_server::game::events::{Event, EventKind, Flow, HandlerRegistry};
use realm_server::game::mob::Actor;
use realm_server::game::persistence::{LoadOutcome, PlayerSave, PlayerStore, SaveWorker};
use realm_server::game::update::EngineSettings;
use realm_server::game::world::{PendingLogin, World, WorldSettings};
use realm_server::game::{EntityId, Position};
use realm_server::net::codec::{FrameDecoder, FrameEncoder, GameMessage};
use realm_server::net::session::{GameSession, SessionHandle, SessionRegistry};
use realm_server::protocol::outbound::{outgoing_size, SYSTEM_MESSAGE_OPCODE};

fn pos(x: i32, y: i32) -> Position {
    Position::new(x, y, 0).unwrap()
}

fn save_at(name: &str, position: Position) -> PlayerSave {
    let mut save = PlayerSave::new(name, "hash");
    save.position = position;
    save
}

/// A session whose writer side is the returned receiver
fn session(id: u64) -> (GameSession, Arc<SessionHandle>, mpsc::Receiver<bytes::Bytes>) {
    let (handle, inbound) = SessionHandle::new(id, "127.0.0.1:40000".parse().unwrap(), 15);
    let (outbound, written) = mpsc::channel(64);
    let session = GameSession::new(
        handle.clone(),
        inbound,
        FrameEncoder::new(Isaac::new(&[0, 0, 0, 0])),
        outbound,
    );
    (session, handle, written)
}

#[derive(Default)]
struct MemoryStore {
    saved: Mutex<Vec<PlayerSave>>,
}

impl PlayerStore for MemoryStore {
    fn save(&self, save: &PlayerSave) -> Result<(), PersistenceError> {
        self.saved.lock().push(save.clone());
        Ok(())
    }

    fn load(&self, _username: &str, _password: &str) -> LoadOutcome {
        LoadOutcome::NotFound
    }
}

/// Test that a crowd is revealed at most `additions_per_tick` at a time
#[test]
fn test_visible_mob_budget() {
    let mut world = World::new(WorldSettings::default());
    let observer = world
        .register_player(save_at("observer", pos(3200, 3200)), None)
        .unwrap();
    for i in 0..50 {
        let position = pos(3190 + i % 10, 3195 + i / 10);
        world
            .register_player(save_at(&format!("crowd{i}"), position), None)
            .unwrap();
    }

    let locals = |world: &World| {
        let player = world.player(observer).unwrap();
        (
            player.local_players().len(),
            player.local_players().deferred().len(),
        )
    };

    world.process_tick().unwrap();
    assert_eq!(locals(&world), (15, 35));
    world.process_tick().unwrap();
    assert_eq!(locals(&world), (30, 20));
    world.process_tick().unwrap();
    assert_eq!(locals(&world), (45, 5));
    world.process_tick().unwrap();
    assert_eq!(locals(&world), (50, 0));
}

/// Test that the first additions are the closest candidates
#[test]
fn test_closest_candidates_are_added_first() {
    let mut world = World::new(WorldSettings::default());
    let origin = pos(3200, 3200);
    let observer = world.register_player(save_at("observer", origin), None).unwrap();
    for i in 0..30 {
        world
            .register_player(save_at(&format!("line{i}"), pos(3186 + i, 3205)), None)
            .unwrap();
    }

    world.process_tick().unwrap();
    let viewport = world.player(observer).unwrap().local_players();
    let distance = |id: &EntityId| {
        world
            .mob(*id)
            .and_then(|mob| mob.position())
            .map(|p| p.distance(&origin))
            .unwrap()
    };

    let farthest_local = viewport.ids().iter().map(distance).max().unwrap();
    let nearest_deferred = viewport.deferred().iter().map(distance).min().unwrap();
    assert!(farthest_local <= nearest_deferred);
}

/// Test that a configured budget is honoured
#[test]
fn test_custom_engine_settings() {
    let settings = WorldSettings::default().with_update(EngineSettings {
        additions_per_tick: 2,
        max_local_mobs: 3,
    });
    let mut world = World::new(settings);
    let observer = world
        .register_player(save_at("observer", pos(3200, 3200)), None)
        .unwrap();
    for i in 0..5 {
        world.spawn_npc(1, pos(3201 + i, 3200)).unwrap();
    }

    world.process_tick().unwrap();
    assert_eq!(world.player(observer).unwrap().local_npcs().len(), 2);
    world.process_tick().unwrap();
    assert_eq!(world.player(observer).unwrap().local_npcs().len(), 3);
    world.process_tick().unwrap();
    assert_eq!(world.player(observer).unwrap().local_npcs().len(), 3);
}

/// Test that mobs leaving view are dropped from the viewport
#[test]
fn test_teleported_mob_leaves_viewport() {
    let mut world = World::new(WorldSettings::default());
    let observer = world
        .register_player(save_at("observer", pos(3200, 3200)), None)
        .unwrap();
    let npc = world.spawn_npc(1, pos(3205, 3200)).unwrap();

    world.process_tick().unwrap();
    assert!(world.player(observer).unwrap().local_npcs().contains(npc));

    world.teleport(npc, pos(3300, 3300)).unwrap();
    world.process_tick().unwrap();
    assert!(!world.player(observer).unwrap().local_npcs().contains(npc));
}

/// Test that crossing a region boundary moves membership and posts one event
#[test]
fn test_region_boundary_crossing() {
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
    let player = world
        .register_player(save_at("walker", pos(3262, 3200)), None)
        .unwrap();
    log.lock().clear();

    world.walk(player, &[(3265, 3200)], false).unwrap();
    for _ in 0..3 {
        world.process_tick().unwrap();
    }

    let west = pos(3263, 3200).region_coordinates();
    let east = pos(3264, 3200).region_coordinates();
    assert_eq!(world.regions().locate(player), Some(east));
    assert!(!world.regions().region(west).unwrap().contains(player));
    assert_eq!(log.lock().len(), 3);
    assert_eq!(
        log.lock()[1],
        Event::PositionChanged {
            entity: player,
            from: Some(pos(3263, 3200)),
            to: pos(3264, 3200),
        }
    );
}

/// Test that login and logout events reach the dispatcher
#[test]
fn test_login_logout_events() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    for kind in [EventKind::Login, EventKind::Logout] {
        let log = log.clone();
        registry.register(kind, move |event, _| {
            log.lock().push(event.clone());
            Flow::Continue
        });
    }

    let mut world = World::new(WorldSettings::default()).with_events(Arc::new(registry));
    let id = world
        .register_player(save_at("alice", pos(3200, 3200)), None)
        .unwrap();
    world.queue_logout(id);
    world.process_tick().unwrap();

    assert_eq!(log.lock().as_slice(), &[Event::Login(id), Event::Logout(id)]);
}

/// Test that the logout button logs the player out and the save is written
#[tokio::test]
async fn test_logout_button_saves_player() {
    let store = Arc::new(MemoryStore::default());
    let (saves, worker) = SaveWorker::spawn(store.clone());
    let registry = Arc::new(SessionRegistry::new(10));

    let mut world = World::new(WorldSettings::default())
        .with_saves(saves)
        .with_sessions(registry.clone());
    let (session, handle, mut written) = session(1);
    assert!(registry.claim_username(1, "alice"));
    let id = world
        .register_player(save_at("alice", pos(3200, 3200)), Some(session))
        .unwrap();

    world.process_tick().unwrap();
    assert!(written.try_recv().is_ok());

    assert!(handle.offer(GameMessage::new(185, vec![0x09, 0x9a])));
    world.process_tick().unwrap();

    assert!(world.player(id).is_none());
    assert!(handle.is_disconnected());
    assert!(!registry.is_logged_in("alice"));
    assert!(written.try_recv().is_ok());

    drop(world);
    worker.await.unwrap();
    let saved = store.saved.lock();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].username, "alice");
    assert_eq!(saved[0].position, pos(3200, 3200));
}

/// Test that a dropped connection is noticed on the next tick
#[tokio::test]
async fn test_disconnect_logs_out() {
    let mut world = World::new(WorldSettings::default());
    let (session, handle, _written) = session(2);
    let id = world
        .register_player(save_at("bob", pos(3200, 3200)), Some(session))
        .unwrap();

    handle.signal_disconnect();
    world.process_tick().unwrap();
    assert!(world.player(id).is_none());
}

/// Test that inbound walk messages move the player
#[tokio::test]
async fn test_walk_message_moves_player() {
    let mut world = World::new(WorldSettings::default());
    let (session, handle, _written) = session(3);
    let id = world
        .register_player(save_at("carol", pos(3200, 3200)), Some(session))
        .unwrap();

    // first x (little endian, add), no offsets, first y (little endian), run (negated)
    let x: u16 = 3202;
    let y: u16 = 3200;
    let payload = vec![
        (x as u8).wrapping_add(128),
        (x >> 8) as u8,
        y as u8,
        (y >> 8) as u8,
        0u8.wrapping_neg(),
    ];
    assert!(handle.offer(GameMessage::new(164, payload)));

    world.process_tick().unwrap();
    assert_eq!(world.mob(id).unwrap().position(), Some(pos(3201, 3200)));
    world.process_tick().unwrap();
    assert_eq!(world.mob(id).unwrap().position(), Some(pos(3202, 3200)));
}

/// Test that the position command answers with a chat box message
#[tokio::test]
async fn test_position_command_replies() {
    let mut world = World::new(WorldSettings::default());
    let (session, handle, mut written) = session(5);
    world
        .register_player(save_at("erin", pos(3222, 3218)), Some(session))
        .unwrap();

    assert!(handle.offer(GameMessage::new(103, b"pos\n".to_vec())));
    world.process_tick().unwrap();

    let mut decoder = FrameDecoder::new(Isaac::new(&[0, 0, 0, 0]), outgoing_size);
    let mut batch = bytes::BytesMut::from(&written.try_recv().unwrap()[..]);
    let mut opcodes = Vec::new();
    while let Some(message) = decoder.decode(&mut batch).unwrap() {
        opcodes.push(message.opcode);
    }
    assert_eq!(opcodes.first(), Some(&SYSTEM_MESSAGE_OPCODE));
}

/// Test that a malformed message closes the session
#[tokio::test]
async fn test_malformed_message_disconnects() {
    let mut world = World::new(WorldSettings::default());
    let (session, handle, _written) = session(4);
    let id = world
        .register_player(save_at("dave", pos(3200, 3200)), Some(session))
        .unwrap();

    // a chat message needs at least two bytes
    assert!(handle.offer(GameMessage::new(4, vec![1])));
    world.process_tick().unwrap();

    assert!(handle.is_disconnected());
    assert!(world.player(id).is_none());
}

/// Test that pending logins are admitted and answered
#[tokio::test]
async fn test_pending_login_admitted() {
    let (logins, receiver) = mpsc::channel(4);
    let mut world = World::new(WorldSettings {
        max_players: 1,
        ..Default::default()
    })
    .with_logins(receiver);

    let mut replies = Vec::new();
    for (i, name) in ["erin", "frank"].into_iter().enumerate() {
        let (session, _handle, _written) = session(10 + i as u64);
        let (reply, answer) = oneshot::channel();
        logins
            .send(PendingLogin {
                save: save_at(name, pos(3200, 3200)),
                session,
                reply,
            })
            .await
            .unwrap();
        replies.push(answer);
    }

    world.process_tick().unwrap();
    let mut answers = Vec::new();
    for answer in replies {
        answers.push(answer.await.unwrap());
    }
    assert_eq!(answers, vec![Ok(1), Err(LoginResponse::WorldFull)]);
    assert_eq!(world.players().len(), 1);
    assert!(world.mob(EntityId::player(1)).unwrap().is_active());
    assert_eq!(world.player(EntityId::player(1)).unwrap().mob().id(), EntityId::player(1));
}
