//! Event dispatch boundary
//!
//! The simulation posts lifecycle, position, combat and chat events here and
//! never looks at the outcome. Gameplay handlers are registered up front in a
//! `HandlerRegistry`, grouped into one pipeline per event kind.

use std::collections::HashMap;

use tracing::trace;

use crate::game::entity::EntityId;
use crate::game::position::Position;

/// Something that happened in the world this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// An entity moved. `from` is `None` on first placement.
    PositionChanged {
        entity: EntityId,
        from: Option<Position>,
        to: Position,
    },
    /// An entity entered the ACTIVE state
    Activated(EntityId),
    /// An entity entered the INACTIVE state and left the region index
    Deactivated(EntityId),
    /// A player finished logging in
    Login(EntityId),
    /// A player is being removed from the world
    Logout(EntityId),
    /// A mob was hit
    Combat {
        attacker: Option<EntityId>,
        victim: EntityId,
        damage: u8,
    },
    /// A player typed a `::command`
    Command { name: String, args: Vec<String> },
    /// A player sent a public chat message
    Chat { text: Vec<u8> },
}

/// Discriminant used to look up a handler pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PositionChanged,
    Activated,
    Deactivated,
    Login,
    Logout,
    Combat,
    Command,
    Chat,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::PositionChanged { .. } => EventKind::PositionChanged,
            Event::Activated(_) => EventKind::Activated,
            Event::Deactivated(_) => EventKind::Deactivated,
            Event::Login(_) => EventKind::Login,
            Event::Logout(_) => EventKind::Logout,
            Event::Combat { .. } => EventKind::Combat,
            Event::Command { .. } => EventKind::Command,
            Event::Chat { .. } => EventKind::Chat,
        }
    }
}

/// Whether the rest of a pipeline should see the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Terminate,
}

/// Fire-and-forget sink for world events
pub trait EventDispatcher: Send + Sync {
    /// Post an event, optionally on behalf of a player
    fn post(&self, event: Event, actor: Option<EntityId>);
}

/// A registered gameplay handler
pub type Handler = Box<dyn Fn(&Event, Option<EntityId>) -> Flow + Send + Sync>;

/// Statically registered handler table
#[derive(Default)]
pub struct HandlerRegistry {
    pipelines: HashMap<EventKind, Vec<Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the pipeline for `kind`
    pub fn register<F>(&mut self, kind: EventKind, handler: F) -> &mut Self
    where
        F: Fn(&Event, Option<EntityId>) -> Flow + Send + Sync + 'static,
    {
        self.pipelines
            .entry(kind)
            .or_default()
            .push(Box::new(handler));
        self
    }

    /// Number of handlers registered for `kind`
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.pipelines.get(&kind).map_or(0, Vec::len)
    }
}

impl EventDispatcher for HandlerRegistry {
    fn post(&self, event: Event, actor: Option<EntityId>) {
        let Some(pipeline) = self.pipelines.get(&event.kind()) else {
            return;
        };

        for handler in pipeline {
            if handler(&event, actor) == Flow::Terminate {
                trace!(kind = ?event.kind(), "Event pipeline terminated early");
                break;
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (kind, pipeline) in &self.pipelines {
            map.entry(kind, &pipeline.len());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::EntityKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_post_without_handlers_is_noop() {
        let registry = HandlerRegistry::new();
        registry.post(Event::Login(EntityId::new(EntityKind::Player, 1)), None);
        assert_eq!(registry.handler_count(EventKind::Login), 0);
    }

    #[test]
    fn test_pipeline_runs_in_order_and_terminates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();

        let c = calls.clone();
        registry.register(EventKind::Command, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
            Flow::Terminate
        });
        let c = calls.clone();
        registry.register(EventKind::Command, move |_, _| {
            c.fetch_add(100, Ordering::SeqCst);
            Flow::Continue
        });

        registry.post(
            Event::Command {
                name: "tele".into(),
                args: vec![],
            },
            None,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handlers_only_see_their_kind() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let c = calls.clone();
        registry.register(EventKind::Logout, move |event, actor| {
            assert!(matches!(event, Event::Logout(_)));
            assert!(actor.is_some());
            c.fetch_add(1, Ordering::SeqCst);
            Flow::Continue
        });

        let id = EntityId::new(EntityKind::Player, 4);
        registry.post(Event::Login(id), Some(id));
        registry.post(Event::Logout(id), Some(id));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
