//! Action scheduler
//!
//! Every mob owns one `ActionSlot`. Submitting replaces whatever was there;
//! cancelling clears it. Each tick the world takes the action out of the
//! slot, runs at most one step and puts it back unless it finished or the
//! slot changed in the meantime.

use std::fmt;

use tracing::{trace, warn};

use crate::error::WorldError;
use crate::game::entity::EntityId;
use crate::game::position::Position;
use crate::game::world::World;

/// What a step wants to happen next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Stop,
}

/// Whether player movement interrupts the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionPriority {
    /// Cancelled when the owner starts walking
    Weak,
    #[default]
    Strong,
}

/// One unit of work run on behalf of a mob
pub trait ActionStep: Send {
    fn execute(&mut self, world: &mut World, actor: EntityId) -> Result<StepOutcome, WorldError>;
}

impl<F> ActionStep for F
where
    F: FnMut(&mut World, EntityId) -> Result<StepOutcome, WorldError> + Send,
{
    fn execute(&mut self, world: &mut World, actor: EntityId) -> Result<StepOutcome, WorldError> {
        self(world, actor)
    }
}

/// Pin a closure to the step signature so its argument and error types
/// are inferred
pub fn from_fn<F>(f: F) -> F
where
    F: FnMut(&mut World, EntityId) -> Result<StepOutcome, WorldError> + Send,
{
    f
}

/// Run only while the owner stands within `radius` of `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProximityGate {
    pub target: Position,
    pub radius: i32,
    /// Cancel after the first execution that passes the gate
    pub interrupt_after: bool,
}

impl ProximityGate {
    fn admits(&self, position: Option<Position>) -> bool {
        position.is_some_and(|p| p.is_within_radius(&self.target, self.radius))
    }
}

pub struct Action {
    step: Box<dyn ActionStep>,
    gate: Option<ProximityGate>,
    repeat: bool,
    priority: ActionPriority,
    period: u32,
    countdown: u32,
}

impl Action {
    /// Run once on the next tick
    pub fn once(step: impl ActionStep + 'static) -> Self {
        Self::build(step, None, false, 1)
    }

    /// Run every `period` ticks until cancelled or the step stops
    pub fn repeating(period: u32, step: impl ActionStep + 'static) -> Self {
        Self::build(step, None, true, period.max(1))
    }

    /// Run once the owner is within `radius` of `target`.
    ///
    /// The gate is rechecked every tick for as long as the action stays in
    /// its slot; there is no timeout.
    pub fn within(
        target: Position,
        radius: i32,
        interrupt_after: bool,
        step: impl ActionStep + 'static,
    ) -> Self {
        let gate = ProximityGate {
            target,
            radius,
            interrupt_after,
        };
        Self::build(step, Some(gate), !interrupt_after, 1)
    }

    fn build(
        step: impl ActionStep + 'static,
        gate: Option<ProximityGate>,
        repeat: bool,
        period: u32,
    ) -> Self {
        Self {
            step: Box::new(step),
            gate,
            repeat,
            priority: ActionPriority::Strong,
            period,
            countdown: 0,
        }
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Skip the first `ticks` ticks
    pub fn with_initial_delay(mut self, ticks: u32) -> Self {
        self.countdown = ticks;
        self
    }

    pub fn priority(&self) -> ActionPriority {
        self.priority
    }

    pub fn gate(&self) -> Option<&ProximityGate> {
        self.gate.as_ref()
    }

    pub fn is_repeating(&self) -> bool {
        self.repeat
    }

    /// Advance one tick. Returns whether the action stays scheduled.
    fn run(
        &mut self,
        world: &mut World,
        actor: EntityId,
        position: Option<Position>,
    ) -> Result<bool, WorldError> {
        if self.countdown > 0 {
            self.countdown -= 1;
            return Ok(true);
        }
        if let Some(gate) = &self.gate {
            if !gate.admits(position) {
                return Ok(true);
            }
        }

        if self.step.execute(world, actor)? == StepOutcome::Stop {
            return Ok(false);
        }
        let keep = match &self.gate {
            Some(gate) => !gate.interrupt_after,
            None => self.repeat,
        };
        self.countdown = self.period - 1;
        Ok(keep)
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("gate", &self.gate)
            .field("repeat", &self.repeat)
            .field("priority", &self.priority)
            .field("period", &self.period)
            .field("countdown", &self.countdown)
            .finish_non_exhaustive()
    }
}

/// Holds at most one action for a mob
#[derive(Debug, Default)]
pub struct ActionSlot {
    current: Option<Action>,
    generation: u64,
}

impl ActionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `action`, discarding any current one
    pub fn submit(&mut self, action: Action) {
        if self.current.is_some() {
            trace!("Replacing scheduled action");
        }
        self.current = Some(action);
        self.generation += 1;
    }

    /// Clear the slot. Safe to call on an empty slot.
    pub fn cancel(&mut self) {
        self.current = None;
        self.generation += 1;
    }

    /// Cancel only if the current action is weak
    pub fn cancel_weak(&mut self) {
        if self
            .current
            .as_ref()
            .is_some_and(|a| a.priority == ActionPriority::Weak)
        {
            self.cancel();
        }
    }

    pub fn has_action(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Action> {
        self.current.as_ref()
    }

    fn take(&mut self) -> Option<(Action, u64)> {
        self.current.take().map(|action| (action, self.generation))
    }

    /// Put an action back unless the slot was touched while it ran
    fn restore(&mut self, action: Action, generation: u64) -> bool {
        if self.generation == generation && self.current.is_none() {
            self.current = Some(action);
            true
        } else {
            false
        }
    }
}

/// Run one tick of `actor`'s action.
///
/// Non-fatal step errors cancel the action; fatal ones propagate.
pub(crate) fn process(world: &mut World, actor: EntityId) -> Result<(), WorldError> {
    let Some(mob) = world.mob_mut(actor) else {
        return Ok(());
    };
    let Some((mut action, generation)) = mob.actions.take() else {
        return Ok(());
    };
    let position = mob.position();

    let keep = match action.run(world, actor, position) {
        Ok(keep) => keep,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            warn!(entity = %actor, error = %e, "Action failed, cancelling");
            false
        }
    };

    if keep {
        if let Some(mob) = world.mob_mut(actor) {
            mob.actions.restore(action, generation);
        }
    }
    Ok(())
}
