//! State machine traits.

use crate::{Action, Event};
use std::time::Duration;

/// A deterministic, synchronous state machine.
///
/// Implementations perform no I/O. Given the same state and the same event
/// they return the same actions.
pub trait StateMachine {
    /// Process one event and return the actions the runner must perform.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the state machine's notion of time. Called before `handle`.
    fn set_time(&mut self, now: Duration);

    fn now(&self) -> Duration;
}
