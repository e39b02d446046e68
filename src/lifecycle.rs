//! Participant lifecycle.
//!
//! [`PowerManager`] tracks the `down -> going_up -> up -> going_down -> down`
//! state machine of a producer or consumer. [`Steps`] runs the ordered
//! setup and teardown phases around it.

use std::fmt;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{BrokerError, LifecycleError};

/// Lifecycle state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerState {
    Down,
    GoingUp,
    Up,
    GoingDown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Down => "down",
            PowerState::GoingUp => "going_up",
            PowerState::Up => "up",
            PowerState::GoingDown => "going_down",
        };
        f.write_str(name)
    }
}

/// Guards lifecycle transitions and lets tasks wait on them.
#[derive(Debug)]
pub struct PowerManager {
    state: watch::Sender<PowerState>,
}

impl Default for PowerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerManager {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PowerState::Down);
        Self { state }
    }

    pub fn state(&self) -> PowerState {
        *self.state.borrow()
    }

    fn transition(&self, allowed: &[PowerState], to: PowerState) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if allowed.contains(current) {
                *current = to;
                true
            } else {
                result = Err(LifecycleError::InvalidTransition { from: *current, to });
                false
            }
        });
        result
    }

    /// `down -> going_up`
    pub fn going_up(&self) -> Result<(), LifecycleError> {
        self.transition(&[PowerState::Down], PowerState::GoingUp)
    }

    /// `going_up -> up`
    pub fn up(&self) -> Result<(), LifecycleError> {
        self.transition(&[PowerState::GoingUp], PowerState::Up)
    }

    /// `up -> going_down`, or `going_up -> going_down` when startup fails.
    pub fn going_down(&self) -> Result<(), LifecycleError> {
        self.transition(
            &[PowerState::Up, PowerState::GoingUp],
            PowerState::GoingDown,
        )
    }

    /// `going_down -> down`
    pub fn down(&self) -> Result<(), LifecycleError> {
        self.transition(&[PowerState::GoingDown], PowerState::Down)
    }

    pub fn is_up(&self) -> bool {
        self.state() == PowerState::Up
    }

    pub fn is_going_up(&self) -> bool {
        self.state() == PowerState::GoingUp
    }

    pub fn is_going_down(&self) -> bool {
        self.state() == PowerState::GoingDown
    }

    pub fn is_down(&self) -> bool {
        self.state() == PowerState::Down
    }

    pub fn subscribe(&self) -> watch::Receiver<PowerState> {
        self.state.subscribe()
    }

    /// Waits until the state is no longer `going_up` and returns it.
    pub async fn settled(&self) -> PowerState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|s| *s != PowerState::GoingUp).await {
            Ok(state) => *state,
            // The sender lives in self, so this only happens while dropping.
            Err(_) => self.state(),
        };
        settled
    }
}

type StepFn<T> =
    Box<dyn for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<(), BrokerError>> + Send>;

/// Ordered list of named async steps run against a shared context.
pub struct Steps<T> {
    phase: &'static str,
    steps: Vec<(&'static str, StepFn<T>)>,
}

impl<T: Send> Steps<T> {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            steps: Vec::new(),
        }
    }

    /// Appends a step. The closure returns a boxed future borrowing the context.
    pub fn step<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut T) -> BoxFuture<'a, Result<(), BrokerError>> + Send + 'static,
    {
        self.steps.push((name, Box::new(f)));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs steps in order and stops at the first failure.
    pub async fn run(self, ctx: &mut T) -> Result<(), BrokerError> {
        for (name, step) in self.steps {
            debug!(phase = self.phase, step = name, "Running step");
            if let Err(e) = step(ctx).await {
                warn!(phase = self.phase, step = name, error = %e, "Step failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs every step regardless of failures and returns the errors seen.
    pub async fn run_all(self, ctx: &mut T) -> Vec<(&'static str, BrokerError)> {
        let mut failures = Vec::new();
        for (name, step) in self.steps {
            debug!(phase = self.phase, step = name, "Running step");
            if let Err(e) = step(ctx).await {
                warn!(phase = self.phase, step = name, error = %e, "Step failed, continuing");
                failures.push((name, e));
            }
        }
        failures
    }
}
