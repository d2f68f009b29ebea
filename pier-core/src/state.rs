// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Process state machine with typed state transitions.
//!
//! Implements the lifecycle of one OS process backing a pier:
//! Stopped → Booting → Running → Stopping → Stopped, with Crashed reachable
//! from Booting or Running on an exit nobody asked for.
//! Invalid transitions result in StateTransitionError.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::PierId;

/// Lifecycle states of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    /// No process, or the process exited after a requested stop.
    Stopped,

    /// Spawned, waiting for the readiness signal.
    Booting,

    /// Ready and accepting connections.
    Running,

    /// A stop was requested; waiting for the process to exit.
    Stopping,

    /// Exited without being asked to.
    Crashed,
}

impl ProcessState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Booting => "Booting",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Crashed => "Crashed",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: ProcessState) -> bool {
        matches!(
            (self, target),
            (Self::Stopped, Self::Booting) |
            // From Booting
            (Self::Booting, Self::Running) |
            (Self::Booting, Self::Stopping) |
            (Self::Booting, Self::Crashed) |
            // From Running
            (Self::Running, Self::Stopping) |
            (Self::Running, Self::Crashed) |
            // From Stopping
            (Self::Stopping, Self::Stopped)
        )
    }

    /// Whether an exit observed in this state is unexpected.
    pub fn exit_is_crash(&self) -> bool {
        matches!(self, Self::Booting | Self::Running)
    }

    /// Whether the process may still be alive in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Booting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one process.
/// Enforces valid state transitions and tracks timing metrics.
#[derive(Debug)]
pub struct ProcessStateMachine {
    pier_id: PierId,
    current_state: ProcessState,
    last_transition: Instant,
    transition_count: u64,
}

impl ProcessStateMachine {
    /// Create a new state machine in `Stopped`.
    pub fn new(pier_id: PierId) -> Self {
        Self {
            pier_id,
            current_state: ProcessState::Stopped,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> ProcessState {
        self.current_state
    }

    /// Get the pier ID.
    pub fn pier_id(&self) -> &PierId {
        &self.pier_id
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> Duration {
        self.last_transition.elapsed()
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: ProcessState) -> Result<(), StateTransitionError> {
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                pier_id: self.pier_id.clone(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            pier_id = %self.pier_id,
            from = self.current_state.name(),
            to = target.name(),
            "Process state transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }
}
