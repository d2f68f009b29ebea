// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Per-pier boot/run guard.
//!
//! A pier is described by two flags, `booted` and `running`, and the pair
//! decides which registry operations are legal:
//!
//! | state                   | start            | stop       | clear data    | delete        |
//! |-------------------------|------------------|------------|---------------|---------------|
//! | not booted, not running | boots, then runs | NotRunning | ok            | ok            |
//! | booted, not running     | runs             | NotRunning | ok            | ok            |
//! | booted, running         | AlreadyRunning   | ok         | MustStopFirst | MustStopFirst |
//!
//! `running` without `booted` is unrepresentable: the setters keep it that way.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{PierError, PierResult};
use crate::types::PierId;

/// Operations gated by the boot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PierOperation {
    Start,
    Stop,
    ClearAppData,
    Delete,
}

impl PierOperation {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ClearAppData => "clear-data",
            Self::Delete => "delete",
        }
    }
}

/// Display status derived from the two flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PierStatus {
    Unbooted,
    Stopped,
    Running,
}

impl PierStatus {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unbooted => "Unbooted",
            Self::Stopped => "Stopped",
            Self::Running => "Running",
        }
    }
}

impl std::fmt::Display for PierStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Boot/run flags of one pier plus the guard over them.
#[derive(Debug, Clone)]
pub struct BootStateMachine {
    pier_id: PierId,
    booted: bool,
    running: bool,
    last_transition: Instant,
}

impl BootStateMachine {
    /// Restore a machine from persisted state. A pier is never running when
    /// it is restored.
    pub fn new(pier_id: PierId, booted: bool) -> Self {
        Self {
            pier_id,
            booted,
            running: false,
            last_transition: Instant::now(),
        }
    }

    pub fn booted(&self) -> bool {
        self.booted
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn status(&self) -> PierStatus {
        match (self.booted, self.running) {
            (_, true) => PierStatus::Running,
            (true, false) => PierStatus::Stopped,
            (false, false) => PierStatus::Unbooted,
        }
    }

    /// Check whether `op` is legal in the current state.
    pub fn check(&self, op: PierOperation) -> PierResult<()> {
        let id = || self.pier_id.clone();
        match (op, self.running) {
            (PierOperation::Start, true) => Err(PierError::AlreadyRunning(id())),
            (PierOperation::Stop, false) => Err(PierError::NotRunning(id())),
            (PierOperation::ClearAppData | PierOperation::Delete, true) => {
                Err(PierError::MustStopFirst(id()))
            }
            _ => Ok(()),
        }
    }

    /// The process signalled readiness. Returns true when this was the
    /// pier's first boot.
    pub fn mark_running(&mut self) -> bool {
        let first_boot = !self.booted;
        self.booted = true;
        self.running = true;
        self.touch("running");
        first_boot
    }

    /// The process is gone, by request or not.
    pub fn mark_stopped(&mut self) {
        self.running = false;
        self.touch("stopped");
    }

    /// Data was wiped; the next start boots from scratch.
    pub fn reset_boot(&mut self) {
        self.running = false;
        self.booted = false;
        self.touch("reset");
    }

    fn touch(&mut self, what: &'static str) {
        tracing::debug!(
            pier_id = %self.pier_id,
            booted = self.booted,
            running = self.running,
            since_last_ms = self.last_transition.elapsed().as_millis() as u64,
            "Boot state {}",
            what
        );
        self.last_transition = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(booted: bool) -> BootStateMachine {
        BootStateMachine::new(PierId::new("zod").unwrap(), booted)
    }

    #[test]
    fn test_unbooted_guard() {
        let sm = machine(false);
        assert_eq!(sm.status(), PierStatus::Unbooted);
        assert!(sm.check(PierOperation::Start).is_ok());
        assert!(matches!(sm.check(PierOperation::Stop), Err(PierError::NotRunning(_))));
        assert!(sm.check(PierOperation::ClearAppData).is_ok());
        assert!(sm.check(PierOperation::Delete).is_ok());
    }

    #[test]
    fn test_stopped_guard() {
        let sm = machine(true);
        assert_eq!(sm.status(), PierStatus::Stopped);
        assert!(sm.check(PierOperation::Start).is_ok());
        assert!(matches!(sm.check(PierOperation::Stop), Err(PierError::NotRunning(_))));
        assert!(sm.check(PierOperation::ClearAppData).is_ok());
        assert!(sm.check(PierOperation::Delete).is_ok());
    }

    #[test]
    fn test_running_guard() {
        let mut sm = machine(false);
        assert!(sm.mark_running());
        assert_eq!(sm.status(), PierStatus::Running);

        assert!(matches!(
            sm.check(PierOperation::Start),
            Err(PierError::AlreadyRunning(_))
        ));
        assert!(sm.check(PierOperation::Stop).is_ok());
        assert!(matches!(
            sm.check(PierOperation::ClearAppData),
            Err(PierError::MustStopFirst(_))
        ));
        assert!(matches!(
            sm.check(PierOperation::Delete),
            Err(PierError::MustStopFirst(_))
        ));
    }

    #[test]
    fn test_first_boot_reported_once() {
        let mut sm = machine(false);
        assert!(sm.mark_running());
        sm.mark_stopped();
        assert!(sm.booted());
        assert!(!sm.mark_running());
    }

    #[test]
    fn test_reset_boot() {
        let mut sm = machine(true);
        sm.reset_boot();
        assert!(!sm.booted());
        assert!(!sm.running());
        assert_eq!(sm.status(), PierStatus::Unbooted);
    }
}
