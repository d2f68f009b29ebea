// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Custom error types for the Pier Service.
//!
//! Explicit enum error types only. No `Box<dyn Error>`, no `anyhow::Result`:
//! every failure a caller can observe is a named variant.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{PierId, Port};

/// Top-level error type returned by every registry operation.
#[derive(Debug, Error)]
pub enum PierError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Pier not found: {0}")]
    NotFound(PierId),

    #[error("Pier already exists: {0}")]
    DuplicateId(PierId),

    #[error("Directory {path} is already owned by pier {owner}")]
    DuplicateDirectory { path: PathBuf, owner: PierId },

    #[error("No free port pair in web range {web_start}-{web_end} / loopback range {loopback_start}-{loopback_end}")]
    PortExhausted {
        web_start: u16,
        web_end: u16,
        loopback_start: u16,
        loopback_end: u16,
    },

    #[error("Persisted ports {ports:?} of pier {pier_id} collide with another pier")]
    PortConflict { pier_id: PierId, ports: Vec<Port> },

    // =========================================================================
    // Lifecycle Guard Errors
    // =========================================================================
    #[error("Pier {0} is already running")]
    AlreadyRunning(PierId),

    #[error("Pier {0} is not running")]
    NotRunning(PierId),

    #[error("Pier {0} must be stopped first")]
    MustStopFirst(PierId),

    #[error("Another operation is in progress for pier {0}")]
    OperationInProgress(PierId),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    // =========================================================================
    // Process Errors
    // =========================================================================
    #[error("Failed to spawn process for pier {pier_id}: {reason}")]
    ProcessSpawnFailed { pier_id: PierId, reason: String },

    #[error("Process for pier {pier_id} crashed: {reason}")]
    ProcessCrashed { pier_id: PierId, reason: String },

    #[error("Timed out during {operation} of pier {pier_id}")]
    Timeout {
        pier_id: PierId,
        operation: &'static str,
    },

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("Durable store unavailable: {context} - {source}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PierError {
    /// Stable machine-readable name of the error kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HardValidation(_) => "validation",
            Self::ConfigNotFound { .. } | Self::ConfigParse { .. } => "config",
            Self::NotFound(_) => "not_found",
            Self::DuplicateId(_) => "duplicate_id",
            Self::DuplicateDirectory { .. } => "duplicate_directory",
            Self::PortExhausted { .. } => "port_exhausted",
            Self::PortConflict { .. } => "port_conflict",
            Self::AlreadyRunning(_) => "already_running",
            Self::NotRunning(_) => "not_running",
            Self::MustStopFirst(_) => "must_stop_first",
            Self::OperationInProgress(_) => "operation_in_progress",
            Self::InvalidStateTransition(_) => "invalid_state_transition",
            Self::ProcessSpawnFailed { .. } => "process_spawn_failed",
            Self::ProcessCrashed { .. } => "process_crashed",
            Self::Timeout { .. } => "timeout",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Io { .. } => "io",
        }
    }
}

/// Hard validation errors reject a value before anything is mutated.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid port: {port} - {reason}")]
    InvalidPort { port: u16, reason: String },

    #[error("Invalid port range {start}-{end}: {reason}")]
    InvalidPortRange { start: u16, end: u16, reason: String },

    #[error("Launcher program does not exist: {path}")]
    LauncherNotFound { path: PathBuf },

    #[error("Launcher program is not executable: {path}")]
    LauncherNotExecutable { path: PathBuf },
}

/// Process state machine errors.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for pier {pier_id}")]
    InvalidTransition {
        pier_id: PierId,
        from: &'static str,
        to: &'static str,
    },
}

/// Errors raised inside the process supervisor.
///
/// These never reach callers directly: the registry converts them into the
/// matching [`PierError`] kind.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Process exited during boot ({status})")]
    ExitedDuringBoot { status: String },

    #[error("Process did not become ready within {timeout_ms}ms")]
    ReadyTimeout { timeout_ms: u64 },

    #[error("Operation already in progress")]
    Busy,

    #[error("Process already live")]
    AlreadyLive,

    #[error("No live process")]
    NotLive,

    #[error("Signal {signal} to pid {pid} failed: {reason}")]
    Signal {
        signal: &'static str,
        pid: u32,
        reason: String,
    },

    #[error(transparent)]
    Transition(#[from] StateTransitionError),
}

impl SupervisorError {
    /// Map a supervisor failure for `pier_id` into the public error kind.
    pub fn into_pier_error(self, pier_id: &PierId) -> PierError {
        match self {
            Self::SpawnFailed { program, reason } => PierError::ProcessSpawnFailed {
                pier_id: pier_id.clone(),
                reason: format!("{}: {}", program, reason),
            },
            Self::ExitedDuringBoot { status } => PierError::ProcessCrashed {
                pier_id: pier_id.clone(),
                reason: format!("exited during boot ({})", status),
            },
            Self::ReadyTimeout { .. } => PierError::Timeout {
                pier_id: pier_id.clone(),
                operation: "boot",
            },
            Self::Busy => PierError::OperationInProgress(pier_id.clone()),
            Self::AlreadyLive => PierError::AlreadyRunning(pier_id.clone()),
            Self::NotLive => PierError::NotRunning(pier_id.clone()),
            Self::Signal { .. } => PierError::ProcessSpawnFailed {
                pier_id: pier_id.clone(),
                reason: self.to_string(),
            },
            Self::Transition(e) => PierError::InvalidStateTransition(e),
        }
    }
}

/// Result type alias using PierError.
pub type PierResult<T> = Result<T, PierError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn zod() -> PierId {
        PierId::new("zod").unwrap()
    }

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "program",
            context: "launcher".to_string(),
        };
        assert!(err.to_string().contains("program"));
        assert!(err.to_string().contains("launcher"));
    }

    #[test]
    fn test_error_chain() {
        let validation_err = HardValidationError::InvalidPort {
            port: 0,
            reason: "Port must be non-zero".to_string(),
        };
        let pier_err: PierError = validation_err.into();
        assert!(matches!(pier_err, PierError::HardValidation(_)));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(PierError::NotRunning(zod()).kind(), "not_running");
        assert_eq!(
            PierError::Timeout {
                pier_id: zod(),
                operation: "stop"
            }
            .kind(),
            "timeout"
        );
    }

    #[test]
    fn test_supervisor_error_mapping() {
        let id = zod();
        assert!(matches!(
            SupervisorError::Busy.into_pier_error(&id),
            PierError::OperationInProgress(_)
        ));
        assert!(matches!(
            SupervisorError::ReadyTimeout { timeout_ms: 10 }.into_pier_error(&id),
            PierError::Timeout { operation: "boot", .. }
        ));
        assert!(matches!(
            SupervisorError::ExitedDuringBoot {
                status: "exit code 1".to_string()
            }
            .into_pier_error(&id),
            PierError::ProcessCrashed { .. }
        ));
        assert!(matches!(
            SupervisorError::NotLive.into_pier_error(&id),
            PierError::NotRunning(_)
        ));
    }
}
