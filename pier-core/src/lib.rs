// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Pier Service Core Library
//!
//! Manages locally hosted piers: long-running service processes that each own
//! a data directory and a pair of network ports. Provides the pier registry,
//! port allocation, process supervision, boot-state guarding, durable records
//! and an ordered event bus.

pub mod backoff;
pub mod boot;
pub mod config;
pub mod error;
pub mod events;
pub mod ports;
pub mod registry;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export commonly used types
pub use boot::{BootStateMachine, PierOperation, PierStatus};
pub use config::{ConfigLoader, ServiceConfig};
pub use error::{HardValidationError, PierError, PierResult, SupervisorError};
pub use events::{EventBus, EventStream, PierEvent, PierEventKind};
pub use ports::PortAllocator;
pub use registry::{PierRegistry, PierSpec};
pub use state::{ProcessState, ProcessStateMachine};
pub use store::{FileStore, MemoryStore, PierRecord, PierSnapshot, PierStore};
pub use supervisor::{OutputLine, OutputStream, ProcessSupervisor};
pub use types::{PierId, Port, PortPair, ProcessId};
