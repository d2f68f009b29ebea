// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! CLI command modules.

use std::path::Path;
use std::sync::Arc;

use pier_core::{ConfigLoader, FileStore, PierRegistry, ServiceConfig};

use crate::error::CliResult;
use crate::instance::InstanceLock;

pub mod clear_data;
pub mod create;
pub mod delete;
pub mod list;
pub mod up;
pub mod validate;

/// Load the configuration, or fall back to defaults when no file was given.
pub fn load_config(path: Option<&Path>) -> CliResult<ServiceConfig> {
    match path {
        Some(path) => Ok(ConfigLoader::load_file(path)?),
        None => Ok(ServiceConfig::default()),
    }
}

/// An open registry together with the lock that makes it ours.
///
/// Field order matters: the registry drops before the lock is released.
pub struct Session {
    pub registry: Arc<PierRegistry>,
    _lock: InstanceLock,
}

/// Take the instance lock on the data directory and open the registry on the
/// durable store beneath it.
pub async fn open_session(config: ServiceConfig) -> CliResult<Session> {
    let lock = InstanceLock::acquire(&config.data_dir)?;
    let store = FileStore::open(config.store_dir())?;
    let registry = PierRegistry::open(config, Arc::new(store)).await?;
    Ok(Session {
        registry,
        _lock: lock,
    })
}
