// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! CLI error type.

use std::path::PathBuf;

use thiserror::Error;

use pier_core::PierError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Pier(#[from] PierError),

    #[error("Another pier instance (pid {pid}) is using {path}; use its control API instead")]
    InstanceLocked { pid: u32, path: PathBuf },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{failed} of {requested} piers failed to start")]
    StartFailed { failed: usize, requested: usize },
}

pub type CliResult<T> = Result<T, CliError>;
