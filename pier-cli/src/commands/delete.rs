// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! `pier delete` command.

use std::path::Path;

use pier_core::PierId;

use crate::error::CliResult;

pub async fn execute(config: Option<&Path>, id: &str) -> CliResult<()> {
    let id = PierId::new(id).map_err(pier_core::PierError::from)?;
    let session = super::open_session(super::load_config(config)?).await?;

    session.registry.delete(&id).await?;
    println!("✓ Deleted pier {}", id);
    Ok(())
}
