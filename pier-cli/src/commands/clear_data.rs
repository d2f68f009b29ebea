// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! `pier clear-data` command - Wipe a stopped pier back to unbooted.

use std::path::Path;

use pier_core::PierId;

use crate::error::CliResult;

pub async fn execute(config: Option<&Path>, id: &str) -> CliResult<()> {
    let id = PierId::new(id).map_err(pier_core::PierError::from)?;
    let session = super::open_session(super::load_config(config)?).await?;

    let pier = session.registry.clear_app_data(&id).await?;
    println!(
        "✓ Cleared data of pier {}; it will boot from scratch on next start",
        pier.id
    );
    Ok(())
}
