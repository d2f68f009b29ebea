// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! `pier create` command - Register a pier and reserve its ports.

use std::path::{Path, PathBuf};

use pier_core::PierSpec;

use crate::error::CliResult;

pub async fn execute(config: Option<&Path>, name: String, dir: Option<PathBuf>) -> CliResult<()> {
    let session = super::open_session(super::load_config(config)?).await?;

    let spec = PierSpec {
        name,
        directory: dir,
    };
    let pier = session.registry.create(spec).await?;

    println!("✓ Created pier {}", pier.id);
    println!("  Directory:     {}", pier.directory.display());
    println!("  Web port:      {}", pier.web_port);
    println!("  Loopback port: {}", pier.loopback_port);
    Ok(())
}
