// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! `pier validate` command - Validate configuration file.

use std::path::Path;

use pier_core::ConfigLoader;

use crate::error::CliResult;

pub async fn execute(file: &Path) -> CliResult<()> {
    tracing::info!(file = %file.display(), "Validating configuration");

    let result = ConfigLoader::load_file(file).and_then(|config| {
        let program = config.launcher.resolve_program()?;
        Ok((config, program))
    });

    match result {
        Ok((config, program)) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Service Settings:");
            println!("  Data Directory:     {}", config.data_dir.display());
            println!("  Output Buffer:      {} lines", config.output_buffer_lines);
            println!(
                "  Web Ports:          {}-{}",
                config.ports.web.start, config.ports.web.end
            );
            println!(
                "  Loopback Ports:     {}-{}",
                config.ports.loopback.start, config.ports.loopback.end
            );
            println!("  Launcher:           {}", program.display());
            println!(
                "  Startup Timeout:    {}ms",
                config.timeouts.startup.as_millis()
            );
            println!("  Stop Timeout:       {}ms", config.timeouts.stop.as_millis());
            if config.restart.enabled {
                println!(
                    "  Crash Restart:      up to {} attempts",
                    config.restart.max_attempts
                );
            } else {
                println!("  Crash Restart:      disabled");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
