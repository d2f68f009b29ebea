// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! `pier up` command - Run piers in the foreground.
//!
//! Starts the requested piers, optionally serves the control API, and on
//! Ctrl+C stops every pier before exiting.

use std::path::Path;
use std::time::Duration;

use tokio::sync::oneshot;

use pier_core::{PierError, PierId};

use crate::error::{CliError, CliResult};

pub async fn execute(
    config: Option<&Path>,
    ids: Vec<String>,
    all: bool,
    control_port: Option<u16>,
) -> CliResult<()> {
    let config = super::load_config(config)?;
    // Fail fast before touching any pier.
    let program = config
        .launcher
        .resolve_program()
        .map_err(PierError::from)?;
    tracing::info!(launcher = %program.display(), all, requested = ids.len(), "Starting piers");

    let session = super::open_session(config).await?;
    let registry = session.registry.clone();
    let observer = crate::metrics::spawn_observer(registry.subscribe());

    let targets: Vec<PierId> = if all {
        registry.list().into_iter().map(|p| p.id).collect()
    } else {
        ids.iter()
            .map(|id| PierId::new(id.as_str()))
            .collect::<Result<_, _>>()
            .map_err(PierError::from)?
    };

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                        PIER SERVICE                          ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut failed = 0usize;
    for id in &targets {
        println!("▶ Starting pier: {}", id);
        match registry.start(id).await {
            Ok(pier) => println!(
                "  ✓ {} started (PID: {}, Web: {}, Loopback: {})",
                pier.id,
                pier.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                pier.web_port,
                pier.loopback_port
            ),
            Err(PierError::AlreadyRunning(_)) => println!("  • {} already running", id),
            Err(e) => {
                failed += 1;
                println!("  ✗ {} failed: {}", id, e);
            }
        }
    }

    println!();
    super::list::print_table(&registry.list());

    let server = control_port.map(|port| {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let registry = registry.clone();
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = stop_rx.await;
            };
            if let Err(e) = crate::control::serve(port, registry, shutdown).await {
                tracing::error!(port, error = %e, "Control API failed");
            }
        });
        (stop_tx, task)
    });

    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    tokio::signal::ctrl_c().await.map_err(|source| CliError::Io {
        context: "wait for Ctrl+C",
        source,
    })?;

    println!();
    println!("Shutting down...");

    if let Some((stop_tx, task)) = server {
        let _ = stop_tx.send(());
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Control API task ended abnormally");
        }
    }

    registry.shutdown().await;
    drop(registry);
    drop(session);
    // The bus closes once the registry is gone; don't hang on a stray handle.
    if tokio::time::timeout(Duration::from_secs(1), observer).await.is_err() {
        tracing::debug!("Event observer still attached at exit");
    }

    println!("Pier service stopped.");

    if failed > 0 {
        return Err(CliError::StartFailed {
            failed,
            requested: targets.len(),
        });
    }
    Ok(())
}
