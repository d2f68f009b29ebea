// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! `pier list` command - Show registered piers.

use std::path::Path;

use pier_core::PierSnapshot;

use crate::error::CliResult;

pub async fn execute(config: Option<&Path>, json: bool) -> CliResult<()> {
    let session = super::open_session(super::load_config(config)?).await?;
    let piers = session.registry.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&piers)?);
        return Ok(());
    }

    if piers.is_empty() {
        println!("No piers registered.");
        return Ok(());
    }

    print_table(&piers);
    println!();
    println!("Total: {} pier(s)", piers.len());
    Ok(())
}

/// Box-drawn status table, shared with `pier up`.
pub fn print_table(piers: &[PierSnapshot]) {
    println!("╔═══════════════════╦══════════╦════════╦══════════╦═════════════════════════════╗");
    println!("║ ID                ║ Status   ║ Web    ║ Loopback ║ Last error                  ║");
    println!("╠═══════════════════╬══════════╬════════╬══════════╬═════════════════════════════╣");

    for pier in piers {
        let last_error = pier.last_error.as_deref().unwrap_or("-");
        println!(
            "║ {:<17} ║ {:<8} ║ {:<6} ║ {:<8} ║ {:<27} ║",
            truncate(pier.id.as_str(), 17),
            pier.status.name(),
            pier.web_port,
            pier.loopback_port,
            truncate(last_error, 27)
        );
    }

    println!("╚═══════════════════╩══════════╩════════╩══════════╩═════════════════════════════╝");
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}
