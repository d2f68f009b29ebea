// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Pier CLI
//!
//! Command-line interface for the Pier Service.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod control;
mod error;
mod instance;
mod metrics;

/// Pier - local supervisor for long-running pier processes
#[derive(Parser)]
#[command(name = "pier")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults are used when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a new pier and reserve its ports
    Create {
        /// Pier name, also its id
        name: String,

        /// Data directory (defaults to <data_dir>/piers/<name>)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// List registered piers
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Delete a stopped pier, its ports and its directory
    Delete {
        /// Pier id
        id: String,
    },

    /// Wipe a stopped pier's data; it boots from scratch next time
    ClearData {
        /// Pier id
        id: String,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: PathBuf,
    },

    /// Run piers in the foreground until Ctrl+C
    Up {
        /// Piers to start
        ids: Vec<String>,

        /// Start every registered pier
        #[arg(short, long)]
        all: bool,

        /// Serve the HTTP control API on this port
        #[arg(long)]
        control_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.config.as_deref();

    // Dispatch to command handlers
    match cli.command {
        Commands::Create { name, dir } => commands::create::execute(config, name, dir).await?,
        Commands::List { json } => commands::list::execute(config, json).await?,
        Commands::Delete { id } => commands::delete::execute(config, &id).await?,
        Commands::ClearData { id } => commands::clear_data::execute(config, &id).await?,
        Commands::Validate { file } => commands::validate::execute(&file).await?,
        Commands::Up {
            ids,
            all,
            control_port,
        } => commands::up::execute(config, ids, all, control_port).await?,
    }

    Ok(())
}
