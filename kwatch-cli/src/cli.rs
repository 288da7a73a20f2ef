//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "kwatch",
    about = "Keyword notification engine over chat-style message streams",
    version
)]
pub struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true, env = "KWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine, reading JSON-line messages from stdin until EOF or
    /// Ctrl-C.
    Run,

    /// Register a keyword or regex subscription.
    Add {
        /// Owner user id.
        #[arg(short, long)]
        owner: i64,
        /// Pattern text. Empty matches everything the filters allow.
        pattern: String,
        /// Interpret the pattern as a regular expression.
        #[arg(short, long)]
        regex: bool,
    },

    /// Remove a subscription by pattern.
    Remove {
        #[arg(short, long)]
        owner: i64,
        pattern: String,
    },

    /// List an owner's subscriptions.
    List {
        #[arg(short, long)]
        owner: i64,
    },

    /// Show an owner's statistics.
    Stats {
        #[arg(short, long)]
        owner: i64,
    },

    /// Parse the configuration file and print the effective settings.
    CheckConfig,
}
