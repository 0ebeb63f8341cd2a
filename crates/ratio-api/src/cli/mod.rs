//! CLI command definitions for the `ratio` binary.

pub mod graph;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Run and inspect composition definitions.
#[derive(Parser)]
#[command(name = "ratio", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory holding config.toml and stored files.
    #[arg(long, global = true, env = "RATIO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Directory that definition paths resolve against.
    #[arg(long, global = true, env = "RATIO_DEFINITION_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a definition and print its response.
    Run {
        /// Definition path relative to the definition root.
        definition: String,

        /// Arguments as a JSON object.
        #[arg(long, conflicts_with = "args_file")]
        args: Option<String>,

        /// Read arguments from a JSON or YAML file.
        #[arg(long)]
        args_file: Option<PathBuf>,

        /// Credential passed to file storage.
        #[arg(long, env = "RATIO_TOKEN")]
        token: Option<String>,

        /// Also print the process tree.
        #[arg(long)]
        processes: bool,
    },

    /// Check a definition without executing it.
    Validate {
        /// Definition path relative to the definition root.
        definition: String,
    },

    /// Show the step dependency graph of a composite definition.
    Graph {
        /// Definition path relative to the definition root.
        definition: String,
    },
}
