//! Ratio CLI entry point.
//!
//! Binary name: `ratio`
//!
//! Parses CLI arguments, wires the engine to the filesystem loader, the local
//! file store, and the loopback executor, then dispatches to a command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,ratio=debug",
        _ => "trace",
    };
    ratio_observe::tracing_setup::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init(cli.data_dir.clone(), cli.root.clone()).await?;

    let result = match cli.command {
        Commands::Run {
            definition,
            args,
            args_file,
            token,
            processes,
        } => {
            let arguments = cli::run::parse_arguments(args.as_deref(), args_file.as_deref()).await?;
            cli::run::run_definition(&state, &definition, arguments, token, processes, cli.json).await
        }

        Commands::Validate { definition } => {
            cli::validate::validate_definition(&state, &definition, cli.json).await
        }

        Commands::Graph { definition } => {
            cli::graph::show_graph(&state, &definition, cli.json).await
        }
    };

    ratio_observe::tracing_setup::shutdown_tracing();
    result
}
