//! AgentFlow command-line entry point.
//!
//! Binary name: `agentflow`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler.

mod cli;

use clap::Parser;
use clap_complete::generate;

use agentflow_observe::tracing_setup::{filter_for_verbosity, init_tracing, shutdown_tracing};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need neither tracing nor config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "agentflow", &mut std::io::stdout());
        return Ok(());
    }

    let filter = if cli.quiet && cli.verbose == 0 {
        "error"
    } else {
        filter_for_verbosity(cli.verbose)
    };
    init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let output = cli::Output {
        json: cli.json,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    let outcome = match cli.command {
        Commands::Run {
            file,
            input,
            input_file,
            concurrency,
            timeout,
            state_out,
        } => {
            let options = cli::run::RunOptions {
                file,
                input,
                input_file,
                concurrency,
                timeout_secs: timeout,
                state_out,
            };
            cli::run::handle_run(options, output).await
        }
        Commands::Validate { file } => cli::validate::handle_validate(&file, output),
        Commands::Plan { file } => cli::plan::handle_plan(&file, output),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    outcome
}
