//! `clawfw` binary entrypoint.

use std::io;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use claw_firewall_cli::cli::{Cli, Commands, LogFormat};
use claw_firewall_cli::commands::{CheckCommand, ReplayCommand};
use claw_firewall_cli::output::OutputFormat;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = OutputFormat::new(cli.format);
    let mut stdout = io::stdout().lock();

    match cli.command {
        Commands::Check(args) => {
            let cmd = CheckCommand::new(cli.config, args.rules);
            cmd.execute(&mut stdout, &format).context("check failed")?;
        }
        Commands::Replay(args) => {
            let trace = args.requests.display().to_string();
            let cmd = ReplayCommand::new(cli.config, args.rules, args.requests, args.blocks);
            cmd.execute(&mut stdout, &format)
                .await
                .with_context(|| format!("replay of {trace} failed"))?;
        }
    }

    Ok(())
}
