mod cli_args;
mod run_command;
mod status_command;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::cli_args::{Cli, CliCommand};
use crate::run_command::execute_run_command;
use crate::status_command::execute_status_command;

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        CliCommand::Run(args) => execute_run_command(&cli.state_dir, args).await,
        CliCommand::Status(args) => execute_status_command(&cli.state_dir, args.json).await,
        CliCommand::Reset => {
            let purged = chatbridge_runtime::reset_connection_state(&cli.state_dir)?;
            println!(
                "connection state reset: state_dir={} credentials_purged={}",
                cli.state_dir.display(),
                purged
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    run_cli(Cli::parse()).await
}
