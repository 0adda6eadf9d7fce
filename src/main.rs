use clap::Parser;
use std::process::ExitCode;

use anvil::cli::args::{Cli, Commands, DaemonCommand};
use anvil::cli::{build, daemon};
use anvil::error::exit_codes;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => ExitCode::from(code.rem_euclid(256) as u8),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code().rem_euclid(256) as u8)
        }
    }
}

async fn run(cli: Cli) -> anvil::Result<i32> {
    match cli.command {
        Commands::Build { dir, args } => build::build(dir, args).await,

        Commands::Daemon { command } => {
            match command {
                DaemonCommand::Status => daemon::status(cli.json).await?,
                DaemonCommand::Purge => daemon::purge(cli.json).await?,
            }
            Ok(exit_codes::SUCCESS)
        }
    }
}
