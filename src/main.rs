use clap::Parser;

use artifact_vault::cli::{self, Cli, Commands};
use artifact_vault::daemon;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `serve` sets up its own file logging once the data dir is known
    if !matches!(cli.command, Some(Commands::Serve { .. })) {
        daemon::init_console_logging(cli.verbose);
    }

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
