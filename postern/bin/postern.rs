#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use postern::{Config, SupervisorError, supervisor};
use postern_common::logging;

/// A durable store-and-forward mail transfer agent
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file. Falls back to `POSTERN_CONFIG`, then
    /// ./postern.config.ron, then /etc/postern/postern.config.ron
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Initialise empty queue storage instead of refusing to start
    #[arg(long)]
    auto_create: bool,

    /// Validate the configuration and storage, then exit
    #[arg(long)]
    check: bool,
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let path = Config::locate(cli.config.as_deref())?;
    let mut config = Config::load(&path)?;
    config.auto_create |= cli.auto_create;
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli, config: Config) -> Result<(), SupervisorError> {
    if cli.check {
        supervisor::check(&config).await?;
        println!("Configuration OK");
        return Ok(());
    }

    supervisor::run(&config).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    logging::init();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = ExitCode::from(&err);
            eprintln!("Error: {:#}", anyhow::Error::new(err));
            code
        }
    }
}
