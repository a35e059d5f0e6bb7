//! devcomp - device-computation service front end.

use anyhow::Result;
use clap::Parser;
use devcomp_cli::cli::{Cli, Commands};
use devcomp_cli::{commands, logging, serve, CliConfig};
use devcomp_service::Service;
use std::io;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = if cli.no_config {
        (CliConfig::default(), None)
    } else {
        CliConfig::discover(cli.config.as_deref())?
    };
    if let Some(devices) = cli.devices {
        config.service.platform.device_count = devices;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    if let Commands::ShowConfig = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    logging::init(&config.logging)?;
    if let Some(path) = &source {
        tracing::info!(path = %path.display(), "loaded configuration");
    }

    let service = Service::new(config.service.clone())?;
    let stdout = io::stdout();
    match &cli.command {
        Commands::Serve => {
            serve(&service, io::stdin().lock(), stdout.lock())?;
        }
        Commands::Devices => commands::devices(&service, stdout.lock())?,
        Commands::Stats { graph } => commands::stats(&service, graph, stdout.lock())?,
        Commands::Run {
            graph,
            args,
            seed,
            replicas,
        } => commands::run(&service, graph, args, *seed, *replicas, stdout.lock())?,
        Commands::ShowConfig => {}
    }
    Ok(())
}
