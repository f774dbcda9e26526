mod cli;
mod log;
mod shutdown;
mod up;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands, GlobalOptions};
use dpitun_core::{Settings, is_elevated, rank_providers};
use dpitun_lifecycle::{OsProxy, SystemProxy};
use miette::{Result, bail};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    log::init_tracing(cli.global_options.level(), cli.global_options.log_format);

    let settings_path = settings_path(&cli.global_options)?;

    match cli.command {
        Commands::Up { no_connect } => up::run(settings_path, no_connect).await,
        Commands::ClearProxy => {
            let settings = Settings::load(&settings_path)?;
            let proxy = OsProxy::from_settings(&settings.proxy);
            proxy.clear().await?;
            info!("System proxy cleared ({})", proxy.backend());
            Ok(())
        }
        Commands::Dns { timeout_ms } => {
            for result in rank_providers(Duration::from_millis(timeout_ms)).await {
                let address = result
                    .provider
                    .ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_default();
                match result.latency {
                    Some(latency) => println!(
                        "{:<12} {:<16} {} ms",
                        result.provider.label(),
                        address,
                        latency.as_millis()
                    ),
                    None => println!(
                        "{:<12} {:<16} unreachable",
                        result.provider.label(),
                        address
                    ),
                }
            }
            Ok(())
        }
        Commands::Settings { path } => {
            if path {
                println!("{}", settings_path.display());
            } else {
                print!("{}", Settings::load(&settings_path)?.to_yaml()?);
            }
            Ok(())
        }
        Commands::CheckAdmin => {
            if is_elevated().await {
                println!("elevated");
            } else {
                println!("not elevated");
            }
            Ok(())
        }
    }
}

fn settings_path(options: &GlobalOptions) -> Result<PathBuf> {
    if let Some(path) = &options.settings {
        return Ok(path.clone());
    }
    match Settings::default_path() {
        Some(path) => Ok(path),
        None => bail!("No config directory found, pass --settings or set DPITUN_SETTINGS"),
    }
}
