use std::path::PathBuf;

use anyhow::{Context, Result};
use brisk::config::Config;
use clap::Subcommand;
use colored::Colorize;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show {
        /// Read this file instead of searching the config paths
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Service name used for the config search path
        #[arg(short, long, default_value = "brisk")]
        service: String,
    },
    /// Print where a service's config file should live
    Path {
        /// Service name
        #[arg(default_value = "brisk")]
        service: String,
    },
}

pub fn execute(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show { config, service } => show(config, &service),
        ConfigCommands::Path { service } => {
            println!("{}", Config::recommended_path(&service).display());
            Ok(())
        }
    }
}

fn show(path: Option<PathBuf>, service: &str) -> Result<()> {
    let config = load(path.as_deref(), service)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;

    match config.validate() {
        Ok(()) => eprintln!("{} configuration is valid", "✓".green().bold()),
        Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
    }
    print!("{rendered}");
    Ok(())
}

/// Load from an explicit file or the service's search path
pub fn load(path: Option<&std::path::Path>, service: &str) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load_for_service(service).context("Failed to load configuration")?,
    };
    Ok(config)
}
