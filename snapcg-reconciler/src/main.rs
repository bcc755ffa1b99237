//! snapcg
//!
//! Reconciles snapshot consistency groups on a block-storage array.
//!
//! # Commands
//! - `apply` - Bring the array to the state declared in a TOML file
//! - `validate` - Check a desired-configuration file without contacting the array
//! - `config` - Show or initialize connection settings
//!
//! # Configuration
//! Config file: ~/.snapcg/config.toml

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use snapcg_array::{ArrayClient, HttpTransport};
use snapcg_reconciler::config::{self, DesiredConfig, SnapcgConfig};
use snapcg_reconciler::Reconciler;

#[derive(Parser)]
#[command(name = "snapcg")]
#[command(about = "Snapshot consistency-group reconciler")]
#[command(version)]
struct Cli {
    /// Connection settings file (default ~/.snapcg/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// REST API root (overrides config file)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Storage system id (overrides config file)
    #[arg(long, global = true)]
    ssid: Option<String>,

    /// API user (overrides config file)
    #[arg(long, global = true)]
    username: Option<String>,

    /// Skip array certificate verification
    #[arg(long, global = true, default_value = "false")]
    insecure: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the array to the declared state
    Apply {
        /// Desired configuration (TOML)
        file: PathBuf,

        /// Compute and print the changes without applying them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate a desired configuration
    Validate {
        /// Desired configuration (TOML)
        file: PathBuf,
    },

    /// Show or initialize connection settings
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current settings
    Show,

    /// Show config file path
    Path,

    /// Initialize config file with defaults
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_file_path()?,
    };

    match &cli.command {
        Commands::Apply { file, dry_run } => {
            let settings = load_settings(&cli, &config_path)?;
            apply(settings, file, *dry_run).await?;
        }
        Commands::Validate { file } => {
            let operation = DesiredConfig::from_file(file)
                .with_context(|| format!("Failed to read {}", file.display()))?
                .into_operation()?;
            println!(
                "{} {} [{}]",
                style("valid").green(),
                operation.kind(),
                operation.group()
            );
        }
        Commands::Config { command } => {
            handle_config_command(command.as_ref(), &config_path)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Settings file, then environment, then command line
fn load_settings(cli: &Cli, path: &Path) -> Result<SnapcgConfig> {
    let mut cfg = SnapcgConfig::load(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    if let Some(api_url) = &cli.api_url {
        cfg.array.api_url = api_url.clone();
    }
    if let Some(ssid) = &cli.ssid {
        cfg.array.ssid = ssid.clone();
    }
    if let Some(username) = &cli.username {
        cfg.array.username = username.clone();
    }
    if cli.insecure {
        cfg.array.validate_certs = false;
    }

    cfg.array.validate()?;
    Ok(cfg)
}

async fn apply(cfg: SnapcgConfig, file: &Path, dry_run: bool) -> Result<()> {
    let operation = DesiredConfig::from_file(file)
        .with_context(|| format!("Failed to read {}", file.display()))?
        .into_operation()?;
    debug!(?operation, "Parsed desired configuration");

    let transport = HttpTransport::new(cfg.array.transport_config())
        .context("Failed to create array transport")?;
    info!(url = %transport.base_url(), "Connecting to array");

    let reconciler = Reconciler::new(ArrayClient::new(Arc::new(transport)));
    let report = match reconciler.reconcile(&operation, dry_run).await {
        Ok(report) => report,
        Err(e) => {
            if !e.is_pre_mutation() {
                warn!("Array was partially modified; re-run apply to converge");
            }
            return Err(e)
                .with_context(|| format!("{} [{}] failed", operation.kind(), operation.group()));
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Handle config subcommands
fn handle_config_command(command: Option<&ConfigCommands>, path: &Path) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let cfg = SnapcgConfig::load(path)?;
            println!();
            println!("{}", style("snapcg Configuration").bold().underlined());
            println!();
            println!("{}", style("[array]").cyan());
            println!("  api_url = \"{}\"", cfg.array.api_url);
            println!("  ssid = \"{}\"", cfg.array.ssid);
            println!("  username = \"{}\"", cfg.array.username);
            println!(
                "  password = \"{}\"",
                if cfg.array.password.is_empty() { "" } else { "********" }
            );
            println!("  validate_certs = {}", cfg.array.validate_certs);
            println!("  timeout_secs = {}", cfg.array.timeout_secs);
            println!();

            println!("{} {}", style("Config file:").dim(), path.display());
            if !path.exists() {
                println!(
                    "{} Run '{}' to create it",
                    style("(not created yet)").yellow(),
                    style("snapcg config init").green()
                );
            }
        }
        Some(ConfigCommands::Path) => {
            println!("{}", path.display());
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!(
                    "{} Config file already exists at {}",
                    style("!").yellow(),
                    path.display()
                );
                println!("  Use --force to overwrite");
                return Ok(());
            }

            SnapcgConfig::template()
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!(
                "{} Created config file at {}",
                style("✓").green(),
                path.display()
            );
        }
    }

    Ok(())
}
