//! obexd command-line interface
//!
//! OBEX File Transfer and Message Access server engine

mod config;
mod progress;
mod replay;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use config::Config;
use replay::{Policy, Replayer};

/// obexd - OBEX server engine for the Bluetooth FTP and MAP profiles
#[derive(Parser)]
#[command(name = "obexd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a scripted client session against the configured store
    Replay {
        /// JSON script
        #[arg(required = true)]
        script: PathBuf,

        /// Serve this folder instead of the configured roots
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Deny every access request
        #[arg(long)]
        deny: bool,
    },

    /// Show the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },

    /// List configured service instances
    Instances,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if cli.config.is_some() {
        anyhow::bail!("Config file not found: {}", config_path.display());
    } else {
        Config::default()
    };

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    config.validate()?;

    match cli.command {
        Commands::Replay { script, root, deny } => {
            let policy = if deny { Policy::Deny } else { Policy::Allow };
            run_replay(&config, script, root, policy).await?;
        }
        Commands::Config { init } => {
            show_config(&config, &config_path, init)?;
        }
        Commands::Instances => {
            list_instances(&config);
        }
    }

    Ok(())
}

/// Replay a script and report the outcome of each step
async fn run_replay(
    config: &Config,
    script: PathBuf,
    root: Option<PathBuf>,
    policy: Policy,
) -> anyhow::Result<()> {
    let parsed = replay::load_script(&script)?;
    tracing::info!(
        "Replaying {} ({} steps, instance {})",
        script.display(),
        parsed.steps.len(),
        parsed.instance
    );

    let mut replayer = Replayer::start(config, root.as_deref(), &parsed, policy)?;
    let result = replayer.run(&parsed.steps).await;
    replayer.shutdown().await?;
    let outcomes = result?;

    let failed = outcomes.iter().filter(|o| !o.code.is_success()).count();
    println!();
    println!("{} steps, {} failed", outcomes.len(), failed);
    Ok(())
}

/// Print (and optionally write) the configuration
fn show_config(config: &Config, path: &std::path::Path, init: bool) -> anyhow::Result<()> {
    if init {
        if path.exists() {
            anyhow::bail!("Refusing to overwrite {}", path.display());
        }
        config.save(path)?;
        println!("Wrote {}", path.display());
    }
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// List configured service instances
fn list_instances(config: &Config) {
    println!("Service instances:");
    for instance in config.instance_configs(None) {
        println!(
            "  {:>3}  {:<16} {:<24} sessions={} target={}",
            instance.id.0,
            format!("{:?}", instance.profile),
            instance.root.display(),
            instance.max_sessions,
            hex::encode(instance.profile.target())
        );
    }
    println!();
    println!(
        "Max packet length: {}, access timeout: {}s, authentication: {}",
        config.engine.max_packet_len,
        config.engine.access_timeout_secs,
        if config.auth.required { "required" } else { "off" }
    );
}
