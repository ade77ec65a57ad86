//! # Coordinator Configuration Validator
//!
//! Loads the layered coordinator configuration for an environment, validates
//! it and prints the sanitized effective configuration.
//!
//! ```text
//! config-validator [--config-dir <path>] [--environment <name>] [--verbose]
//! ```

use anyhow::{bail, Context, Result};
use query_coordinator::config::ConfigManager;
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};

#[derive(Debug, Default)]
struct Args {
    config_dir: Option<PathBuf>,
    environment: Option<String>,
    verbose: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "-c" | "--config-dir" => {
                args.config_dir = Some(raw.next().context("--config-dir needs a path")?.into());
            }
            "-e" | "--environment" => {
                args.environment = Some(raw.next().context("--environment needs a name")?);
            }
            "-v" | "--verbose" => args.verbose = true,
            "-h" | "--help" => {
                println!("usage: config-validator [--config-dir <path>] [--environment <name>] [--verbose]");
                process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn run(args: &Args) -> Result<()> {
    println!("🔧 Validating coordinator configuration");

    let manager = match &args.environment {
        Some(environment) => ConfigManager::load_from_directory_with_env(args.config_dir.clone(), environment),
        None => ConfigManager::load_from_directory(args.config_dir.clone()),
    }
    .context("failed to load configuration")?;

    println!("Environment: {}", manager.environment());
    println!("Config Directory: {}", manager.config_directory().display());

    manager
        .config()
        .validate()
        .context("configuration is invalid")?;
    println!("✅ Configuration is valid");

    let config = manager.config();
    println!();
    println!("  storage backend:      {:?}", config.storage.backend);
    println!("  messaging backend:    {}", config.messaging.backend);
    println!("  claim check:          {}", config.messaging.claim_check.enabled);
    match config.messaging.claim_check_threshold() {
        Some(threshold) => println!("  claim check threshold: {threshold} bytes"),
        None => println!("  claim check threshold: none"),
    }
    println!("  lock wait/lease:      {}ms / {}ms", config.lock.wait_time_ms, config.lock.lease_time_ms);
    println!("  next call concurrency: {}", config.next_call.concurrency);
    println!("  max running tasks:    {}", config.tasks.max_running);

    println!();
    println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
    Ok(())
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(2);
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .try_init();

    match run(&args) {
        Ok(()) => info!("Configuration validation completed successfully"),
        Err(e) => {
            error!(error = %e, "Configuration validation failed");
            println!("❌ {e:#}");
            process::exit(1);
        }
    }
}
