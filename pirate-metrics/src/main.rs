//! pirate-metrics - command-line client for PirateMetrics
//!
//! This tool provides commands for:
//! - Checking agent configuration and collector endpoint
//! - Submitting a metric by hand and reporting how delivery went
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/pirate-metrics/config.toml (~/.config/pirate-metrics/config.toml)
//! - Logs: $XDG_STATE_HOME/pirate-metrics/ (~/.local/state/pirate-metrics/)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pirate_metrics_core::{Agent, Config, MetricKind, Record};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "pirate-metrics")]
#[command(about = "Ship AARRR business metrics to PirateMetrics")]
#[command(version)]
struct Args {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Collector host:port, overriding the config file
    #[arg(long, global = true)]
    collector: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show agent configuration and collector endpoint
    Status,

    /// Submit one record and wait for it to be handled
    Send {
        /// Metric kind (acquisition, activation, retention, revenue, referral, ...)
        kind: MetricKind,

        /// Record field as key=value (repeatable)
        #[arg(short, long = "field", value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,

        /// Block until the collector has answered instead of queueing
        #[arg(long)]
        sync: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(collector) = &args.collector {
        config.agent.collector = Some(collector.clone());
    }
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    let _log_guard = pirate_metrics_core::logging::init(&config.logging)
        .context("failed to initialize logging")?;

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Send { kind, fields, sync } => cmd_send(config, kind, &fields, sync),
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("PirateMetrics Agent Configuration");
    println!("=================================");
    println!();

    let agent = &config.agent;

    println!("Enabled:         {}", agent.enabled);
    if config.logging.file {
        println!(
            "Log File:        {}",
            pirate_metrics_core::logging::log_file_path().display()
        );
    } else {
        println!("Log Output:      stderr");
    }

    if !agent.enabled {
        println!();
        println!("Agent is disabled. Enable it in config.toml:");
        println!();
        println!("  [agent]");
        println!("  enabled = true");
        println!("  api_key = \"your-api-key\"");
        return Ok(());
    }

    println!("API Key:         {}", mask(&agent.api_key));
    match agent.base_url() {
        Ok(url) => println!("Collector:       {}", url),
        Err(e) => println!("Collector:       <invalid: {}>", e),
    }
    println!(
        "Delivery:        {}",
        if agent.synchronous { "synchronous" } else { "asynchronous" }
    );
    println!("Max Buffer:      {}", agent.max_buffer);
    println!("Reconnect Delay: {}ms", agent.reconnect_delay_ms);
    println!("Exit Timeout:    {}ms", agent.exit_flush_timeout_ms);

    println!();
    match agent.validate() {
        Ok(()) => println!("Status: Ready to send"),
        Err(e) => println!("Status: Not ready ({})", e),
    }

    Ok(())
}

fn cmd_send(config: Config, kind: MetricKind, fields: &[String], sync: bool) -> Result<()> {
    let record = parse_fields(fields)?;

    if !config.agent.enabled {
        println!("Agent is disabled; nothing sent.");
        return Ok(());
    }
    config
        .agent
        .validate()
        .context("agent configuration is invalid (run 'status' for details)")?;

    let agent = Agent::new(config.agent);
    let accepted = agent.submit(kind.clone(), record, sync);
    if accepted.is_none() {
        println!("{} was not queued", kind);
    }

    agent.flush(false);
    agent.cleanup();

    let stats = agent.stats();
    println!("Kind:            {}", kind);
    println!("Endpoint:        {}", kind.path());
    println!("Delivered:       {}", stats.delivered);
    println!("Failed Attempts: {}", stats.failures);
    println!("Abandoned:       {}", stats.abandoned);

    Ok(())
}

/// Build a record from `key=value` arguments
///
/// Values that read as JSON numbers or booleans are sent as such, anything
/// else as a string.
fn parse_fields(fields: &[String]) -> Result<Record> {
    let mut record = Record::new();
    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            bail!("field '{}' must be key=value", field);
        };
        if key.is_empty() {
            bail!("field '{}' has an empty key", field);
        }
        let value = match serde_json::from_str::<Value>(value) {
            Ok(v @ (Value::Number(_) | Value::Bool(_))) => v,
            _ => Value::String(value.to_string()),
        };
        record.insert(key.to_string(), value);
    }
    Ok(record)
}

fn mask(api_key: &str) -> String {
    if api_key.is_empty() {
        return "<not set>".to_string();
    }
    let visible: String = api_key.chars().take(4).collect();
    format!("{}****", visible)
}
