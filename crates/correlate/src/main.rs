//! correlate CLI
//!
//! Thin wrapper over `correlate-core`: replays correlation scripts and checks
//! configuration files.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use correlate_core::config::{Config, LogFormat};
use correlate_core::logging::{LogLevel, init_logging};
use correlate_core::replay::{ReplayReport, Replayer, Script};
use correlate_core::table::TableStats;

#[derive(Parser, Debug)]
#[command(name = "correlate", version, about = "Request/response correlation tools")]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, env = "CORRELATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (pretty, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a JSON replay script against a deterministic clock
    Replay {
        /// Script file path
        script: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log.level = level.to_string();
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    init_logging(&config.log).context("failed to initialize logging")?;

    match cli.command {
        Command::Replay { script, format } => replay(&config, &script, format),
        Command::CheckConfig => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| match path {
        Some(path) => format!("failed to load config from {}", path.display()),
        None => "failed to build default config".to_string(),
    })
}

fn replay(config: &Config, path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let script = Script::load(path)
        .with_context(|| format!("failed to load replay script {}", path.display()))?;
    tracing::info!(script = %path.display(), steps = script.steps.len(), "starting replay");
    let report = Replayer::run(config, &script);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => print_plain(&report),
    }
    Ok(())
}

fn print_plain(report: &ReplayReport) {
    if let Some(name) = &report.name {
        println!("# {name}");
    }
    for event in &report.events {
        println!("{event}");
    }
    println!(
        "-- {} steps, {} events, {}ms elapsed",
        report.steps,
        report.events.len(),
        report.elapsed_ms
    );
    print_stats("keyed", &report.keyed, &report.pending_keys);
    print_stats("messages", &report.messages, &report.pending_messages);
}

fn print_stats(label: &str, stats: &TableStats, pending: &[String]) {
    println!(
        "{label}: registered={} resolved={} timed_out={} cancelled={} unmatched={} rejected={} pending={}",
        stats.registered,
        stats.resolved,
        stats.timed_out,
        stats.cancelled,
        stats.unmatched,
        stats.rejected,
        stats.pending
    );
    if !pending.is_empty() {
        println!("{label} pending: {}", pending.join(", "));
    }
}
