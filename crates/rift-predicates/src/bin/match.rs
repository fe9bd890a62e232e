//! Evaluate predicates against a recorded request.
//!
//! Usage:
//!   rift-match --predicate <file> --request <file> [--state <file>] [OPTIONS]
//!
//! Exits 0 on match, 1 on no match and 2 on error.

use anyhow::{Context, Result};
use clap::Parser;
use rift_predicates::{EngineConfig, Evaluator, ImposterState, Predicate, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Rift predicate evaluator
#[derive(Parser, Debug)]
#[command(name = "rift-match")]
#[command(
    author,
    version,
    about = "Check whether Mountebank predicates match a request"
)]
struct Args {
    /// Predicate file (JSON or YAML): one predicate or a list of them
    #[arg(short, long)]
    predicate: PathBuf,

    /// Request file (JSON or YAML) in Mountebank's request format
    #[arg(short, long)]
    request: PathBuf,

    /// Imposter state file; updated in place after evaluation
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Engine configuration file (JSON or YAML)
    #[arg(short, long, env = "RIFT_PREDICATES_CONFIG")]
    config: Option<PathBuf>,

    /// Allow inject predicates
    #[arg(long)]
    allow_injection: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.json_logs);

    match run(&args) {
        Ok(true) => {
            println!("match");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("no match");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(args: &Args) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if args.allow_injection {
        config.allow_injection = true;
    }

    let predicates = Predicate::parse_all(&load_document(&args.predicate)?)
        .with_context(|| format!("Invalid predicate in {}", args.predicate.display()))?;
    let request = Value::from(load_document(&args.request)?);
    let state = match &args.state {
        Some(path) if path.exists() => ImposterState::from_json(load_document(path)?),
        _ => ImposterState::new(),
    };

    let evaluator = Evaluator::with_config(config);
    evaluator.validate_all(&predicates)?;
    let matched = evaluator.all_match(&predicates, &request, &state)?;

    if let Some(path) = &args.state {
        let content = serde_json::to_string_pretty(&state.to_json())?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write state to {}", path.display()))?;
    }

    Ok(matched)
}

/// Read a JSON or YAML document.
fn load_document(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
