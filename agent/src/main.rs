//! Sitepulse replay - run a recorded signal script through the agent.
//!
//! Every event the agent sends to its evaluator is printed to stdout as one
//! JSON line; logs go to stderr.
//!
//! # Environment Variables
//!
//! See the [`config`](sitepulse_agent::config) module for available
//! configuration options.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sitepulse_agent::config::Config;
use sitepulse_agent::replay::{parse_script, JsonLinesEvaluator, Replay};
use sitepulse_agent::storage::{FileStorage, MemoryStorage, Storage};

/// Sitepulse replay - deterministic agent replay.
///
/// Replays timestamped signals from a JSON-lines script with a simulated
/// clock, running the duty cycle at every period boundary the script
/// crosses.
#[derive(Parser, Debug)]
#[command(name = "sitepulse-replay")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    SITEPULSE_DUTY_CYCLE_SECS      Duty-cycle period (default: 30)
    SITEPULSE_SESSION_LENGTH_SECS  Session inactivity window (default: 1800)
    SITEPULSE_IDLE_THRESHOLD_SECS  Idle threshold (default: 60)
    SITEPULSE_RAGE_MIN_CLICKS      Clicks that make a rage click (default: 5)
    SITEPULSE_RAGE_COOLDOWN_MS     Max gap inside a click burst (default: 300)
    SITEPULSE_TRACKED_SELECTORS    Comma-separated watched selectors
    SITEPULSE_STORAGE_PATH         Storage file (default: ~/.sitepulse/storage.json)

EXAMPLES:
    # Replay against a throwaway in-memory store
    sitepulse-replay session.jsonl --memory

    # Two replays sharing one store behave like two tabs
    sitepulse-replay tab-a.jsonl --storage /tmp/shared.json
    sitepulse-replay tab-b.jsonl --storage /tmp/shared.json
")]
struct Cli {
    /// JSON-lines script of timestamped signals.
    script: PathBuf,

    /// Storage file shared between replays.
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Keep storage in memory for this run only.
    #[arg(short, long, conflicts_with = "storage")]
    memory: bool,

    /// Dispatch `before-unload` after the last step.
    #[arg(short, long)]
    unload: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = Config::from_env().context("Failed to load configuration")?;

    let storage: Rc<dyn Storage> = if cli.memory {
        Rc::new(MemoryStorage::new())
    } else {
        let path = match cli.storage {
            Some(path) => path,
            None => config
                .resolve_storage_path()
                .context("Failed to determine storage path")?,
        };
        info!(path = %path.display(), "Using file storage");
        Rc::new(FileStorage::new(path))
    };

    let file = File::open(&cli.script)
        .with_context(|| format!("Failed to open script {}", cli.script.display()))?;
    let steps = parse_script(BufReader::new(file))
        .with_context(|| format!("Failed to parse script {}", cli.script.display()))?;

    let start = steps.first().map_or(0, |step| step.at);
    let evaluator = Rc::new(JsonLinesEvaluator::new(io::stdout().lock()));
    let mut replay = Replay::new(&config, storage, evaluator, start);

    let failed = replay.run(&steps);
    if cli.unload {
        replay.unload();
    }

    if failed > 0 {
        warn!(failed, "Some handlers failed during replay");
    }
    info!(
        steps = steps.len(),
        ticks = replay.ticks(),
        "Replay finished"
    );

    Ok(())
}

/// Initializes the tracing subscriber on stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_level(true)
        .init();
}
