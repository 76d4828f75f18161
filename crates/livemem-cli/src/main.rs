//! `livemem` – command line front end for live memory states.
//!
//! Subcommands:
//!
//! 1. `ingest` reads a text file, encodes it and runs chunked ingestion,
//!    saving the resulting memory state.  Ctrl-C stops after the current chunk,
//!    saves the partial state and prints the offset to resume from.
//! 2. `query` loads a state and opens an interactive REPL answering prompts
//!    from it.
//! 3. `inspect` prints a state file's summary, optionally as JSON.
//! 4. `config` prints the effective configuration or writes a default
//!    `~/.livemem/config.toml`.

mod config;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

use livemem_memory::{MemoryState, persist};
use livemem_model::{ByteTokenizer, ReferenceModel};
use livemem_runtime::{ChunkProgress, IngestError, Ingestor};
use livemem_types::LiveMemError;

use crate::config::Config;

/// Build, inspect and query live memory states.
#[derive(Parser)]
#[command(name = "livemem", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (default: ~/.livemem/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a text file into a memory state.
    Ingest {
        /// Text file to ingest.
        data_path: PathBuf,

        /// Where to write the state (default: <state_dir>/memory_state.lmem).
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Tokens per forward call (default: `chunk_size` from the config).
        #[arg(long, value_name = "N")]
        chunk_size: Option<usize>,

        /// Continue from a previously saved (partial) state.
        #[arg(long, value_name = "STATE")]
        resume: Option<PathBuf>,

        /// Token offset to continue from, as printed by an interrupted run.
        #[arg(long, value_name = "N", requires = "resume", default_value_t = 0)]
        offset: usize,
    },

    /// Answer prompts interactively from a saved memory state.
    Query {
        /// State file to load.
        state_path: PathBuf,

        /// Generation budget per prompt (default: `max_new_tokens` from the config).
        #[arg(long, value_name = "N")]
        max_new_tokens: Option<usize>,
    },

    /// Print the summary of a saved memory state.
    Inspect {
        /// State file to read.
        state_path: PathBuf,

        /// Emit JSON instead of styled text.
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration.
    Config {
        /// Write the default configuration to the config path if it is absent.
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG wins over -v.  LIVEMEM_LOG_FORMAT=json switches to JSON lines
    // and OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let _guard = livemem_runtime::init_tracing("livemem", level);

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!();
        eprintln!(
            "{}",
            "⚠  Ctrl-C received – stopping after the current step …".yellow().bold()
        );
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; interrupted runs will not save partial state");
    }

    match run(cli, shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            match e {
                LiveMemError::Cancelled(_) => ExitCode::from(130),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: Cli, shutdown: Arc<AtomicBool>) -> Result<(), LiveMemError> {
    let config_path = cli.config.unwrap_or_else(config::config_path);

    match cli.command {
        Commands::Ingest {
            data_path,
            output,
            chunk_size,
            resume,
            offset,
        } => {
            let cfg = load_config(&config_path)?;
            let output = output.unwrap_or_else(|| cfg.default_state_path());
            let chunk_size = chunk_size.unwrap_or(cfg.chunk_size);
            cmd_ingest(&cfg, &data_path, &output, chunk_size, resume.as_deref(), offset, shutdown)
        }
        Commands::Query {
            state_path,
            max_new_tokens,
        } => {
            let cfg = load_config(&config_path)?;
            let max_new_tokens = max_new_tokens.unwrap_or(cfg.max_new_tokens);
            cmd_query(&cfg, &state_path, max_new_tokens, shutdown)
        }
        Commands::Inspect { state_path, json } => cmd_inspect(&state_path, json),
        Commands::Config { init } => cmd_config(&config_path, init),
    }
}

fn load_config(path: &Path) -> Result<Config, LiveMemError> {
    let cfg = config::load(path).map_err(LiveMemError::InvalidArgument)?;
    cfg.validate()?;
    Ok(cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// ingest
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_ingest(
    cfg: &Config,
    data_path: &Path,
    output: &Path,
    chunk_size: usize,
    resume: Option<&Path>,
    offset: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<(), LiveMemError> {
    config::check_chunk_size(chunk_size, &cfg.model)?;
    let text = std::fs::read_to_string(data_path)
        .map_err(|e| LiveMemError::Io(format!("{}: {e}", data_path.display())))?;
    let tokens = ByteTokenizer.encode(&text, true);
    let model = ReferenceModel::new(cfg.model.clone())?;

    let initial = match resume {
        Some(path) => {
            let state = persist::load(path, cfg.model.width)?;
            println!(
                "  Resuming from {} ({} traces) at token {}",
                path.display().to_string().bold(),
                state.len(),
                offset
            );
            Some(state)
        }
        None => None,
    };

    println!(
        "  Ingesting {} tokens from {} in windows of {}",
        tokens.len().to_string().bold(),
        data_path.display().to_string().bold(),
        chunk_size
    );

    let result = Ingestor::new(&model)
        .chunk_size(chunk_size)
        .with_cancel(shutdown)
        .on_chunk(print_progress)
        .resume(&tokens, offset, initial);

    match result {
        Ok(state) => {
            persist::save(&state, output)?;
            println!(
                "  {} Saved {} to {}",
                "✓".green().bold(),
                state.summary(),
                output.display().to_string().bold()
            );
            Ok(())
        }
        Err(IngestError::Cancelled { at, resume_state }) => {
            save_partial(resume_state.as_ref(), output, data_path, at.token_offset);
            Err(LiveMemError::Cancelled(at))
        }
        Err(IngestError::Chunk {
            at,
            resume_state,
            source,
        }) => {
            save_partial(resume_state.as_ref(), output, data_path, at.token_offset);
            Err(IngestError::Chunk {
                at,
                resume_state: None,
                source,
            }
            .into())
        }
        Err(other) => Err(other.into()),
    }
}

fn print_progress(p: &ChunkProgress) {
    println!(
        "  {} tokens {}-{} of {} → {} traces",
        format!("[chunk {}]", p.chunk_index).dimmed(),
        p.start,
        p.end,
        p.total,
        p.trace_count
    );
}

/// Persist the state of an interrupted session and tell the user how to
/// pick it up again.
fn save_partial(state: Option<&MemoryState>, output: &Path, data_path: &Path, offset: usize) {
    let Some(state) = state else {
        println!("  {}", "No chunk completed; nothing to save.".yellow());
        return;
    };
    match persist::save(state, output) {
        Ok(()) => {
            println!(
                "  {} Partial state ({} traces) saved to {}",
                "✓".green().bold(),
                state.len(),
                output.display().to_string().bold()
            );
            println!(
                "  Resume with: {}",
                format!(
                    "livemem ingest {} --output {} --resume {} --offset {}",
                    data_path.display(),
                    output.display(),
                    output.display(),
                    offset
                )
                .bold()
            );
        }
        Err(e) => println!("{}: {}", "Error saving partial state".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// query
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_query(
    cfg: &Config,
    state_path: &Path,
    max_new_tokens: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<(), LiveMemError> {
    let state = persist::load(state_path, cfg.model.width)?;
    let model = ReferenceModel::new(cfg.model.clone())?;

    print_banner();
    println!(
        "  Loaded {} from {}",
        state.summary(),
        state_path.display().to_string().bold()
    );
    println!(
        "  Type {} for commands, {} to leave.\n",
        "/help".bold().cyan(),
        "exit".bold().cyan()
    );

    repl::run(&model, state, state_path, max_new_tokens, shutdown)
}

// ─────────────────────────────────────────────────────────────────────────────
// inspect / config
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_inspect(state_path: &Path, json: bool) -> Result<(), LiveMemError> {
    let state = persist::inspect(state_path)?;
    let summary = state.summary();
    if json {
        let raw = serde_json::to_string_pretty(&summary)
            .map_err(|e| LiveMemError::Io(e.to_string()))?;
        println!("{raw}");
        return Ok(());
    }

    println!("{}", state_path.display().to_string().bold().underline());
    println!("  Schema version : {}", summary.schema_version);
    println!("  Width          : {}", summary.width);
    println!("  Traces         : {}", summary.trace_count.to_string().yellow());
    match summary.last_trace_mean {
        Some(mean) => println!("  Last trace mean: {mean:.6}"),
        None => println!("  Last trace mean: {}", "-".dimmed()),
    }
    match summary.consolidated_norm {
        Some(norm) => println!("  Consolidated   : norm {norm:.6}"),
        None => println!("  Consolidated   : {}", "none".dimmed()),
    }
    Ok(())
}

fn cmd_config(config_path: &Path, init: bool) -> Result<(), LiveMemError> {
    if init {
        if config_path.exists() {
            println!(
                "  {} already exists; leaving it untouched.",
                config_path.display().to_string().bold()
            );
        } else {
            config::save_to(&Config::default(), config_path).map_err(LiveMemError::Io)?;
            println!(
                "  {} Config written to {}",
                "✓".green().bold(),
                config_path.display().to_string().bold()
            );
        }
    }

    let cfg = config::load(config_path).map_err(LiveMemError::InvalidArgument)?;
    let raw = toml::to_string_pretty(&cfg).map_err(|e| LiveMemError::Io(e.to_string()))?;
    println!("{}", format!("# {}", config_path.display()).dimmed());
    print!("{raw}");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___              __  ___              "#.bold().cyan());
    println!("{}", r#"  / (_)  _____     /  |/  /__ __ _       "#.bold().cyan());
    println!("{}", r#" / / / |/ / -_)   / /|_/ / -_)  ' \      "#.bold().cyan());
    println!("{}", r#"/_/_/|___/\__/   /_/  /_/\__/_/_/_/      "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "livemem".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Ask questions of what the model has read");
    println!();
}
