//! Hookgate CLI - policy hooks for an agent host
//!
//! Usage:
//!   hookgate serve                 Dispatch JSONL requests from stdin
//!   hookgate order                 Show the resolved hook order
//!   hookgate config                Print the normalized configuration
//!   hookgate loop start <session>  Arm the autopilot loop for a session
//!   hookgate loop stop             Remove the autopilot loop state
//!   hookgate loop status           Show the autopilot loop state

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use hookgate_core::config::CompletionMode;
use hookgate_core::{
    normalize, GatewayConfig, GatewayRequest, GatewayResponse, ResponseError, PROTOCOL_VERSION,
};
use hookgate_engine::{loop_state_store, AutopilotLoopState, Gateway};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::level_filters::LevelFilter;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "hookgate")]
#[command(author, version, about = "Policy hooks for agent sessions")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (JSON or TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Project directory that relative state paths resolve against
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read gateway requests from stdin, one JSON object per line
    Serve,

    /// Show the resolved hook dispatch order
    Order,

    /// Print the normalized configuration
    Config,

    /// Manage the autopilot loop
    Loop {
        #[command(subcommand)]
        action: LoopCommands,
    },
}

#[derive(Subcommand)]
enum LoopCommands {
    /// Arm the loop for a session
    Start {
        /// Session the loop belongs to
        session: String,

        /// Task description repeated in every continuation prompt
        #[arg(short = 'P', long, default_value = "")]
        prompt: String,

        /// Iteration cap (0 for unbounded; defaults to the configured cap)
        #[arg(short, long)]
        max_iterations: Option<u64>,

        /// How completion is detected
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Token expected inside <promise>...</promise>
        #[arg(long)]
        promise: Option<String>,
    },

    /// Remove the loop state
    Stop,

    /// Show the loop state
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Promise,
    Objective,
}

impl From<ModeArg> for CompletionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Promise => CompletionMode::Promise,
            ModeArg::Objective => CompletionMode::Objective,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout carries the protocol; logs go to stderr
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Serve => cmd_serve(&config, &cli.project).await,
        Commands::Order => cmd_order(&config, &cli.project),
        Commands::Config => cmd_config(&config),
        Commands::Loop { action } => cmd_loop(&config, &cli.project, action).await,
    }
}

/// Read and normalize the configuration; no file means all defaults
async fn load_config(path: Option<&Path>) -> Result<GatewayConfig> {
    let Some(path) = path else {
        return Ok(normalize(&Value::Null));
    };

    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;

    let raw: Value = if path.extension().is_some_and(|ext| ext == "toml") {
        let table: toml::Value = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
        serde_json::to_value(table).context("Failed to convert TOML config")?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON config {}", path.display()))?
    };

    debug!("Loaded config from {}", path.display());
    Ok(normalize(&raw))
}

async fn cmd_serve(config: &GatewayConfig, project: &Path) -> Result<()> {
    let gateway = Gateway::new(config, project);
    info!("Serving hooks: {}", gateway.hook_ids().join(", "));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<GatewayRequest>(&line) {
            Ok(request) => gateway.handle(request).await,
            Err(e) => {
                warn!("Rejected malformed request: {}", e);
                GatewayResponse {
                    version: PROTOCOL_VERSION,
                    ok: false,
                    output: Value::Null,
                    error: Some(ResponseError {
                        kind: "error".to_string(),
                        hook: None,
                        message: format!("request: {}", e),
                    }),
                    effects: Vec::new(),
                }
            }
        };

        let mut encoded = serde_json::to_string(&response).context("Failed to encode response")?;
        encoded.push('\n');
        stdout.write_all(encoded.as_bytes()).await?;
        stdout.flush().await?;
    }

    info!("Input closed, shutting down");
    Ok(())
}

fn cmd_order(config: &GatewayConfig, project: &Path) -> Result<()> {
    let gateway = Gateway::new(config, project);
    let ids = gateway.hook_ids();

    if ids.is_empty() {
        println!("No hooks enabled");
        return Ok(());
    }

    for (position, id) in ids.iter().enumerate() {
        println!("{:>2}. {}", position + 1, id);
    }
    Ok(())
}

fn cmd_config(config: &GatewayConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn cmd_loop(config: &GatewayConfig, project: &Path, action: LoopCommands) -> Result<()> {
    let store = loop_state_store(config, project);

    match action {
        LoopCommands::Start {
            session,
            prompt,
            max_iterations,
            mode,
            promise,
        } => {
            let defaults = &config.autopilot;
            let state = AutopilotLoopState::new(
                session,
                prompt,
                max_iterations.unwrap_or(defaults.default_max_iterations),
                mode.map_or(defaults.default_completion_mode, CompletionMode::from),
                promise.unwrap_or_else(|| defaults.default_completion_promise.clone()),
            );
            store.save(&state).await.context("Failed to save loop state")?;

            info!("Started autopilot loop for {}", state.session_id);
            println!("Autopilot loop armed for {}", state.session_id);
            println!("  State file: {}", store.path().display());
            print_limits(&state);
        }

        LoopCommands::Stop => {
            if store.clear().await.context("Failed to clear loop state")? {
                println!("Autopilot loop stopped");
            } else {
                println!("No loop in progress");
            }
        }

        LoopCommands::Status => match store.load().await.context("Failed to load loop state")? {
            Some(state) => {
                println!("Loop status for {}:", state.session_id);
                println!("  Active: {}", state.active);
                println!("  Current iteration: {}", state.iteration);
                print_limits(&state);
                let elapsed = Utc::now().signed_duration_since(state.started_at);
                println!(
                    "  Started: {} ({} min ago)",
                    state.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    elapsed.num_minutes()
                );
                if state.ignored_completions > 0 {
                    println!("  Ignored completions: {}", state.ignored_completions);
                }
                if !state.prompt.is_empty() {
                    println!();
                    println!("Task:");
                    for line in state.prompt.lines().take(20) {
                        println!("  {}", line);
                    }
                }
            }
            None => println!("No loop in progress"),
        },
    }

    Ok(())
}

fn print_limits(state: &AutopilotLoopState) {
    if state.max_iterations == 0 {
        println!("  Max iterations: unbounded");
    } else {
        println!("  Max iterations: {}", state.max_iterations);
    }
    match state.completion_mode {
        CompletionMode::Promise => {
            println!(
                "  Completion: <promise>{}</promise>",
                state.completion_promise
            )
        }
        CompletionMode::Objective => {
            println!("  Completion: <objective-complete>true</objective-complete>")
        }
    }
}
