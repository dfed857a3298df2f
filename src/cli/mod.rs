//! Command-line interface for agentkit.
//!
//! Provides commands for serving the engine over HTTP, triggering runs,
//! checking status, reading event logs and uploading files.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::EchoAgent;
use crate::config::{self, Config};
use crate::core::{Engine, EventLog, JsonlEventLog, RunStore};
use crate::domain::{Event, EventKind, InputValue, RunInputs, RunStatus};

/// agentkit - Event-sourced run engine for agent UIs
#[derive(Parser, Debug)]
#[command(name = "agentkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the engine over HTTP
    Serve {
        /// Address to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Trigger a run and wait for it to finish
    Trigger {
        /// Input value as key=value (repeatable)
        #[arg(short, long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,

        /// File to upload and pass as the `files` input (repeatable)
        #[arg(short, long = "file")]
        files: Vec<PathBuf>,

        /// Print events as they happen
        #[arg(long)]
        follow: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// Print a run's events as JSON lines
    Logs {
        /// Run ID (UUID)
        run_id: String,

        /// First sequence number to print
        #[arg(long, default_value = "0")]
        from: u64,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Upload a file for use as a run input
    Upload {
        /// File to upload
        path: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = config::load_config()?;

        match self.command {
            Commands::Serve { host, port } => serve(config, host, port).await,
            Commands::Trigger {
                inputs,
                files,
                follow,
            } => trigger(config, inputs, files, follow).await,
            Commands::Status { run_id } => show_status(&config, &run_id).await,
            Commands::Logs { run_id, from } => show_logs(&config, &run_id, from).await,
            Commands::Runs { limit } => list_runs(&config, limit).await,
            Commands::Upload { path } => upload(config, &path).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Parse `key=value`
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_run_id(run_id: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id).with_context(|| format!("Invalid run ID: {}", run_id))
}

async fn open_engine(config: Config) -> Result<Engine> {
    Engine::open(config, Arc::new(EchoAgent::new()))
        .await
        .context("Failed to open engine")
}

/// Serve until Ctrl-C
async fn serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr()))?;

    let engine = Arc::new(open_engine(config).await?);
    crate::server::serve(engine, addr).await
}

/// Trigger a run in-process and wait for its outcome
async fn trigger(
    config: Config,
    pairs: Vec<(String, String)>,
    files: Vec<PathBuf>,
    follow: bool,
) -> Result<()> {
    let engine = open_engine(config).await?;

    let mut inputs: RunInputs = pairs
        .into_iter()
        .map(|(key, value)| (key, InputValue::Text(value)))
        .collect();

    if !files.is_empty() {
        let mut refs = Vec::new();
        for path in &files {
            refs.push(upload_file(&engine, path).await?);
        }
        inputs.insert("files".to_string(), InputValue::Files(refs));
    }

    let run_id = engine.create_run(inputs).await?;
    eprintln!("[Run {} created]", run_id);

    if follow {
        let mut stream = engine.open_stream(run_id, 0).await?;
        while let Some(event) = stream.next().await {
            print_event(&event?);
        }
    }

    let status = engine.wait_for(run_id).await?;
    let run = engine.get_run(run_id).await?;

    match status {
        RunStatus::Completed => {
            if !follow {
                let events = engine.read_log(run_id).await?;
                if let Some(Event {
                    kind: EventKind::Final { text, artifacts },
                    ..
                }) = events.last()
                {
                    println!("{}", text);
                    for artifact in artifacts {
                        eprintln!("  artifact: {} ({})", artifact.name, artifact.path.display());
                    }
                }
            }
            eprintln!("\n[Run {} completed successfully]", run_id);
        }
        _ => {
            eprintln!(
                "\n[Run {} {}: {}]",
                run_id,
                status,
                run.error.as_deref().unwrap_or("unknown error")
            );
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn upload_file(engine: &Engine, path: &PathBuf) -> Result<crate::domain::FileRef> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid file name: {}", path.display()))?;

    Ok(engine.save_upload(name, "", &bytes).await?)
}

/// Upload a file and print its reference
async fn upload(config: Config, path: &PathBuf) -> Result<()> {
    let engine = open_engine(config).await?;
    let file = upload_file(&engine, path).await?;

    println!("{}", serde_json::to_string_pretty(&file)?);
    Ok(())
}

/// Show the status of a run
async fn show_status(config: &Config, run_id: &str) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let store = RunStore::open(&config.database_path())?;

    let run = store
        .get_run(run_id)
        .await?
        .with_context(|| format!("Run not found: {}", run_id))?;

    println!("Run ID:   {}", run.id);
    println!("Status:   {}", run.status);
    println!("Created:  {}", run.created_at);
    if let Some(started) = run.started_at {
        println!("Started:  {}", started);
    }
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished);
    }
    if let Some(error) = &run.error {
        println!("Error:    {}", error);
    }
    println!("\nInputs:");
    for (field, value) in &run.inputs {
        match value {
            InputValue::Text(text) => println!("  {}: {}", field, text),
            InputValue::Flag(flag) => println!("  {}: {}", field, flag),
            InputValue::Files(files) => {
                let names: Vec<&str> = files.iter().map(|f| f.original_name.as_str()).collect();
                println!("  {}: [{}]", field, names.join(", "));
            }
        }
    }

    Ok(())
}

/// Print a run's log without opening the engine
async fn show_logs(config: &Config, run_id: &str, from: u64) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let log = JsonlEventLog::new(config.runs_dir());

    let events = log.read_range(run_id, from).await?;
    if events.is_empty() {
        eprintln!("No events for run {}", run_id);
    }
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }

    Ok(())
}

/// List recent runs
async fn list_runs(config: &Config, limit: usize) -> Result<()> {
    let store = RunStore::open(&config.database_path())?;
    let runs = store.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<25}", "RUN ID", "STATUS", "CREATED");
    println!("{}", "-".repeat(75));

    for run in runs {
        println!(
            "{:<38} {:<12} {:<25}",
            run.id,
            run.status,
            run.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

fn print_event(event: &Event) {
    match &event.kind {
        EventKind::Token { text } => println!("[{}] token: {}", event.seq, text),
        EventKind::ToolStart { tool, input } => {
            println!("[{}] tool_start {}: {}", event.seq, tool, input)
        }
        EventKind::ToolEnd { tool, output } => {
            println!("[{}] tool_end {}: {}", event.seq, tool, output)
        }
        EventKind::Final { text, artifacts } => {
            println!("[{}] final: {}", event.seq, text);
            for artifact in artifacts {
                println!("    artifact: {} ({})", artifact.name, artifact.path.display());
            }
        }
        EventKind::Error { message } => println!("[{}] error: {}", event.seq, message),
    }
}

/// Show resolved configuration
fn show_config(cfg: &Config) -> Result<()> {
    println!("agentkit configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Data:     {}", cfg.data_dir.display());
    println!("  Runs:     {}", cfg.runs_dir().display());
    println!("  Uploads:  {}", cfg.uploads_dir().display());
    println!("  Database: {}", cfg.database_path().display());
    println!();
    println!("Engine:");
    println!("  Subscriber buffer: {} events", cfg.engine.subscriber_buffer);
    println!("  Max active runs:   {}", cfg.engine.max_active_runs);
    println!("  Run timeout:       {}s", cfg.engine.run_timeout_seconds);
    println!("  Shutdown grace:    {}s", cfg.engine.shutdown_grace_seconds);
    println!();
    println!("Inputs:");
    if cfg.inputs.required.is_empty() {
        println!("  Required:       (none)");
    } else {
        println!("  Required:       {}", cfg.inputs.required.join(", "));
    }
    println!("  Max input size: {} bytes", cfg.inputs.max_input_bytes);
    println!("  Denylist:       {}", cfg.inputs.denylist_patterns.join(", "));
    println!();
    println!("Server: {}", cfg.listen_addr());

    Ok(())
}
