//! AgentDock command line
//!
//! Thin operator front end over `agentdock-core`: scan an agents directory,
//! chat with one agent from the terminal, or print the effective settings.

use agentdock_core::{AdapterSettings, AgentDescriptor, SessionOrchestrator};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "agentdock")]
#[command(about = "AgentDock - run heterogeneous agents behind one session API")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to the user config dir when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify every agent directory under DIR
    Scan {
        /// Agents directory, defaults to the configured one
        dir: Option<PathBuf>,
        /// Print descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Start a session and relay stdin lines to it
    Chat {
        agent_id: String,
        /// Agents directory, defaults to the configured one
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Session config entry, exported to the agent as an env var
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
        set: Vec<(String, String)>,
    },
    /// Print the effective settings as JSON
    Probe,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{}`", raw)),
    }
}

fn load_settings(explicit: Option<&PathBuf>) -> anyhow::Result<AdapterSettings> {
    let path = match explicit {
        Some(path) => Some(path.clone()),
        None => AdapterSettings::default_path().filter(|p| p.exists()),
    };

    AdapterSettings::load(path.as_deref())
        .with_context(|| format!("Failed to load settings from {:?}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays parseable
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Scan { dir, json } => handle_scan(settings, dir, json),
        Commands::Chat { agent_id, dir, set } => handle_chat(settings, agent_id, dir, set).await,
        Commands::Probe => handle_probe(&settings),
    }
}

fn handle_scan(settings: AdapterSettings, dir: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let root = dir.unwrap_or_else(|| settings.agents_dir.clone());
    let orchestrator = SessionOrchestrator::new(settings);
    let descriptors = orchestrator.scan(&root)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    for descriptor in &descriptors {
        print_descriptor(descriptor);
    }
    println!("{} agents in {}", descriptors.len(), root.display());
    Ok(())
}

fn print_descriptor(descriptor: &AgentDescriptor) {
    println!(
        "{:<32} {:<16} {}",
        descriptor.id,
        descriptor.kind.as_str(),
        descriptor.entry_file.as_deref().unwrap_or("-")
    );
    if !descriptor.description.is_empty() {
        println!("    {}", descriptor.description);
    }
}

async fn handle_chat(
    settings: AdapterSettings,
    agent_id: String,
    dir: Option<PathBuf>,
    set: Vec<(String, String)>,
) -> anyhow::Result<()> {
    let root = dir.unwrap_or_else(|| settings.agents_dir.clone());
    let orchestrator = SessionOrchestrator::new(settings);
    orchestrator.scan(&root)?;

    if orchestrator.descriptor(&agent_id).is_none() {
        bail!("No agent `{}` under {}", agent_id, root.display());
    }

    let config: HashMap<String, String> = set.into_iter().collect();
    let session = orchestrator.create_session(&agent_id, config).await?;
    info!(
        "Session {} started for {} ({})",
        session.session_id, session.agent_id, session.kind
    );

    let result = chat_loop(&orchestrator, &session.session_id).await;

    if let Err(e) = orchestrator.end_session(&session.session_id).await {
        warn!("Failed to end session: {}", e);
    }
    let report = orchestrator.cleanup_all().await;
    if !report.is_clean() {
        warn!("{} sessions failed to stop cleanly", report.failures.len());
    }

    result
}

async fn chat_loop(orchestrator: &SessionOrchestrator, session_id: &str) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let message = line.trim();
        if message.is_empty() {
            continue;
        }

        match orchestrator.send_message(session_id, message).await {
            Ok(reply) => {
                stdout.write_all(reply.reply.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            Err(e) => {
                let error = serde_json::to_string(&e)?;
                stdout.write_all(error.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
        }
    }

    Ok(())
}

fn handle_probe(settings: &AdapterSettings) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
