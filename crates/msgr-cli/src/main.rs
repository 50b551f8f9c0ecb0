//! msgr — restore a Messenger web session from cookies and stream its events.

use std::path::{Path, PathBuf};

use anyhow::Context;
use msgr_runtime::{Engine, EngineConfig, Event};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn print_usage() {
    println!("msgr — Messenger session client");
    println!();
    println!("Usage: msgr <command> <appstate-file> [config.json]");
    println!();
    println!("Commands:");
    println!("  listen <appstate> [config]   Log in and print events as JSON lines");
    println!("  check <appstate> [config]    Log in, print the session status and exit");
    println!("  help                         Show this help message");
    println!();
    println!("Without a config file, settings come from MSGR_* environment variables.");
}

/// Config file when given, environment otherwise.
fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            EngineConfig::from_json(&json)?
        }
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");
    if matches!(command, "help" | "--help" | "-h") {
        print_usage();
        return Ok(());
    }

    let Some(app_state) = args.get(2).map(PathBuf::from) else {
        eprintln!("Usage: msgr {} <appstate-file> [config.json]", command);
        std::process::exit(1);
    };
    let config = load_config(args.get(3).map(Path::new))?;

    match command {
        "listen" => listen(&app_state, config).await,
        "check" => check(&app_state, config).await,
        other => {
            eprintln!("Unknown command: {}. Use 'msgr help' for usage.", other);
            std::process::exit(1);
        }
    }
}

async fn check(app_state: &Path, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::login_from_file(app_state, config).await?;
    println!("{}", serde_json::to_string_pretty(&engine.status())?);
    engine.shutdown().await;
    Ok(())
}

async fn listen(app_state: &Path, config: EngineConfig) -> anyhow::Result<()> {
    let engine = Engine::login_from_file(app_state, config).await?;
    info!("Logged in as {}", engine.user_id());

    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<Event>();
    engine.listen(move |event: Event| {
        let fatal_tx = fatal_tx.clone();
        async move {
            println!("{}", event.to_json());
            if event.is_fatal() {
                let _ = fatal_tx.send(event);
            }
        }
    })?;

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; stopping");
            0
        }
        Some(event) = fatal_rx.recv() => {
            warn!("Session ended: {}", event.to_json());
            2
        }
    };

    engine.shutdown().await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
