//! # Voice Session CLI
//!
//! Connects to a voice pipeline backend with headless audio devices and
//! prints every session event as a JSON line. Lines typed on stdin are sent
//! as text input; `/barge` interrupts the assistant and `/commit` ends the
//! current utterance.
//!
//! ## Usage:
//! ```text
//! voice-session [--config <file>] [--conversation <id>] [--print-config]
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_session_engine::audio::devices::{HeadlessDevices, OutputClock};
use voice_session_engine::transport::websocket::WebSocketConnector;
use voice_session_engine::{EngineConfig, SessionEvent, SessionHandle, SessionRuntime};

#[derive(Debug, Parser)]
#[command(
    name = "voice-session",
    about = "Talk to a voice pipeline backend from the terminal",
    version
)]
struct CliArgs {
    #[arg(long, help = "Configuration file layered over the defaults (voice.toml when omitted)")]
    config: Option<String>,

    #[arg(long, help = "Conversation to join instead of server.conversation_id")]
    conversation: Option<String>,

    #[arg(long = "print-config", help = "Print the effective configuration as TOML and exit")]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = EngineConfig::load(args.config.as_deref())?;
    config.validate()?;

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!(url = %config.server.url, "Configuration loaded");

    let devices = HeadlessDevices::new(OutputClock::Wall);
    let (handle, mut events, task) =
        SessionRuntime::spawn(config, Box::new(devices), Arc::new(WebSocketConnector::new()));

    handle.connect(args.conversation).await?;

    let input = tokio::spawn(read_stdin(handle.clone()));
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.next() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, disconnecting...");
                handle.shutdown();
                break;
            }
        }
    }

    input.abort();
    if let Err(e) = task.await {
        error!("Session task error: {}", e);
    }
    info!("Session stopped");
    Ok(())
}

fn print_event(event: &SessionEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, "failed to render event"),
    }
}

async fn read_stdin(handle: SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let result = match line {
            "" => continue,
            "/barge" => {
                handle.barge_in();
                Ok(())
            }
            "/commit" => handle.commit_audio().await,
            "/quit" => {
                handle.shutdown();
                return;
            }
            text => handle.send_text(text).await,
        };
        if let Err(e) = result {
            warn!(error = %e, "command rejected");
        }
    }
}

/// Initialize the tracing system.
///
/// `RUST_LOG` controls filtering; it defaults to
/// `voice_session_engine=debug,voice_session=debug,tokio_tungstenite=info`.
/// Logs go to stderr so stdout carries only events.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "voice_session_engine=debug,voice_session=debug,tokio_tungstenite=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let args = CliArgs::try_parse_from([
            "voice-session",
            "--config",
            "staging.toml",
            "--conversation",
            "conv-1",
            "--print-config",
        ])
        .unwrap();
        assert_eq!(args.config.as_deref(), Some("staging.toml"));
        assert_eq!(args.conversation.as_deref(), Some("conv-1"));
        assert!(args.print_config);

        assert!(CliArgs::try_parse_from(["voice-session", "--bogus"]).is_err());
    }
}
