//! Attach the local terminal to a portal gateway.
//!
//! Run with: cargo run -p portal-terminal -- --container <id>
//!
//! Ctrl+] detaches. After the shell exits or the gateway gives up, any key
//! asks for a fresh connection.

use std::{
    io::{self, Write},
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use crossterm::event::{Event, EventStream, KeyCode, KeyModifiers};
use futures::StreamExt;
use portal_core::ServerMessage;
use portal_transport::{
    ConnectionStatus, CrosstermSurface, RawModeGuard, SurfaceInput, TerminalAdapter,
    TerminalClient, translate_event,
};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "portal-terminal")]
#[command(about = "Attach this terminal to a container shell through a portal gateway")]
#[command(version)]
struct Cli {
    /// Gateway terminal socket
    #[arg(
        short = 'u',
        long,
        env = "PORTAL_URL",
        default_value = "ws://127.0.0.1:3000/api/terminal/ws"
    )]
    url: String,

    /// Container to attach to; the gateway default is used when omitted
    #[arg(short, long)]
    container: Option<String>,
}

impl Cli {
    fn socket_url(&self) -> String {
        match self.container.as_deref() {
            Some(id) if !id.is_empty() => format!("{}?containerId={id}", self.url),
            _ => self.url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let url = Cli::parse().socket_url();
    let client = Arc::new(
        TerminalClient::connect(&url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?,
    );

    let raw = RawModeGuard::enable().context("failed to enter raw mode")?;
    let result = run(&client).await;
    drop(raw);

    client.close().await;
    for entry in client.debug_log() {
        tracing::debug!("{entry}");
    }
    result
}

async fn run(client: &Arc<TerminalClient>) -> anyhow::Result<()> {
    let mounted = TerminalAdapter::mount(Arc::clone(client), CrosstermSurface::new());
    let mut keys = EventStream::new();
    let mut server = client.subscribe();

    loop {
        tokio::select! {
            event = keys.next() => {
                let Some(event) = event else { break };
                let event = event.context("failed to read terminal event")?;
                if is_detach(&event) {
                    break;
                }
                match translate_event(&event) {
                    Some(SurfaceInput::Keys(data)) => {
                        if matches!(
                            client.status(),
                            ConnectionStatus::Disconnected | ConnectionStatus::Error
                        ) {
                            notice("reconnecting...")?;
                            client.reconnect().await?;
                        } else {
                            mounted.input(data).await?;
                        }
                    }
                    Some(SurfaceInput::Resized) => mounted.layout_changed(),
                    None => {}
                }
            }
            msg = server.recv() => match msg {
                Ok(ServerMessage::Error { message }) => {
                    notice(&format!("error: {message}"))?;
                }
                Ok(ServerMessage::Disconnected { reason, .. }) => {
                    notice(&format!("disconnected: {reason}; press any key to reconnect"))?;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }

    mounted.unmount().await;
    Ok(())
}

fn is_detach(event: &Event) -> bool {
    matches!(
        event,
        Event::Key(key)
            if key.code == KeyCode::Char(']') && key.modifiers.contains(KeyModifiers::CONTROL)
    )
}

fn notice(text: &str) -> io::Result<()> {
    let mut out = io::stdout();
    write!(out, "\r\n[portal: {text}]\r\n")?;
    out.flush()
}
