//! Client side of the terminal socket.
//!
//! [`TerminalClient`] owns the connection and outlives any surface drawn on
//! it. [`TerminalAdapter::mount`] attaches a [`TerminalSurface`]: history is
//! replayed first, then live output, while size changes flow back as
//! `resize` messages. Unmounting disposes the surface and leaves the
//! connection open, so a later mount replays the same history.

use std::{
    collections::VecDeque,
    io,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Local};
use futures::{SinkExt, StreamExt, future};
use portal_core::{ClientMessage, OutputStore, ServerMessage};
use thiserror::Error;
use tokio::{
    sync::{Notify, broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::Sleep,
};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

/// Debug log entries kept per client.
pub const DEBUG_LOG_LEN: usize = 50;

/// Coalescing window for layout changes, about one animation frame.
pub const FRAME_DELAY: Duration = Duration::from_millis(16);

/// Delay before the size is sent once more after a change.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

const OUTGOING_CHANNEL_LEN: usize = 256;
const EVENT_CHANNEL_LEN: usize = 1024;

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Connection closed")]
    Closed,
}

/// Connection status as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Timestamped debug log line.
#[derive(Debug, Clone)]
pub struct DebugEntry {
    pub at: DateTime<Local>,
    pub message: String,
}

impl std::fmt::Display for DebugEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.at.format("%H:%M:%S"), self.message)
    }
}

/// Mutable view of the connection, updated from server events.
#[derive(Debug)]
struct ClientState {
    status: ConnectionStatus,
    last_error: Option<String>,
    container_target: Option<String>,
    log: VecDeque<DebugEntry>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            last_error: None,
            container_target: None,
            log: VecDeque::with_capacity(DEBUG_LOG_LEN),
        }
    }

    fn note(&mut self, message: impl Into<String>) {
        if self.log.len() == DEBUG_LOG_LEN {
            self.log.pop_front();
        }
        self.log.push_back(DebugEntry {
            at: Local::now(),
            message: message.into(),
        });
    }

    fn apply(&mut self, msg: &ServerMessage) {
        match msg {
            ServerMessage::Connected { container_target } => {
                self.status = ConnectionStatus::Connected;
                self.last_error = None;
                self.container_target = Some(container_target.clone());
                self.note(format!("Connected to {container_target}"));
            }
            ServerMessage::Disconnected { code, reason } => {
                self.status = ConnectionStatus::Disconnected;
                self.note(format!("Disconnected ({code}): {reason}"));
            }
            ServerMessage::Error { message } => {
                self.status = ConnectionStatus::Error;
                self.last_error = Some(message.clone());
                self.note(format!("Error: {message}"));
            }
            ServerMessage::Log { message } => self.note(message.clone()),
            ServerMessage::Output { .. } | ServerMessage::Pong => {}
        }
    }

    fn socket_closed(&mut self) {
        if self.status != ConnectionStatus::Error {
            self.status = ConnectionStatus::Disconnected;
        }
        self.note("Socket closed");
    }
}

/// Connection to a terminal gateway.
pub struct TerminalClient {
    outgoing: mpsc::Sender<WsMessage>,
    state: Arc<Mutex<ClientState>>,
    output: Arc<OutputStore>,
    events: broadcast::Sender<ServerMessage>,
    tasks: [JoinHandle<()>; 2],
}

impl TerminalClient {
    /// Connect to a gateway socket URL, e.g.
    /// `ws://127.0.0.1:3000/api/terminal/ws?containerId=box`.
    ///
    /// # Errors
    /// Returns error if the socket handshake fails.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _) = tokio_tungstenite::connect_async(url).await?;
        let (mut sink, mut stream) = socket.split();

        let state = Arc::new(Mutex::new(ClientState::new()));
        let output = Arc::new(OutputStore::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_LEN);
        let (outgoing, mut outgoing_rx) = mpsc::channel::<WsMessage>(OUTGOING_CHANNEL_LEN);

        lock(&state).note(format!("Socket opened: {url}"));
        tracing::debug!(url, "Terminal socket opened");

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!("Terminal socket write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = {
            let state = Arc::clone(&state);
            let output = Arc::clone(&output);
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    let text = match msg {
                        Ok(WsMessage::Text(text)) => text,
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            let mut state = lock(&state);
                            state.last_error = Some(e.to_string());
                            state.note(format!("Socket error: {e}"));
                            break;
                        }
                    };
                    let msg: ServerMessage = match serde_json::from_str(text.as_str()) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!("Invalid server message: {e}");
                            continue;
                        }
                    };
                    if let ServerMessage::Output { data } = &msg {
                        output.push(data.clone());
                    }
                    lock(&state).apply(&msg);
                    let _ = events.send(msg);
                }
                lock(&state).socket_closed();
                tracing::debug!("Terminal socket closed");
            })
        };

        Ok(Self {
            outgoing,
            state,
            output,
            events,
            tasks: [reader, writer],
        })
    }

    /// Send a client message.
    ///
    /// # Errors
    /// Returns `Closed` once the socket writer has stopped.
    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let json = serde_json::to_string(msg)?;
        self.outgoing
            .send(WsMessage::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Send keystrokes.
    ///
    /// # Errors
    /// Returns `Closed` once the socket writer has stopped.
    pub async fn input(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.send(&ClientMessage::input(data)).await
    }

    /// Report the surface size.
    ///
    /// # Errors
    /// Returns `Closed` once the socket writer has stopped.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(&ClientMessage::Resize { cols, rows }).await
    }

    /// Ask the gateway for a fresh connection cycle.
    ///
    /// # Errors
    /// Returns `Closed` once the socket writer has stopped.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        {
            let mut state = lock(&self.state);
            state.status = ConnectionStatus::Connecting;
            state.last_error = None;
            state.note("Manual reconnect requested");
        }
        self.send(&ClientMessage::Reconnect).await
    }

    /// Keepalive ping.
    ///
    /// # Errors
    /// Returns `Closed` once the socket writer has stopped.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    /// Close the socket.
    pub async fn close(&self) {
        let _ = self.outgoing.send(WsMessage::Close(None)).await;
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    /// Container named by the last `connected` event.
    #[must_use]
    pub fn container_target(&self) -> Option<String> {
        lock(&self.state).container_target.clone()
    }

    /// Debug log, oldest first.
    #[must_use]
    pub fn debug_log(&self) -> Vec<DebugEntry> {
        lock(&self.state).log.iter().cloned().collect()
    }

    /// Output history shared by every mounted surface.
    #[must_use]
    pub const fn output(&self) -> &Arc<OutputStore> {
        &self.output
    }

    /// Every server message received from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }
}

impl Drop for TerminalClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TerminalClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalClient")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn lock(state: &Mutex<ClientState>) -> std::sync::MutexGuard<'_, ClientState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A visible terminal the adapter draws on.
pub trait TerminalSurface: Send + 'static {
    /// Write output text.
    ///
    /// # Errors
    /// Returns error if the surface cannot be written.
    fn write(&mut self, data: &str) -> io::Result<()>;

    /// Measured size as `(cols, rows)`.
    ///
    /// # Errors
    /// Returns error if the surface cannot be measured.
    fn size(&self) -> io::Result<(u16, u16)>;

    /// Release the surface.
    fn dispose(&mut self) {}
}

/// Remembers the last size sent so unchanged measurements are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResizeTracker {
    last: Option<(u16, u16)>,
}

impl ResizeTracker {
    /// Record a measurement; returns it if it differs from the last one.
    /// Zero-sized measurements are ignored.
    pub fn observe(&mut self, cols: u16, rows: u16) -> Option<(u16, u16)> {
        if cols == 0 || rows == 0 || self.last == Some((cols, rows)) {
            return None;
        }
        self.last = Some((cols, rows));
        self.last
    }

    /// Record a measurement and return it unconditionally, unless zero-sized.
    pub fn force(&mut self, cols: u16, rows: u16) -> Option<(u16, u16)> {
        if cols == 0 || rows == 0 {
            return None;
        }
        self.last = Some((cols, rows));
        self.last
    }

    #[must_use]
    pub const fn last(&self) -> Option<(u16, u16)> {
        self.last
    }
}

/// Attaches surfaces to a client.
#[derive(Debug, Clone, Copy)]
pub struct TerminalAdapter;

impl TerminalAdapter {
    /// Mount `surface` on `client`.
    pub fn mount<S: TerminalSurface>(client: Arc<TerminalClient>, surface: S) -> MountedTerminal<S> {
        let layout = Arc::new(Notify::new());
        let (unmount_tx, unmount_rx) = oneshot::channel();
        let task = tokio::spawn(drive(
            Arc::clone(&client),
            surface,
            Arc::clone(&layout),
            unmount_rx,
        ));
        MountedTerminal {
            client,
            layout,
            unmount: Some(unmount_tx),
            task,
        }
    }
}

/// A surface currently attached to a client.
pub struct MountedTerminal<S> {
    client: Arc<TerminalClient>,
    layout: Arc<Notify>,
    unmount: Option<oneshot::Sender<()>>,
    task: JoinHandle<S>,
}

impl<S: TerminalSurface> MountedTerminal<S> {
    /// Forward keystrokes typed on the surface.
    ///
    /// # Errors
    /// Returns `Closed` once the socket writer has stopped.
    pub async fn input(&self, data: impl Into<String>) -> Result<(), ClientError> {
        self.client.input(data).await
    }

    /// The surface's container changed size; re-measure on the next frame.
    pub fn layout_changed(&self) {
        self.layout.notify_one();
    }

    #[must_use]
    pub const fn client(&self) -> &Arc<TerminalClient> {
        &self.client
    }

    /// Detach and dispose the surface. The connection stays open.
    ///
    /// Returns the disposed surface, or `None` if its task panicked.
    pub async fn unmount(mut self) -> Option<S> {
        if let Some(tx) = self.unmount.take() {
            let _ = tx.send(());
        }
        (&mut self.task).await.ok()
    }
}

async fn drive<S: TerminalSurface>(
    client: Arc<TerminalClient>,
    mut surface: S,
    layout: Arc<Notify>,
    mut unmount: oneshot::Receiver<()>,
) -> S {
    let mut output = client.output().history_plus_stream();
    let mut events = client.subscribe();
    let mut tracker = ResizeTracker::default();
    let mut frame: Option<Pin<Box<Sleep>>> = None;
    let mut settle: Option<Pin<Box<Sleep>>> = Some(Box::pin(tokio::time::sleep(SETTLE_DELAY)));

    send_size(&client, surface.size(), &mut tracker, false).await;

    loop {
        tokio::select! {
            _ = &mut unmount => break,
            Some(chunk) = output.next() => {
                if let Err(e) = surface.write(&chunk) {
                    tracing::warn!("Surface write failed: {e}");
                }
            }
            Ok(event) = events.recv() => {
                // Resizes sent before the bridge connected were dropped.
                if matches!(event, ServerMessage::Connected { .. }) {
                    send_size(&client, surface.size(), &mut tracker, true).await;
                }
            }
            () = layout.notified() => {
                if frame.is_none() {
                    frame = Some(Box::pin(tokio::time::sleep(FRAME_DELAY)));
                }
            }
            () = await_timer(&mut frame) => {
                frame = None;
                if send_size(&client, surface.size(), &mut tracker, false).await {
                    settle = Some(Box::pin(tokio::time::sleep(SETTLE_DELAY)));
                }
            }
            () = await_timer(&mut settle) => {
                settle = None;
                send_size(&client, surface.size(), &mut tracker, true).await;
            }
        }
    }

    surface.dispose();
    surface
}

/// Send a fresh measurement; returns whether a resize went out.
///
/// The surface is measured by the caller so no borrow of it is held
/// across the send.
async fn send_size(
    client: &TerminalClient,
    measured: io::Result<(u16, u16)>,
    tracker: &mut ResizeTracker,
    force: bool,
) -> bool {
    let (cols, rows) = match measured {
        Ok(size) => size,
        Err(e) => {
            tracing::debug!("Surface size unavailable: {e}");
            return false;
        }
    };
    let next = if force {
        tracker.force(cols, rows)
    } else {
        tracker.observe(cols, rows)
    };
    let Some((cols, rows)) = next else {
        return false;
    };
    if let Err(e) = client.resize(cols, rows).await {
        tracing::debug!(cols, rows, "Resize not sent: {e}");
        return false;
    }
    true
}

async fn await_timer(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}
