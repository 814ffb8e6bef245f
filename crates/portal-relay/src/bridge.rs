//! Relay bridge driver.
//!
//! One task per client connection. It feeds client commands, negotiation
//! results, retry timers and stream reads into the [`RelayMachine`] and
//! performs the actions it returns. The raw stream lives only inside the
//! driver; nothing else holds a reference to it.

use std::{collections::VecDeque, io, pin::Pin, sync::Arc};

use futures::future::{self, BoxFuture};
use portal_core::{
    ControlPlane, ExecSession, ExecSpec, GatewayConfig, NegotiationError, RetryPolicy,
    ServerMessage, StreamError,
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Sleep,
};

use crate::{
    output::OutputDecoder,
    state::{Action, Event, RelayMachine, RelayStatus},
};

/// Bytes requested per raw stream read.
pub const READ_BUFFER_LEN: usize = 8 * 1024;

const COMMAND_CHANNEL_LEN: usize = 256;

/// How the bridge starts its exec.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Command run in the container.
    pub command: Vec<String>,
    /// Attach a TTY (raw output) instead of multiplexed frames.
    pub tty: bool,
    /// Negotiation retry policy.
    pub retry: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

impl From<&GatewayConfig> for BridgeConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            command: config.shell_command.clone(),
            tty: true,
            retry: config.retry,
        }
    }
}

/// Request from the client side of a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Reconnect,
    Disconnect,
}

impl From<BridgeCommand> for Event {
    fn from(command: BridgeCommand) -> Self {
        match command {
            BridgeCommand::Input(data) => Self::Input(data),
            BridgeCommand::Resize { cols, rows } => Self::Resize { cols, rows },
            BridgeCommand::Reconnect => Self::Reconnect,
            BridgeCommand::Disconnect => Self::ClientClosed,
        }
    }
}

/// Bridge error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Relay bridge has stopped")]
    Stopped,
}

/// Client-side handle to a running bridge.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    commands: mpsc::Sender<BridgeCommand>,
    status: watch::Receiver<RelayStatus>,
}

impl BridgeHandle {
    /// Send a command to the bridge.
    ///
    /// # Errors
    /// Returns `Stopped` if the bridge task has exited.
    pub async fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| BridgeError::Stopped)
    }

    /// Forward keystrokes.
    ///
    /// # Errors
    /// Returns `Stopped` if the bridge task has exited.
    pub async fn input(&self, data: impl Into<String>) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Input(data.into())).await
    }

    /// Report a new surface size.
    ///
    /// # Errors
    /// Returns `Stopped` if the bridge task has exited.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Resize { cols, rows }).await
    }

    /// Start a fresh connection cycle.
    ///
    /// # Errors
    /// Returns `Stopped` if the bridge task has exited.
    pub async fn reconnect(&self) -> Result<(), BridgeError> {
        self.send(BridgeCommand::Reconnect).await
    }

    /// Tear the connection down. No-op if already stopped.
    pub async fn disconnect(&self) {
        let _ = self.send(BridgeCommand::Disconnect).await;
    }

    /// Latest published status.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        *self.status.borrow()
    }

    /// Whether the bridge task has exited.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the bridge task has exited.
    pub async fn stopped(&self) {
        self.commands.closed().await;
    }
}

/// Drives one relay connection.
pub struct RelayBridge {
    control: Arc<dyn ControlPlane>,
    config: BridgeConfig,
    machine: RelayMachine,
    session: Option<ExecSession>,
    resizer: Option<Resizer>,
    decoder: OutputDecoder,
    events: mpsc::Sender<ServerMessage>,
    status: watch::Sender<RelayStatus>,
}

/// Pending negotiation and retry timer.
#[derive(Default)]
struct Slots {
    negotiation: Option<BoxFuture<'static, Result<ExecSession, NegotiationError>>>,
    retry: Option<Pin<Box<Sleep>>>,
}

enum Flow {
    Continue,
    Follow(Event),
    Stop,
}

impl RelayBridge {
    /// Spawn a bridge for `target`; client events are sent to `events`.
    pub fn spawn(
        control: Arc<dyn ControlPlane>,
        target: impl Into<String>,
        config: BridgeConfig,
        events: mpsc::Sender<ServerMessage>,
    ) -> (BridgeHandle, JoinHandle<()>) {
        let machine = RelayMachine::new(target, config.retry);
        let (status_tx, status_rx) = watch::channel(machine.status());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_LEN);

        let bridge = Self {
            control,
            decoder: OutputDecoder::new(config.tty),
            config,
            machine,
            session: None,
            resizer: None,
            events,
            status: status_tx,
        };
        let task = tokio::spawn(bridge.run(command_rx));

        (
            BridgeHandle {
                commands: command_tx,
                status: status_rx,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<BridgeCommand>) {
        let mut slots = Slots::default();
        let mut buf = vec![0u8; READ_BUFFER_LEN];
        let mut pending = VecDeque::from([Event::Connect]);

        tracing::debug!(target_container = %self.machine.target(), "Relay bridge started");

        'relay: loop {
            while let Some(event) = pending.pop_front() {
                let actions = self.machine.handle(event);
                self.status.send_replace(self.machine.status());
                for action in actions {
                    match self.perform(action, &mut slots).await {
                        Flow::Continue => {}
                        Flow::Follow(event) => pending.push_back(event),
                        Flow::Stop => break 'relay,
                    }
                }
            }

            let event = tokio::select! {
                command = commands.recv() => command.map_or(Event::ClientClosed, Event::from),
                result = await_slot(&mut slots.negotiation) => {
                    slots.negotiation = None;
                    match result {
                        Ok(session) => {
                            self.decoder = OutputDecoder::new(session.tty_mode());
                            self.resizer = Some(Resizer::spawn(
                                Arc::clone(&self.control),
                                session.exec_id().to_string(),
                            ));
                            self.session = Some(session);
                            Event::NegotiationSucceeded
                        }
                        Err(e) => {
                            tracing::warn!(
                                target_container = %self.machine.target(),
                                attempt = self.machine.attempts(),
                                "Negotiation failed: {e}"
                            );
                            Event::NegotiationFailed(e.to_string())
                        }
                    }
                }
                () = await_timer(&mut slots.retry) => {
                    slots.retry = None;
                    Event::RetryTimerFired
                }
                read = read_stream(self.session.as_mut(), &mut buf) => match read {
                    Ok(0) => {
                        for chunk in self.decoder.finish() {
                            self.emit(ServerMessage::output(chunk)).await;
                        }
                        Event::StreamEnded
                    }
                    Ok(n) => match self.decoder.decode(&buf[..n]) {
                        Ok(chunks) => {
                            for chunk in chunks {
                                self.emit(ServerMessage::output(chunk)).await;
                            }
                            continue;
                        }
                        Err(e) => Event::StreamFailed(e.to_string()),
                    },
                    Err(e) => Event::StreamFailed(e.to_string()),
                },
            };
            pending.push_back(event);
        }

        tracing::debug!(target_container = %self.machine.target(), "Relay bridge stopped");
    }

    async fn perform(&mut self, action: Action, slots: &mut Slots) -> Flow {
        match action {
            Action::CancelNegotiation => slots.negotiation = None,
            Action::CancelRetry => slots.retry = None,
            Action::CloseStream => self.close_stream().await,
            Action::Negotiate => slots.negotiation = Some(self.negotiate()),
            Action::ScheduleRetry(delay) => {
                slots.retry = Some(Box::pin(tokio::time::sleep(delay)));
            }
            Action::Emit(message) => {
                if matches!(message, ServerMessage::Connected { .. }) {
                    tracing::info!(
                        target_container = %self.machine.target(),
                        exec_id = self.session.as_ref().map_or("", ExecSession::exec_id),
                        "Relay connected"
                    );
                }
                self.emit(message).await;
            }
            Action::WriteInput(data) => {
                if let Err(e) = self.write_input(&data).await {
                    tracing::error!(target_container = %self.machine.target(), "Stream write failed: {e}");
                    return Flow::Follow(Event::StreamFailed(e.to_string()));
                }
            }
            Action::ForwardResize { cols, rows } => self.forward_resize(cols, rows),
            Action::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    fn negotiate(&self) -> BoxFuture<'static, Result<ExecSession, NegotiationError>> {
        let control = Arc::clone(&self.control);
        let target = self.machine.target().to_string();
        let spec = ExecSpec {
            command: self.config.command.clone(),
            attach_stdin: true,
            tty: self.config.tty,
        };
        let events = self.events.clone();

        Box::pin(async move {
            let _ = events
                .send(ServerMessage::log("Creating shell session..."))
                .await;
            let exec_id = control.create_exec(&target, &spec).await?;

            let _ = events
                .send(ServerMessage::log("Shell session created, connecting..."))
                .await;
            let stream = control.start_exec(&exec_id, spec.tty).await?;

            Ok(ExecSession::new(exec_id, target, spec.tty, stream))
        })
    }

    async fn emit(&self, message: ServerMessage) {
        if self.events.send(message).await.is_err() {
            tracing::debug!(target_container = %self.machine.target(), "Client event receiver dropped");
        }
    }

    async fn close_stream(&mut self) {
        self.resizer = None;
        if let Some(mut session) = self.session.take() {
            if session.close().await {
                tracing::debug!(exec_id = session.exec_id(), "Exec stream closed");
            }
        }
    }

    async fn write_input(&mut self, data: &str) -> Result<(), StreamError> {
        let stream = self
            .session
            .as_mut()
            .and_then(ExecSession::stream_mut)
            .ok_or(StreamError::Closed)?;
        stream.write_all(data.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    fn forward_resize(&self, cols: u16, rows: u16) {
        if let Some(resizer) = &self.resizer {
            resizer.forward(cols, rows);
        }
    }
}

/// Forwards resizes for one exec on its own task, in receipt order, so a
/// slow control plane never stalls the relay. Dropping it abandons
/// whatever is still queued.
struct Resizer {
    sizes: mpsc::UnboundedSender<(u16, u16)>,
    task: JoinHandle<()>,
}

impl Resizer {
    fn spawn(control: Arc<dyn ControlPlane>, exec_id: String) -> Self {
        let (sizes, mut queued) = mpsc::unbounded_channel::<(u16, u16)>();
        let task = tokio::spawn(async move {
            while let Some((cols, rows)) = queued.recv().await {
                if let Err(e) = control.resize_exec(&exec_id, cols, rows).await {
                    tracing::warn!(exec_id, cols, rows, "Resize failed: {e}");
                }
            }
        });
        Self { sizes, task }
    }

    fn forward(&self, cols: u16, rows: u16) {
        let _ = self.sizes.send((cols, rows));
    }
}

impl Drop for Resizer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn await_slot<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

async fn await_timer(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot {
        Some(sleep) => sleep.as_mut().await,
        None => future::pending().await,
    }
}

async fn read_stream(session: Option<&mut ExecSession>, buf: &mut [u8]) -> io::Result<usize> {
    match session.and_then(ExecSession::stream_mut) {
        Some(stream) => stream.read(buf).await,
        None => future::pending().await,
    }
}
