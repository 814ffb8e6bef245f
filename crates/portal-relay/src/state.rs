//! Relay connection state machine.
//!
//! [`RelayMachine::handle`] is a pure transition: it takes an event and
//! returns the side effects the driver must perform, in order. It never does
//! I/O, so retry and backoff behavior can be exercised without sockets.

use std::time::Duration;

use portal_core::{RetryPolicy, ServerMessage};
use serde::{Deserialize, Serialize};

/// Relay connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    /// Negotiating, or waiting out a retry delay.
    Connecting,
    /// Raw stream attached; bytes flow both ways.
    Connected,
    /// Remote stream ended or the client went away.
    Disconnected,
    /// Retries exhausted or stream I/O failed.
    Errored,
}

impl RelayState {
    /// Whether the current exec session is over.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Errored)
    }
}

/// State plus retry bookkeeping, as published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStatus {
    pub state: RelayState,
    /// Failed negotiations since the last fresh cycle.
    pub attempts: u32,
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// First connection on accept.
    Connect,
    /// Client asked for a fresh cycle.
    Reconnect,
    /// Exec created and started.
    NegotiationSucceeded,
    /// Exec create or start failed.
    NegotiationFailed(String),
    /// Backoff delay elapsed.
    RetryTimerFired,
    /// Remote stream reached EOF.
    StreamEnded,
    /// Remote stream read or write failed.
    StreamFailed(String),
    /// Keystrokes from the client.
    Input(String),
    /// Client surface resized.
    Resize { cols: u16, rows: u16 },
    /// Client connection closed.
    ClientClosed,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Drop any in-flight negotiation.
    CancelNegotiation,
    /// Drop any pending retry timer.
    CancelRetry,
    /// Close the current raw stream, if any.
    CloseStream,
    /// Begin a create/start negotiation.
    Negotiate,
    /// Arm the retry timer.
    ScheduleRetry(Duration),
    /// Send an event to the client.
    Emit(ServerMessage),
    /// Write to the remote stdin.
    WriteInput(String),
    /// Forward a resize to the control plane.
    ForwardResize { cols: u16, rows: u16 },
    /// Stop the driver.
    Shutdown,
}

/// Relay state machine for one client connection.
#[derive(Debug, Clone)]
pub struct RelayMachine {
    target: String,
    policy: RetryPolicy,
    state: RelayState,
    attempts: u32,
}

impl RelayMachine {
    /// Create a machine for `target`. Starts in `Connecting` until the
    /// driver feeds [`Event::Connect`].
    pub fn new(target: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            target: target.into(),
            policy,
            state: RelayState::Connecting,
            attempts: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RelayState {
        self.state
    }

    /// Failed attempts in the current cycle.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Snapshot for observers.
    #[must_use]
    pub const fn status(&self) -> RelayStatus {
        RelayStatus {
            state: self.state,
            attempts: self.attempts,
        }
    }

    /// Target container.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Apply `event` and return the actions to perform.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        use RelayState::{Connected, Connecting};

        match (self.state, event) {
            (_, Event::Connect) => self.fresh_cycle(Vec::new()),
            (_, Event::Reconnect) => {
                self.fresh_cycle(vec![Action::Emit(ServerMessage::log("Reconnecting..."))])
            }

            (Connecting, Event::NegotiationSucceeded) => {
                self.state = Connected;
                self.attempts = 0;
                vec![Action::Emit(ServerMessage::Connected {
                    container_target: self.target.clone(),
                })]
            }
            (Connecting, Event::NegotiationFailed(reason)) => self.negotiation_failed(reason),
            (Connecting, Event::RetryTimerFired) => vec![Action::Negotiate],

            (Connected, Event::StreamEnded) => {
                self.state = RelayState::Disconnected;
                vec![
                    Action::CloseStream,
                    Action::Emit(ServerMessage::Disconnected {
                        code: 0,
                        reason: "Stream closed".to_string(),
                    }),
                ]
            }
            (Connected, Event::StreamFailed(reason)) => {
                self.state = RelayState::Errored;
                vec![
                    Action::CloseStream,
                    Action::Emit(ServerMessage::error(format!("Stream error: {reason}"))),
                ]
            }
            (Connected, Event::Input(data)) => vec![Action::WriteInput(data)],
            (Connected, Event::Resize { cols, rows }) => {
                vec![Action::ForwardResize { cols, rows }]
            }

            (_, Event::ClientClosed) => {
                if !self.state.is_terminal() {
                    self.state = RelayState::Disconnected;
                }
                vec![
                    Action::CancelRetry,
                    Action::CancelNegotiation,
                    Action::CloseStream,
                    Action::Shutdown,
                ]
            }

            // Input and resize outside `Connected` are dropped, as are stale
            // negotiation and stream events.
            _ => Vec::new(),
        }
    }

    fn fresh_cycle(&mut self, mut actions: Vec<Action>) -> Vec<Action> {
        self.state = RelayState::Connecting;
        self.attempts = 0;
        actions.extend([
            Action::CancelRetry,
            Action::CancelNegotiation,
            Action::CloseStream,
            Action::Negotiate,
        ]);
        actions
    }

    fn negotiation_failed(&mut self, reason: String) -> Vec<Action> {
        if self.attempts < self.policy.max_retries {
            self.attempts += 1;
            let delay = self.policy.delay_for(self.attempts);
            vec![
                Action::Emit(ServerMessage::error(reason)),
                Action::Emit(ServerMessage::log(format!(
                    "Retrying in {}ms (attempt {}/{})...",
                    delay.as_millis(),
                    self.attempts,
                    self.policy.max_retries
                ))),
                Action::ScheduleRetry(delay),
            ]
        } else {
            self.state = RelayState::Errored;
            vec![Action::Emit(ServerMessage::error(format!(
                "Connection failed after {} retries: {reason}",
                self.policy.max_retries
            )))]
        }
    }
}
