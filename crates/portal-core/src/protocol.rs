//! Wire protocol for the terminal socket (browser ↔ gateway).
//!
//! Every frame is a JSON text message tagged by `type`.

use serde::{Deserialize, Serialize};

/// Message from client to gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keystrokes for the remote process's stdin.
    Input { data: String },
    /// Terminal surface size changed.
    Resize { cols: u16, rows: u16 },
    /// Manual reconnect with a fresh attempt counter.
    Reconnect,
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Create an input message.
    #[must_use]
    pub fn input(data: impl Into<String>) -> Self {
        Self::Input { data: data.into() }
    }
}

/// Message from gateway to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Raw stream attached.
    Connected {
        #[serde(rename = "containerTarget")]
        container_target: String,
    },
    /// One decoded chunk of remote output.
    Output { data: String },
    /// Remote stream ended.
    Disconnected { code: i32, reason: String },
    /// Negotiation, stream or configuration failure.
    Error { message: String },
    /// Informational progress note.
    Log { message: String },
    /// Pong response.
    Pong,
}

impl ServerMessage {
    /// Create an output message.
    #[must_use]
    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    /// Create an error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Create a log message.
    #[must_use]
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
        }
    }
}
