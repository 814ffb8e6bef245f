//! Error taxonomy for the terminal relay.

use std::{io, time::Duration};

use thiserror::Error;

/// Control-plane negotiation failed.
///
/// Triggers the bridge's bounded retry policy.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("Failed to create exec: {status} {body}")]
    ExecCreate { status: u16, body: String },
    #[error("Docker exec start failed: {status} {message}")]
    ExecStart { status: u16, message: String },
    #[error("Docker API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("Malformed control-plane response: {0}")]
    MalformedResponse(String),
    #[error("Invalid container target: {0:?}")]
    InvalidTarget(String),
    #[error("Docker socket not found at {0}")]
    SocketNotFound(String),
    #[error("Control-plane request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Control-plane I/O error: {0}")]
    Io(#[from] io::Error),
}

/// I/O failure on an established raw stream.
///
/// Never retried automatically.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Stream is closed")]
    Closed,
}

/// Required configuration is missing or invalid.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Container ID is required. Set OPENCODE_CONTAINER env variable.")]
    MissingTarget,
    #[error("Invalid control-plane address: {0}")]
    InvalidControlPlane(String),
    #[error("Invalid bind address: {0}")]
    InvalidBind(String),
}

/// Best-effort resize failed. Logged only.
#[derive(Debug, Error)]
pub enum ResizeError {
    #[error("Resize rejected: {status} {body}")]
    Rejected { status: u16, body: String },
    #[error("Resize request failed: {0}")]
    Request(#[from] NegotiationError),
}
