//! One-shot command execution.

use std::time::Duration;

use async_trait::async_trait;
use portal_core::{ControlPlane, ExecSpec, NegotiationError, StreamError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    client::DockerClient,
    frame::{FrameDecoder, FrameError, StreamType},
    shell::QuoteError,
};

/// One-shot exec error.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("Bad output framing: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error("Command did not finish within {0:?}")]
    TimedOut(Duration),
}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        Self::Stream(StreamError::Io(e))
    }
}

/// Buffered result of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Stdout and stderr interleaved in arrival order.
    pub combined: String,
    /// `None` if the runtime did not report one.
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }

    /// Demultiplex a complete non-TTY output buffer.
    ///
    /// # Errors
    /// Returns error if a frame declares an oversized payload.
    pub fn from_frames(raw: &[u8]) -> Result<Self, FrameError> {
        let mut decoder = FrameDecoder::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut combined = Vec::new();

        for frame in decoder.decode(raw)? {
            match frame.stream {
                StreamType::Stdout => stdout.extend_from_slice(&frame.payload),
                StreamType::Stderr => stderr.extend_from_slice(&frame.payload),
                _ => continue,
            }
            combined.extend_from_slice(&frame.payload);
        }
        if decoder.pending() > 0 {
            tracing::debug!(bytes = decoder.pending(), "Dropping truncated trailing frame");
        }

        Ok(Self {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            combined: String::from_utf8_lossy(&combined).into_owned(),
            exit_code: None,
        })
    }
}

/// Runs a non-interactive command in a container and buffers its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in `target` to completion.
    async fn run(&self, target: &str, command: Vec<String>) -> Result<ExecOutput, ExecError>;
}

#[async_trait]
impl CommandRunner for DockerClient {
    async fn run(&self, target: &str, command: Vec<String>) -> Result<ExecOutput, ExecError> {
        let exec_id = self
            .create_exec(target, &ExecSpec::one_shot(command))
            .await?;
        let mut stream = self.start_exec(&exec_id, false).await?;
        let collected = collect_output(&mut stream, self.command_timeout()).await;
        drop(stream);
        let raw = collected?;

        let mut output = ExecOutput::from_frames(&raw)?;
        match self.inspect_exec(&exec_id).await {
            Ok(inspect) => output.exit_code = inspect.exit_code,
            Err(e) => tracing::warn!(exec_id, "Failed to read exit code: {e}"),
        }
        Ok(output)
    }
}

/// Read a one-shot exec stream to EOF, giving up after `limit`.
async fn collect_output<S>(stream: &mut S, limit: Duration) -> Result<Vec<u8>, ExecError>
where
    S: AsyncRead + Unpin,
{
    let mut raw = Vec::new();
    match tokio::time::timeout(limit, stream.read_to_end(&mut raw)).await {
        Ok(read) => {
            read?;
            Ok(raw)
        }
        Err(_) => {
            tracing::warn!(bytes = raw.len(), ?limit, "One-shot command timed out");
            Err(ExecError::TimedOut(limit))
        }
    }
}
