//! Exec session data model.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::traits::RawStream;

/// What to run when creating an exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSpec {
    /// Argument vector run inside the container.
    pub command: Vec<String>,
    /// Whether the caller will write to stdin.
    pub attach_stdin: bool,
    /// Raw combined output (true) or multiplexed frames (false).
    pub tty: bool,
}

impl ExecSpec {
    /// Interactive terminal: stdin attached, TTY mode.
    #[must_use]
    pub fn interactive(command: Vec<String>) -> Self {
        Self {
            command,
            attach_stdin: true,
            tty: true,
        }
    }

    /// One-shot command: no stdin, multiplexed output.
    #[must_use]
    pub fn one_shot(command: Vec<String>) -> Self {
        Self {
            command,
            attach_stdin: false,
            tty: false,
        }
    }
}

/// One negotiated attach to a remote process.
///
/// Owns the raw stream exclusively; closing is idempotent.
pub struct ExecSession {
    exec_id: String,
    container_target: String,
    tty_mode: bool,
    stream: Option<RawStream>,
}

impl ExecSession {
    /// Wrap a freshly started exec stream.
    #[must_use]
    pub fn new(
        exec_id: impl Into<String>,
        container_target: impl Into<String>,
        tty_mode: bool,
        stream: RawStream,
    ) -> Self {
        Self {
            exec_id: exec_id.into(),
            container_target: container_target.into(),
            tty_mode,
            stream: Some(stream),
        }
    }

    /// Control-plane exec identifier.
    #[must_use]
    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    /// Target container.
    #[must_use]
    pub fn container_target(&self) -> &str {
        &self.container_target
    }

    /// Whether the stream carries raw TTY bytes rather than frames.
    #[must_use]
    pub const fn tty_mode(&self) -> bool {
        self.tty_mode
    }

    /// Whether the stream is still open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Mutable access to the open stream.
    pub fn stream_mut(&mut self) -> Option<&mut RawStream> {
        self.stream.as_mut()
    }

    /// Shut down and drop the stream.
    ///
    /// Returns `true` if this call closed it, `false` if already closed.
    pub async fn close(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };
        if let Err(e) = stream.shutdown().await {
            tracing::debug!(exec_id = %self.exec_id, "Stream shutdown error: {e}");
        }
        true
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("exec_id", &self.exec_id)
            .field("container_target", &self.container_target)
            .field("tty_mode", &self.tty_mode)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut session = ExecSession::new("exec-1", "box", true, Box::new(local));
        assert!(session.is_open());

        assert!(session.close().await);
        assert!(!session.is_open());
        assert!(!session.close().await);

        let mut buf = Vec::new();
        let n = remote.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
