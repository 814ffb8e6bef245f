//! Control-plane trait seam.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{NegotiationError, ResizeError},
    session::ExecSpec,
};

/// Duplex byte channel obtained from an exec start.
pub trait ExecStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> ExecStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// Boxed raw stream, exclusively owned by one bridge.
pub type RawStream = Box<dyn ExecStream>;

/// Container runtime exec lifecycle.
///
/// Implemented by the HTTP client in `portal-exec`; tests substitute
/// scripted implementations.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create an exec instance and return its identifier.
    async fn create_exec(&self, target: &str, spec: &ExecSpec) -> Result<String, NegotiationError>;

    /// Start an exec and hand over the upgraded raw stream.
    async fn start_exec(&self, exec_id: &str, tty: bool) -> Result<RawStream, NegotiationError>;

    /// Resize the exec's TTY.
    async fn resize_exec(&self, exec_id: &str, cols: u16, rows: u16) -> Result<(), ResizeError>;
}
