//! Core types for the OpenCode portal terminal relay.
//!
//! This crate provides the shared building blocks:
//! - `HistoryBuffer` / `OutputStore` - Bounded output history with live fan-in
//! - `ClientMessage` / `ServerMessage` - Terminal socket wire protocol
//! - `ExecSpec` / `ExecSession` - Negotiated attach to a container process
//! - `ControlPlane` trait and the error taxonomy
//! - `GatewayConfig` - Environment-driven configuration

pub mod config;
pub mod error;
pub mod history;
pub mod protocol;
pub mod session;
pub mod traits;

pub use config::{ControlPlaneAddr, GatewayConfig, RetryPolicy};
pub use error::{ConfigurationError, NegotiationError, ResizeError, StreamError};
pub use history::{HistoryBuffer, OutputStore};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{ExecSession, ExecSpec};
pub use traits::{ControlPlane, ExecStream, RawStream};
