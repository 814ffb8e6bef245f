//! Transport layer for the terminal relay.
//!
//! Provides:
//! - `Gateway` - Terminal socket server with lazy `ensure_started` (feature: websocket)
//! - Collaborator HTTP routes for files, skills and server resolution (feature: websocket)
//! - `TerminalClient` / `TerminalAdapter` - Client side of the socket (feature: client)
//! - Crossterm terminal surface (feature: tui)

#[cfg(feature = "websocket")]
pub mod routes;
#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "tui")]
pub mod tui;

pub use portal_core::{ClientMessage, ServerMessage};

#[cfg(feature = "websocket")]
pub use routes::{ApiError, resolve_server_url};
#[cfg(feature = "websocket")]
pub use websocket::{Gateway, GatewayError, GatewayState};

#[cfg(feature = "client")]
pub use client::{
    ClientError, ConnectionStatus, DebugEntry, MountedTerminal, ResizeTracker, TerminalAdapter,
    TerminalClient, TerminalSurface,
};

#[cfg(feature = "tui")]
pub use tui::{CrosstermSurface, RawModeGuard, SurfaceInput, key_to_bytes, translate_event};
