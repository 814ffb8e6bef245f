//! Relay between terminal clients and container exec streams.
//!
//! Provides:
//! - `RelayMachine` - Pure connection state machine with bounded retry
//! - `RelayBridge` - Driver pairing one client with one exec session
//! - `RelayRegistry` - Live connections, for teardown on disconnect

pub mod bridge;
pub mod manager;
pub mod output;
pub mod state;

pub use bridge::{BridgeCommand, BridgeConfig, BridgeError, BridgeHandle, RelayBridge};
pub use manager::{ConnId, RelayRegistry};
pub use output::OutputDecoder;
pub use state::{Action, Event, RelayMachine, RelayState, RelayStatus};
