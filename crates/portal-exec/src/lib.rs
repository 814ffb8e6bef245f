//! Container runtime exec client.
//!
//! Provides:
//! - `frame` - Multiplexed stream framing (8-byte header, stdout/stderr)
//! - `DockerClient` - Exec create/start/resize with a hand-parsed upgrade
//! - `CommandRunner` - One-shot commands with buffered, demultiplexed output
//! - `RemoteFs` - Directory listing, file transfer and skills over one-shot execs

pub mod client;
pub mod endpoint;
pub mod frame;
pub mod fs;
pub mod http;
pub mod run;
pub mod shell;
pub mod skills;
pub mod text;

pub use client::{DockerClient, ExecInspect, validate_target};
pub use frame::{Frame, FrameDecoder, FrameError, FrameRef, StreamType, decode_frames, encode_frame};
pub use fs::{DirEntry, DirListing, FsError, RemoteFs};
pub use run::{CommandRunner, ExecError, ExecOutput};
pub use skills::Skill;
pub use text::Utf8Decoder;
