//! Local terminal as a surface, via crossterm.

use std::io::{self, Stdout, Write};

use crossterm::{
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal,
};

use crate::client::TerminalSurface;

/// What a terminal event means for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceInput {
    /// Bytes for the remote stdin.
    Keys(String),
    /// The local terminal changed size.
    Resized,
}

/// Writes to stdout, measures the local terminal.
#[derive(Debug)]
pub struct CrosstermSurface {
    out: Stdout,
}

impl CrosstermSurface {
    #[must_use]
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for CrosstermSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSurface for CrosstermSurface {
    fn write(&mut self, data: &str) -> io::Result<()> {
        self.out.write_all(data.as_bytes())?;
        self.out.flush()
    }

    fn size(&self) -> io::Result<(u16, u16)> {
        terminal::size()
    }

    fn dispose(&mut self) {
        let _ = self.out.flush();
    }
}

/// Raw mode for as long as the guard lives.
#[derive(Debug)]
pub struct RawModeGuard(());

impl RawModeGuard {
    /// Enable raw mode.
    ///
    /// # Errors
    /// Returns error if the terminal refuses raw mode.
    pub fn enable() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            tracing::warn!("Failed to restore terminal mode: {e}");
        }
    }
}

/// Map a crossterm event to relay input.
#[must_use]
pub fn translate_event(event: &Event) -> Option<SurfaceInput> {
    match event {
        Event::Key(key) if key.kind != KeyEventKind::Release => {
            key_to_bytes(key).map(|bytes| SurfaceInput::Keys(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Event::Paste(text) => Some(SurfaceInput::Keys(text.clone())),
        Event::Resize(_, _) => Some(SurfaceInput::Resized),
        _ => None,
    }
}

/// Convert a crossterm key event to the bytes a terminal would send.
#[must_use]
pub fn key_to_bytes(key: &KeyEvent) -> Option<Vec<u8>> {
    let alt = key.modifiers.contains(KeyModifiers::ALT);
    let mut bytes = match key.code {
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            match c.to_ascii_lowercase() {
                c @ 'a'..='z' => vec![(c as u8) - b'a' + 1],
                '@' | ' ' => vec![0],
                '[' => vec![0x1b],
                '\\' => vec![0x1c],
                ']' => vec![0x1d],
                _ => return None,
            }
        }
        KeyCode::Char(c) => {
            let mut buf = [0; 4];
            c.encode_utf8(&mut buf).as_bytes().to_vec()
        }
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::F(n) => match n {
            1 => b"\x1bOP".to_vec(),
            2 => b"\x1bOQ".to_vec(),
            3 => b"\x1bOR".to_vec(),
            4 => b"\x1bOS".to_vec(),
            5 => b"\x1b[15~".to_vec(),
            6 => b"\x1b[17~".to_vec(),
            7 => b"\x1b[18~".to_vec(),
            8 => b"\x1b[19~".to_vec(),
            9 => b"\x1b[20~".to_vec(),
            10 => b"\x1b[21~".to_vec(),
            11 => b"\x1b[23~".to_vec(),
            12 => b"\x1b[24~".to_vec(),
            _ => return None,
        },
        _ => return None,
    };
    if alt {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}
