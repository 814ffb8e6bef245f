//! Bounded output history with live fan-out for surface remounts.

use std::sync::RwLock;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit (1 MB).
pub const HISTORY_BYTES: usize = 1_000_000;

/// Append-only text accumulator capped at a fixed byte size.
///
/// Appending beyond capacity drops the oldest bytes first. Trimming always
/// lands on a char boundary, so the retained text may be a few bytes under
/// the cap but never over it.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    data: String,
    capacity: usize,
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(HISTORY_BYTES)
    }
}

impl HistoryBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            data: String::new(),
            capacity,
        }
    }

    /// Append text, trimming the oldest content on overflow.
    pub fn append(&mut self, text: &str) {
        if text.len() >= self.capacity {
            // Only the tail of `text` survives.
            let start = ceil_char_boundary(text, text.len() - self.capacity);
            self.data.clear();
            self.data.push_str(&text[start..]);
            return;
        }

        let overflow = (self.data.len() + text.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            let cut = ceil_char_boundary(&self.data, overflow);
            self.data.drain(..cut);
        }
        self.data.push_str(text);
    }

    /// Current contents, oldest first.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Byte length of the retained contents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum retained size in bytes.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index.min(s.len())
}

/// Output store with broadcast and bounded history.
///
/// Surfaces mounted late receive the history snapshot, then live output,
/// with no gap or duplicate between the two.
pub struct OutputStore {
    history: RwLock<HistoryBuffer>,
    sender: broadcast::Sender<String>,
}

impl Default for OutputStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStore {
    /// Create a store with the default history cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_BYTES)
    }

    /// Create a store with a custom history cap.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(10000);
        Self {
            history: RwLock::new(HistoryBuffer::new(capacity)),
            sender,
        }
    }

    /// Push a chunk to both history and live listeners.
    pub fn push(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        let mut history = self
            .history
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        history.append(&chunk);
        // Sent under the lock so snapshot + subscribe is atomic.
        let _ = self.sender.send(chunk);
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> String {
        self.history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_str()
            .to_string()
    }

    /// History snapshot plus a receiver for everything pushed afterwards.
    #[must_use]
    pub fn snapshot_and_subscribe(&self) -> (String, broadcast::Receiver<String>) {
        let history = self
            .history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (history.as_str().to_string(), self.sender.subscribe())
    }

    /// Stream that yields the history snapshot first, then live chunks.
    ///
    /// Lagged receivers skip the chunks they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, String> {
        let (history, rx) = self.snapshot_and_subscribe();
        let hist = futures::stream::iter((!history.is_empty()).then_some(history));
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });
        hist.chain(live).boxed()
    }
}
