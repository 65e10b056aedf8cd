//! Output routing: program log and device console sinks.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Local};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Default history size limit per sink (4 MB).
const HISTORY_BYTES: usize = 4 * 1024 * 1024;

/// Destination of an output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkTag {
    /// Program log.
    Log,
    /// Device console.
    Console,
}

/// Bytes bound for one sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub bytes: Vec<u8>,
    pub tag: SinkTag,
}

impl OutputChunk {
    #[must_use]
    pub fn log(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            tag: SinkTag::Log,
        }
    }

    #[must_use]
    pub fn console(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            tag: SinkTag::Console,
        }
    }
}

/// Program log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        })
    }
}

/// One timestamped program log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogLine {
    #[must_use]
    pub fn now(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%m/%d/%Y %I:%M:%S %p"),
            self.level,
            self.message
        )
    }
}

/// Append-only output destination.
pub trait Sink: Send + Sync {
    /// Append `content` at the end of the sink.
    fn append(&self, content: &[u8]);
}

/// Notification sent to sink readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    /// Bytes were appended.
    Appended(Vec<u8>),
    /// The view should follow the newest content.
    ScrollToLatest,
}

struct Inner {
    history: VecDeque<Vec<u8>>,
    total_bytes: usize,
}

struct Shared {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SinkEvent>,
    limit: usize,
}

/// Sink with bounded history and live broadcast.
///
/// The buffer itself is the only writer; displays hold a [`SinkReader`].
pub struct SinkBuffer {
    shared: Arc<Shared>,
}

impl Default for SinkBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkBuffer {
    /// Create a sink with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(HISTORY_BYTES)
    }

    /// Create a sink keeping at most `limit` bytes of history.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            shared: Arc::new(Shared {
                inner: RwLock::new(Inner {
                    history: VecDeque::with_capacity(32),
                    total_bytes: 0,
                }),
                sender,
                limit,
            }),
        }
    }

    /// Read-only view of this sink.
    #[must_use]
    pub fn reader(&self) -> SinkReader {
        SinkReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Sink for SinkBuffer {
    fn append(&self, content: &[u8]) {
        if content.is_empty() {
            return;
        }
        {
            let mut inner = self
                .shared
                .inner
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            while inner.total_bytes.saturating_add(content.len()) > self.shared.limit {
                if let Some(front) = inner.history.pop_front() {
                    inner.total_bytes = inner.total_bytes.saturating_sub(front.len());
                } else {
                    break;
                }
            }
            inner.history.push_back(content.to_vec());
            inner.total_bytes = inner.total_bytes.saturating_add(content.len());
        }
        // live listeners
        let _ = self.shared.sender.send(SinkEvent::Appended(content.to_vec()));
        let _ = self.shared.sender.send(SinkEvent::ScrollToLatest);
    }
}

/// Read-only handle onto a [`SinkBuffer`].
#[derive(Clone)]
pub struct SinkReader {
    shared: Arc<Shared>,
}

impl SinkReader {
    /// Everything currently retained, concatenated.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.shared
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    /// Retained content as lossy UTF-8.
    #[must_use]
    pub fn snapshot_text(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    /// Receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SinkEvent> {
        self.shared.sender.subscribe()
    }

    /// Stream yielding retained chunks first, then live appends.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, Vec<u8>> {
        let rx = self.subscribe();
        let history: Vec<Vec<u8>> = self
            .shared
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(SinkEvent::Appended(bytes)) => Some(bytes),
                _ => None,
            }
        });

        Box::pin(hist.chain(live))
    }
}

/// Routes controller log lines and device output to their sinks.
///
/// The two destinations never see each other's content.
#[derive(Clone)]
pub struct OutputRouter {
    log: Arc<dyn Sink>,
    console: Arc<dyn Sink>,
}

impl OutputRouter {
    /// Route into the given sinks.
    #[must_use]
    pub fn new(log: impl Sink + 'static, console: impl Sink + 'static) -> Self {
        Self {
            log: Arc::new(log),
            console: Arc::new(console),
        }
    }

    /// Router over two fresh [`SinkBuffer`]s, returning `(router, log, console)`.
    #[must_use]
    pub fn buffered() -> (Self, SinkReader, SinkReader) {
        let log = SinkBuffer::new();
        let console = SinkBuffer::new();
        let (log_reader, console_reader) = (log.reader(), console.reader());
        (Self::new(log, console), log_reader, console_reader)
    }

    /// Deliver a tagged chunk.
    pub fn route(&self, chunk: &OutputChunk) {
        match chunk.tag {
            SinkTag::Log => self.log.append(&chunk.bytes),
            SinkTag::Console => self.console.append(&chunk.bytes),
        }
    }

    /// Append a timestamped line to the program log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let line = LogLine::now(level, message);
        match level {
            LogLevel::Info => tracing::info!(target: "program_log", "{}", line.message),
            LogLevel::Warn => tracing::warn!(target: "program_log", "{}", line.message),
            LogLevel::Error => tracing::error!(target: "program_log", "{}", line.message),
        }
        self.route(&OutputChunk::log(format!("{line}\n")));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Append raw device output to the console.
    pub fn console(&self, bytes: &[u8]) {
        self.console.append(bytes);
    }

    /// Echo a typed command to the console ahead of its output.
    pub fn echo(&self, text: &str) {
        if text.ends_with('\n') {
            self.console(text.as_bytes());
        } else {
            self.console(format!("{text}\n").as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_and_console_do_not_mix() {
        let (router, log, console) = OutputRouter::buffered();

        router.info("connected");
        router.console(b"2\r\n");
        router.error("boom");

        let log_text = log.snapshot_text();
        assert!(log_text.contains("[INFO] connected\n"));
        assert!(log_text.contains("[ERROR] boom\n"));
        assert!(!log_text.contains("2\r\n"));
        assert_eq!(console.snapshot(), b"2\r\n");
    }

    #[test]
    fn echo_appends_newline_once() {
        let (router, _log, console) = OutputRouter::buffered();
        router.echo("print(1)");
        router.echo("x = 1\n");
        assert_eq!(console.snapshot_text(), "print(1)\nx = 1\n");
    }

    #[test]
    fn every_append_is_followed_by_scroll_signal() {
        let sink = SinkBuffer::new();
        let mut rx = sink.reader().subscribe();

        sink.append(b"abc");

        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Appended(b"abc".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::ScrollToLatest);
    }

    #[test]
    fn empty_append_is_ignored() {
        let sink = SinkBuffer::new();
        let mut rx = sink.reader().subscribe();
        sink.append(b"");
        assert!(rx.try_recv().is_err());
        assert!(sink.reader().snapshot().is_empty());
    }

    #[test]
    fn history_evicts_oldest_chunks() {
        let sink = SinkBuffer::with_limit(8);
        sink.append(b"aaaa");
        sink.append(b"bbbb");
        sink.append(b"cc");
        assert_eq!(sink.reader().snapshot(), b"bbbbcc");
    }

    #[test]
    fn log_line_format() {
        let line = LogLine::now(LogLevel::Warn, "port vanished");
        let text = line.to_string();
        assert!(text.ends_with("[WARN] port vanished"));
    }

    #[tokio::test]
    async fn stream_yields_history_then_live() {
        let sink = SinkBuffer::new();
        sink.append(b"one");
        let mut stream = sink.reader().history_plus_stream();
        sink.append(b"two");

        assert_eq!(stream.next().await.unwrap(), b"one");
        assert_eq!(stream.next().await.unwrap(), b"two");
    }
}
