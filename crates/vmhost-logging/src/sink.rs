//! Log sinks for captured output.
//!
//! Every complete line is delivered synchronously from the logger thread to
//! up to two independent sinks:
//! 1. A [`NativeLog`] receiving `(priority, tag, message)`
//! 2. An [`OutputSink`] receiving `(line, stream)`
//!
//! Sink implementations must not block indefinitely, or capture stalls.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

/// Which redirected stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    /// Standard output.
    Stdout = 1,
    /// Standard error.
    Stderr = 2,
}

impl StreamId {
    /// Stream name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            StreamId::Stdout => "stdout",
            StreamId::Stderr => "stderr",
        }
    }

    /// Priority of lines read from this stream.
    pub fn priority(self) -> Priority {
        match self {
            StreamId::Stdout => Priority::Info,
            StreamId::Stderr => Priority::Error,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Native log priority.
///
/// Numeric values follow the common platform logger convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Unknown = 0,
    Default = 1,
    Verbose = 2,
    Debug = 3,
    Info = 4,
    Warn = 5,
    Error = 6,
    Fatal = 7,
    Silent = 8,
}

/// Host logging facility, e.g. a platform system log.
pub trait NativeLog: Send + Sync {
    /// Write one message.
    fn log(&self, priority: Priority, tag: &str, message: &str);
}

impl<F> NativeLog for F
where
    F: Fn(Priority, &str, &str) + Send + Sync,
{
    fn log(&self, priority: Priority, tag: &str, message: &str) {
        self(priority, tag, message);
    }
}

/// Receiver of complete captured lines.
pub trait OutputSink: Send + Sync {
    /// Handle one line (without its terminator).
    fn on_line(&self, line: &str, stream: StreamId);
}

impl<F> OutputSink for F
where
    F: Fn(&str, StreamId) + Send + Sync,
{
    fn on_line(&self, line: &str, stream: StreamId) {
        self(line, stream);
    }
}

/// Native log backed by `tracing`.
///
/// Captured lines show up as structured events with `tag` and
/// `captured = true` fields. The subscriber must write somewhere other than
/// the captured descriptors, otherwise every event is captured again.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNativeLog;

impl NativeLog for TracingNativeLog {
    fn log(&self, priority: Priority, tag: &str, message: &str) {
        match priority {
            Priority::Unknown | Priority::Default | Priority::Verbose => {
                trace!(tag, captured = true, "{}", message);
            }
            Priority::Debug => debug!(tag, captured = true, "{}", message),
            Priority::Info => info!(tag, captured = true, "{}", message),
            Priority::Warn => warn!(tag, captured = true, "{}", message),
            Priority::Error | Priority::Fatal => error!(tag, captured = true, "{}", message),
            Priority::Silent => {}
        }
    }
}

/// The configured fan-out for captured lines.
#[derive(Clone)]
pub struct Sinks {
    tag: Arc<str>,
    native: Option<Arc<dyn NativeLog>>,
    output: Option<Arc<dyn OutputSink>>,
}

impl Sinks {
    /// Create a fan-out with no sinks attached.
    pub fn new(tag: impl Into<Arc<str>>) -> Self {
        Self {
            tag: tag.into(),
            native: None,
            output: None,
        }
    }

    /// Attach a native log.
    #[must_use]
    pub fn with_native(mut self, native: Arc<dyn NativeLog>) -> Self {
        self.native = Some(native);
        self
    }

    /// Attach a line receiver.
    #[must_use]
    pub fn with_output(mut self, output: Arc<dyn OutputSink>) -> Self {
        self.output = Some(output);
        self
    }

    /// The native log tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Write a diagnostic to the native log only.
    pub fn native(&self, priority: Priority, message: &str) {
        if let Some(native) = &self.native {
            native.log(priority, &self.tag, message);
        }
    }

    /// Deliver a complete line to every attached sink.
    pub fn write_line(&self, line: &str, stream: StreamId) {
        self.native(stream.priority(), line);

        if let Some(output) = &self.output {
            output.on_line(line, stream);
        }
    }
}

impl fmt::Debug for Sinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sinks")
            .field("tag", &self.tag)
            .field("native", &self.native.is_some())
            .field("output", &self.output.is_some())
            .finish()
    }
}
