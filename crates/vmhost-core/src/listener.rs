//! Host-facing receiver of captured script output.

use std::sync::Arc;

use parking_lot::RwLock;

use vmhost_logging::{OutputSink, StreamId};

/// Receives complete lines printed by scripts while capture is enabled.
pub trait LogListener: Send + Sync {
    /// A line written to standard output.
    fn accept(&self, line: &str);

    /// A line written to standard error. Defaults to [`accept`](Self::accept).
    fn on_error(&self, line: &str) {
        self.accept(line);
    }
}

/// Replaceable listener shared between a VM and the capture thread.
pub(crate) type ListenerSlot = Arc<RwLock<Option<Arc<dyn LogListener>>>>;

/// Output sink routing captured lines to whatever listener is current.
pub(crate) struct ListenerSink {
    slot: ListenerSlot,
}

impl ListenerSink {
    pub(crate) fn new(slot: ListenerSlot) -> Self {
        Self { slot }
    }
}

impl OutputSink for ListenerSink {
    fn on_line(&self, line: &str, stream: StreamId) {
        let Some(listener) = self.slot.read().clone() else {
            return;
        };

        match stream {
            StreamId::Stdout => listener.accept(line),
            StreamId::Stderr => listener.on_error(line),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl LogListener for Recorder {
        fn accept(&self, line: &str) {
            self.lines.lock().push(format!("out:{line}"));
        }

        fn on_error(&self, line: &str) {
            self.lines.lock().push(format!("err:{line}"));
        }
    }

    struct OutOnly(Mutex<Vec<String>>);

    impl LogListener for OutOnly {
        fn accept(&self, line: &str) {
            self.0.lock().push(line.to_string());
        }
    }

    #[test]
    fn test_routes_by_stream() {
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn LogListener> = recorder.clone();
        let slot: ListenerSlot = Arc::new(RwLock::new(Some(listener)));
        let sink = ListenerSink::new(slot);

        sink.on_line("hello", StreamId::Stdout);
        sink.on_line("boom", StreamId::Stderr);

        assert_eq!(*recorder.lines.lock(), vec!["out:hello", "err:boom"]);
    }

    #[test]
    fn test_listener_replaced_while_attached() {
        let first = Arc::new(OutOnly(Mutex::new(Vec::new())));
        let second = Arc::new(OutOnly(Mutex::new(Vec::new())));
        let listener: Arc<dyn LogListener> = first.clone();
        let slot: ListenerSlot = Arc::new(RwLock::new(Some(listener)));
        let sink = ListenerSink::new(Arc::clone(&slot));

        sink.on_line("a", StreamId::Stderr);
        let listener: Arc<dyn LogListener> = second.clone();
        *slot.write() = Some(listener);
        sink.on_line("b", StreamId::Stdout);
        *slot.write() = None;
        sink.on_line("c", StreamId::Stdout);

        assert_eq!(*first.0.lock(), vec!["a"]);
        assert_eq!(*second.0.lock(), vec!["b"]);
    }
}
