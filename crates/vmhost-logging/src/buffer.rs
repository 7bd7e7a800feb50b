//! Per-stream line reassembly.

use vmhost_common::LoggingError;

use crate::sink::{Priority, Sinks, StreamId};

/// Bytes of the current incomplete line of one stream.
///
/// The buffer keeps a logical capacity that grows by a fixed factor whenever
/// the required size reaches it. Growth is fallible: if the allocation fails
/// the line in progress is dropped and reported, and capture continues.
#[derive(Debug)]
pub struct StreamBuffer {
    stream: StreamId,
    data: Vec<u8>,
    capacity: usize,
    growth_factor: f64,
}

impl StreamBuffer {
    /// Allocate a buffer for `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`LoggingError::Allocation`] if the initial capacity cannot be
    /// reserved.
    pub fn new(
        stream: StreamId,
        initial_capacity: usize,
        growth_factor: f64,
    ) -> Result<Self, LoggingError> {
        let mut data = Vec::new();
        data.try_reserve_exact(initial_capacity)
            .map_err(|_| LoggingError::Allocation {
                requested: initial_capacity,
            })?;

        Ok(Self {
            stream,
            data,
            capacity: initial_capacity,
            growth_factor,
        })
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no partial line is buffered.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current logical capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append bytes to the line in progress.
    ///
    /// # Errors
    ///
    /// Returns [`LoggingError::Allocation`] if the buffer cannot grow. The
    /// buffer content is left untouched in that case.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), LoggingError> {
        // One extra byte mirrors the terminator slot of the line.
        let required = self.data.len() + bytes.len() + 1;
        if self.capacity <= required {
            let grown = grown_capacity(required, self.growth_factor);
            self.data
                .try_reserve_exact(grown.saturating_sub(self.data.len()))
                .map_err(|_| LoggingError::Allocation { requested: grown })?;
            self.capacity = grown;
        }

        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Flush the buffered bytes as one line. Empty buffers emit nothing.
    pub fn flush_line(&mut self, sinks: &Sinks) {
        if self.data.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.data);
        sinks.write_line(&line, self.stream);
        self.data.clear();
    }

    /// Split a freshly read chunk on `\n`, emitting every completed line and
    /// keeping the trailing remainder.
    pub fn feed(&mut self, chunk: &[u8], sinks: &Sinks) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            match self.append(&rest[..pos]) {
                Ok(()) => self.flush_line(sinks),
                Err(e) => self.drop_line(sinks, &e),
            }
            rest = &rest[pos + 1..];
        }

        if !rest.is_empty() {
            if let Err(e) = self.append(rest) {
                self.drop_line(sinks, &e);
            }
        }
    }

    fn drop_line(&mut self, sinks: &Sinks, err: &LoggingError) {
        sinks.native(
            Priority::Error,
            &format!("Memory allocation failed on {}: {err}", self.stream),
        );
        self.data.clear();
    }
}

/// Next logical capacity for a buffer that must hold `required` bytes.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn grown_capacity(required: usize, growth_factor: f64) -> usize {
    let scaled = ((required as f64) * growth_factor).min(usize::MAX as f64) as usize;
    scaled.saturating_add(1)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    type Seen = Arc<Mutex<Vec<(Priority, String)>>>;

    fn recording_sinks() -> (Sinks, Arc<Mutex<Vec<String>>>, Seen) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let native: Seen = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&lines);
        let n = Arc::clone(&native);
        let sinks = Sinks::new("test")
            .with_output(Arc::new(move |line: &str, _: StreamId| {
                l.lock().push(line.to_string());
            }))
            .with_native(Arc::new(move |p: Priority, _: &str, msg: &str| {
                n.lock().push((p, msg.to_string()));
            }));
        (sinks, lines, native)
    }

    #[test]
    fn test_feed_splits_lines_and_keeps_partial() {
        let (sinks, lines, _) = recording_sinks();
        let mut buf = StreamBuffer::new(StreamId::Stdout, 128, 1.5).unwrap();

        buf.feed(b"line1\nline2\n partial", &sinks);

        assert_eq!(*lines.lock(), vec!["line1", "line2"]);
        assert_eq!(buf.len(), " partial".len());

        buf.flush_line(&sinks);
        assert_eq!(*lines.lock(), vec!["line1", "line2", " partial"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_split_across_chunks() {
        let (sinks, lines, _) = recording_sinks();
        let mut buf = StreamBuffer::new(StreamId::Stdout, 4, 1.5).unwrap();

        buf.feed(b"hel", &sinks);
        buf.feed(b"lo wor", &sinks);
        buf.feed(b"ld\n", &sinks);

        assert_eq!(*lines.lock(), vec!["hello world"]);
    }

    #[test]
    fn test_empty_lines_are_not_emitted() {
        let (sinks, lines, _) = recording_sinks();
        let mut buf = StreamBuffer::new(StreamId::Stdout, 16, 1.5).unwrap();

        buf.feed(b"\n\na\n\n", &sinks);
        buf.flush_line(&sinks);

        assert_eq!(*lines.lock(), vec!["a"]);
    }

    #[test]
    fn test_capacity_growth() {
        let (sinks, _, _) = recording_sinks();
        let mut buf = StreamBuffer::new(StreamId::Stderr, 128, 1.5).unwrap();
        assert_eq!(buf.capacity(), 128);

        buf.feed(&[b'x'; 200], &sinks);

        // required = 201, grown to 201 * 1.5 + 1
        assert_eq!(buf.capacity(), 302);
        assert_eq!(buf.len(), 200);
    }

    #[test]
    fn test_grown_capacity() {
        assert_eq!(grown_capacity(10, 1.5), 16);
        assert_eq!(grown_capacity(128, 2.0), 257);
        assert_eq!(grown_capacity(4, 1e300), usize::MAX);
    }

    #[test]
    fn test_allocation_failure_drops_line() {
        let (sinks, lines, native) = recording_sinks();
        // An absurd growth factor makes the reservation overflow.
        let mut buf = StreamBuffer::new(StreamId::Stdout, 2, 1e300).unwrap();

        buf.feed(b"too long\n", &sinks);

        assert!(lines.lock().is_empty());
        let native = native.lock();
        assert_eq!(native.len(), 1);
        assert_eq!(native[0].0, Priority::Error);
        assert!(native[0].1.contains("Memory allocation failed"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (sinks, lines, _) = recording_sinks();
        let mut buf = StreamBuffer::new(StreamId::Stdout, 16, 1.5).unwrap();

        buf.feed(b"ab\xffcd\n", &sinks);

        assert_eq!(*lines.lock(), vec!["ab\u{fffd}cd"]);
    }
}
