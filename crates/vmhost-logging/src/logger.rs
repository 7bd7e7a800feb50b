//! Background multiplexer for captured output streams.
//!
//! [`StreamLogger`] owns one thread that waits on every still-open source
//! with `poll(2)`, reads bounded chunks from whichever are ready, and feeds
//! them through a per-stream [`StreamBuffer`] so sinks only ever see whole
//! lines.
//!
//! # Shutdown
//!
//! [`StreamLogger::stop`] raises the stop flag and shuts down the read side
//! of every source, which wakes a pending `poll` immediately. The thread
//! drains whatever is still queued, flushes all partial lines, emits
//! [`TERMINAL_MARKER`], and exits; `stop` joins it.

use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, warn};

use vmhost_common::{LoggingConfig, LoggingError};

use crate::buffer::StreamBuffer;
use crate::sink::{Priority, Sinks, StreamId};

/// Line emitted on the stdout stream when the logger thread ends.
pub const TERMINAL_MARKER: &str = "----------------------------";

/// A readable end of a captured stream.
#[derive(Debug)]
pub struct LogSource {
    stream: StreamId,
    reader: UnixStream,
}

impl LogSource {
    /// Wrap the read end of a socket pair.
    pub fn new(stream: StreamId, reader: UnixStream) -> Self {
        Self { stream, reader }
    }
}

/// Handle to a running logger thread.
#[derive(Debug)]
pub struct StreamLogger {
    stop: Arc<AtomicBool>,
    wakers: Vec<UnixStream>,
    handle: Option<JoinHandle<()>>,
}

impl StreamLogger {
    /// Spawn the logger thread over `sources`.
    ///
    /// # Errors
    ///
    /// Returns an error if a source handle cannot be cloned for shutdown or
    /// the thread cannot be spawned.
    pub fn spawn(
        sources: Vec<LogSource>,
        sinks: Sinks,
        config: &LoggingConfig,
    ) -> Result<Self, LoggingError> {
        let wakers = sources
            .iter()
            .map(|s| {
                s.reader.try_clone().map_err(|e| LoggingError::Channel {
                    stream: s.stream.name(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            sources,
            sinks,
            config: config.clone(),
            stop: Arc::clone(&stop),
        };

        let handle = thread::Builder::new()
            .name(format!("{}-logger", worker.sinks.tag()))
            .spawn(move || worker.run())
            .map_err(LoggingError::Thread)?;

        debug!("Logging thread started");

        Ok(Self {
            stop,
            wakers,
            handle: Some(handle),
        })
    }

    /// Whether the logger thread has exited on its own (all sources closed).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop the thread and wait for it to flush and exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        self.stop.store(true, Ordering::SeqCst);
        for waker in &self.wakers {
            // ENOTCONN once the peer is gone is fine; the thread is waking anyway.
            let _ = waker.shutdown(Shutdown::Read);
        }

        if handle.join().is_err() {
            warn!("Logging thread panicked");
        }
    }
}

impl Drop for StreamLogger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Stream {
    source: LogSource,
    buffer: StreamBuffer,
    open: bool,
}

struct Worker {
    sources: Vec<LogSource>,
    sinks: Sinks,
    config: LoggingConfig,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        let Worker {
            sources,
            sinks,
            config,
            stop,
        } = self;

        let mut streams = Vec::with_capacity(sources.len());
        for source in sources {
            match StreamBuffer::new(source.stream, config.initial_capacity, config.growth_factor) {
                Ok(buffer) => streams.push(Stream {
                    source,
                    buffer,
                    open: true,
                }),
                Err(e) => {
                    sinks.native(
                        Priority::Error,
                        &format!("Failed to allocate buffers, aborting logging thread: {e}"),
                    );
                    return;
                }
            }
        }

        let mut chunk = vec![0u8; config.read_chunk.max(1)];
        let timeout = PollTimeout::from(config.poll_timeout_ms);

        while !stop.load(Ordering::SeqCst) {
            let open: Vec<usize> = (0..streams.len()).filter(|&i| streams[i].open).collect();
            if open.is_empty() {
                break;
            }

            let ready = {
                let mut fds: Vec<PollFd<'_>> = open
                    .iter()
                    .map(|&i| PollFd::new(streams[i].source.reader.as_fd(), PollFlags::POLLIN))
                    .collect();

                match poll(&mut fds, timeout) {
                    Ok(0) | Err(Errno::EINTR) => continue,
                    Ok(_) => {}
                    Err(e) => {
                        sinks.native(Priority::Error, &format!("poll() error: {e}"));
                        break;
                    }
                }

                let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
                fds.iter()
                    .zip(&open)
                    .filter(|(fd, _)| fd.revents().is_some_and(|r| r.intersects(wake)))
                    .map(|(_, &i)| i)
                    .collect::<Vec<_>>()
            };

            for i in ready {
                read_ready(&mut streams[i], &mut chunk, &sinks);
            }
        }

        for stream in &mut streams {
            if stream.open {
                drain(stream, &mut chunk, &sinks);
            }
            stream.buffer.flush_line(&sinks);
        }
        drop(streams);

        sinks.write_line(TERMINAL_MARKER, StreamId::Stdout);
        sinks.native(Priority::Debug, "Logging thread ended");
    }
}

/// Read one chunk from a ready stream.
fn read_ready(stream: &mut Stream, chunk: &mut [u8], sinks: &Sinks) {
    match stream.source.reader.read(chunk) {
        Ok(0) => {
            stream.buffer.flush_line(sinks);
            stream.open = false;
        }
        Ok(n) => stream.buffer.feed(&chunk[..n], sinks),
        Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {}
        Err(e) => {
            sinks.native(
                Priority::Error,
                &format!("Error reading {}: {e}", stream.source.stream),
            );
            stream.open = false;
        }
    }
}

/// Consume whatever is still queued on a stream without blocking.
fn drain(stream: &mut Stream, chunk: &mut [u8], sinks: &Sinks) {
    if stream.source.reader.set_nonblocking(true).is_err() {
        return;
    }
    loop {
        match stream.source.reader.read(chunk) {
            Ok(0) => break,
            Ok(n) => stream.buffer.feed(&chunk[..n], sinks),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => break,
        }
    }
    stream.open = false;
}
