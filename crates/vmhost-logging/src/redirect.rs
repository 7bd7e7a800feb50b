//! Redirection of the process's standard output descriptors.
//!
//! Each standard descriptor is pointed at the write end of a fresh socket
//! pair; the read end becomes a [`LogSource`]. The original descriptors are
//! saved so [`StdioRedirect::restore`] can put them back, which also closes
//! the last writer and lets the logger see end-of-stream.

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::unistd::dup2;
use tracing::{debug, warn};

use vmhost_common::LoggingError;

use crate::logger::LogSource;
use crate::sink::StreamId;

const STDOUT_FILENO: RawFd = 1;
const STDERR_FILENO: RawFd = 2;

struct Saved {
    stream: StreamId,
    target: RawFd,
    original: OwnedFd,
}

/// Active redirection of stdout and stderr.
///
/// Dropping the value restores the original descriptors.
pub struct StdioRedirect {
    saved: Vec<Saved>,
}

impl StdioRedirect {
    /// Redirect stdout and stderr into socket pairs.
    ///
    /// Rust's `stdout` is line-buffered and `stderr` unbuffered, so writes
    /// reach the pairs promptly; both are flushed before switching.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket pair cannot be created or a descriptor
    /// cannot be duplicated. Streams already redirected are restored.
    pub fn install() -> Result<(Self, Vec<LogSource>), LoggingError> {
        let mut redirect = Self { saved: Vec::new() };
        let mut sources = Vec::with_capacity(2);

        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        for (stream, target) in [
            (StreamId::Stdout, STDOUT_FILENO),
            (StreamId::Stderr, STDERR_FILENO),
        ] {
            // On error `redirect` drops here and restores what was done.
            sources.push(redirect.redirect_one(stream, target)?);
        }

        debug!("stdout/stderr redirected");
        Ok((redirect, sources))
    }

    fn redirect_one(&mut self, stream: StreamId, target: RawFd) -> Result<LogSource, LoggingError> {
        let (reader, writer) = UnixStream::pair().map_err(|e| LoggingError::Channel {
            stream: stream.name(),
            source: e,
        })?;

        let original = clone_std(target).map_err(|e| LoggingError::Redirect {
            stream: stream.name(),
            reason: format!("dup() failed: {e}"),
        })?;

        dup2(writer.as_raw_fd(), target).map_err(|e| LoggingError::Redirect {
            stream: stream.name(),
            reason: format!("dup2() failed: {e}"),
        })?;

        self.saved.push(Saved {
            stream,
            target,
            original,
        });

        // `target` now holds its own reference to the write end.
        drop(writer);
        Ok(LogSource::new(stream, reader))
    }

    /// Put the original descriptors back.
    pub fn restore(mut self) {
        self.restore_all();
    }

    fn restore_all(&mut self) {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        for saved in self.saved.drain(..).rev() {
            if let Err(e) = dup2(saved.original.as_raw_fd(), saved.target) {
                warn!(stream = %saved.stream, error = %e, "Failed to restore descriptor");
            }
        }
    }
}

impl Drop for StdioRedirect {
    fn drop(&mut self) {
        self.restore_all();
    }
}

impl std::fmt::Debug for StdioRedirect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioRedirect")
            .field("streams", &self.saved.len())
            .finish()
    }
}

fn clone_std(target: RawFd) -> io::Result<OwnedFd> {
    if target == STDERR_FILENO {
        io::stderr().as_fd().try_clone_to_owned()
    } else {
        io::stdout().as_fd().try_clone_to_owned()
    }
}
