//! Bidirectional command channel between submitters and the worker.
//!
//! The channel is a connected local stream-socket pair. Requests and
//! responses share it in a strict one-request / one-response discipline;
//! the VM enforces single-flight on the main endpoint.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use tracing::debug;

use vmhost_common::VmError;

/// A connected endpoint pair.
#[derive(Debug)]
pub struct CommChannel {
    main: Option<UnixStream>,
    worker: Option<UnixStream>,
}

impl CommChannel {
    /// Allocate a connected pair.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ChannelCreation`] if the pair cannot be created.
    pub fn create() -> Result<Self, VmError> {
        let (main, worker) =
            UnixStream::pair().map_err(|source| VmError::ChannelCreation { source })?;
        debug!("Command channel created");

        Ok(Self {
            main: Some(main),
            worker: Some(worker),
        })
    }

    /// The submitting endpoint, unless closed.
    pub fn main_end(&self) -> Option<&UnixStream> {
        self.main.as_ref()
    }

    /// Move the worker endpoint out, for handing to the worker thread.
    pub fn take_worker_end(&mut self) -> Option<UnixStream> {
        self.worker.take()
    }

    /// A second handle to the main endpoint.
    ///
    /// Shutting the channel down through [`close`](Self::close) also affects
    /// every handle obtained here, which unblocks a pending read on them.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::ChannelCreation`] if the channel is closed or the
    /// descriptor cannot be duplicated.
    pub fn clone_main_end(&self) -> Result<UnixStream, VmError> {
        let main = self.main.as_ref().ok_or_else(|| VmError::ChannelCreation {
            source: io::Error::new(io::ErrorKind::NotConnected, "channel is closed"),
        })?;
        main.try_clone()
            .map_err(|source| VmError::ChannelCreation { source })
    }

    /// Whether both endpoints have been released.
    pub fn is_closed(&self) -> bool {
        self.main.is_none() && self.worker.is_none()
    }

    /// Shut down and release both endpoints. Safe to call repeatedly.
    pub fn close(&mut self) {
        for endpoint in [self.main.take(), self.worker.take()].into_iter().flatten() {
            // Fails with NotConnected once the peer is gone, which is fine.
            let _ = endpoint.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for CommChannel {
    fn drop(&mut self) {
        self.close();
    }
}
