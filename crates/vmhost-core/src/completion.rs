//! One-shot completion notification.
//!
//! A [`CompletionTask`] is consumed by [`CompletionTask::invoke`], so a
//! result can be delivered at most once. The VM guarantees it is delivered
//! exactly once per enqueued script, including on failure paths.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::protocol::STATUS_PROTOCOL_VIOLATION;

type Callback = Box<dyn FnOnce(i32) + Send + 'static>;

/// Callback invoked with the result of a script.
///
/// The callback owns whatever context it needs. It runs on the thread that
/// finished the round trip (usually the VM's dispatcher thread), so it must
/// not block for long.
#[derive(Default)]
pub struct CompletionTask {
    callback: Option<Callback>,
}

impl CompletionTask {
    /// Wrap a callback.
    pub fn new(callback: impl FnOnce(i32) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    /// A task that ignores the result.
    pub fn none() -> Self {
        Self { callback: None }
    }

    /// A task that sends the result through a oneshot channel.
    pub fn from_oneshot(sender: oneshot::Sender<i32>) -> Self {
        Self::new(move |result| {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = sender.send(result);
        })
    }

    /// Whether a callback is attached.
    pub fn is_set(&self) -> bool {
        self.callback.is_some()
    }

    /// Deliver the result. Does nothing if no callback is attached.
    pub fn invoke(self, result: i32) {
        if let Some(callback) = self.callback {
            callback(result);
        }
    }
}

impl fmt::Debug for CompletionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionTask")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Future resolving to the result of a submitted script.
///
/// If the task is dropped without being invoked the future resolves to
/// [`STATUS_PROTOCOL_VIOLATION`].
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<i32>,
}

impl Completion {
    /// Create a connected task/future pair.
    pub fn channel() -> (CompletionTask, Completion) {
        let (tx, rx) = oneshot::channel();
        (CompletionTask::from_oneshot(tx), Completion { rx })
    }

    /// Block the current thread until the result is available.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> i32 {
        self.rx.blocking_recv().unwrap_or(STATUS_PROTOCOL_VIOLATION)
    }
}

impl Future for Completion {
    type Output = i32;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(STATUS_PROTOCOL_VIOLATION))
    }
}
