//! Stdout/stderr capture for vmhost.
//!
//! The embedded engine writes to the process's standard streams. This crate
//! turns those writes into complete log lines without blocking the writer:
//!
//! - [`StdioRedirect`]: points fd 1 / fd 2 at socket pairs
//! - [`StreamLogger`]: one thread multiplexing the read ends with `poll(2)`
//! - [`StreamBuffer`]: per-stream reassembly of partial lines
//! - [`Sinks`]: fan-out to a [`NativeLog`] and an [`OutputSink`]
//! - [`capture`]: the process-wide start/stop controller
//!
//! # Data flow
//!
//! ```text
//! engine ── write(1/2) ──▶ socket pair ──▶ poll loop ──▶ StreamBuffer
//!                                                          │ '\n'
//!                                                          ▼
//!                                           NativeLog + OutputSink
//! ```

pub mod buffer;
pub mod capture;
pub mod logger;
pub mod redirect;
pub mod sink;

pub use buffer::StreamBuffer;
pub use logger::{LogSource, StreamLogger, TERMINAL_MARKER};
pub use redirect::StdioRedirect;
pub use sink::{NativeLog, OutputSink, Priority, Sinks, StreamId, TracingNativeLog};
