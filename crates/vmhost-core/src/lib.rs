//! Script VM hosting for vmhost.
//!
//! This crate runs an embedded script engine on a persistent worker thread
//! and feeds it work over a local command channel:
//! - [`Vm`]: lifecycle, FIFO submission queue, single-flight round trips
//! - [`ExecutionEngine`]: the worker side ([`ShellEngine`], [`FnEngine`])
//! - [`protocol`]: `<length>\n<bytes>` requests, `<digit>\n` responses
//! - [`CompletionTask`] / [`Completion`]: exactly-once result delivery
//! - [`Interpreter`]: lazily created process-wide VM
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       Interpreter                       │
//! │  (Process-wide registry, lazy create + start)           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                           Vm                            │
//! │  - FIFO queue drained by one dispatcher thread          │
//! │  - Endpoint mutex held per round trip                   │
//! │  - Error slot, stats, output capture control            │
//! └─────────────────────────────────────────────────────────┘
//!                            │  CommChannel (socket pair)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │               ExecutionEngine (worker thread)           │
//! │  - Bootstrap once                                       │
//! │  - read request / execute / write status, until EOF     │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod completion;
pub mod engine;
pub mod install;
pub mod interpreter;
pub mod listener;
pub mod protocol;
pub mod script;
pub mod vm;

pub use channel::CommChannel;
pub use completion::{Completion, CompletionTask};
pub use engine::{ExecutionEngine, FnEngine, ScriptExecutor, ShellEngine, serve};
pub use install::{DirectoryInstaller, Installer, NoInstall};
pub use interpreter::Interpreter;
pub use listener::LogListener;
pub use protocol::STATUS_PROTOCOL_VIOLATION;
pub use script::Script;
pub use vm::{Vm, VmState, VmStats};
