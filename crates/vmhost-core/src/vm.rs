//! VM lifecycle and request dispatch.
//!
//! A [`Vm`] owns one persistent worker thread running an
//! [`ExecutionEngine`], the command channel connecting it to submitters,
//! and a dispatcher thread draining a FIFO submission queue:
//!
//! ```text
//! enqueue ──▶ queue ──▶ dispatcher ──┐
//!                                    ├─▶ endpoint mutex ──▶ channel ──▶ worker
//! execute_blocking ──────────────────┘
//! ```
//!
//! The endpoint mutex is held for a whole write-request / read-response
//! round trip, so at most one request is in flight on the channel. Every
//! enqueued script gets exactly one completion, including when the VM is
//! not running or is torn down with requests still queued.

use std::fmt;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use vmhost_common::{ErrorCode, ErrorInfo, ErrorSlot, ProtocolError, RuntimeConfig, VmError};
use vmhost_logging::capture;

use crate::channel::CommChannel;
use crate::completion::{Completion, CompletionTask};
use crate::engine::{ExecutionEngine, ShellEngine};
use crate::install::{self, Installer};
use crate::listener::{ListenerSink, ListenerSlot, LogListener};
use crate::protocol::{self, STATUS_PROTOCOL_VIOLATION};
use crate::script::Script;

/// Observable lifecycle state of a [`Vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Created, not started yet.
    Created,
    /// Worker and dispatcher are running.
    Running,
    /// `start` failed; the instance cannot be started again.
    Failed,
    /// Torn down.
    Destroyed,
}

/// Snapshot of round-trip instrumentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    /// Scripts handed to the VM.
    pub submitted: u64,
    /// Scripts whose result has been delivered.
    pub completed: u64,
    /// Round trips that failed on the channel.
    pub protocol_errors: u64,
    /// Highest number of concurrent round trips observed.
    pub max_in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    protocol_errors: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> VmStats {
        VmStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            protocol_errors: self.protocol_errors.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
        }
    }
}

struct Request {
    id: Uuid,
    script: Script,
    completion: CompletionTask,
}

/// The submitting side of the command channel.
struct Transport {
    endpoint: Mutex<UnixStream>,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl Transport {
    fn new(endpoint: UnixStream, counters: Arc<Counters>) -> Self {
        Self {
            endpoint: Mutex::new(endpoint),
            closed: AtomicBool::new(false),
            counters,
        }
    }

    /// Refuse further round trips.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn round_trip(&self, script: &Script) -> Result<u8, ProtocolError> {
        let mut endpoint = self.endpoint.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }

        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        let result = protocol::write_request(&mut *endpoint, script.as_bytes())
            .and_then(|()| protocol::read_response(&mut *endpoint));

        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        if result.is_err() {
            self.counters.protocol_errors.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    /// Run one round trip and decode it into a result code.
    fn execute(&self, id: Uuid, script: &Script) -> i32 {
        let result = match self.round_trip(script) {
            Ok(status) => {
                debug!(%id, status, "Script completed");
                i32::from(status)
            }
            Err(e) => {
                warn!(%id, error = %e, "Round trip failed");
                STATUS_PROTOCOL_VIOLATION
            }
        };
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        result
    }
}

fn dispatch(mut queue: mpsc::UnboundedReceiver<Request>, transport: &Transport) {
    debug!("Dispatcher running");

    while let Some(Request {
        id,
        script,
        completion,
    }) = queue.blocking_recv()
    {
        let result = transport.execute(id, &script);
        // A panicking callback must not strand the requests behind it.
        if panic::catch_unwind(AssertUnwindSafe(|| completion.invoke(result))).is_err() {
            error!(%id, "Completion callback panicked");
        }
    }

    debug!("Dispatcher exiting");
}

/// Threads and channel of a started VM.
struct Running {
    queue: mpsc::UnboundedSender<Request>,
    channel: CommChannel,
    transport: Arc<Transport>,
    dispatcher: JoinHandle<()>,
    worker: JoinHandle<()>,
}

impl Running {
    fn shutdown(self) {
        let Running {
            queue,
            mut channel,
            transport,
            dispatcher,
            worker,
        } = self;

        // Closing the queue ends the dispatcher once it has failed whatever
        // is still queued; shutting the socket down unblocks both the
        // dispatcher's pending read and the worker's.
        drop(queue);
        transport.close();
        channel.close();

        join(dispatcher, "dispatcher");
        join(worker, "worker");
    }
}

fn join(handle: JoinHandle<()>, role: &'static str) {
    if handle.thread().id() == thread::current().id() {
        warn!(role, "VM destroyed from its own thread; not joining");
        return;
    }
    if handle.join().is_err() {
        error!(role, "VM thread panicked");
    }
}

enum Lifecycle {
    Created,
    Running(Running),
    Failed,
    Destroyed,
}

/// A script VM with a persistent worker.
///
/// # Example
///
/// ```ignore
/// use vmhost_common::RuntimeConfig;
/// use vmhost_core::{Script, Vm};
///
/// let vm = Vm::from_config(&RuntimeConfig::default())?;
/// vm.start()?;
/// let status = vm.submit(Script::from("exit 3")).await;
/// assert_eq!(status, 3);
/// vm.destroy();
/// ```
pub struct Vm {
    config: RuntimeConfig,
    bootstrap: Script,
    engine: Mutex<Option<Box<dyn ExecutionEngine>>>,
    installer: Box<dyn Installer>,
    lifecycle: Mutex<Lifecycle>,
    errors: Arc<ErrorSlot>,
    listener: ListenerSlot,
    counters: Arc<Counters>,
    logging: AtomicBool,
}

impl Vm {
    /// Create a VM that will run `engine` once started.
    ///
    /// The installation step creates `config.vm.install_dir` when set.
    pub fn new(config: RuntimeConfig, bootstrap: Script, engine: Box<dyn ExecutionEngine>) -> Self {
        let installer = install::for_dir(config.vm.install_dir.as_deref());

        Self {
            config,
            bootstrap,
            engine: Mutex::new(Some(engine)),
            installer,
            lifecycle: Mutex::new(Lifecycle::Created),
            errors: Arc::new(ErrorSlot::new()),
            listener: Arc::new(RwLock::new(None)),
            counters: Arc::new(Counters::default()),
            logging: AtomicBool::new(false),
        }
    }

    /// Create a VM running the shell engine described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidParam`] if the configured bootstrap script
    /// cannot be loaded.
    pub fn from_config(config: &RuntimeConfig) -> Result<Self, VmError> {
        let bootstrap = match &config.engine.bootstrap {
            Some(path) => Script::from_file(path)?,
            None => Script::empty(),
        };
        let engine = ShellEngine::new(&config.engine);

        Ok(Self::new(config.clone(), bootstrap, Box::new(engine)))
    }

    /// Replace the installation step.
    #[must_use]
    pub fn with_installer(mut self, installer: impl Installer + 'static) -> Self {
        self.installer = Box::new(installer);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        match &*self.lifecycle.lock() {
            Lifecycle::Created => VmState::Created,
            Lifecycle::Running(_) => VmState::Running,
            Lifecycle::Failed => VmState::Failed,
            Lifecycle::Destroyed => VmState::Destroyed,
        }
    }

    /// Install, open the channel and spawn the worker and dispatcher.
    ///
    /// A failed start is terminal for this instance.
    ///
    /// # Errors
    ///
    /// - [`VmError::AlreadyStarted`] if the VM is running (state unchanged)
    /// - [`VmError::InstallFailed`], [`VmError::ChannelCreation`] or
    ///   [`VmError::ThreadCreation`] from the start steps
    /// - [`VmError::InvalidParam`] if the VM failed before or was destroyed
    #[instrument(skip(self), fields(engine_thread = %self.config.vm.worker_thread_name))]
    pub fn start(&self) -> Result<(), VmError> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => {
                warn!("VM already started");
                let err = VmError::AlreadyStarted;
                self.errors.set(&err);
                return Err(err);
            }
            Lifecycle::Failed => {
                return Err(VmError::invalid_param(
                    "VM failed to start; create a new instance",
                ));
            }
            Lifecycle::Destroyed => {
                return Err(VmError::invalid_param("VM has been destroyed"));
            }
        }

        self.errors.clear();

        match self.spawn() {
            Ok(running) => {
                *lifecycle = Lifecycle::Running(running);
                info!("VM started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, code = e.code().as_i32(), "VM start failed");
                self.errors.set(&e);
                *lifecycle = Lifecycle::Failed;
                Err(e)
            }
        }
    }

    fn spawn(&self) -> Result<Running, VmError> {
        self.installer.install()?;

        if self.config.logging.enabled {
            if let Err(e) = self.start_capture() {
                warn!(error = %e, "Continuing without output capture");
            }
        }

        let mut channel = CommChannel::create()?;
        let worker_end = channel
            .take_worker_end()
            .ok_or_else(|| VmError::runtime_init("worker endpoint already taken"))?;
        let transport = Arc::new(Transport::new(
            channel.clone_main_end()?,
            Arc::clone(&self.counters),
        ));

        let engine = self
            .engine
            .lock()
            .take()
            .ok_or_else(|| VmError::runtime_init("engine already consumed"))?;

        let worker = self.spawn_worker(engine, worker_end)?;

        let (queue, rx) = mpsc::unbounded_channel();
        let dispatcher = {
            let transport = Arc::clone(&transport);
            thread::Builder::new()
                .name(self.config.vm.dispatcher_thread_name.clone())
                .spawn(move || dispatch(rx, &transport))
        };
        let dispatcher = match dispatcher {
            Ok(handle) => handle,
            Err(e) => {
                channel.close();
                join(worker, "worker");
                return Err(VmError::thread_creation("dispatcher", e));
            }
        };

        Ok(Running {
            queue,
            channel,
            transport,
            dispatcher,
            worker,
        })
    }

    fn spawn_worker(
        &self,
        mut engine: Box<dyn ExecutionEngine>,
        endpoint: UnixStream,
    ) -> Result<JoinHandle<()>, VmError> {
        let bootstrap = self.bootstrap.clone();
        let errors = Arc::clone(&self.errors);

        thread::Builder::new()
            .name(self.config.vm.worker_thread_name.clone())
            .spawn(move || {
                debug!(bootstrap = ?bootstrap, "Worker running");
                match engine.run(&bootstrap, endpoint) {
                    Ok(()) => debug!("Worker exiting"),
                    Err(e) => {
                        error!(error = %e, code = e.code().as_i32(), "Engine stopped");
                        errors.set(&e);
                    }
                }
            })
            .map_err(|e| VmError::thread_creation("worker", e))
    }

    /// Queue a script; `completion` receives its result exactly once.
    ///
    /// If the VM is not running the completion is invoked immediately with
    /// [`STATUS_PROTOCOL_VIOLATION`].
    pub fn enqueue(&self, script: Script, completion: CompletionTask) -> Uuid {
        let id = Uuid::new_v4();
        let len = script.len();
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);

        let request = Request {
            id,
            script,
            completion,
        };
        let rejected = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running.queue.send(request).err().map(|e| e.0),
            _ => Some(request),
        };

        match rejected {
            None => debug!(%id, len, "Script queued"),
            Some(request) => {
                warn!(%id, "VM is not running; failing script");
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                request.completion.invoke(STATUS_PROTOCOL_VIOLATION);
            }
        }
        id
    }

    /// Queue a script and get a future for its result.
    pub fn submit(&self, script: Script) -> Completion {
        let (task, completion) = Completion::channel();
        self.enqueue(script, task);
        completion
    }

    /// Run a script on the calling thread, bypassing the queue.
    ///
    /// Blocks until the worker answers. Round trips from the dispatcher and
    /// other callers are serialized with this one.
    #[instrument(skip(self, script), fields(len = script.len()))]
    pub fn execute_blocking(&self, script: &Script) -> i32 {
        let transport = match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Some(Arc::clone(&running.transport)),
            _ => None,
        };

        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        let Some(transport) = transport else {
            warn!("VM is not running; failing script");
            self.counters.completed.fetch_add(1, Ordering::SeqCst);
            return STATUS_PROTOCOL_VIOLATION;
        };

        transport.execute(Uuid::new_v4(), script)
    }

    /// Start process-wide output capture with this VM's listener attached.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Logging`] if capture is already running or
    /// cannot be set up. The error is also recorded in the error slot.
    pub fn enable_logging(&self) -> Result<(), VmError> {
        self.start_capture().inspect_err(|e| self.errors.set(e))
    }

    fn start_capture(&self) -> Result<(), VmError> {
        let sink = ListenerSink::new(Arc::clone(&self.listener));
        capture::start_with_output(&self.config.logging, Arc::new(sink))?;
        self.logging.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop process-wide output capture.
    pub fn disable_logging(&self) {
        capture::stop();
        self.logging.store(false, Ordering::SeqCst);
    }

    /// Replace the listener receiving captured lines.
    pub fn set_log_listener(&self, listener: Option<Arc<dyn LogListener>>) {
        *self.listener.write() = listener;
    }

    /// The last recorded error.
    pub fn last_error(&self) -> Option<ErrorInfo> {
        self.errors.get()
    }

    /// Code of the last recorded error, [`ErrorCode::Ok`] when none.
    pub fn error_code(&self) -> ErrorCode {
        self.errors.code()
    }

    /// Message of the last recorded error.
    pub fn error_message(&self) -> Option<String> {
        self.errors.get().map(|info| info.message().to_string())
    }

    /// Forget the last recorded error.
    pub fn clear_error(&self) {
        self.errors.clear();
    }

    /// Round-trip instrumentation.
    pub fn stats(&self) -> VmStats {
        self.counters.snapshot()
    }

    /// Tear the VM down and join its threads.
    ///
    /// Requests still queued complete with [`STATUS_PROTOCOL_VIOLATION`].
    /// Output capture is stopped if this VM started it. Calling it again
    /// does nothing.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Destroyed);

        match previous {
            Lifecycle::Running(running) => {
                running.shutdown();
                info!("VM destroyed");
            }
            Lifecycle::Created | Lifecycle::Failed => debug!("VM destroyed before running"),
            Lifecycle::Destroyed => {}
        }

        if self.logging.swap(false, Ordering::SeqCst) {
            capture::stop();
        }
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vm")
            .field("state", &self.state())
            .field("bootstrap", &self.bootstrap)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
