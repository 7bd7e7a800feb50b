//! Execution engines.
//!
//! An [`ExecutionEngine`] owns the worker side of the command channel for
//! the whole life of a VM: it initializes once, runs the bootstrap script,
//! then loops reading requests and writing status digits until the channel
//! closes. [`serve`] implements that loop for any [`ScriptExecutor`].

use std::io::{BufReader, ErrorKind};
use std::os::unix::net::UnixStream;
use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, error, info, warn};

use vmhost_common::{EngineConfig, ProtocolError, VmError};

use crate::protocol::{self, STATUS_BAD_REQUEST};
use crate::script::Script;

/// The worker side of a VM.
///
/// `run` is called once on the VM's worker thread and must not return
/// until the endpoint reports end-of-stream (or the engine fails).
pub trait ExecutionEngine: Send + 'static {
    /// Initialize, run `bootstrap`, then serve requests on `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::RuntimeInit`] if initialization or the bootstrap
    /// fails, or the error that ended the request loop.
    fn run(&mut self, bootstrap: &Script, endpoint: UnixStream) -> Result<(), VmError>;
}

/// Executes one script and reports a status.
pub trait ScriptExecutor {
    /// Run `script`; `0` means success.
    fn execute(&mut self, script: &Script) -> u8;
}

impl<F> ScriptExecutor for F
where
    F: FnMut(&Script) -> u8,
{
    fn execute(&mut self, script: &Script) -> u8 {
        self(script)
    }
}

/// Serve requests on `endpoint` until the peer closes it.
///
/// Malformed requests are answered with [`STATUS_BAD_REQUEST`] and the
/// loop continues.
///
/// # Errors
///
/// Returns [`VmError::Protocol`] if the channel fails or closes mid-frame.
pub fn serve<E>(endpoint: &UnixStream, executor: &mut E) -> Result<(), VmError>
where
    E: ScriptExecutor + ?Sized,
{
    let mut reader = BufReader::new(endpoint);
    let mut writer = endpoint;
    let mut served: u64 = 0;

    loop {
        let status = match protocol::read_request(&mut reader) {
            Ok(None) => {
                debug!(served, "Command channel closed");
                return Ok(());
            }
            Ok(Some(body)) => match Script::from_bytes(&body) {
                Ok(script) => executor.execute(&script),
                Err(e) => {
                    warn!(error = %e, "Rejecting request");
                    STATUS_BAD_REQUEST
                }
            },
            Err(ProtocolError::InvalidLength { line }) => {
                warn!(line = %line, "Invalid length prefix");
                STATUS_BAD_REQUEST
            }
            Err(ProtocolError::TooLarge { len, max }) => {
                warn!(len, max, "Discarded oversized request");
                STATUS_BAD_REQUEST
            }
            Err(e) => return Err(e.into()),
        };

        match protocol::write_response(&mut writer, status) {
            Ok(()) => served += 1,
            // The submitter went away while the script ran.
            Err(ProtocolError::Io(e)) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(served, "Command channel closed during execution");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Engine running each script with an external interpreter program.
///
/// Every script is executed as `program args... <script text>` with the
/// process's standard output and error inherited, so output capture sees
/// whatever the script prints.
#[derive(Debug, Clone)]
pub struct ShellEngine {
    program: String,
    args: Vec<String>,
}

impl ShellEngine {
    /// Create an engine from configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }
}

impl ScriptExecutor for ShellEngine {
    fn execute(&mut self, script: &Script) -> u8 {
        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(script.content())
            .stdin(Stdio::null())
            .status();

        match result {
            Ok(status) => exit_status(status),
            Err(e) => {
                let err = VmError::runtime_exec(format!("failed to spawn '{}': {e}", self.program));
                error!(error = %err, code = err.code().as_i32(), "Script execution failed");
                STATUS_BAD_REQUEST
            }
        }
    }
}

impl ExecutionEngine for ShellEngine {
    fn run(&mut self, bootstrap: &Script, endpoint: UnixStream) -> Result<(), VmError> {
        info!(program = %self.program, "Shell engine starting");

        if !bootstrap.is_empty() {
            let status = self.execute(bootstrap);
            if status != 0 {
                return Err(VmError::runtime_init(format!(
                    "bootstrap script exited with status {status}"
                )));
            }
            debug!("Bootstrap script completed");
        }

        serve(&endpoint, self)
    }
}

/// Map a process exit status to a single status digit.
fn exit_status(status: ExitStatus) -> u8 {
    match status.code() {
        Some(code) => u8::try_from(code.clamp(0, 9)).unwrap_or(9),
        None => {
            debug!(%status, "Script terminated by signal");
            STATUS_BAD_REQUEST
        }
    }
}

/// Engine backed by a closure.
///
/// The closure runs the bootstrap first (a non-zero status fails the
/// start), then every submitted script.
pub struct FnEngine<F> {
    executor: F,
}

impl<F> FnEngine<F>
where
    F: FnMut(&Script) -> u8 + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(executor: F) -> Self {
        Self { executor }
    }
}

impl<F> ExecutionEngine for FnEngine<F>
where
    F: FnMut(&Script) -> u8 + Send + 'static,
{
    fn run(&mut self, bootstrap: &Script, endpoint: UnixStream) -> Result<(), VmError> {
        if !bootstrap.is_empty() {
            let status = (self.executor)(bootstrap);
            if status != 0 {
                return Err(VmError::runtime_init(format!(
                    "bootstrap returned status {status}"
                )));
            }
        }

        serve(&endpoint, &mut self.executor)
    }
}

impl<F> std::fmt::Debug for FnEngine<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread;

    use super::*;
    use crate::protocol::{read_response, write_request};

    fn spawn_serve<E>(mut executor: E) -> (UnixStream, thread::JoinHandle<Result<(), VmError>>)
    where
        E: ScriptExecutor + Send + 'static,
    {
        let (main, worker) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || serve(&worker, &mut executor));
        (main, handle)
    }

    #[test]
    fn test_serve_round_trips() {
        let (mut main, handle) = spawn_serve(|script: &Script| {
            u8::try_from(script.len()).unwrap_or(9)
        });

        write_request(&mut main, b"abc").unwrap();
        assert_eq!(read_response(&mut main).unwrap(), 3);
        write_request(&mut main, b"abcdefghijkl").unwrap();
        assert_eq!(read_response(&mut main).unwrap(), 9);

        drop(main);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_serve_answers_bad_length_and_continues() {
        let (mut main, handle) = spawn_serve(|_: &Script| 0);

        main.write_all(b"nope\n").unwrap();
        assert_eq!(read_response(&mut main).unwrap(), STATUS_BAD_REQUEST);

        write_request(&mut main, b"ok").unwrap();
        assert_eq!(read_response(&mut main).unwrap(), 0);

        drop(main);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_serve_truncated_frame_is_error() {
        let (mut main, handle) = spawn_serve(|_: &Script| 0);

        main.write_all(b"10\nabc").unwrap();
        drop(main);

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            VmError::Protocol(ProtocolError::Truncated { expected: 10, got: 3 })
        ));
    }

    #[test]
    fn test_exit_status_clamped() {
        let mut engine = ShellEngine::new(&EngineConfig::default());
        assert_eq!(engine.execute(&Script::from("exit 0")), 0);
        assert_eq!(engine.execute(&Script::from("exit 3")), 3);
        assert_eq!(engine.execute(&Script::from("exit 42")), 9);
    }

    #[test]
    fn test_spawn_failure_reports_one() {
        let config = EngineConfig {
            program: "/nonexistent/vmhost-interpreter".into(),
            ..Default::default()
        };
        let mut engine = ShellEngine::new(&config);
        assert_eq!(engine.execute(&Script::from("exit 0")), STATUS_BAD_REQUEST);
    }

    #[test]
    fn test_failing_bootstrap_is_runtime_init() {
        let (_main, worker) = UnixStream::pair().unwrap();
        let mut engine = ShellEngine::new(&EngineConfig::default());

        let err = engine.run(&Script::from("exit 1"), worker).unwrap_err();
        assert!(matches!(err, VmError::RuntimeInit { .. }));
    }

    #[test]
    fn test_fn_engine_bootstrap_failure_stops_worker() {
        let (mut main, worker) = UnixStream::pair().unwrap();
        let mut seen = Vec::new();
        let handle = thread::spawn(move || {
            let mut engine = FnEngine::new(move |script: &Script| {
                seen.push(script.content().to_string());
                u8::try_from(seen.len()).unwrap_or(9)
            });
            engine.run(&Script::from("boot"), worker)
        });

        // Bootstrap returned 1, so the engine refuses to serve.
        write_request(&mut main, b"x").ok();
        assert!(read_response(&mut main).is_err());
        assert!(matches!(
            handle.join().unwrap(),
            Err(VmError::RuntimeInit { .. })
        ));
    }
}
