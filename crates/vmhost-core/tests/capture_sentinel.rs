//! End-to-end test: a shell script's output is captured while it runs.
//!
//! Capture redirects the real descriptors of the test process, so this file
//! holds a single test.

use std::sync::Arc;

use parking_lot::Mutex;

use vmhost_common::{ErrorCode, LoggingConfig, LoggingError, RuntimeConfig, VmError};
use vmhost_core::{FnEngine, LogListener, Script, Vm};
use vmhost_logging::{TERMINAL_MARKER, capture};

#[derive(Default)]
struct Recorder {
    out: Mutex<Vec<String>>,
    err: Mutex<Vec<String>>,
}

impl LogListener for Recorder {
    fn accept(&self, line: &str) {
        self.out.lock().push(line.to_string());
    }

    fn on_error(&self, line: &str) {
        self.err.lock().push(line.to_string());
    }
}

#[test]
fn test_sentinel_script_is_captured() {
    let config = RuntimeConfig {
        logging: LoggingConfig {
            tag: "sentinel".into(),
            poll_timeout_ms: 50,
            ..Default::default()
        },
        ..Default::default()
    };

    let recorder = Arc::new(Recorder::default());
    let vm = Vm::from_config(&config).unwrap();
    vm.set_log_listener(Some(recorder.clone()));
    vm.start().unwrap();
    vm.enable_logging().unwrap();
    assert!(capture::is_running());

    // A second VM cannot take over capture, and its listener stays detached.
    let intruder = Arc::new(Recorder::default());
    let other = Vm::new(
        config.clone(),
        Script::empty(),
        Box::new(FnEngine::new(|_: &Script| 0)),
    );
    other.set_log_listener(Some(intruder.clone()));
    assert!(matches!(
        other.enable_logging(),
        Err(VmError::Logging(LoggingError::AlreadyRunning))
    ));
    assert_eq!(other.error_code(), ErrorCode::Logging);
    drop(other);
    assert!(capture::is_running());

    let status = vm
        .submit(Script::from("echo SENTINEL; echo oops >&2; exit 3"))
        .wait();
    assert_eq!(status, 3);

    // Joins the worker, then stops capture and flushes the logger.
    vm.destroy();
    assert!(!capture::is_running());

    let out = recorder.out.lock();
    assert_eq!(out.iter().filter(|l| *l == "SENTINEL").count(), 1);
    assert_eq!(out.last().map(String::as_str), Some(TERMINAL_MARKER));
    assert_eq!(*recorder.err.lock(), vec!["oops".to_string()]);
    assert!(intruder.out.lock().is_empty());
    assert!(intruder.err.lock().is_empty());
}
