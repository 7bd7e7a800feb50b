//! Process-wide output capture.
//!
//! Standard descriptors are a process-wide resource, so capture is a
//! singleton: sinks are configured once with [`set_native_log`] and
//! [`set_output_sink`], then [`start`] redirects stdout/stderr and spawns
//! the logger thread, and [`stop`] restores the descriptors and joins it.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use vmhost_common::{LoggingConfig, LoggingError};

use crate::logger::StreamLogger;
use crate::redirect::StdioRedirect;
use crate::sink::{NativeLog, OutputSink, Priority, Sinks};

struct Active {
    redirect: StdioRedirect,
    logger: StreamLogger,
}

struct CaptureState {
    native: Option<Arc<dyn NativeLog>>,
    output: Option<Arc<dyn OutputSink>>,
    active: Option<Active>,
}

static STATE: Mutex<CaptureState> = Mutex::new(CaptureState {
    native: None,
    output: None,
    active: None,
});

/// Set the native log used by subsequent [`start`] calls.
pub fn set_native_log(native: Option<Arc<dyn NativeLog>>) {
    STATE.lock().native = native;
}

/// Set the line receiver used by subsequent [`start`] calls.
pub fn set_output_sink(output: Option<Arc<dyn OutputSink>>) {
    STATE.lock().output = output;
}

/// Whether capture is currently running.
pub fn is_running() -> bool {
    STATE.lock().active.is_some()
}

/// Redirect stdout/stderr and start the logger thread.
///
/// # Errors
///
/// Returns [`LoggingError::AlreadyRunning`] if capture is active, or the
/// redirection / thread spawn error. On error the descriptors are left as
/// they were.
pub fn start(config: &LoggingConfig) -> Result<(), LoggingError> {
    let mut state = STATE.lock();
    let output = state.output.clone();
    start_locked(&mut state, config, output)
}

/// Like [`start`], but with `output` as the line receiver.
///
/// `output` replaces the configured receiver only if capture starts; on
/// error the previous receiver stays in place.
///
/// # Errors
///
/// Same as [`start`].
pub fn start_with_output(
    config: &LoggingConfig,
    output: Arc<dyn OutputSink>,
) -> Result<(), LoggingError> {
    let mut state = STATE.lock();
    start_locked(&mut state, config, Some(Arc::clone(&output)))?;
    state.output = Some(output);
    Ok(())
}

fn start_locked(
    state: &mut CaptureState,
    config: &LoggingConfig,
    output: Option<Arc<dyn OutputSink>>,
) -> Result<(), LoggingError> {
    if state.active.is_some() {
        return Err(LoggingError::AlreadyRunning);
    }

    let mut sinks = Sinks::new(config.tag.as_str());
    if let Some(native) = &state.native {
        sinks = sinks.with_native(Arc::clone(native));
    }
    if let Some(output) = output {
        sinks = sinks.with_output(output);
    }

    let (redirect, sources) = StdioRedirect::install().inspect_err(|e| {
        sinks.native(Priority::Error, &e.to_string());
    })?;

    let logger = match StreamLogger::spawn(sources, sinks.clone(), config) {
        Ok(logger) => logger,
        Err(e) => {
            redirect.restore();
            sinks.native(Priority::Warn, "Failed to create logging thread");
            return Err(e);
        }
    };

    sinks.native(Priority::Debug, "Logging thread started");
    info!(tag = %config.tag, "Output capture started");
    state.active = Some(Active { redirect, logger });
    Ok(())
}

/// Restore stdout/stderr and join the logger thread.
///
/// Pending output is flushed to the sinks before this returns. Calling it
/// while capture is not running does nothing.
pub fn stop() {
    let Some(active) = STATE.lock().active.take() else {
        return;
    };

    // Restoring closes the last write ends, so the logger sees EOF after
    // consuming everything already written.
    active.redirect.restore();
    active.logger.stop();
    debug!("Output capture stopped");
}
