//! Configuration structures for vmhost.
//!
//! This module defines configuration options for the components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`VmConfig`]: VM lifecycle settings (install dir, thread names)
//! - [`LoggingConfig`]: Output capture settings (buffers, poll timeout)
//! - [`EngineConfig`]: Execution engine settings (interpreter program)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// It can be loaded from TOML files or built in code.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// VM lifecycle configuration.
    #[serde(default)]
    pub vm: VmConfig,

    /// Output capture configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Execution engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// VM lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VmConfig {
    /// Directory materialized before the engine starts.
    ///
    /// When unset, the installation step is skipped.
    #[serde(default)]
    pub install_dir: Option<PathBuf>,

    /// Name of the persistent worker thread.
    #[serde(default = "defaults::worker_thread_name")]
    pub worker_thread_name: String,

    /// Name of the thread draining the submission queue.
    #[serde(default = "defaults::dispatcher_thread_name")]
    pub dispatcher_thread_name: String,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            install_dir: None,
            worker_thread_name: defaults::worker_thread_name(),
            dispatcher_thread_name: defaults::dispatcher_thread_name(),
        }
    }
}

/// Output capture configuration.
///
/// Controls how the redirected stdout/stderr streams are drained and
/// reassembled into lines.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Capture stdout/stderr as soon as the VM starts.
    #[serde(default)]
    pub enabled: bool,

    /// Tag passed to the native log sink.
    #[serde(default = "defaults::tag")]
    pub tag: String,

    /// Maximum bytes read from a stream per readiness event.
    #[serde(default = "defaults::read_chunk")]
    pub read_chunk: usize,

    /// Initial capacity of each line buffer.
    #[serde(default = "defaults::initial_capacity")]
    pub initial_capacity: usize,

    /// Multiplicative growth factor applied when a line outgrows its buffer.
    #[serde(default = "defaults::growth_factor")]
    pub growth_factor: f64,

    /// Upper bound on each readiness wait, so the stop flag is rechecked.
    #[serde(default = "defaults::poll_timeout_ms")]
    pub poll_timeout_ms: u16,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tag: defaults::tag(),
            read_chunk: defaults::read_chunk(),
            initial_capacity: defaults::initial_capacity(),
            growth_factor: defaults::growth_factor(),
            poll_timeout_ms: defaults::poll_timeout_ms(),
        }
    }
}

impl LoggingConfig {
    /// Get the poll timeout as a `Duration`.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_timeout_ms))
    }
}

/// Execution engine configuration.
///
/// The built-in shell engine runs every script as `program args... <script>`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Interpreter program.
    #[serde(default = "defaults::program")]
    pub program: String,

    /// Arguments placed before the script text.
    #[serde(default = "defaults::args")]
    pub args: Vec<String>,

    /// Bootstrap script run once when the worker comes up.
    #[serde(default)]
    pub bootstrap: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: defaults::program(),
            args: defaults::args(),
            bootstrap: None,
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub fn worker_thread_name() -> String {
        "vmhost-worker".to_string()
    }

    pub fn dispatcher_thread_name() -> String {
        "vmhost-dispatch".to_string()
    }

    pub fn tag() -> String {
        "vmhost".to_string()
    }

    pub const fn read_chunk() -> usize {
        128
    }

    pub const fn initial_capacity() -> usize {
        128
    }

    pub const fn growth_factor() -> f64 {
        1.5
    }

    pub const fn poll_timeout_ms() -> u16 {
        1000
    }

    pub fn program() -> String {
        "/bin/sh".to_string()
    }

    pub fn args() -> Vec<String> {
        vec!["-c".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.vm.install_dir.is_none());
        assert_eq!(config.vm.worker_thread_name, "vmhost-worker");
        assert_eq!(config.vm.dispatcher_thread_name, "vmhost-dispatch");

        assert!(!config.logging.enabled);
        assert_eq!(config.logging.tag, "vmhost");
        assert_eq!(config.logging.read_chunk, 128);
        assert_eq!(config.logging.initial_capacity, 128);
        assert!((config.logging.growth_factor - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.logging.poll_timeout_ms, 1000);

        assert_eq!(config.engine.program, "/bin/sh");
        assert_eq!(config.engine.args, vec!["-c".to_string()]);
        assert!(config.engine.bootstrap.is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.logging.read_chunk, deserialized.logging.read_chunk);
        assert_eq!(config.engine.program, deserialized.engine.program);
    }

    #[test]
    fn test_poll_timeout() {
        let config = LoggingConfig {
            poll_timeout_ms: 250,
            ..Default::default()
        };

        assert_eq!(config.poll_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"logging": {"read_chunk": 64}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.logging.read_chunk, 64);
        // Default values for unspecified fields
        assert_eq!(config.logging.poll_timeout_ms, 1000);
        assert_eq!(config.engine.program, "/bin/sh");
    }
}
