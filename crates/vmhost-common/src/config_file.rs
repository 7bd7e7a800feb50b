//! Configuration file structures for vmhost.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ScriptEntry`]: Script submitted at startup

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.vm]
/// install_dir = "./vm-home"
///
/// [runtime.logging]
/// enabled = true
/// tag = "my-app"
///
/// [runtime.engine]
/// program = "/bin/sh"
/// args = ["-c"]
///
/// [[scripts]]
/// id = "hello"
/// path = "./scripts/hello.sh"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (vm + logging + engine settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Scripts to submit at startup, in order.
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// A script submitted at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptEntry {
    /// Identifier used in log output.
    pub id: String,

    /// Path to the script file.
    pub path: PathBuf,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(!config.runtime.logging.enabled);
        assert_eq!(config.runtime.engine.program, "/bin/sh");
        assert!(config.scripts.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [runtime.logging]
            enabled = true
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert!(config.runtime.logging.enabled);
        // Defaults applied
        assert_eq!(config.runtime.logging.tag, "vmhost");
        assert_eq!(config.runtime.logging.poll_timeout_ms, 1000);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [runtime.vm]
            install_dir = "/tmp/vm-home"
            worker_thread_name = "engine"

            [runtime.logging]
            enabled = true
            tag = "host-app"
            read_chunk = 256
            growth_factor = 2.0
            poll_timeout_ms = 200

            [runtime.engine]
            program = "/bin/bash"
            args = ["--noprofile", "-c"]
            bootstrap = "./boot.sh"

            [[scripts]]
            id = "hello"
            path = "./hello.sh"

            [[scripts]]
            id = "world"
            path = "./world.sh"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(
            config.runtime.vm.install_dir,
            Some(PathBuf::from("/tmp/vm-home"))
        );
        assert_eq!(config.runtime.vm.worker_thread_name, "engine");
        assert_eq!(config.runtime.vm.dispatcher_thread_name, "vmhost-dispatch");
        assert_eq!(config.runtime.logging.tag, "host-app");
        assert_eq!(config.runtime.logging.read_chunk, 256);
        assert_eq!(config.runtime.logging.poll_timeout_ms, 200);
        assert_eq!(config.runtime.engine.program, "/bin/bash");
        assert_eq!(config.runtime.engine.args.len(), 2);
        assert_eq!(
            config.runtime.engine.bootstrap,
            Some(PathBuf::from("./boot.sh"))
        );
        assert_eq!(config.scripts.len(), 2);
        assert_eq!(config.scripts[0].id, "hello");
        assert_eq!(config.scripts[1].path, PathBuf::from("./world.sh"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[runtime.logging]\ntag = \"from-file\"").unwrap();

        let config = ConfigFile::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.logging.tag, "from-file");
    }

    #[test]
    fn test_from_missing_file() {
        let result = ConfigFile::from_file("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
