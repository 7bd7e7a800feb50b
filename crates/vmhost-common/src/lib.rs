//! Common types, errors, and configuration for vmhost.
//!
//! This crate provides shared functionality used across the vmhost workspace:
//! - Error types using `thiserror`, plus the stable [`ErrorCode`] taxonomy
//! - Configuration structures for the VM, output capture and engine
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, LoggingConfig, RuntimeConfig, VmConfig};
pub use config_file::{ConfigFile, ConfigFileError, ScriptEntry};
pub use error::{ErrorCode, ErrorInfo, ErrorSlot, LoggingError, ProtocolError, VmError};
