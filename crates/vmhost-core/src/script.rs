//! Script values submitted to a VM.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use vmhost_common::VmError;

/// An immutable unit of source text.
///
/// Cloning is cheap: the text is shared. The content is never modified
/// after construction, so a script can be queued and read from any thread.
#[derive(Clone, PartialEq, Eq)]
pub struct Script {
    content: Arc<str>,
}

impl Script {
    /// Create a script from source text.
    pub fn new(content: impl Into<Arc<str>>) -> Self {
        Self {
            content: content.into(),
        }
    }

    /// An empty script, e.g. when no bootstrap is configured.
    pub fn empty() -> Self {
        Self::new("")
    }

    /// Create a script from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidParam`] if the bytes are not valid UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VmError> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| VmError::invalid_param(format!("script is not valid UTF-8: {e}")))?;
        Ok(Self::new(content))
    }

    /// Load a script from a file.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidParam`] if the file cannot be read or is
    /// not valid UTF-8.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VmError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            VmError::invalid_param(format!("failed to read script '{}': {e}", path.display()))
        })?;
        Self::from_bytes(&bytes)
    }

    /// The source text.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The source text as bytes, as sent over the command channel.
    pub fn as_bytes(&self) -> &[u8] {
        self.content.as_bytes()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Whether the script has no content.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Hash of the content, used to correlate log events.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.content.hash(&mut hasher);
        hasher.finish()
    }
}

impl From<&str> for Script {
    fn from(content: &str) -> Self {
        Self::new(content)
    }
}

impl From<String> for Script {
    fn from(content: String) -> Self {
        Self::new(content)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("len", &self.len())
            .field("hash", &format_args!("{:016x}", self.content_hash()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_script_from_str() {
        let script = Script::from("puts 'hi'");
        assert_eq!(script.content(), "puts 'hi'");
        assert_eq!(script.len(), 9);
        assert!(!script.is_empty());
        assert!(Script::empty().is_empty());
    }

    #[test]
    fn test_clone_shares_content() {
        let script = Script::from(String::from("echo hi"));
        let copy = script.clone();
        assert_eq!(script, copy);
        assert_eq!(script.content_hash(), copy.content_hash());
        assert!(std::ptr::eq(script.content(), copy.content()));
    }

    #[test]
    fn test_from_bytes_rejects_invalid_utf8() {
        let err = Script::from_bytes(&[0x66, 0xff, 0x6f]).unwrap_err();
        assert!(matches!(err, VmError::InvalidParam { .. }));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"exit 3\n").unwrap();

        let script = Script::from_file(file.path()).unwrap();
        assert_eq!(script.content(), "exit 3\n");

        let err = Script::from_file("/nonexistent/vmhost/script.sh").unwrap_err();
        assert!(err.to_string().contains("failed to read script"));
    }
}
