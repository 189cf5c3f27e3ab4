//! Error types for the esp-exception-decoder MCP server

use std::time::Duration;

use thiserror::Error;

/// Main error type for the esp-exception-decoder MCP server
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("ERROR: {0} not found!")]
    ToolNotFound(String),

    #[error("ERROR: {0}")]
    BinaryNotFound(String),

    #[error("Not Supported on {0}")]
    UnsupportedTarget(String),

    #[error("Unknown resolver '{0}' (expected addr2line or gdb)")]
    InvalidResolver(String),

    #[error("Resolver exited with {}", describe_exit(.code))]
    ResolverExit { code: Option<i32> },

    #[error("Resolver timed out after {0:?}")]
    ResolverTimeout(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl DecodeError {
    /// The resolver tool or the firmware ELF is missing; nothing can be decoded.
    pub fn is_missing_toolchain(&self) -> bool {
        matches!(self, DecodeError::ToolNotFound(_) | DecodeError::BinaryNotFound(_))
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DecodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_not_found_message() {
        let err = DecodeError::ToolNotFound("xtensa-lx106-elf-addr2line".to_string());
        assert_eq!(err.to_string(), "ERROR: xtensa-lx106-elf-addr2line not found!");
        assert!(err.is_missing_toolchain());
        assert!(DecodeError::BinaryNotFound("blink.ino.elf was not found!".to_string()).is_missing_toolchain());
    }

    #[test]
    fn test_resolver_exit_message() {
        assert_eq!(
            DecodeError::ResolverExit { code: Some(1) }.to_string(),
            "Resolver exited with status 1"
        );
        assert_eq!(
            DecodeError::ResolverExit { code: None }.to_string(),
            "Resolver exited with a signal"
        );
        assert!(!DecodeError::ResolverExit { code: Some(1) }.is_missing_toolchain());
        assert_eq!(
            DecodeError::ResolverTimeout(Duration::from_secs(30)).to_string(),
            "Resolver timed out after 30s"
        );
        assert!(!DecodeError::ResolverTimeout(Duration::from_secs(30)).is_missing_toolchain());
        assert!(!DecodeError::InternalError("replay queue poisoned".to_string()).is_missing_toolchain());
    }
}
