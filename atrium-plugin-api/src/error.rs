//! Error types for plugin authors

use thiserror::Error;

/// Errors that plugins can return from lifecycle handlers, and that the
/// plugin-side runtime reports while speaking to the host.
#[derive(Error, Debug)]
pub enum PluginError {
    /// IO error on the control channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The host (or this runtime) violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A `helper/eval` call was rejected by the host
    #[error("Helper error: {0}")]
    Helper(String),

    /// Serialization error on the control channel
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

impl PluginError {
    /// Create a custom error with a message
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PluginError::Protocol("unexpected frame".to_string());
        assert_eq!(err.to_string(), "Protocol error: unexpected frame");

        let err = PluginError::Helper("eval rejected".to_string());
        assert_eq!(err.to_string(), "Helper error: eval rejected");

        let err = PluginError::Custom("something happened".to_string());
        assert_eq!(err.to_string(), "something happened");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PluginError = io_err.into();

        assert!(matches!(err, PluginError::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }

    #[test]
    fn test_helper_constructors() {
        let err = PluginError::custom("test");
        assert!(matches!(err, PluginError::Custom(_)));

        let err = PluginError::protocol("bad frame");
        assert!(matches!(err, PluginError::Protocol(_)));
    }
}
