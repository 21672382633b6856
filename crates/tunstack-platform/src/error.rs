//! Platform-specific errors

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// External command exited unsuccessfully
    #[error("Command '{command}' failed ({status}): {stderr}")]
    CommandFailed {
        /// Command line that was run
        command: String,
        /// Exit status as reported by the OS
        status: String,
        /// Trimmed standard error output
        stderr: String,
    },

    /// Unexpected output from the OS
    #[error("Parse error: {0}")]
    Parse(String),

    /// Operation not available on this platform
    #[error("Unsupported on this platform: {0}")]
    Unsupported(String),

    /// TUN device creation or I/O setup failed
    #[error("TUN device error: {0}")]
    Device(String),

    /// Error raised by the core library
    #[error(transparent)]
    Core(#[from] tunstack_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Platform result type
pub type Result<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    /// Create a parse error
    pub fn parse(message: impl ToString) -> Self {
        Self::Parse(message.to_string())
    }
}

impl From<PlatformError> for tunstack_core::Error {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::Core(e) => e,
            PlatformError::Io(e) => Self::Io(e),
            PlatformError::CommandFailed {
                command, stderr, ..
            } => Self::kernel(command, stderr),
            PlatformError::Device(message) => {
                Self::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
            other => Self::Stack(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failure_maps_to_kernel_state() {
        let err = PlatformError::CommandFailed {
            command: "ip -4 rule add priority 9000".into(),
            status: "exit status: 2".into(),
            stderr: "RTNETLINK answers: File exists".into(),
        };
        assert!(err.to_string().contains("File exists"));

        let core: tunstack_core::Error = err.into();
        assert!(matches!(core, tunstack_core::Error::KernelState { .. }));
    }

    #[test]
    fn test_core_error_passes_through() {
        let err = PlatformError::from(tunstack_core::Error::AmbiguousRoute("none".into()));
        let core: tunstack_core::Error = err.into();
        assert!(matches!(core, tunstack_core::Error::AmbiguousRoute(_)));
    }
}
