//! Error types for the klnk protocol layer.
//!
//! Every failure a request can produce maps onto one `KlnkError` variant, and
//! every variant maps back to a host error number through [`KlnkError::errno`],
//! so a backend code is never dropped on its way to the caller.

use crate::config::ProtocolConfig;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the klnk library.
#[derive(Debug, Error)]
pub enum KlnkError {
    // Caller errors
    #[error("Invalid argument for {field}: {message}")]
    InvalidArgument { field: String, message: String },

    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    // Outcomes reported by the backend or by the scope check
    #[error("Not found (code {code})")]
    NotFound { code: i32 },

    #[error("Denied (code {code})")]
    Denied { code: i32 },

    #[error("Control transaction failed with code {code}")]
    TransactionFailed { code: i32 },

    #[error("Backend asked for local resolution")]
    RetrySignal,

    #[error("Interrupted, retry the original operation")]
    Interrupted,

    // Control channel transport
    #[error("Control channel to {endpoint} lost")]
    ChannelLost { endpoint: String },

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for klnk operations.
pub type Result<T> = std::result::Result<T, KlnkError>;

impl From<std::io::Error> for KlnkError {
    fn from(err: std::io::Error) -> Self {
        KlnkError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for KlnkError {
    fn from(err: serde_json::Error) -> Self {
        KlnkError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl KlnkError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        KlnkError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Shorthand for an `InvalidArgument` on a named field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        KlnkError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify a non-OK code returned by the control channel.
    ///
    /// Codes are positive error numbers. `EOK` must be filtered out by the
    /// caller before classification; passing it here yields
    /// `TransactionFailed` so that nothing is ever turned into success by
    /// accident.
    pub fn from_code(code: i32) -> Self {
        match code {
            libc::EAGAIN => KlnkError::RetrySignal,
            libc::EINTR => KlnkError::Interrupted,
            libc::ENOENT | ProtocolConfig::ERMID => KlnkError::NotFound { code },
            libc::EACCES | libc::EPERM | ProtocolConfig::ENOOWNER => KlnkError::Denied { code },
            libc::EINVAL => KlnkError::invalid("backend", "rejected by backend"),
            libc::ENOMEM => KlnkError::ResourceExhausted {
                message: "backend out of memory".to_string(),
            },
            _ => KlnkError::TransactionFailed { code },
        }
    }

    /// Host error number equivalent of this error.
    ///
    /// For errors classified from a backend code this is the original code.
    pub fn errno(&self) -> i32 {
        match self {
            KlnkError::InvalidArgument { .. } => libc::EINVAL,
            KlnkError::ResourceExhausted { .. } => libc::ENOMEM,
            KlnkError::NotFound { code }
            | KlnkError::Denied { code }
            | KlnkError::TransactionFailed { code } => *code,
            KlnkError::RetrySignal => libc::EAGAIN,
            KlnkError::Interrupted => libc::EINTR,
            KlnkError::ChannelLost { .. } => libc::EPIPE,
            KlnkError::VersionMismatch { .. } => libc::EPROTO,
            KlnkError::Config { .. } => libc::EINVAL,
            KlnkError::Io { source, .. } => source
                .as_ref()
                .and_then(|e| e.raw_os_error())
                .unwrap_or(libc::EIO),
            KlnkError::Json { .. } => libc::EPROTO,
        }
    }

    /// True for the reserved protocol range (900 and up), false for host codes.
    pub fn is_protocol_code(&self) -> bool {
        (ProtocolConfig::EOK..ProtocolConfig::ERRNO_MAX).contains(&self.errno())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KlnkError::invalid("path", "too long");
        assert_eq!(err.to_string(), "Invalid argument for path: too long");
    }

    #[test]
    fn test_code_classification() {
        assert!(matches!(KlnkError::from_code(libc::EAGAIN), KlnkError::RetrySignal));
        assert!(matches!(KlnkError::from_code(libc::EINTR), KlnkError::Interrupted));
        assert!(matches!(
            KlnkError::from_code(ProtocolConfig::ERMID),
            KlnkError::NotFound { code: 902 }
        ));
        assert!(matches!(
            KlnkError::from_code(ProtocolConfig::ENOOWNER),
            KlnkError::Denied { code: 901 }
        ));
        assert!(matches!(
            KlnkError::from_code(ProtocolConfig::EMIGRATE),
            KlnkError::TransactionFailed { code: 903 }
        ));
    }

    #[test]
    fn test_errno_preserves_backend_code() {
        for code in [libc::ENOENT, libc::EPERM, libc::EBUSY, 901, 902, 903, 950] {
            assert_eq!(KlnkError::from_code(code).errno(), code);
        }
    }

    #[test]
    fn test_eok_is_never_success_here() {
        assert!(matches!(
            KlnkError::from_code(ProtocolConfig::EOK),
            KlnkError::TransactionFailed { code: 900 }
        ));
    }

    #[test]
    fn test_protocol_code_range() {
        assert!(KlnkError::from_code(ProtocolConfig::EMIGRATE).is_protocol_code());
        assert!(!KlnkError::from_code(libc::EBUSY).is_protocol_code());
    }
}
