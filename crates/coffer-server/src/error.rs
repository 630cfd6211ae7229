//! Error types for the daemon shell.

use thiserror::Error;

/// Result type alias for daemon operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Error variants for the daemon shell.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket or file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A store engine operation failed.
    #[error("store error: {0}")]
    Store(#[from] coffer_store::StoreError),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The peer could not be mapped to an enabled account.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Malformed frame or message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration file missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A network read exceeded its deadline.
    #[error("network read timed out")]
    Timeout,
}
