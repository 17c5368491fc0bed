//! Error types for the printer link layer

use thiserror::Error;

/// Printer link error types
#[derive(Debug, Error)]
pub enum PrintError {
    /// Dial failure, lost link or transport-level rejection
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Operation needs an open transport
    #[error("Not connected to device")]
    NotConnected,

    /// IO error on the underlying socket / stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connect, discovery or transfer timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A pending wait was released by `disconnect()`
    #[error("Operation cancelled by disconnect")]
    Cancelled,

    /// Invalid printer configuration
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Transport not available in this build / on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl PrintError {
    /// True for timeout errors (connect / discovery / transfer)
    pub fn is_timeout(&self) -> bool {
        matches!(self, PrintError::Timeout(_))
    }
}

/// Result type for printer link operations
pub type PrintResult<T> = Result<T, PrintError>;
