//! Channel error taxonomy.

use thiserror::Error;

/// Result type for channel operations
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Errors that can occur in channel operations
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// Establishing the connection failed
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Connection was lost mid-stream
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame exceeded the channel's size limit or was malformed
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation did not complete before its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Operation requires a connected channel
    #[error("Channel not connected")]
    NotConnected,

    /// Channel kind is not available for this endpoint
    #[error("Channel not available: {0}")]
    NotAvailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ChannelError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
