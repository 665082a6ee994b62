//! Error types for the capture pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing and encoding frames
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid business configuration, detected before any remote call
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The page reported a different source identifier than the caller expected
    #[error("Source mismatch: expected {expected:?}, page reported {actual:?}")]
    SourceMismatch { expected: String, actual: String },

    /// The remote surface could not be reached or its setup call failed
    #[error("Remote initialization failed: {0}")]
    RemoteInit(String),

    /// A frame render failed on the remote surface
    #[error("Remote render failed: {0}")]
    RemoteRender(String),

    /// The subprocess replied outside its response vocabulary
    #[error("Protocol violation: unexpected response {0:?}")]
    ProtocolViolation(String),

    /// The subprocess exited while a response was still owed
    #[error("Subprocess closed its control stream mid-request")]
    ChannelClosed,

    /// Failed to start an external process
    #[error("Failed to start subprocess: {0}")]
    Spawn(#[source] std::io::Error),

    /// The encoder subprocess rejected input or exited abnormally
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// CDP-specific error
    #[cfg(feature = "cdp")]
    #[error("CDP error: {0}")]
    Cdp(String),

    /// I/O error on a subprocess stream or the filesystem
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(feature = "cdp")]
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Cdp(err.to_string())
    }
}
