//! Error types for verity-distributed

use thiserror::Error;

/// Result type for verity-distributed operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in verity-distributed
#[derive(Debug, Error)]
pub enum Error {
    /// The broker failed to send or receive
    #[error("broker error: {0}")]
    Broker(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A message body could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A wait exceeded its configured bound
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A message arrived that does not fit the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The received configuration does not match its checksum
    #[error("configuration checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The master turned this worker away
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// A worker reported that it could not load the run configuration
    #[error("worker {worker} failed to configure: {reason}")]
    WorkerConfiguration { worker: String, reason: String },

    /// Script or model loading error
    #[error("script error: {0}")]
    Script(#[from] verity_script::Error),

    /// Engine error
    #[error("engine error: {0}")]
    Engine(#[from] verity_engine::Error),

    /// Core error
    #[error("core error: {0}")]
    Core(#[from] verity_core::Error),
}

impl Error {
    /// Wrap a broker implementation's error
    pub fn broker<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Broker(Box::new(error))
    }
}

// Compile-time check that Error is Send + Sync for thread-safe error propagation.
// This function is never called but will fail to compile if the bound is not satisfied.
fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
}
