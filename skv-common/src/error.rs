//! # Error Types
//!
//! Two layers of errors:
//!
//! - `BackendError` is what a single backend connection reports (I/O,
//!   framing, server replies). It is `Clone` so one failed pipeline batch can
//!   be handed to every callback queued on it.
//! - `ShardError` is what the sharding layer reports: configuration mistakes,
//!   use after disposal, serialization, and wrapped backend failures.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type for a single backend call.
pub type BackendResult<T> = Result<T, BackendError>;

/// Result type for sharded operations.
pub type ShardResult<T> = Result<T, ShardError>;

/// Failure reported by one backend connection.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,

    /// Server returned an error reply.
    #[error("server error: {0}")]
    Server(String),

    /// Reply type did not match the command that was sent.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Address could not be parsed into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Operation against a key holding the wrong kind of value.
    #[error("WRONGTYPE operation against a key holding the wrong kind of value")]
    WrongType,

    /// Key targeted by RENAME does not exist.
    #[error("no such key")]
    NoSuchKey,
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        BackendError::Io(Arc::new(err))
    }
}

/// Failure reported by the sharding layer.
#[derive(Debug, Clone, Error)]
pub enum ShardError {
    /// The shard map was built with zero groups.
    #[error("shard map must contain at least one group")]
    EmptyShardMap,

    /// A shard group was built with zero backends.
    #[error("shard group {0} has no backends")]
    EmptyGroup(usize),

    /// A key resolved outside `[0, groups)`; indicates a routing bug.
    #[error("shard index {index} out of range for {groups} groups")]
    ShardOutOfRange { index: usize, groups: usize },

    /// Operation issued after `dispose()` on the client.
    #[error("sharded client has been disposed")]
    ClientDisposed,

    /// Operation issued after `dispose()` on the pipeline.
    #[error("sharded pipeline has been disposed")]
    PipelineDisposed,

    /// Failure surfaced by a backend connection.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Hash field name could not be parsed into the requested key type.
    #[error("invalid hash key: {0}")]
    InvalidHashKey(String),

    /// Shard configuration is malformed.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ShardError {
    /// Returns the wrapped backend error, if any.
    pub fn as_backend(&self) -> Option<&BackendError> {
        match self {
            ShardError::Backend(err) => Some(err),
            _ => None,
        }
    }
}
