use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

/// Recoverable cache failures.
///
/// Fatal invariant violations (duplicate write versions on one block, an
/// acquirer outliving its transaction, destruction with outstanding work) are
/// bugs and panic instead of surfacing here.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("page pool exhausted")]
    PoolExhausted,
    #[error("metadata ring index {0} out of bounds")]
    RingBounds(u64),
    #[error("transport fault: {0}")]
    Transport(String),
    #[error("serializer failure: {0}")]
    Serializer(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
