//! Status taxonomy shared by negotiation, push and persistence

use std::path::PathBuf;

use thiserror::Error;

use crate::capture::FormatDescriptor;

/// Errors returned by the sink endpoint, node and buffer pool.
///
/// Negotiation and push errors are recoverable and returned to the caller.
/// `WriteFailure` is only ever produced inside the writer and is logged there.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("endpoint is not connected")]
    NotConnected,

    #[error("endpoint is already connected to another peer")]
    AlreadyConnected,

    #[error("format rejected: {0}")]
    FormatRejected(FormatDescriptor),

    #[error("null or empty argument")]
    NullArgument,

    #[error("failed to write {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("endpoint does not provide an allocator")]
    NoAllocator,

    #[error("no pin with id {0:?}")]
    PinNotFound(String),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;
