use std::io;
use std::path::PathBuf;

use thiserror::Error;

use beam_protocol::WireError;

/// Everything that can end a transfer. Within one transfer the first error
/// recorded wins; siblings are cancelled and see `Cancelled`, which never
/// overwrites the original cause.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no receiver found on the network")]
    NoReceiverFound,

    #[error("transfer declined by the receiver")]
    Declined,

    #[error("timed out waiting for the receiver")]
    HandshakeTimeout,

    #[error("malformed header: {0}")]
    Wire(#[from] WireError),

    #[error("malformed header: {0}")]
    Malformed(&'static str),

    #[error("archive entry escapes the target directory: {}", .0.display())]
    UnsafePath(PathBuf),

    #[error("chunk decoded to {actual} bytes, expected {expected}")]
    ChunkLengthMismatch { expected: usize, actual: usize },

    #[error("stream ended before the segment completed")]
    UnexpectedEof,

    #[error("receiver reported a failed transfer")]
    RemoteFailure,

    #[error("transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}
