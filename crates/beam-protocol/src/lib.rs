/// Beam wire protocol: header and frame codecs plus the discovery grammar.
///
/// Everything on the wire is big-endian. A transfer runs over one primary
/// TCP connection (full handshake header, control bytes, segment 0) and
/// zero or more auxiliary connections (short `STRM` handshake, one segment
/// each). Payload framing is shared by all connections.

pub mod discovery;
pub mod frame;
pub mod header;

// Re-export key types for convenience.
pub use discovery::{
    SenderRequest, DISCOVERY_PORT, RECEIVER_READY, SENDER_REQUEST_PREFIX, TRANSFER_PORT,
};
pub use frame::{FrameHeader, FRAME_HEADER_LEN, SENTINEL_FRAME};
pub use header::{
    StreamHandshake, StreamSegment, TransferHeader, WireError, FIXED_AFTER_NAME_LEN,
    FLAG_COMPRESS, FLAG_MULTI_STREAM, FLAG_TAR_ARCHIVE, IV_LEN, KEY_HASH_LEN, MAX_FILENAME_LEN,
    MAX_WIRE_STREAMS, SEGMENT_ENCODED_LEN, STREAM_COUNT_OFFSET, STREAM_HANDSHAKE_LEN,
    STREAM_MAGIC, TRANSFER_ID_LEN,
};
