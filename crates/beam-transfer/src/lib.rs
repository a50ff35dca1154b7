/// Beam transfer engine: the streaming core shared by both endpoints.
///
/// - Sender: segment planning, multi-connection fan-out, per-segment
///   read → compress → encrypt → frame pipeline.
/// - Receiver: concurrent listener, handshake authorization, per-segment
///   decrypt → inflate → positional-write pipeline, completion latch.
/// - Tar pipeline: streaming directory packaging and extraction with
///   bounded-queue backpressure and path-traversal defense.
/// - Discovery: UDP broadcast request/response for locating a receiver.
///
/// The engine is host-agnostic: interactive prompts live behind the
/// `Authorizer` capability and progress rendering behind `Progress`, so the
/// whole thing runs under test without a TTY.

pub mod authorize;
pub mod compress;
pub mod discovery;
pub mod error;
pub mod net;
pub mod options;
pub mod plan;
pub mod progress;
pub mod registry;
pub mod receiver;
pub mod sender;
pub mod tar_stream;

// Re-export the embedding surface.
pub use authorize::{Authorizer, StaticAuthorizer};
pub use discovery::{find_receiver, respond_to_discovery, DISCOVERY_WINDOW};
pub use error::TransferError;
pub use options::{TransferOptions, MAX_PARALLEL_STREAMS, MIN_CHUNK_SIZE, MULTI_STREAM_THRESHOLD};
pub use progress::{NullProgress, Progress};
pub use receiver::{Receiver, ReceiverConfig};
pub use sender::{send_path, HANDSHAKE_TIMEOUT};
