/// The capability the receiver engine uses to ask its host application
/// whether to accept a transfer and for the shared key. Implementations may
/// block (the engine calls them on the blocking pool), which is how an
/// interactive console prompt stays out of the event loop.
use beam_protocol::TransferHeader;

pub trait Authorizer: Send + Sync {
    /// Decide whether to accept a validated transfer offer.
    fn accept(&self, offer: &TransferHeader) -> bool;

    /// Obtain the transfer key from the operator. Only called after
    /// `accept` returned true. The engine trims and uppercases the result
    /// before hashing.
    fn request_key(&self) -> String;
}

/// Fixed-response authorizer for embedding and tests.
pub struct StaticAuthorizer {
    pub accept_all: bool,
    pub key: String,
}

impl Authorizer for StaticAuthorizer {
    fn accept(&self, _offer: &TransferHeader) -> bool {
        self.accept_all
    }

    fn request_key(&self) -> String {
        self.key.clone()
    }
}
