/// Beam crypto: transfer keys and the streaming segment cipher.
///
/// The human-entered transfer key is hashed with SHA-256; the digest doubles
/// as the AES-256 key and as the handshake authenticator. Each stream segment
/// gets its own random 16-byte IV and encrypts with AES-256-CTR, so segments
/// decrypt independently and in parallel. There is no MAC or AEAD tag; the
/// handshake authenticates the key hash and TCP checksums are the only
/// transport integrity.

pub mod cipher;
pub mod keys;

pub use cipher::SegmentCipher;
pub use keys::{generate_key, key_hash, random_iv, random_transfer_id, DEFAULT_KEY_LEN};
