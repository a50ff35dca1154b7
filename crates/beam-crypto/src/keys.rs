use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

/// Characters a transfer key is drawn from.
const KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default transfer key length.
pub const DEFAULT_KEY_LEN: usize = 6;

/// Generate a random uppercase alphanumeric transfer key.
pub fn generate_key(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| KEY_CHARSET[rng.gen_range(0..KEY_CHARSET.len())] as char)
        .collect()
}

/// SHA-256 of the UTF-8 transfer key. Used both as the AES-256 key and as
/// the handshake authenticator.
pub fn key_hash(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

/// Random 16-byte IV for one stream segment.
pub fn random_iv() -> [u8; 16] {
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Random 16-byte transfer id binding auxiliary streams to a transfer.
pub fn random_transfer_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    OsRng.fill_bytes(&mut id);
    id
}
