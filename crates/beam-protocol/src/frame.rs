/// Chunk frame format, shared by every stream of a transfer:
///
/// ```text
/// [0..4]  plain_len (u32 BE)    bytes after decrypt + decompress
/// [4..8]  payload_len (u32 BE)  ciphertext bytes that follow
/// [8..]   payload
/// ```
///
/// Without compression `payload_len == plain_len`; with compression the
/// payload is the zlib stream, which may be larger than the plaintext for
/// incompressible data. The frame `(0, 0)` is the stream terminator; no
/// frame follows it on that stream.

pub const FRAME_HEADER_LEN: usize = 8;

/// The stream-terminating sentinel.
pub const SENTINEL_FRAME: FrameHeader = FrameHeader {
    plain_len: 0,
    payload_len: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub plain_len: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn is_sentinel(&self) -> bool {
        self.plain_len == 0 && self.payload_len == 0
    }

    /// Serialize into the fixed 8-byte wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.plain_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    /// Parse from raw bytes. Returns None if too short.
    pub fn decode(buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < FRAME_HEADER_LEN {
            return None;
        }
        Some(FrameHeader {
            plain_len: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            payload_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}
