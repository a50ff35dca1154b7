/// Handshake header formats.
///
/// Primary handshake, sent by the sender on the first TCP connection:
///
/// ```text
/// [0..4]          filename_len (u32 BE)
/// [4..4+n]        filename (UTF-8, n = filename_len)
/// [..+8]          total_size (u64 BE; 0 for tar transfers)
/// [..+32]         key_hash (SHA-256 of the transfer key)
/// [..+1]          flags (bit0 COMPRESS, bit1 MULTI_STREAM, bit2 TAR_ARCHIVE)
/// [..+1]          compression_level (0..=9)
/// [..+2]          stream_count (u16 BE, >= 1)
/// [..+4]          chunk_size (u32 BE, sender's max plaintext chunk)
/// [..+16]         transfer_id (random)
/// stream_count ×:
///   [..+16]       segment IV
///   [..+8]        segment offset (u64 BE)
///   [..+8]        segment length (u64 BE)
/// ```
///
/// Auxiliary handshake, sent on every non-primary connection:
///
/// ```text
/// [0..4]   magic "STRM"
/// [4..6]   stream_index (u16 BE, 1..=stream_count-1)
/// [6..22]  transfer_id
/// ```
///
/// The receiver dispatches on the first 4 bytes: `"STRM"` means auxiliary,
/// anything else is the primary header's filename_len. A filename whose
/// first four UTF-8 bytes spell `STRM` would be ambiguous on the wire and
/// is rejected by both codec directions.
use thiserror::Error;

pub const KEY_HASH_LEN: usize = 32;
pub const TRANSFER_ID_LEN: usize = 16;
pub const IV_LEN: usize = 16;

/// Dispatch magic for auxiliary stream connections.
pub const STREAM_MAGIC: [u8; 4] = *b"STRM";

/// Encoded size of one segment table entry.
pub const SEGMENT_ENCODED_LEN: usize = IV_LEN + 8 + 8;

/// Fixed bytes between the end of the filename and the segment table.
pub const FIXED_AFTER_NAME_LEN: usize = 8 + KEY_HASH_LEN + 1 + 1 + 2 + 4 + TRANSFER_ID_LEN;

/// Offset of the stream count within that fixed section.
pub const STREAM_COUNT_OFFSET: usize = 8 + KEY_HASH_LEN + 1 + 1;

/// Total encoded size of the auxiliary handshake.
pub const STREAM_HANDSHAKE_LEN: usize = 4 + 2 + TRANSFER_ID_LEN;

/// Upper bound a receiver accepts for filename_len.
pub const MAX_FILENAME_LEN: usize = 4096;

/// Upper bound a receiver accepts for stream_count. Senders use at most 4;
/// the wire allows headroom without letting a peer demand absurd tables.
pub const MAX_WIRE_STREAMS: u16 = 64;

pub const FLAG_COMPRESS: u8 = 1 << 0;
pub const FLAG_MULTI_STREAM: u8 = 1 << 1;
pub const FLAG_TAR_ARCHIVE: u8 = 1 << 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("header truncated")]
    Truncated,
    #[error("filename is not valid UTF-8")]
    BadUtf8,
    #[error("filename length {0} out of range")]
    BadFilenameLen(usize),
    #[error("filename collides with the stream handshake magic")]
    ReservedFilename,
    #[error("stream count {0} out of range")]
    BadStreamCount(u16),
    #[error("bad stream handshake magic")]
    BadMagic,
}

/// One contiguous byte range of the source, bound to one TCP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSegment {
    pub iv: [u8; IV_LEN],
    pub offset: u64,
    pub length: u64,
}

/// The primary handshake header / transfer descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub filename: String,
    pub total_size: u64,
    pub key_hash: [u8; KEY_HASH_LEN],
    pub flags: u8,
    pub compression_level: u8,
    pub chunk_size: u32,
    pub transfer_id: [u8; TRANSFER_ID_LEN],
    pub segments: Vec<StreamSegment>,
}

impl TransferHeader {
    pub fn stream_count(&self) -> u16 {
        self.segments.len() as u16
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESS != 0
    }

    pub fn is_tar(&self) -> bool {
        self.flags & FLAG_TAR_ARCHIVE != 0
    }

    /// Serialize to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let name = self.filename.as_bytes();
        if name.is_empty() || name.len() > MAX_FILENAME_LEN {
            return Err(WireError::BadFilenameLen(name.len()));
        }
        if name.len() >= 4 && name[..4] == STREAM_MAGIC {
            return Err(WireError::ReservedFilename);
        }
        let count = self.segments.len();
        if count == 0 || count > MAX_WIRE_STREAMS as usize {
            return Err(WireError::BadStreamCount(count as u16));
        }

        let mut buf =
            Vec::with_capacity(4 + name.len() + FIXED_AFTER_NAME_LEN + count * SEGMENT_ENCODED_LEN);
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(name);
        buf.extend_from_slice(&self.total_size.to_be_bytes());
        buf.extend_from_slice(&self.key_hash);
        buf.push(self.flags);
        buf.push(self.compression_level);
        buf.extend_from_slice(&(count as u16).to_be_bytes());
        buf.extend_from_slice(&self.chunk_size.to_be_bytes());
        buf.extend_from_slice(&self.transfer_id);
        for seg in &self.segments {
            buf.extend_from_slice(&seg.iv);
            buf.extend_from_slice(&seg.offset.to_be_bytes());
            buf.extend_from_slice(&seg.length.to_be_bytes());
        }
        Ok(buf)
    }

    /// Parse from wire format. `buf` must hold the complete header,
    /// including the leading filename_len.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(buf);
        let name_len = r.read_u32()? as usize;
        if name_len == 0 || name_len > MAX_FILENAME_LEN {
            return Err(WireError::BadFilenameLen(name_len));
        }
        let name = r.take(name_len)?;
        if name.len() >= 4 && name[..4] == STREAM_MAGIC {
            return Err(WireError::ReservedFilename);
        }
        let filename = std::str::from_utf8(name)
            .map_err(|_| WireError::BadUtf8)?
            .to_owned();

        let total_size = r.read_u64()?;
        let key_hash: [u8; KEY_HASH_LEN] = r.read_array()?;
        let flags = r.read_u8()?;
        let compression_level = r.read_u8()?;
        let stream_count = r.read_u16()?;
        if stream_count == 0 || stream_count > MAX_WIRE_STREAMS {
            return Err(WireError::BadStreamCount(stream_count));
        }
        let chunk_size = r.read_u32()?;
        let transfer_id: [u8; TRANSFER_ID_LEN] = r.read_array()?;

        let mut segments = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let iv: [u8; IV_LEN] = r.read_array()?;
            let offset = r.read_u64()?;
            let length = r.read_u64()?;
            segments.push(StreamSegment { iv, offset, length });
        }

        Ok(TransferHeader {
            filename,
            total_size,
            key_hash,
            flags,
            compression_level,
            chunk_size,
            transfer_id,
            segments,
        })
    }
}

/// The auxiliary stream handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHandshake {
    pub stream_index: u16,
    pub transfer_id: [u8; TRANSFER_ID_LEN],
}

impl StreamHandshake {
    /// Serialize to wire format, magic included.
    pub fn encode(&self) -> [u8; STREAM_HANDSHAKE_LEN] {
        let mut buf = [0u8; STREAM_HANDSHAKE_LEN];
        buf[0..4].copy_from_slice(&STREAM_MAGIC);
        buf[4..6].copy_from_slice(&self.stream_index.to_be_bytes());
        buf[6..].copy_from_slice(&self.transfer_id);
        buf
    }

    /// Parse the 18 bytes that follow an already-consumed `STRM` magic.
    pub fn decode_body(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < STREAM_HANDSHAKE_LEN - 4 {
            return Err(WireError::Truncated);
        }
        let stream_index = u16::from_be_bytes([buf[0], buf[1]]);
        let mut transfer_id = [0u8; TRANSFER_ID_LEN];
        transfer_id.copy_from_slice(&buf[2..2 + TRANSFER_ID_LEN]);
        Ok(StreamHandshake {
            stream_index,
            transfer_id,
        })
    }

    /// Parse from wire format, magic included.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < STREAM_HANDSHAKE_LEN {
            return Err(WireError::Truncated);
        }
        if buf[0..4] != STREAM_MAGIC {
            return Err(WireError::BadMagic);
        }
        Self::decode_body(&buf[4..])
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TransferHeader {
        TransferHeader {
            filename: "movie.mkv".into(),
            total_size: 1 << 30,
            key_hash: [0x42; KEY_HASH_LEN],
            flags: FLAG_COMPRESS | FLAG_MULTI_STREAM,
            compression_level: 6,
            chunk_size: 256 * 1024,
            transfer_id: [7; TRANSFER_ID_LEN],
            segments: vec![
                StreamSegment {
                    iv: [1; IV_LEN],
                    offset: 0,
                    length: 1 << 29,
                },
                StreamSegment {
                    iv: [2; IV_LEN],
                    offset: 1 << 29,
                    length: 1 << 29,
                },
            ],
        }
    }

    #[test]
    fn roundtrip_header() {
        let hdr = sample_header();
        let bytes = hdr.encode().unwrap();
        assert_eq!(
            bytes.len(),
            4 + hdr.filename.len() + FIXED_AFTER_NAME_LEN + 2 * SEGMENT_ENCODED_LEN
        );
        let parsed = TransferHeader::decode(&bytes).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn stream_count_offset_matches_layout() {
        let hdr = sample_header();
        let bytes = hdr.encode().unwrap();
        let off = 4 + hdr.filename.len() + STREAM_COUNT_OFFSET;
        let count = u16::from_be_bytes([bytes[off], bytes[off + 1]]);
        assert_eq!(count, 2);
    }

    #[test]
    fn reject_reserved_filename() {
        let mut hdr = sample_header();
        hdr.filename = "STRM".into();
        assert_eq!(hdr.encode(), Err(WireError::ReservedFilename));
        hdr.filename = "STRMfile.bin".into();
        assert_eq!(hdr.encode(), Err(WireError::ReservedFilename));

        // Decoding a crafted header with a reserved name must fail too.
        let mut good = sample_header();
        good.filename = "XTRMfile.bin".into();
        let mut bytes = good.encode().unwrap();
        bytes[4..8].copy_from_slice(b"STRM");
        assert_eq!(TransferHeader::decode(&bytes), Err(WireError::ReservedFilename));
    }

    #[test]
    fn reject_truncated_header() {
        let bytes = sample_header().encode().unwrap();
        for cut in [3, 10, bytes.len() - 1] {
            assert_eq!(
                TransferHeader::decode(&bytes[..cut]),
                Err(WireError::Truncated)
            );
        }
    }

    #[test]
    fn reject_zero_streams() {
        let hdr = sample_header();
        let mut bytes = hdr.encode().unwrap();
        let off = 4 + hdr.filename.len() + STREAM_COUNT_OFFSET;
        bytes[off] = 0;
        bytes[off + 1] = 0;
        assert_eq!(
            TransferHeader::decode(&bytes),
            Err(WireError::BadStreamCount(0))
        );
    }

    #[test]
    fn roundtrip_stream_handshake() {
        let hs = StreamHandshake {
            stream_index: 3,
            transfer_id: [0xAB; TRANSFER_ID_LEN],
        };
        let bytes = hs.encode();
        assert_eq!(&bytes[0..4], b"STRM");
        assert_eq!(StreamHandshake::decode(&bytes).unwrap(), hs);
        assert_eq!(StreamHandshake::decode_body(&bytes[4..]).unwrap(), hs);
    }

    #[test]
    fn handshake_reject_bad_magic() {
        let mut bytes = StreamHandshake {
            stream_index: 1,
            transfer_id: [0; TRANSFER_ID_LEN],
        }
        .encode();
        bytes[0] = b'X';
        assert_eq!(StreamHandshake::decode(&bytes), Err(WireError::BadMagic));
    }
}
