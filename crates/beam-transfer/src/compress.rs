/// Per-chunk zlib compression. Every chunk is an independent zlib stream so
/// parallel segments never share compressor state.
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::TransferError;

/// Compress one plaintext chunk at the given level (1..=9).
pub fn deflate_chunk(data: &[u8], level: u8) -> std::io::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(
        Vec::with_capacity(data.len() / 2 + 64),
        Compression::new(level as u32),
    );
    enc.write_all(data)?;
    enc.finish()
}

/// Inflate one chunk, insisting on the exact plaintext length promised by
/// the frame header. The decoder is capped one byte past the expectation so
/// an oversized (or hostile) stream fails instead of allocating freely.
pub fn inflate_chunk(data: &[u8], expected_len: usize) -> Result<Vec<u8>, TransferError> {
    let mut out = Vec::with_capacity(expected_len);
    let mut dec = ZlibDecoder::new(data).take(expected_len as u64 + 1);
    dec.read_to_end(&mut out)?;
    if out.len() != expected_len {
        return Err(TransferError::ChunkLengthMismatch {
            expected: expected_len,
            actual: out.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_every_level() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 7) as u8).collect();
        for level in 1..=9u8 {
            let packed = deflate_chunk(&data, level).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(inflate_chunk(&packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn incompressible_data_may_grow() {
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let packed = deflate_chunk(&data, 9).unwrap();
        assert_eq!(inflate_chunk(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn wrong_expected_length_is_fatal() {
        let data = vec![0u8; 1000];
        let packed = deflate_chunk(&data, 6).unwrap();
        match inflate_chunk(&packed, 999) {
            Err(TransferError::ChunkLengthMismatch { expected, actual }) => {
                assert_eq!(expected, 999);
                assert_eq!(actual, 1000);
            }
            other => panic!("expected length mismatch, got {other:?}"),
        }
        assert!(matches!(
            inflate_chunk(&packed, 1001),
            Err(TransferError::ChunkLengthMismatch { .. })
        ));
    }

    #[test]
    fn corrupt_stream_is_an_error() {
        let mut packed = deflate_chunk(&vec![7u8; 512], 6).unwrap();
        let mid = packed.len() / 2;
        packed[mid] ^= 0xFF;
        assert!(inflate_chunk(&packed, 512).is_err());
    }
}
