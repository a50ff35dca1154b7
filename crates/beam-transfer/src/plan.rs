/// Segment planning: carve the source into per-stream byte ranges.
use beam_crypto::random_iv;
use beam_protocol::StreamSegment;

/// Split `total_size` bytes into `stream_count` contiguous segments that
/// tile `[0, total_size)` exactly. Each segment gets a fresh random IV.
/// The base length is `ceil(total / count)`; the last segment absorbs the
/// rounding remainder.
pub fn plan_segments(total_size: u64, stream_count: u16) -> Vec<StreamSegment> {
    let count = stream_count.max(1) as u64;
    let base = total_size.div_ceil(count);
    let mut segments = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    for index in 0..count {
        let length = if index == count - 1 {
            total_size - offset
        } else {
            base.min(total_size - offset)
        };
        segments.push(StreamSegment {
            iv: random_iv(),
            offset,
            length,
        });
        offset += length;
    }
    segments
}

/// The single zero-length segment of a directory (tar) transfer.
pub fn plan_tar_segment() -> Vec<StreamSegment> {
    vec![StreamSegment {
        iv: random_iv(),
        offset: 0,
        length: 0,
    }]
}
