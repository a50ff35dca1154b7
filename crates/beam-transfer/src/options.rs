/// Sender-side transfer tuning.
use beam_protocol::{FLAG_COMPRESS, FLAG_MULTI_STREAM, FLAG_TAR_ARCHIVE};

/// Smallest plaintext chunk a sender will use.
pub const MIN_CHUNK_SIZE: u32 = 256 * 1024;

/// Files below this size always go over a single stream.
pub const MULTI_STREAM_THRESHOLD: u64 = 256 * 1024 * 1024;

pub const MAX_PARALLEL_STREAMS: u16 = 4;
pub const MAX_COMPRESSION_LEVEL: u8 = 9;
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 6;

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: u32,
    pub compress: bool,
    pub compression_level: u8,
    pub parallel_streams: u16,
    /// Exposed so tests can exercise multi-stream planning without
    /// multi-hundred-megabyte fixtures. Defaults to the protocol constant.
    pub multi_stream_threshold: u64,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            chunk_size: MIN_CHUNK_SIZE,
            compress: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            parallel_streams: 1,
            multi_stream_threshold: MULTI_STREAM_THRESHOLD,
        }
    }
}

impl TransferOptions {
    /// Clamp every knob into its supported range.
    pub fn normalized(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size.max(MIN_CHUNK_SIZE),
            compress: self.compress,
            compression_level: self.compression_level.min(MAX_COMPRESSION_LEVEL),
            parallel_streams: self.parallel_streams.clamp(1, MAX_PARALLEL_STREAMS),
            multi_stream_threshold: self.multi_stream_threshold,
        }
    }

    /// Level 0 disables compression no matter what the boolean says.
    pub fn compression_enabled(&self) -> bool {
        self.compress && self.compression_level > 0
    }

    /// Header flag byte for a transfer with `stream_count` segments.
    pub fn flags(&self, stream_count: usize, is_tar: bool) -> u8 {
        let mut flags = 0;
        if self.compression_enabled() {
            flags |= FLAG_COMPRESS;
        }
        if stream_count > 1 {
            flags |= FLAG_MULTI_STREAM;
        }
        if is_tar {
            flags |= FLAG_TAR_ARCHIVE;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_clamps_every_knob() {
        let opts = TransferOptions {
            chunk_size: 1,
            compress: true,
            compression_level: 42,
            parallel_streams: 99,
            multi_stream_threshold: MULTI_STREAM_THRESHOLD,
        }
        .normalized();
        assert_eq!(opts.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(opts.compression_level, MAX_COMPRESSION_LEVEL);
        assert_eq!(opts.parallel_streams, MAX_PARALLEL_STREAMS);

        let opts = TransferOptions {
            parallel_streams: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(opts.parallel_streams, 1);
    }

    #[test]
    fn level_zero_disables_compression() {
        let opts = TransferOptions {
            compress: true,
            compression_level: 0,
            ..Default::default()
        };
        assert!(!opts.compression_enabled());
        assert_eq!(opts.flags(1, false) & FLAG_COMPRESS, 0);
    }

    #[test]
    fn flags_reflect_layout() {
        let opts = TransferOptions {
            compress: true,
            ..Default::default()
        };
        let flags = opts.flags(4, false);
        assert_ne!(flags & FLAG_COMPRESS, 0);
        assert_ne!(flags & FLAG_MULTI_STREAM, 0);
        assert_eq!(flags & FLAG_TAR_ARCHIVE, 0);

        let flags = opts.flags(1, true);
        assert_eq!(flags & FLAG_MULTI_STREAM, 0);
        assert_ne!(flags & FLAG_TAR_ARCHIVE, 0);
    }
}
