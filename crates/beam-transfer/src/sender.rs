/// Sender side of the transfer engine.
///
/// One primary TCP connection carries the handshake header, segment 0 and
/// the receiver's two control bytes; every further segment of a multi-stream
/// transfer gets its own connection opened with a short `STRM` handshake.
/// Each segment task reads its own byte range (or the tar producer),
/// optionally compresses, encrypts with its segment cipher and frames the
/// result. The first failing task cancels the rest.
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use beam_crypto::{key_hash, random_transfer_id, SegmentCipher};
use beam_protocol::{
    FrameHeader, StreamHandshake, StreamSegment, TransferHeader, KEY_HASH_LEN, SENTINEL_FRAME,
};

use crate::compress::deflate_chunk;
use crate::error::TransferError;
use crate::net::tune_stream;
use crate::options::TransferOptions;
use crate::plan::{plan_segments, plan_tar_segment};
use crate::progress::Progress;
use crate::tar_stream::TarProducer;

/// How long to wait for the accept byte and for the final verdict.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Send a file or directory to `peer`. Returns once the receiver has
/// acknowledged the whole transfer.
pub async fn send_path(
    path: &Path,
    peer: SocketAddr,
    key: &str,
    options: &TransferOptions,
    progress: Arc<dyn Progress>,
) -> Result<(), TransferError> {
    let options = options.normalized();
    let meta = tokio::fs::metadata(path).await?;
    let is_dir = meta.is_dir();
    let total_size = if is_dir { 0 } else { meta.len() };

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| {
            TransferError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "source path has no usable name",
            ))
        })?;

    let segments = if is_dir {
        plan_tar_segment()
    } else {
        let streams = if total_size < options.multi_stream_threshold {
            1
        } else {
            options.parallel_streams
        };
        plan_segments(total_size, streams)
    };

    let header = TransferHeader {
        flags: options.flags(segments.len(), is_dir),
        compression_level: if options.compression_enabled() {
            options.compression_level
        } else {
            0
        },
        filename: filename.clone(),
        total_size,
        key_hash: key_hash(key),
        chunk_size: options.chunk_size,
        transfer_id: random_transfer_id(),
        segments,
    };
    let header_bytes = header.encode()?;

    info!(
        file = %filename,
        size = total_size,
        streams = header.stream_count(),
        transfer_id = %hex::encode(header.transfer_id),
        "connecting to receiver"
    );

    let stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(peer))
        .await
        .map_err(|_| TransferError::HandshakeTimeout)??;
    tune_stream(&stream);
    let (mut primary_rd, mut primary_wr) = stream.into_split();

    primary_wr.write_all(&header_bytes).await?;
    primary_wr.flush().await?;

    match timeout(HANDSHAKE_TIMEOUT, primary_rd.read_u8()).await {
        Err(_) => return Err(TransferError::HandshakeTimeout),
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(b'Y')) => {}
        Ok(Ok(_)) => return Err(TransferError::Declined),
    }
    debug!("transfer accepted");

    progress.start(
        if is_dir { None } else { Some(total_size) },
        &filename,
    );

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<(), TransferError>> = JoinSet::new();

    // Segment 0 rides the primary connection.
    {
        let ctx = SegmentCtx::new(&header, &options, 0, path, progress.clone(), cancel.clone());
        if is_dir {
            let producer = TarProducer::spawn(path.to_path_buf(), options.chunk_size as usize)?;
            tasks.spawn(async move { run_tar_segment(ctx, producer, &mut primary_wr).await });
        } else {
            tasks.spawn(async move { run_file_segment(ctx, &mut primary_wr).await });
        }
    }

    // Every other segment opens its own connection.
    for index in 1..header.segments.len() {
        let ctx = SegmentCtx::new(&header, &options, index, path, progress.clone(), cancel.clone());
        let handshake = StreamHandshake {
            stream_index: index as u16,
            transfer_id: header.transfer_id,
        };
        tasks.spawn(async move {
            let mut stream = timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(peer))
                .await
                .map_err(|_| TransferError::HandshakeTimeout)??;
            tune_stream(&stream);
            stream.write_all(&handshake.encode()).await?;
            run_file_segment(ctx, &mut stream).await?;
            stream.shutdown().await?;
            Ok(())
        });
    }

    let mut first_err: Option<TransferError> = None;
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(_) => Err(TransferError::Io(io::Error::other("segment task panicked"))),
        };
        if let Err(err) = result {
            cancel.cancel();
            if first_err.is_none() && !matches!(err, TransferError::Cancelled) {
                first_err = Some(err);
            }
        }
    }
    if let Some(err) = first_err {
        progress.finish();
        return Err(err);
    }

    // All streams done; the receiver's last byte is the verdict.
    let verdict = timeout(HANDSHAKE_TIMEOUT, primary_rd.read_u8())
        .await
        .map_err(|_| TransferError::HandshakeTimeout)?;
    progress.finish();
    match verdict {
        Ok(b'Y') => {
            info!("transfer complete");
            Ok(())
        }
        Ok(_) => Err(TransferError::RemoteFailure),
        Err(err) => Err(err.into()),
    }
}

/// Everything one sender segment task needs, detached from the header's
/// lifetime so it can move into a spawned task.
struct SegmentCtx {
    source: PathBuf,
    segment: StreamSegment,
    key_hash: [u8; KEY_HASH_LEN],
    chunk_size: usize,
    /// Some(level) when chunks are zlib-compressed before encryption.
    compress_level: Option<u8>,
    index: usize,
    progress: Arc<dyn Progress>,
    cancel: CancellationToken,
}

impl SegmentCtx {
    fn new(
        header: &TransferHeader,
        options: &TransferOptions,
        index: usize,
        source: &Path,
        progress: Arc<dyn Progress>,
        cancel: CancellationToken,
    ) -> SegmentCtx {
        SegmentCtx {
            source: source.to_path_buf(),
            segment: header.segments[index].clone(),
            key_hash: header.key_hash,
            chunk_size: options.chunk_size as usize,
            compress_level: options
                .compression_enabled()
                .then_some(options.compression_level),
            index,
            progress,
            cancel,
        }
    }
}

/// Stream one file segment: read, compress, encrypt, frame, sentinel.
async fn run_file_segment<W>(ctx: SegmentCtx, writer: &mut W) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(&ctx.source).await?;
    file.seek(SeekFrom::Start(ctx.segment.offset)).await?;
    let mut cipher = SegmentCipher::new(&ctx.key_hash, &ctx.segment.iv);
    let mut remaining = ctx.segment.length;
    let mut buf = vec![0u8; ctx.chunk_size];

    while remaining > 0 {
        let want = remaining.min(ctx.chunk_size as u64) as usize;
        read_chunk(&ctx.cancel, &mut file, &mut buf[..want]).await?;
        send_chunk(&ctx, &mut cipher, writer, &buf[..want]).await?;
        remaining -= want as u64;
    }

    finish_stream(writer).await?;
    debug!(segment = ctx.index, "segment sent");
    Ok(())
}

/// Stream the tar producer until end of archive.
async fn run_tar_segment<W>(
    ctx: SegmentCtx,
    mut producer: TarProducer,
    writer: &mut W,
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut cipher = SegmentCipher::new(&ctx.key_hash, &ctx.segment.iv);
    loop {
        let chunk = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = producer.next_chunk() => chunk,
        };
        let chunk: Bytes = match chunk {
            None => break,
            Some(chunk) => chunk?,
        };
        send_chunk(&ctx, &mut cipher, writer, &chunk).await?;
    }

    finish_stream(writer).await?;
    debug!("archive stream sent");
    Ok(())
}

/// Fill `buf` exactly from the file, treating a short source as fatal.
async fn read_chunk(
    cancel: &CancellationToken,
    file: &mut File,
    buf: &mut [u8],
) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            n = file.read(&mut buf[filled..]) => n?,
        };
        if n == 0 {
            return Err(TransferError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(())
}

/// Compress (maybe), encrypt and frame one chunk.
async fn send_chunk<W>(
    ctx: &SegmentCtx,
    cipher: &mut SegmentCipher,
    writer: &mut W,
    plain: &[u8],
) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let plain_len = plain.len();
    let mut payload = match ctx.compress_level {
        Some(level) => {
            let data = plain.to_vec();
            tokio::task::spawn_blocking(move || deflate_chunk(&data, level))
                .await
                .map_err(|_| io::Error::other("compression task failed"))??
        }
        None => plain.to_vec(),
    };
    cipher.apply(&mut payload);

    let frame = FrameHeader {
        plain_len: plain_len as u32,
        payload_len: payload.len() as u32,
    };
    tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
        result = async {
            writer.write_all(&frame.encode()).await?;
            writer.write_all(&payload).await
        } => result?,
    }
    ctx.progress.advance(plain_len as u64);
    Ok(())
}

async fn finish_stream<W>(writer: &mut W) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&SENTINEL_FRAME.encode()).await?;
    writer.flush().await?;
    Ok(())
}
