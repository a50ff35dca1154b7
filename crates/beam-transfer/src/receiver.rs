/// Receiver side of the transfer engine.
///
/// The listener accepts any number of connections and dispatches each on
/// its first four bytes: `"STRM"` binds the connection to a segment of a
/// registered transfer, anything else is the filename length of a primary
/// handshake. The primary handler authorizes the transfer, preallocates the
/// sink, runs segment 0 on its own connection and waits on the completion
/// latch before writing the final verdict byte. One failed transfer never
/// takes the listener down.
use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use subtle::ConstantTimeEq;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use beam_crypto::{key_hash, SegmentCipher};
use beam_protocol::{
    FrameHeader, StreamHandshake, TransferHeader, WireError, FIXED_AFTER_NAME_LEN,
    FRAME_HEADER_LEN, MAX_FILENAME_LEN, MAX_WIRE_STREAMS, SEGMENT_ENCODED_LEN,
    STREAM_COUNT_OFFSET, STREAM_HANDSHAKE_LEN, STREAM_MAGIC,
};
use tokio_util::sync::CancellationToken;

use crate::authorize::Authorizer;
use crate::compress::inflate_chunk;
use crate::error::TransferError;
use crate::net::tune_stream;
use crate::progress::Progress;
use crate::registry::{ActiveTransfer, TransferRegistry, TransferSink};
use crate::tar_stream::{unique_target_dir, TarConsumer};

pub struct ReceiverConfig {
    pub download_dir: PathBuf,
    pub authorizer: Arc<dyn Authorizer>,
    pub progress: Arc<dyn Progress>,
}

pub struct Receiver {
    config: ReceiverConfig,
    registry: TransferRegistry,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Arc<Receiver> {
        Arc::new(Receiver {
            config,
            registry: TransferRegistry::new(),
        })
    }

    /// Accept loop. Runs until the enclosing task is dropped.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        info!(
            dir = %self.config.download_dir.display(),
            "receiver listening for incoming transfers"
        );
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tune_stream(&stream);
                    let receiver = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = receiver.handle_connection(stream, peer).await {
                            debug!(peer = %peer, error = %err, "connection closed");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                }
            }
        }
    }

    /// Dispatch one inbound connection on its 4-byte prefix.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TransferError> {
        let (mut rd, wr) = stream.into_split();
        let mut prefix = [0u8; 4];
        rd.read_exact(&mut prefix).await?;
        if prefix == STREAM_MAGIC {
            self.handle_aux_stream(rd, peer).await
        } else {
            self.handle_primary(prefix, rd, wr, peer).await
        }
    }

    /// Auxiliary connection: bind to a registered segment or drop silently.
    async fn handle_aux_stream(
        &self,
        mut rd: OwnedReadHalf,
        peer: SocketAddr,
    ) -> Result<(), TransferError> {
        let mut body = [0u8; STREAM_HANDSHAKE_LEN - 4];
        rd.read_exact(&mut body).await?;
        let handshake = StreamHandshake::decode_body(&body)?;

        let Some(transfer) = self.registry.get(&handshake.transfer_id) else {
            debug!(peer = %peer, "stream handshake for unknown transfer");
            return Ok(());
        };
        let index = handshake.stream_index as usize;
        if index == 0 || !transfer.claim_segment(index) {
            debug!(peer = %peer, index, "invalid or duplicate stream index");
            return Ok(());
        }
        debug!(peer = %peer, index, "auxiliary stream attached");
        run_receive_segment(transfer, index, rd).await;
        Ok(())
    }

    /// Primary connection: full handshake, authorization, segment 0 and the
    /// final verdict byte.
    async fn handle_primary(
        &self,
        prefix: [u8; 4],
        mut rd: OwnedReadHalf,
        mut wr: OwnedWriteHalf,
        peer: SocketAddr,
    ) -> Result<(), TransferError> {
        let header = read_primary_header(prefix, &mut rd).await?;
        validate_header(&header)?;
        info!(
            file = %header.filename,
            size = header.total_size,
            streams = header.stream_count(),
            transfer_id = %hex::encode(header.transfer_id),
            peer = %peer,
            "incoming transfer offer"
        );

        let authorizer = self.config.authorizer.clone();
        let offer = header.clone();
        let accepted = tokio::task::spawn_blocking(move || authorizer.accept(&offer))
            .await
            .map_err(|_| io::Error::other("authorizer task failed"))?;
        if !accepted {
            wr.write_all(b"N").await?;
            info!("transfer declined by operator");
            return Ok(());
        }

        let authorizer = self.config.authorizer.clone();
        let entered = tokio::task::spawn_blocking(move || authorizer.request_key())
            .await
            .map_err(|_| io::Error::other("authorizer task failed"))?;
        let entered_hash = key_hash(entered.trim().to_uppercase().as_str());
        if !bool::from(entered_hash.ct_eq(&header.key_hash)) {
            wr.write_all(b"N").await?;
            info!("transfer key mismatch, declining");
            return Ok(());
        }

        if self.registry.get(&header.transfer_id).is_some() {
            debug!("duplicate transfer id, abandoning handshake");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let sink = if header.is_tar() {
            TransferSink::Tar {
                target_dir: unique_target_dir(&self.config.download_dir, &header.filename),
            }
        } else {
            // Collisions overwrite: the file is created in place, sized up
            // front so parallel segments can write disjoint ranges.
            let path = self.config.download_dir.join(&header.filename);
            let file = tokio::fs::File::create(&path).await?;
            file.set_len(header.total_size).await?;
            TransferSink::File { path }
        };

        let transfer = ActiveTransfer::new(header, sink, self.config.progress.clone());
        if !self.registry.insert(transfer.clone()) {
            // Lost a registration race; the other handshake owns the id and
            // possibly the same output path, so leave the filesystem alone.
            debug!("duplicate transfer id, abandoning handshake");
            return Ok(());
        }

        wr.write_all(b"Y").await?;
        transfer.progress.start(
            if transfer.header.is_tar() {
                None
            } else {
                Some(transfer.header.total_size)
            },
            &transfer.header.filename,
        );

        transfer.claim_segment(0);
        let segment0 = tokio::spawn(run_receive_segment(transfer.clone(), 0, rd));

        transfer.wait_done().await;
        self.registry.remove(&transfer.header.transfer_id);
        let _ = segment0.await;

        let failed = transfer.failed();
        let _ = wr.write_all(if failed { b"N" } else { b"Y" }).await;
        transfer.progress.finish();

        if failed {
            remove_sink(&transfer.sink).await;
            let cause = transfer.take_error();
            warn!(
                file = %transfer.header.filename,
                error = %cause.unwrap_or(TransferError::Cancelled),
                "transfer failed, partial output removed"
            );
        } else {
            info!(file = %transfer.header.filename, "transfer complete");
        }
        Ok(())
    }
}

/// Delete whatever a failed or abandoned transfer left behind.
async fn remove_sink(sink: &TransferSink) {
    match sink {
        TransferSink::File { path } => {
            let _ = tokio::fs::remove_file(path).await;
        }
        TransferSink::Tar { target_dir } => {
            let _ = tokio::fs::remove_dir_all(target_dir).await;
        }
    }
}

/// Read the rest of the primary header after its 4-byte prefix. The stream
/// count sits at a fixed offset past the filename, which tells us how much
/// segment table to expect before handing the whole buffer to the codec.
async fn read_primary_header(
    prefix: [u8; 4],
    rd: &mut OwnedReadHalf,
) -> Result<TransferHeader, TransferError> {
    let name_len = u32::from_be_bytes(prefix) as usize;
    if name_len == 0 || name_len > MAX_FILENAME_LEN {
        return Err(WireError::BadFilenameLen(name_len).into());
    }

    let mut fixed = vec![0u8; name_len + FIXED_AFTER_NAME_LEN];
    rd.read_exact(&mut fixed).await?;
    let off = name_len + STREAM_COUNT_OFFSET;
    let stream_count = u16::from_be_bytes([fixed[off], fixed[off + 1]]);
    if stream_count == 0 || stream_count > MAX_WIRE_STREAMS {
        return Err(WireError::BadStreamCount(stream_count).into());
    }

    let mut table = vec![0u8; stream_count as usize * SEGMENT_ENCODED_LEN];
    rd.read_exact(&mut table).await?;

    let mut full = Vec::with_capacity(4 + fixed.len() + table.len());
    full.extend_from_slice(&prefix);
    full.extend_from_slice(&fixed);
    full.extend_from_slice(&table);
    Ok(TransferHeader::decode(&full)?)
}

/// Semantic validation on top of the codec: the segment table must tile the
/// file exactly, and the filename must resolve inside the download dir.
fn validate_header(header: &TransferHeader) -> Result<(), TransferError> {
    let name = Path::new(&header.filename);
    let mut components = name.components();
    let plain_name = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if !plain_name || header.filename.contains(['/', '\\']) {
        return Err(TransferError::Malformed("filename is not a plain name"));
    }
    if header.chunk_size == 0 {
        return Err(TransferError::Malformed("zero chunk size"));
    }
    if header.compression_level > 9 {
        return Err(TransferError::Malformed("compression level out of range"));
    }

    if header.is_tar() {
        let seg = &header.segments[0];
        if header.segments.len() != 1
            || header.total_size != 0
            || seg.offset != 0
            || seg.length != 0
        {
            return Err(TransferError::Malformed("bad archive segment table"));
        }
        return Ok(());
    }

    let mut expected = 0u64;
    for seg in &header.segments {
        if seg.offset != expected {
            return Err(TransferError::Malformed("segments do not tile"));
        }
        expected = seg
            .offset
            .checked_add(seg.length)
            .ok_or(TransferError::Malformed("segment range overflow"))?;
    }
    if expected != header.total_size {
        return Err(TransferError::Malformed("segments do not cover the file"));
    }
    Ok(())
}

/// Drive one segment to completion and fold its outcome into the transfer.
async fn run_receive_segment(transfer: Arc<ActiveTransfer>, index: usize, rd: OwnedReadHalf) {
    let result = match &transfer.sink {
        TransferSink::File { path } => file_segment(&transfer, index, path.clone(), rd).await,
        TransferSink::Tar { target_dir } => tar_segment(&transfer, target_dir.clone(), rd).await,
    };
    if let Err(err) = result {
        transfer.record_error(err);
    }
    transfer.segment_done();
}

/// Receive one file segment: frames in, decrypt, inflate, positional write.
async fn file_segment(
    transfer: &ActiveTransfer,
    index: usize,
    path: PathBuf,
    mut rd: OwnedReadHalf,
) -> Result<(), TransferError> {
    let segment = &transfer.header.segments[index];
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .await?;
    file.seek(SeekFrom::Start(segment.offset)).await?;

    let mut cipher = SegmentCipher::new(&transfer.header.key_hash, &segment.iv);
    let mut remaining = segment.length;

    loop {
        let Some((plain_len, mut payload)) =
            read_frame(&transfer.cancel, &mut rd, &transfer.header).await?
        else {
            if remaining != 0 {
                return Err(TransferError::UnexpectedEof);
            }
            debug!(index, "segment complete");
            return Ok(());
        };
        cipher.apply(&mut payload);
        let plain = decode_plain(payload, plain_len, &transfer.header).await?;
        if plain.len() as u64 > remaining {
            return Err(TransferError::UnexpectedEof);
        }
        file.write_all(&plain).await?;
        remaining -= plain.len() as u64;
        transfer.progress.advance(plain.len() as u64);
    }
}

/// Receive the single archive segment, feeding plaintext into the tar
/// consumer. If the extractor finishes early its verdict decides ours, but
/// the stream is still drained to the sentinel to keep the connection in
/// step for the final control byte.
async fn tar_segment(
    transfer: &ActiveTransfer,
    target_dir: PathBuf,
    mut rd: OwnedReadHalf,
) -> Result<(), TransferError> {
    let segment = &transfer.header.segments[0];
    let mut cipher = SegmentCipher::new(&transfer.header.key_hash, &segment.iv);
    let mut consumer = Some(TarConsumer::spawn(target_dir)?);

    loop {
        let Some((plain_len, mut payload)) =
            read_frame(&transfer.cancel, &mut rd, &transfer.header).await?
        else {
            break;
        };
        cipher.apply(&mut payload);
        let plain = decode_plain(payload, plain_len, &transfer.header).await?;
        transfer.progress.advance(plain.len() as u64);

        let delivered = match consumer.as_ref() {
            Some(active) => active.write(Bytes::from(plain)).await,
            None => true,
        };
        if !delivered {
            if let Some(done) = consumer.take() {
                done.finish().await?;
            }
        }
    }

    match consumer.take() {
        Some(active) => active.finish().await,
        None => Ok(()),
    }
}

/// Read one frame; None is the sentinel. Length fields beyond the bounds
/// promised by the handshake are fatal.
async fn read_frame(
    cancel: &CancellationToken,
    rd: &mut OwnedReadHalf,
    header: &TransferHeader,
) -> Result<Option<(usize, Vec<u8>)>, TransferError> {
    let mut raw = [0u8; FRAME_HEADER_LEN];
    tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        result = rd.read_exact(&mut raw) => {
            result?;
        }
    }
    let Some(frame) = FrameHeader::decode(&raw) else {
        return Err(TransferError::Malformed("short frame header"));
    };
    if frame.is_sentinel() {
        return Ok(None);
    }

    let plain_len = frame.plain_len as usize;
    let payload_len = frame.payload_len as usize;
    if plain_len == 0 || plain_len > header.chunk_size as usize {
        return Err(TransferError::Malformed("plain length out of range"));
    }
    if payload_len == 0 || payload_len > payload_bound(header.chunk_size) {
        return Err(TransferError::Malformed("payload length out of range"));
    }
    if !header.is_compressed() && payload_len != plain_len {
        return Err(TransferError::ChunkLengthMismatch {
            expected: plain_len,
            actual: payload_len,
        });
    }

    let mut payload = vec![0u8; payload_len];
    tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        result = rd.read_exact(&mut payload) => {
            result?;
        }
    }
    Ok(Some((plain_len, payload)))
}

/// Compressed chunks may run slightly past the plaintext size; anything
/// beyond this bound is a malformed frame rather than unlucky input.
fn payload_bound(chunk_size: u32) -> usize {
    let chunk = chunk_size as usize;
    chunk + chunk / 16 + 256
}

/// Undo the optional zlib stage, enforcing the exact advertised length.
async fn decode_plain(
    payload: Vec<u8>,
    plain_len: usize,
    header: &TransferHeader,
) -> Result<Vec<u8>, TransferError> {
    if !header.is_compressed() {
        // read_frame already pinned payload_len == plain_len
        return Ok(payload);
    }
    tokio::task::spawn_blocking(move || inflate_chunk(&payload, plain_len))
        .await
        .map_err(|_| io::Error::other("decompression task failed"))?
}
