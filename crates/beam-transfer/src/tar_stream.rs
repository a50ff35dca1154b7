/// Streaming tar pipeline: directories travel as GNU tar bytes with no
/// temporary archive on either side.
///
/// ```text
/// sender:    [pack worker] --bounded queue--> [segment task] --> TCP
/// receiver:  TCP --> [segment task] --bounded queue--> [extract worker]
/// ```
///
/// Both queues hold a handful of chunks, so a slow disk on either end
/// stalls the network reader and TCP flow control stalls the peer.
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::thread;

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::TransferError;

/// Chunks of tar bytes in flight on either side of a worker.
pub const TAR_QUEUE_CHUNKS: usize = 4;

/// Background producer: walks a directory and yields its tar serialization
/// chunk by chunk.
pub struct TarProducer {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl TarProducer {
    /// Archive `source` into chunks of at most `chunk_size` bytes. The
    /// archive is rooted at the basename of `source`, so it extracts into a
    /// single top-level directory.
    pub fn spawn(source: PathBuf, chunk_size: usize) -> io::Result<TarProducer> {
        let (tx, rx) = mpsc::channel(TAR_QUEUE_CHUNKS);
        thread::Builder::new()
            .name("beam-tar-pack".into())
            .spawn(move || {
                let writer = ChannelWriter {
                    tx: tx.clone(),
                    buf: Vec::with_capacity(chunk_size),
                    chunk_size,
                };
                if let Err(err) = pack_tree(&source, writer) {
                    let _ = tx.blocking_send(Err(err));
                }
            })?;
        Ok(TarProducer { rx })
    }

    /// Next chunk of archive bytes; None once the archive is complete.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.rx.recv().await
    }
}

fn pack_tree(source: &Path, writer: ChannelWriter) -> io::Result<()> {
    let arcname = source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("archive"));

    let mut builder = tar::Builder::new(writer);
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::other)?;
        let path = entry.path();
        let rel = path.strip_prefix(source).map_err(io::Error::other)?;
        let name = arcname.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(&name, path)?;
        } else if file_type.is_file() {
            let mut file = fs::File::open(path)?;
            builder.append_file(&name, &mut file)?;
        } else {
            // Links and specials do not survive streaming extraction.
            debug!(path = %path.display(), "skipping non-regular entry");
        }
    }
    let mut writer = builder.into_inner()?;
    writer.flush()
}

/// Bridges `tar::Builder` onto the bounded queue, cutting chunks of exactly
/// `chunk_size` bytes (the final flush may be shorter).
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChannelWriter {
    fn push_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.tx
            .blocking_send(Ok(Bytes::from(chunk)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tar stream reader hung up"))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = rest.len().min(room);
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == self.chunk_size {
                self.push_chunk()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.push_chunk()
    }
}

/// Background consumer: extracts a streamed tar archive into a target
/// directory as the bytes arrive.
pub struct TarConsumer {
    tx: mpsc::Sender<Bytes>,
    worker: thread::JoinHandle<Result<(), TransferError>>,
}

impl TarConsumer {
    /// Spawn the extraction worker. `target_dir` is created eagerly.
    pub fn spawn(target_dir: PathBuf) -> io::Result<TarConsumer> {
        fs::create_dir_all(&target_dir)?;
        let (tx, rx) = mpsc::channel(TAR_QUEUE_CHUNKS);
        let worker = thread::Builder::new()
            .name("beam-tar-extract".into())
            .spawn(move || extract_stream(rx, &target_dir))?;
        Ok(TarConsumer { tx, worker })
    }

    /// Feed decrypted archive bytes. Returns false once the worker is gone;
    /// harvest its verdict with `finish`.
    pub async fn write(&self, chunk: Bytes) -> bool {
        self.tx.send(chunk).await.is_ok()
    }

    /// Close the queue and join the worker.
    pub async fn finish(self) -> Result<(), TransferError> {
        let TarConsumer { tx, worker } = self;
        drop(tx);
        tokio::task::spawn_blocking(move || worker.join())
            .await
            .map_err(|_| io::Error::other("tar extraction join failed"))?
            .map_err(|_| io::Error::other("tar extraction worker panicked"))?
    }
}

fn extract_stream(rx: mpsc::Receiver<Bytes>, target: &Path) -> Result<(), TransferError> {
    let mut archive = tar::Archive::new(ChannelReader {
        rx,
        buf: Bytes::new(),
    });
    archive.set_unpack_xattrs(false);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let kind = entry.header().entry_type();
        if kind.is_hard_link() || kind.is_symlink() {
            debug!(path = ?entry.path(), "skipping link entry");
            continue;
        }
        let dest = rebase_entry(target, entry.path()?.as_ref(), kind.is_dir())?;
        if kind.is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            match entry.unpack(&dest) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    warn!(path = %dest.display(), "could not apply entry metadata");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok(())
}

/// Map a tar entry name under the target directory. `CurDir` components are
/// dropped, anything that could climb out of the target is fatal, and the
/// archive's single root component is stripped so the tree lands directly
/// in the (possibly deduplicated) target.
fn rebase_entry(target: &Path, rel: &Path, is_dir: bool) -> Result<PathBuf, TransferError> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::UnsafePath(rel.to_path_buf()));
            }
        }
    }
    let strip_root = parts.len() > 1 || is_dir;
    let mut dest = target.to_path_buf();
    for part in parts.into_iter().skip(strip_root as usize) {
        dest.push(part);
    }
    Ok(dest)
}

/// Blocking `Read` over the bounded queue, for `tar::Archive`.
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    buf: Bytes,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.buf.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.buf = chunk,
                None => return Ok(0),
            }
        }
        let n = self.buf.len().min(out.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }
}

/// `download_dir/<basename>`, deduplicated with `_1`, `_2`, … suffixes.
pub fn unique_target_dir(download_dir: &Path, basename: &str) -> PathBuf {
    let candidate = download_dir.join(basename);
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = download_dir.join(format!("{basename}_{n}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
