/// Receiver-side bookkeeping: the process-wide map of live transfers and
/// the per-transfer completion machinery.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use beam_protocol::{TransferHeader, TRANSFER_ID_LEN};

use crate::error::TransferError;
use crate::progress::Progress;

/// Where a transfer's plaintext goes.
pub enum TransferSink {
    /// Preallocated output file; every segment task opens its own handle
    /// and writes its own range.
    File { path: PathBuf },
    /// Streaming extraction into a freshly resolved directory.
    Tar { target_dir: PathBuf },
}

/// One live transfer on the receiver. Owned by the primary connection
/// handler; auxiliary connections borrow it through the registry.
pub struct ActiveTransfer {
    pub header: TransferHeader,
    pub sink: TransferSink,
    pub progress: Arc<dyn Progress>,
    pub cancel: CancellationToken,
    pending: AtomicU16,
    claimed: Vec<AtomicBool>,
    failed: AtomicBool,
    error: Mutex<Option<TransferError>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl ActiveTransfer {
    pub fn new(
        header: TransferHeader,
        sink: TransferSink,
        progress: Arc<dyn Progress>,
    ) -> Arc<ActiveTransfer> {
        let count = header.segments.len();
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(ActiveTransfer {
            header,
            sink,
            progress,
            cancel: CancellationToken::new(),
            pending: AtomicU16::new(count as u16),
            claimed: (0..count).map(|_| AtomicBool::new(false)).collect(),
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
            done_tx,
            done_rx,
        })
    }

    /// Bind a connection to segment `index`. False if the index is out of
    /// range or some connection already took it.
    pub fn claim_segment(&self, index: usize) -> bool {
        match self.claimed.get(index) {
            Some(slot) => !slot.swap(true, Ordering::SeqCst),
            None => false,
        }
    }

    /// Record a fatal error and cancel the sibling segments. The first
    /// error wins the slot; `Cancelled` never does.
    pub fn record_error(&self, err: TransferError) {
        if !matches!(err, TransferError::Cancelled) {
            let mut slot = self.error.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
                self.failed.store(true, Ordering::SeqCst);
            }
        }
        self.cancel.cancel();
        let _ = self.done_tx.send(true);
    }

    /// A segment task finished (successfully or not).
    pub fn segment_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.done_tx.send(true);
        }
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn take_error(&self) -> Option<TransferError> {
        self.error.lock().unwrap().take()
    }

    /// Resolves when every segment completed or the first error landed.
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// The process-wide `transfer_id -> ActiveTransfer` map. Every auxiliary
/// connection resolves through this single point.
#[derive(Default)]
pub struct TransferRegistry {
    inner: Mutex<HashMap<[u8; TRANSFER_ID_LEN], Arc<ActiveTransfer>>>,
}

impl TransferRegistry {
    pub fn new() -> TransferRegistry {
        TransferRegistry::default()
    }

    /// Register a transfer. False if the id is already live, in which case
    /// the caller must abandon the new handshake.
    pub fn insert(&self, transfer: Arc<ActiveTransfer>) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.entry(transfer.header.transfer_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(transfer);
                true
            }
        }
    }

    pub fn get(&self, id: &[u8; TRANSFER_ID_LEN]) -> Option<Arc<ActiveTransfer>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &[u8; TRANSFER_ID_LEN]) {
        self.inner.lock().unwrap().remove(id);
    }
}
