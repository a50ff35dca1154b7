/// Byte-progress reporting surface. The engine calls it from multiple
/// segment tasks at once; implementations must tolerate that.
pub trait Progress: Send + Sync {
    /// A transfer is starting. `total` is None for directory transfers,
    /// whose size is not known up front.
    fn start(&self, total: Option<u64>, label: &str);

    /// `n` more plaintext bytes are done.
    fn advance(&self, n: u64);

    /// The transfer ended, successfully or not.
    fn finish(&self);
}

/// Discards all progress events.
pub struct NullProgress;

impl Progress for NullProgress {
    fn start(&self, _total: Option<u64>, _label: &str) {}
    fn advance(&self, _n: u64) {}
    fn finish(&self) {}
}
