//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{CuspakError, Result};

/// Receives `(processed_bytes, total_bytes)` updates as a pack or unpack
/// proceeds. Updates are a side channel; implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn update(&self, processed: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn update(&self, processed: u64, total: u64) {
        self(processed, total)
    }
}

/// Monotonic byte counter feeding an optional sink.
pub struct Progress {
    sink: Option<Arc<dyn ProgressSink>>,
    processed: AtomicU64,
    total: u64,
}

impl Progress {
    pub fn new(sink: Option<Arc<dyn ProgressSink>>, total: u64) -> Self {
        Self {
            sink,
            processed: AtomicU64::new(0),
            total,
        }
    }

    /// Record `bytes` more work done and notify the sink
    pub fn add(&self, bytes: u64) {
        let processed = self.processed.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(sink) = &self.sink {
            sink.update(processed, self.total);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Cooperative cancellation flag, checked between files and chunk batches —
/// never mid-chunk.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Bail out with `Cancelled` if the flag has been raised
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CuspakError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_progress_is_monotonic() {
        let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |processed: u64, _total: u64| seen.lock().unwrap().push(processed)
        };
        let progress = Progress::new(Some(Arc::new(sink)), 100);

        progress.add(10);
        progress.add(30);
        progress.add(60);

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![10, 40, 100]);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());

        let clone = token.clone();
        clone.cancel();
        match token.check() {
            Err(CuspakError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }
}
