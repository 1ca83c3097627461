//! Channel between a blocking index scan and the scan operator that drains it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::ScanEntry;
use crate::types::QueryError;

/// Producer half of an index scan.
///
/// Indexes push entries with [`send`](Self::send) from a blocking thread;
/// the scan operator drains the paired receiver. The connection also
/// carries the out-of-band signals a scan can raise: a timeout flag for
/// resumable scans and a fatal error slot.
#[derive(Debug)]
pub struct IndexConnection {
    sender: Sender<ScanEntry>,
    stop: CancellationToken,
    timed_out: AtomicBool,
    sent: AtomicU64,
    error: Mutex<Option<QueryError>>,
}

impl IndexConnection {
    /// Connection with a buffer of `capacity` entries.
    pub fn new(capacity: usize, stop: CancellationToken) -> (Self, Receiver<ScanEntry>) {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        let conn = Self {
            sender,
            stop,
            timed_out: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            error: Mutex::new(None),
        };
        (conn, receiver)
    }

    /// Connection whose buffer is sized from the expected entry count,
    /// capped at `cap`.
    pub fn sized(expected: i64, cap: usize, stop: CancellationToken) -> (Self, Receiver<ScanEntry>) {
        let expected = usize::try_from(expected.max(1)).unwrap_or(cap);
        Self::new(expected.min(cap), stop)
    }

    /// Delivers one entry, blocking while the buffer is full. Returns
    /// `false` once the consumer is gone or the scan was stopped; the
    /// producer must then return.
    pub fn send(&self, entry: ScanEntry) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        match self.sender.send_blocking(entry) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    /// True once the consumer asked the scan to stop.
    pub fn stopped(&self) -> bool {
        self.stop.is_cancelled() || self.sender.is_closed()
    }

    /// Marks the scan as cut short by the index; the consumer may resume.
    pub fn set_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    /// Whether the index cut the scan short.
    pub fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }

    /// Entries delivered so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Records a fatal scan error. The first error wins.
    pub fn report_error(&self, err: QueryError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Takes the recorded error, if any.
    pub fn take_error(&self) -> Option<QueryError> {
        self.error.lock().take()
    }

    /// Signals end of scan; buffered entries remain readable.
    pub fn close(&self) {
        self.sender.close();
    }
}
