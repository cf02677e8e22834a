use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock;
use crate::timer;

/// How often pending receipts are compared against the receipts seen so far.
pub const SCAN_INTERVAL: Duration = Duration::from_millis(100);

struct PendingReceipt {
    timestamp: u64,
    tx: oneshot::Sender<()>,
}

/// Cumulative receipt tracking.
///
/// Brokers acknowledge frames in order, so a RECEIPT for one frame also
/// covers every frame registered before it. `receive` only records the
/// highest registration timestamp confirmed so far; the periodic `scan`
/// resolves every waiter registered at or before that mark.
///
/// Entries are never expired here. A caller that gives up waiting must call
/// [`ReceiptService::try_remove`].
pub struct ReceiptService {
    pending: DashMap<String, PendingReceipt>,
    last_receipt: AtomicU64,
    scanning: AtomicBool,
    timer: Mutex<Option<CancellationToken>>,
}

impl Default for ReceiptService {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiptService {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            last_receipt: AtomicU64::new(0),
            scanning: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    /// Register a waiter for receipt `id` stamped with the current tick.
    pub fn wait_for_receipt(&self, id: &str) -> oneshot::Receiver<()> {
        self.wait_for_receipt_at(id, clock::ticks())
    }

    /// Register a waiter for receipt `id` with an explicit timestamp.
    ///
    /// Registering the same id twice replaces the earlier waiter, whose
    /// receiver then completes with an error.
    pub fn wait_for_receipt_at(&self, id: &str, timestamp: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(id.to_string(), PendingReceipt { timestamp, tx });
        trace!(receipt = id, timestamp, "receipt registered");
        rx
    }

    /// Record that the broker confirmed receipt `id`.
    ///
    /// Returns `false` when the id is unknown. Resolution happens on the
    /// next scan.
    pub fn receive(&self, id: &str) -> bool {
        let timestamp = match self.pending.get(id) {
            Some(entry) => entry.timestamp,
            None => {
                debug!(receipt = id, "receipt for unknown id");
                return false;
            }
        };
        self.last_receipt.fetch_max(timestamp, Ordering::AcqRel);
        true
    }

    /// Resolve every waiter registered at or before the highest confirmed
    /// timestamp. Returns how many waiters were resolved; an overlapping
    /// call resolves nothing.
    pub fn scan(&self) -> usize {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }
        let last = self.last_receipt.load(Ordering::Acquire);
        let due: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.timestamp <= last)
            .map(|entry| entry.key().clone())
            .collect();
        let mut resolved = 0;
        for id in due {
            if let Some((_, receipt)) = self.pending.remove(&id) {
                // the waiter may already have given up
                let _ = receipt.tx.send(());
                resolved += 1;
            }
        }
        if resolved > 0 {
            trace!(resolved, "receipts resolved");
        }
        self.scanning.store(false, Ordering::Release);
        resolved
    }

    /// Discard the waiter for `id`, if any.
    pub fn try_remove(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start the periodic scan on `handle`.
    pub fn start(self: &Arc<Self>, handle: &Handle) {
        let weak = Arc::downgrade(self);
        let token = timer::spawn_periodic(handle, SCAN_INTERVAL, move || {
            if let Some(service) = weak.upgrade() {
                service.scan();
            }
        });
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(previous) = slot.replace(token) {
                previous.cancel();
            }
        }
    }

    /// Stop scanning and drop every waiter.
    pub fn dispose(&self) {
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
        self.pending.clear();
    }
}
