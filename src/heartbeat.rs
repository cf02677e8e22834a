use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock;
use crate::timer;

/// Liveness watchdog shared by the inbound and outbound monitors.
///
/// The frame-processing pipelines call [`HeartbeatService::update`] for every
/// frame seen. On each timer tick, if no frame was seen since the previous
/// tick, `on_elapsed` runs: the inbound monitor reports a missing heartbeat,
/// the outbound monitor queues a client heartbeat.
pub struct HeartbeatService {
    kind: &'static str,
    last_frame: AtomicU64,
    last_tick: AtomicU64,
    ticking: AtomicBool,
    on_elapsed: Box<dyn Fn() + Send + Sync>,
    timer: Mutex<Option<CancellationToken>>,
}

impl HeartbeatService {
    pub fn new<F>(kind: &'static str, on_elapsed: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            kind,
            last_frame: AtomicU64::new(0),
            last_tick: AtomicU64::new(clock::ticks()),
            ticking: AtomicBool::new(false),
            on_elapsed: Box::new(on_elapsed),
            timer: Mutex::new(None),
        }
    }

    /// Start ticking every `interval_ms`. Zero or negative disables the
    /// monitor. The first check happens one full interval after the call.
    ///
    /// Returns whether the monitor is running.
    pub fn start(self: &Arc<Self>, handle: &Handle, interval_ms: i64) -> bool {
        self.stop();
        if interval_ms <= 0 {
            debug!(kind = self.kind, "heartbeat disabled");
            return false;
        }
        self.last_tick.store(clock::ticks(), Ordering::Release);
        let weak = Arc::downgrade(self);
        let token = timer::spawn_periodic(
            handle,
            Duration::from_millis(interval_ms as u64),
            move || {
                if let Some(service) = weak.upgrade() {
                    service.tick();
                }
            },
        );
        if let Ok(mut slot) = self.timer.lock() {
            *slot = Some(token);
        }
        info!(kind = self.kind, interval_ms, "heartbeat started");
        true
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.timer.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
                debug!(kind = self.kind, "heartbeat stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Record that a frame was seen.
    pub fn update(&self) {
        self.last_frame.store(clock::ticks(), Ordering::Release);
    }

    /// One watchdog check. Returns whether `on_elapsed` ran; an overlapping
    /// call does nothing.
    pub fn tick(&self) -> bool {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _guard = TickGuard(&self.ticking);
        let elapsed =
            self.last_frame.load(Ordering::Acquire) < self.last_tick.load(Ordering::Acquire);
        if elapsed {
            debug!(kind = self.kind, "no frame since last check");
            (self.on_elapsed)();
        }
        self.last_tick.store(clock::ticks(), Ordering::Release);
        elapsed
    }
}

/// Clears the overlap flag even when `on_elapsed` unwinds.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Arc<HeartbeatService>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let service = Arc::new(HeartbeatService::new("test", move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        (service, count)
    }

    #[test]
    fn fires_only_when_idle() {
        let (service, count) = counting();
        assert!(service.tick());
        service.update();
        assert!(!service.tick());
        assert!(service.tick());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_callback_does_not_stop_the_watchdog() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let service = HeartbeatService::new("test", move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first check fails");
            }
        });
        let first = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| service.tick()));
        assert!(first.is_err());
        assert!(service.tick());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_positive_interval_disables() {
        let (service, _) = counting();
        assert!(!service.start(&Handle::current(), 0));
        assert!(!service.start(&Handle::current(), -5));
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn timer_drives_ticks() {
        let (service, count) = counting();
        assert!(service.start(&Handle::current(), 20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        service.stop();
        assert!(count.load(Ordering::SeqCst) >= 1);
        assert!(!service.is_running());
    }
}
