use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Run `tick` every `period` until the returned token is cancelled.
///
/// The first tick fires one full period after the call. Each tick is handed
/// to the blocking pool without waiting for the previous one, so `tick`
/// must guard itself against overlapping runs.
pub fn spawn_periodic<F>(handle: &Handle, period: Duration, tick: F) -> CancellationToken
where
    F: Fn() + Send + Sync + 'static,
{
    let token = CancellationToken::new();
    let stop = token.clone();
    let tick = Arc::new(tick);
    let blocking = handle.clone();
    handle.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let tick = Arc::clone(&tick);
                    blocking.spawn_blocking(move || tick());
                }
            }
        }
    });
    token
}
