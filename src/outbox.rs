use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Condvar, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{self, MAX_FRAME_SIZE};
use crate::error::StompError;
use crate::frame::{Direction, Frame};
use crate::pipeline::Pipeline;
use crate::transport::ByteWrite;

/// Context passed through the outbound pipeline.
#[derive(Debug)]
pub struct OutboxContext {
    pub frame: Frame,
}

struct Queued {
    priority: u8,
    seq: u64,
    frame: Frame,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<(), StompError>>,
}

// BinaryHeap pops the greatest entry: lowest priority value, then oldest.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

struct OutboxState {
    queue: BinaryHeap<Queued>,
    signaled: bool,
    running: bool,
    seq: u64,
}

/// Single-writer agent.
///
/// Callers on any thread [`enqueue`](Outbox::enqueue) frames; the dedicated
/// writer thread in [`run`](Outbox::run) drains them in priority order. The
/// queue and its wake flag live under one mutex so a producer's signal can
/// never be lost between the consumer's empty check and its reset.
pub struct Outbox {
    name: String,
    state: Mutex<OutboxState>,
    wake: Condvar,
}

impl Outbox {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(OutboxState {
                queue: BinaryHeap::new(),
                signaled: false,
                running: true,
                seq: 0,
            }),
            wake: Condvar::new(),
        }
    }

    /// Queue `frame` for writing.
    ///
    /// The frame is queued before this returns; the future resolves once
    /// the frame went through the outbound pipeline. Once the agent has
    /// stopped this is a no-op whose future is already complete.
    pub fn enqueue(
        &self,
        frame: Frame,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<(), StompError>> {
        let (done, rx) = oneshot::channel();
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => {
                    return future::ready(Err(StompError::Closed(format!(
                        "outbox {} is poisoned",
                        self.name
                    ))))
                    .boxed();
                }
            };
            if !state.running {
                debug!(connection = %self.name, command = %frame.command(), "outbox stopped, frame dropped");
                return future::ready(Ok(())).boxed();
            }
            state.seq += 1;
            let seq = state.seq;
            state.queue.push(Queued {
                priority: frame.priority(),
                seq,
                frame,
                cancel,
                done,
            });
            state.signaled = true;
        }
        self.wake.notify_one();
        async move {
            rx.await
                .map_err(|_| StompError::Closed("outbox stopped before the frame was written".into()))?
        }
        .boxed()
    }

    /// Stop the agent. Frames still queued are dropped and their futures
    /// fail with `StompError::Closed`.
    pub fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.running = false;
            state.signaled = true;
            state.queue.clear();
        }
        self.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.running).unwrap_or(false)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().map(|s| s.queue.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, OutboxState>, StompError> {
        self.state
            .lock()
            .map_err(|_| StompError::Closed(format!("outbox {} is poisoned", self.name)))
    }

    /// Block until an entry is available. `None` once stopped.
    fn next_entry(&self) -> Result<Option<Queued>, StompError> {
        let mut state = self.lock()?;
        loop {
            if !state.running {
                return Ok(None);
            }
            if state.signaled {
                match state.queue.pop() {
                    Some(entry) => return Ok(Some(entry)),
                    None => state.signaled = false,
                }
            } else {
                state = self
                    .wake
                    .wait(state)
                    .map_err(|_| StompError::Closed(format!("outbox {} is poisoned", self.name)))?;
            }
        }
    }

    /// Writer loop. Runs on the dedicated outbox thread until [`stop`]
    /// is called or the loop itself fails.
    ///
    /// [`stop`]: Outbox::stop
    pub fn run(&self, pipeline: &Pipeline<OutboxContext>, errors: &mpsc::UnboundedSender<StompError>) {
        info!(connection = %self.name, "outbox started");
        loop {
            let entry = match self.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(connection = %self.name, error = %e, "outbox failed");
                    self.stop();
                    let _ = errors.send(e);
                    break;
                }
            };

            let command = entry.frame.command();
            if entry.cancel.is_cancelled() {
                debug!(connection = %self.name, command = %command, "frame cancelled before write");
                let _ = entry.done.send(Err(StompError::Timeout(format!(
                    "{} cancelled before it was written",
                    command
                ))));
                continue;
            }
            if entry.frame.direction() == Direction::ClientBound {
                error!(connection = %self.name, command = %command, "client-bound frame in outbox");
                let _ = entry.done.send(Err(StompError::frame(
                    command.as_str(),
                    "client-bound frames cannot be sent",
                )));
                continue;
            }

            let mut ctx = OutboxContext { frame: entry.frame };
            match catch_unwind(AssertUnwindSafe(|| pipeline.execute(&mut ctx))) {
                Ok(result) => {
                    if let Err(e) = &result {
                        warn!(connection = %self.name, command = %command, error = %e, "frame not written");
                    }
                    let _ = entry.done.send(result);
                }
                Err(_) => {
                    let e = StompError::Closed(format!(
                        "outbox {} stopped: pipeline panicked on {}",
                        self.name, command
                    ));
                    error!(connection = %self.name, error = %e, "outbox failed");
                    self.stop();
                    let _ = errors.send(e);
                    break;
                }
            }
        }
        info!(connection = %self.name, "outbox stopped");
    }
}

/// Marshal `frame`, enforce [`MAX_FRAME_SIZE`] and write it. Returns the
/// number of bytes written.
pub fn marshal_and_write(writer: &mut dyn ByteWrite, frame: &Frame) -> Result<usize, StompError> {
    let bytes = codec::marshal(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        error!(command = %frame.command(), size = bytes.len(), "frame exceeds maximum size");
        return Err(StompError::frame(
            frame.command().as_str(),
            format!(
                "frame of {} bytes exceeds the maximum of {} bytes",
                bytes.len(),
                MAX_FRAME_SIZE
            ),
        ));
    }
    writer.write_bytes(&bytes)?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{AckMode, Command};
    use std::sync::Arc;
    use std::time::Duration;

    fn recording() -> (Pipeline<OutboxContext>, Arc<Mutex<Vec<Command>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pipeline = Pipeline::new().run(move |ctx: &mut OutboxContext| {
            sink.lock().unwrap().push(ctx.frame.command());
            Ok(())
        });
        (pipeline, seen)
    }

    fn text(destination: &str) -> Frame {
        let mut frame = Frame::send(destination);
        frame.set_text_body("x", "text/plain").unwrap();
        frame
    }

    #[tokio::test]
    async fn drains_in_priority_order() {
        let outbox = Arc::new(Outbox::new("test"));
        let token = CancellationToken::new();
        let send = outbox.enqueue(text("/q"), token.clone());
        let sub = outbox.enqueue(Frame::subscribe("s", "/q", AckMode::Auto), token.clone());
        let hb = outbox.enqueue(Frame::heartbeat(Direction::ServerBound), token.clone());
        assert_eq!(outbox.queued(), 3);

        let (pipeline, seen) = recording();
        let (errors, _rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(&outbox);
        let thread = std::thread::spawn(move || agent.run(&pipeline, &errors));

        hb.await.unwrap();
        sub.await.unwrap();
        send.await.unwrap();
        outbox.stop();
        thread.join().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Command::Heartbeat, Command::Subscribe, Command::Send]
        );
    }

    #[tokio::test]
    async fn cancelled_and_misrouted_frames_fail() {
        let outbox = Arc::new(Outbox::new("test"));
        let (pipeline, seen) = recording();
        let (errors, _rx) = mpsc::unbounded_channel();
        let agent = Arc::clone(&outbox);
        let thread = std::thread::spawn(move || agent.run(&pipeline, &errors));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = outbox.enqueue(text("/q"), cancelled).await.unwrap_err();
        assert!(matches!(err, StompError::Timeout(_)));

        let err = outbox
            .enqueue(Frame::receipt("r1"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StompError::Frame { .. }));

        outbox.stop();
        thread.join().unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_after_stop_is_a_no_op() {
        let outbox = Outbox::new("test");
        outbox.stop();
        let done = tokio::time::timeout(
            Duration::from_millis(100),
            outbox.enqueue(text("/q"), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(done.is_ok());
        assert_eq!(outbox.queued(), 0);
    }

    #[test]
    fn writes_marshalled_bytes() {
        let mut out: Vec<u8> = Vec::new();
        let n = marshal_and_write(&mut out, &Frame::heartbeat(Direction::ServerBound)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(out, vec![0u8]);
    }
}
