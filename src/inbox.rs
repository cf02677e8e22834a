use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock;
use crate::error::StompError;
use crate::frame::Frame;
use crate::parser;
use crate::pipeline::Pipeline;
use crate::transport::ByteRead;

/// Context passed through the inbound pipeline.
#[derive(Debug)]
pub struct InboxContext {
    pub frame: Frame,
}

/// Single-reader agent.
///
/// Runs on a dedicated thread and blocks on the byte source. Dispatch
/// failures are reported and the loop keeps reading; a read failure stops
/// the agent for good.
pub struct Inbox {
    name: String,
    running: AtomicBool,
}

impl Inbox {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            running: AtomicBool::new(true),
        }
    }

    /// Ask the loop to stop. A read that is already blocked only returns
    /// once the source yields a byte, fails, or observes cancellation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn run<R: ByteRead + ?Sized>(
        &self,
        reader: &mut R,
        pipeline: &Pipeline<InboxContext>,
        cancel: &CancellationToken,
        errors: &mpsc::UnboundedSender<StompError>,
    ) {
        info!(connection = %self.name, "inbox started");
        while self.is_running() {
            match parser::unmarshal(reader, cancel) {
                Ok(mut frame) => {
                    frame.mark_received(clock::ticks());
                    let command = frame.command();
                    let mut ctx = InboxContext { frame };
                    if let Err(e) = pipeline.execute(&mut ctx) {
                        warn!(connection = %self.name, command = %command, error = %e, "dispatch failed");
                        let _ = errors.send(e);
                    }
                }
                Err(StompError::Validation(failures)) => {
                    // the frame was consumed completely, the stream is still in sync
                    warn!(connection = %self.name, ?failures, "invalid inbound frame");
                    let _ = errors.send(StompError::Validation(failures));
                }
                Err(e) => {
                    self.stop();
                    if cancel.is_cancelled() {
                        debug!(connection = %self.name, "inbox read cancelled");
                    } else {
                        error!(connection = %self.name, error = %e, "inbox read failed");
                        let _ = errors.send(e);
                    }
                    break;
                }
            }
        }
        info!(connection = %self.name, "inbox stopped");
    }
}
