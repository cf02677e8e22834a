use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::acknowledge::AcknowledgeService;
use crate::clock;
use crate::error::StompError;
use crate::frame::{
    ACK, AckMode, Command, DESTINATION, Direction, Frame, ID, MESSAGE, RECEIPT, RECEIPT_ID,
    SUBSCRIPTION,
};
use crate::heartbeat::HeartbeatService;
use crate::inbox::{Inbox, InboxContext};
use crate::options::ClientSettings;
use crate::outbox::{Outbox, OutboxContext, marshal_and_write};
use crate::pipeline::Pipeline;
use crate::receipt::ReceiptService;
use crate::subscription::{SubscriptionHandler, SubscriptionService};
use crate::transport::{ByteRead, ByteWrite};

/// What a subscription handler decided for a message on a `client` or
/// `client-individual` subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    Ack,
    Nack,
    /// Nothing is sent; the caller acknowledges later through
    /// [`Client::ack`] or [`Client::nack`].
    Manual,
}

/// Result of a subscription handler.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Sent to the message's `reply-to`, if it has one.
    pub reply: Option<Frame>,
    pub disposition: Disposition,
}

impl Outcome {
    pub fn reply(frame: Frame) -> Self {
        Self {
            reply: Some(frame),
            disposition: Disposition::Ack,
        }
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }
}

impl From<Option<Frame>> for Outcome {
    fn from(reply: Option<Frame>) -> Self {
        Self {
            reply,
            disposition: Disposition::Ack,
        }
    }
}

impl From<Disposition> for Outcome {
    fn from(disposition: Disposition) -> Self {
        Self {
            reply: None,
            disposition,
        }
    }
}

/// Callback for messages delivered to a subscription.
///
/// The returned [`Outcome`] decides the reply and the acknowledgement; an
/// `Err` is answered with a NACK. Nothing is acknowledged on `auto`
/// subscriptions.
pub type MessageHandler =
    Arc<dyn Fn(Frame) -> BoxFuture<'static, Result<Outcome, StompError>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
///
/// The closure may return anything convertible into an [`Outcome`]:
/// `Option<Frame>` replies and acknowledges, a bare [`Disposition`] only
/// decides the acknowledgement.
pub fn message_handler<F, Fut, O>(f: F) -> MessageHandler
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, StompError>> + Send + 'static,
    O: Into<Outcome>,
{
    Arc::new(move |frame: Frame| f(frame).map(|result| result.map(Into::into)).boxed())
}

/// Protocol client: owns the inbox and outbox agents and the services
/// they share.
///
/// Cloning is cheap; all clones drive the same connection. The agents are
/// stopped by [`Client::dispose`] or when the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    name: String,
    settings: ClientSettings,
    handle: Handle,
    receipts: Arc<ReceiptService>,
    subscriptions: Arc<SubscriptionService>,
    acks: Arc<AcknowledgeService>,
    heartbeat_in: Arc<HeartbeatService>,
    heartbeat_out: Arc<HeartbeatService>,
    inbox: Arc<Inbox>,
    outbox: Arc<Outbox>,
    cancel: CancellationToken,
    threads: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Client {
    /// Start the agents over the given byte stream.
    ///
    /// Must be called from within a tokio runtime; listener callbacks and
    /// timers are scheduled on it.
    ///
    /// Returns the client and the receiver on which protocol errors,
    /// missing heartbeats and broker ERROR frames are reported.
    pub fn start(
        name: &str,
        reader: Box<dyn ByteRead>,
        writer: Box<dyn ByteWrite>,
        settings: ClientSettings,
    ) -> Result<(Client, mpsc::UnboundedReceiver<StompError>), StompError> {
        let handle = Handle::try_current().map_err(|e| StompError::Runtime(e.to_string()))?;
        let (errors, error_rx) = mpsc::unbounded_channel();

        let receipts = Arc::new(ReceiptService::new());
        let subscriptions = Arc::new(SubscriptionService::new(handle.clone()));
        let acks = Arc::new(AcknowledgeService::new(Arc::clone(&subscriptions)));
        let inbox = Arc::new(Inbox::new(name));
        let outbox = Arc::new(Outbox::new(name));

        let heartbeat_in = {
            let errors = errors.clone();
            let name = name.to_string();
            Arc::new(HeartbeatService::new("inbound", move || {
                warn!(connection = %name, "server heartbeat missing");
                let _ = errors.send(StompError::HeartbeatMissing);
            }))
        };
        let heartbeat_out = {
            let outbox = Arc::clone(&outbox);
            Arc::new(HeartbeatService::new("outbound", move || {
                // queued immediately; nobody waits for the write
                drop(outbox.enqueue(
                    Frame::heartbeat(Direction::ServerBound),
                    CancellationToken::new(),
                ));
            }))
        };

        let inbound = inbound_pipeline(
            name,
            Arc::clone(&receipts),
            Arc::clone(&subscriptions),
            Arc::clone(&acks),
            Arc::clone(&heartbeat_in),
        );
        let outbound = outbound_pipeline(
            name,
            writer,
            Arc::clone(&acks),
            Arc::clone(&heartbeat_out),
            errors.clone(),
        );

        let cancel = CancellationToken::new();
        let inner = Arc::new(ClientInner {
            name: name.to_string(),
            settings,
            handle: handle.clone(),
            receipts,
            subscriptions,
            acks,
            heartbeat_in,
            heartbeat_out,
            inbox,
            outbox,
            cancel,
            threads: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });

        let inbox_thread = {
            let inbox = Arc::clone(&inner.inbox);
            let cancel = inner.cancel.clone();
            let errors = errors.clone();
            let mut reader = reader;
            thread::Builder::new()
                .name(format!("stomp-inbox@{}", name))
                .spawn(move || inbox.run(&mut reader, &inbound, &cancel, &errors))?
        };
        inner.track(inbox_thread);

        let outbox_thread = {
            let outbox = Arc::clone(&inner.outbox);
            thread::Builder::new()
                .name(format!("stomp-outbox@{}", name))
                .spawn(move || outbox.run(&outbound, &errors))?
        };
        inner.track(outbox_thread);

        inner.receipts.start(&handle);
        info!(connection = %name, "client started");
        Ok((Client { inner }, error_rx))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send a CONNECT frame and wait for the broker's CONNECTED.
    ///
    /// A broker ERROR frame in reply fails with `StompError::Frame`.
    pub async fn connect(&self, frame: Frame, timeout: Duration) -> Result<Frame, StompError> {
        self.inner.connect(frame, timeout).await
    }

    /// Send `frame`; when it carries a `receipt` header also wait for the
    /// broker to confirm it.
    ///
    /// Parameters
    /// - `timeout`: deadline for the whole operation, defaulting to the
    ///   configured operation timeout.
    pub async fn send(&self, frame: Frame, timeout: Option<Duration>) -> Result<(), StompError> {
        self.inner.send(frame, timeout).await
    }

    /// Send a SEND frame carrying `reply-to` and wait for the reply MESSAGE.
    pub async fn request(&self, frame: Frame, timeout: Option<Duration>) -> Result<Frame, StompError> {
        self.inner.request(frame, timeout).await
    }

    /// Register `handler` for subscription `id` and send SUBSCRIBE, waiting
    /// for its receipt.
    pub async fn subscribe(
        &self,
        id: &str,
        destination: &str,
        ack_mode: AckMode,
        handler: MessageHandler,
    ) -> Result<(), StompError> {
        let weak = Arc::downgrade(&self.inner);
        let wrapped: SubscriptionHandler = Arc::new(move |frame: Frame| {
            let weak = weak.clone();
            let handler = Arc::clone(&handler);
            async move {
                let outcome = handler(frame.clone()).await;
                if let Some(inner) = weak.upgrade() {
                    inner.complete_message(&frame, ack_mode, outcome).await;
                }
            }
            .boxed()
        });

        if !self.inner.subscriptions.add_listener(id, ack_mode, wrapped) {
            return Err(StompError::Validation(vec![format!(
                "subscription id '{}' is already in use",
                id
            )]));
        }
        let (result, written) = self
            .inner
            .deliver(Frame::subscribe(id, destination, ack_mode), None)
            .await;
        if let Err(e) = &result {
            self.inner.subscriptions.remove_listener(id);
            self.inner.acks.discard_subscription(id);
            if written {
                // the broker may already be delivering; withdraw without waiting
                warn!(connection = %self.name(), subscription = id, error = %e, "SUBSCRIBE unconfirmed, withdrawing it");
                let mut unsubscribe = Frame::unsubscribe(id);
                unsubscribe.remove_header(RECEIPT);
                if let Err(e) = self.inner.send(unsubscribe, None).await {
                    warn!(connection = %self.name(), subscription = id, error = %e, "UNSUBSCRIBE not sent");
                }
            }
        }
        result
    }

    /// Send UNSUBSCRIBE for `id`, waiting for its receipt, then drop the
    /// listener. Returns `false` (and sends nothing) for an unknown id.
    ///
    /// On failure the listener stays registered, since the broker may still
    /// be delivering to it.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool, StompError> {
        if !self.inner.subscriptions.contains(id) {
            return Ok(false);
        }
        self.inner.send(Frame::unsubscribe(id), None).await?;
        self.inner.subscriptions.remove_listener(id);
        self.inner.acks.discard_subscription(id);
        Ok(true)
    }

    /// Acknowledge the message whose `ack` header is `ack_id`. Redundant
    /// acknowledgements are suppressed before they reach the wire.
    pub async fn ack(&self, ack_id: &str) -> Result<(), StompError> {
        self.inner.send(Frame::ack(ack_id), None).await
    }

    pub async fn nack(&self, ack_id: &str) -> Result<(), StompError> {
        self.inner.send(Frame::nack(ack_id), None).await
    }

    /// Start the heartbeat monitors. Values of zero or less disable the
    /// corresponding monitor.
    pub fn start_heartbeats(&self, outgoing_ms: i64, incoming_ms: i64) {
        self.inner
            .heartbeat_out
            .start(&self.inner.handle, outgoing_ms);
        self.inner
            .heartbeat_in
            .start(&self.inner.handle, incoming_ms);
    }

    /// Stop both agents and release every service. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Receipt waiters not yet resolved or removed.
    pub fn pending_receipts(&self) -> usize {
        self.inner.receipts.pending_count()
    }

    /// Messages still awaiting an ACK/NACK decision.
    pub fn pending_acknowledgements(&self) -> usize {
        self.inner.acks.pending_count()
    }

    /// Registered subscription and reply listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.subscriptions.len()
    }
}

impl ClientInner {
    fn track(&self, thread: JoinHandle<()>) {
        if let Ok(mut threads) = self.threads.lock() {
            threads.push(thread);
        }
    }

    fn deadline(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.settings.operation_timeout)
    }

    async fn send(&self, frame: Frame, timeout: Option<Duration>) -> Result<(), StompError> {
        self.deliver(frame, timeout).await.0
    }

    /// [`ClientInner::send`], also reporting whether the frame reached the
    /// wire.
    async fn deliver(&self, frame: Frame, timeout: Option<Duration>) -> (Result<(), StompError>, bool) {
        if self.disposed.load(Ordering::Acquire) {
            return (
                Err(StompError::Closed(format!("client {} is disposed", self.name))),
                false,
            );
        }
        if let Err(e) = frame.validate() {
            return (Err(e), false);
        }
        let deadline = self.deadline(timeout);
        let command = frame.command();
        let receipt_id = frame.receipt_id().map(str::to_string);
        let waiter = receipt_id
            .as_deref()
            .map(|id| self.receipts.wait_for_receipt(id));
        let token = self.cancel.child_token();
        let pending_write = self.outbox.enqueue(frame, token.clone());
        let written = AtomicBool::new(false);

        let outcome = tokio::time::timeout(deadline, async {
            pending_write.await?;
            written.store(true, Ordering::Release);
            if let Some(waiter) = waiter {
                waiter
                    .await
                    .map_err(|_| StompError::Closed("receipt waiter dropped".into()))?;
            }
            Ok::<(), StompError>(())
        })
        .await;

        if let Some(id) = &receipt_id {
            self.receipts.try_remove(id);
        }
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(StompError::Timeout(match &receipt_id {
                    Some(id) => format!("no receipt '{}' for {} within {:?}", id, command, deadline),
                    None => format!("{} not written within {:?}", command, deadline),
                }))
            }
        };
        (result, written.load(Ordering::Acquire))
    }

    async fn connect(&self, frame: Frame, timeout: Duration) -> Result<Frame, StompError> {
        if frame.command() != Command::Connect {
            return Err(StompError::Validation(vec![format!(
                "connect requires a CONNECT frame, got {}",
                frame.command()
            )]));
        }
        let started = Instant::now();
        let mut reply = self
            .subscriptions
            .add_reply_listener(|f| matches!(f.command(), Command::Connected | Command::Error));
        self.send(frame, Some(timeout)).await?;

        let remaining = timeout.saturating_sub(started.elapsed());
        let answer = tokio::time::timeout(remaining, reply.result())
            .await
            .map_err(|_| {
                StompError::Timeout(format!("no CONNECTED frame within {:?}", timeout))
            })??;
        if answer.command() == Command::Error {
            return Err(StompError::frame(Command::Error.as_str(), error_message(&answer)));
        }
        info!(connection = %self.name, "connected");
        Ok(answer)
    }

    async fn request(&self, frame: Frame, timeout: Option<Duration>) -> Result<Frame, StompError> {
        if frame.command() != Command::Send {
            return Err(StompError::Validation(vec![format!(
                "request requires a SEND frame, got {}",
                frame.command()
            )]));
        }
        let expected = self.settings.strategy.reply_header(&frame)?;
        let deadline = self.deadline(timeout);
        let started = Instant::now();
        let mut reply = self.subscriptions.add_reply_listener(move |f| {
            f.command() == Command::Message && f.get_header(SUBSCRIPTION) == Some(expected.as_str())
        });
        self.send(frame, Some(deadline)).await?;

        let remaining = deadline.saturating_sub(started.elapsed());
        tokio::time::timeout(remaining, reply.result())
            .await
            .map_err(|_| StompError::Timeout(format!("no reply within {:?}", deadline)))?
    }

    /// Reply and acknowledge after a subscription handler finished.
    async fn complete_message(
        &self,
        frame: &Frame,
        ack_mode: AckMode,
        outcome: Result<Outcome, StompError>,
    ) {
        let disposition = match outcome {
            Ok(Outcome { reply, disposition }) => {
                if let Some(mut reply) = reply {
                    match frame.reply_to() {
                        Some(reply_to) => {
                            reply.remove_header(DESTINATION);
                            reply.set_destination(reply_to);
                            if let Err(e) = self.send(reply, None).await {
                                warn!(connection = %self.name, error = %e, "reply not sent");
                            }
                        }
                        None => {
                            debug!(connection = %self.name, "handler replied to a message without reply-to")
                        }
                    }
                }
                disposition
            }
            Err(e) => {
                warn!(connection = %self.name, error = %e, "message handler failed");
                Disposition::Nack
            }
        };
        if ack_mode == AckMode::Auto {
            return;
        }
        let Some(ack_id) = frame.get_header(ACK) else {
            warn!(connection = %self.name, "message on {} subscription without ack header", ack_mode);
            return;
        };
        let acknowledgement = match disposition {
            Disposition::Ack => Frame::ack(ack_id),
            Disposition::Nack => Frame::nack(ack_id),
            Disposition::Manual => {
                trace!(connection = %self.name, ack = ack_id, "acknowledgement left to the caller");
                return;
            }
        };
        if let Err(e) = self.send(acknowledgement, None).await {
            warn!(connection = %self.name, error = %e, "acknowledgement not sent");
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(connection = %self.name, "disposing client");
        self.inbox.stop();
        self.outbox.stop();
        self.cancel.cancel();

        let threads = self
            .threads
            .lock()
            .map(|mut threads| std::mem::take(&mut *threads))
            .unwrap_or_default();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(connection = %self.name, "agent thread panicked");
            }
        }

        self.heartbeat_in.stop();
        self.heartbeat_out.stop();
        self.receipts.dispose();
        self.acks.clear();
        self.subscriptions.clear();
        info!(connection = %self.name, "client disposed");
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn error_message(frame: &Frame) -> String {
    match frame.get_header(MESSAGE) {
        Some(message) => message.to_string(),
        None => frame.body_text().unwrap_or("broker sent ERROR").to_string(),
    }
}

fn inbound_pipeline(
    name: &str,
    receipts: Arc<ReceiptService>,
    subscriptions: Arc<SubscriptionService>,
    acks: Arc<AcknowledgeService>,
    heartbeat_in: Arc<HeartbeatService>,
) -> Pipeline<InboxContext> {
    let log_name = name.to_string();
    let name = name.to_string();
    Pipeline::<InboxContext>::new()
        .use_middleware(move |ctx, next| {
            trace!(connection = %log_name, command = %ctx.frame.command(), "frame received");
            next.run(ctx)
        })
        .use_middleware(move |ctx, next| {
            heartbeat_in.update();
            next.run(ctx)
        })
        .run(move |ctx| {
            let frame = &ctx.frame;
            match frame.command() {
                Command::Receipt => {
                    match frame.get_header(RECEIPT_ID) {
                        Some(id) => {
                            receipts.receive(id);
                        }
                        None => warn!(connection = %name, "RECEIPT without receipt-id"),
                    }
                    Ok(())
                }
                Command::Message => {
                    let subscription = frame.get_header(SUBSCRIPTION).unwrap_or_default();
                    if let Some(ack_id) = frame.get_header(ACK) {
                        // auto subscriptions never send ACK/NACK, nothing to track
                        if subscriptions.acknowledge_mode(subscription) != AckMode::Auto {
                            let received = frame.received_at().unwrap_or_else(clock::ticks);
                            acks.register(ack_id, subscription, received);
                        }
                    }
                    if subscriptions.notify_listeners(frame) == 0 {
                        debug!(connection = %name, "MESSAGE without listener");
                    }
                    Ok(())
                }
                Command::Connected => {
                    subscriptions.notify_listeners(frame);
                    Ok(())
                }
                Command::Error => {
                    subscriptions.notify_listeners(frame);
                    Err(StompError::frame(Command::Error.as_str(), error_message(frame)))
                }
                Command::Heartbeat | Command::Shutdown => {
                    trace!(connection = %name, command = %frame.command(), "keep-alive");
                    Ok(())
                }
                other => {
                    warn!(connection = %name, command = %other, "unexpected inbound frame");
                    Ok(())
                }
            }
        })
}

fn outbound_pipeline(
    name: &str,
    writer: Box<dyn ByteWrite>,
    acks: Arc<AcknowledgeService>,
    heartbeat_out: Arc<HeartbeatService>,
    errors: mpsc::UnboundedSender<StompError>,
) -> Pipeline<OutboxContext> {
    let log_name = name.to_string();
    let ack_name = name.to_string();
    let name = name.to_string();
    let writer = Mutex::new(writer);
    Pipeline::<OutboxContext>::new()
        .use_middleware(move |ctx, next| {
            trace!(connection = %log_name, command = %ctx.frame.command(), "frame sending");
            next.run(ctx)
        })
        .use_middleware(move |ctx, next| match ctx.frame.command() {
            Command::Ack | Command::Nack => {
                let ack_id = ctx.frame.get_header(ID).unwrap_or_default().to_string();
                let decision = acks.is_acknowledge_required(&ack_id);
                if !decision.required {
                    debug!(connection = %ack_name, ack = %ack_id, "acknowledgement suppressed");
                    return Ok(());
                }
                next.run(ctx)?;
                if let (Some(subscription), Some(timestamp)) =
                    (decision.subscription_id, decision.timestamp)
                {
                    acks.update(&subscription, timestamp);
                }
                Ok(())
            }
            _ => next.run(ctx),
        })
        .use_middleware(move |ctx, next| {
            next.run(ctx)?;
            heartbeat_out.update();
            Ok(())
        })
        .run(move |ctx| {
            let mut writer = writer
                .lock()
                .map_err(|_| StompError::Closed("writer lock poisoned".into()))?;
            match marshal_and_write(&mut **writer, &ctx.frame) {
                Ok(size) => {
                    debug!(connection = %name, command = %ctx.frame.command(), size, "frame written");
                    Ok(())
                }
                Err(StompError::Io(e)) => {
                    error!(connection = %name, error = %e, "write failed");
                    let _ = errors.send(StompError::Io(io::Error::new(e.kind(), e.to_string())));
                    Err(StompError::Io(e))
                }
                Err(e) => Err(e),
            }
        })
}
