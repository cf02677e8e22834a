use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::{Client, MessageHandler, Outcome};
use crate::error::StompError;
use crate::frame::{AckMode, Frame, HEART_BEAT, LOGIN, PASSCODE, SESSION};
use crate::options::StompOptions;
use crate::strategy::ValidationContext;
use crate::transport::Transport;

/// Protocol version offered in CONNECT.
pub const STOMP_VERSION: &str = "1.2";

/// Grace added to the negotiated incoming interval before a missing server
/// heartbeat is reported.
pub const INCOMING_GRACE: Duration = Duration::from_millis(500);

/// Split a `heart-beat` value of the form `cx,cy` into its two intervals in
/// milliseconds.
///
/// Whitespace around either number is ignored; anything else fails with
/// `StompError::Protocol`.
pub fn parse_heartbeat_header(value: &str) -> Result<(u64, u64), StompError> {
    let malformed = || StompError::Protocol(format!("malformed heart-beat header '{}'", value));
    let (send, receive) = value.split_once(',').ok_or_else(malformed)?;
    let interval = |field: &str| field.trim().parse::<u64>().map_err(|_| malformed());
    Ok((interval(send)?, interval(receive)?))
}

/// Negotiate heartbeat intervals between client and server.
///
/// Parameters
/// - `client_out`: how often the client can send heartbeats (cx).
/// - `client_in`: how often the client wants to receive them (cy).
/// - `server_out`: how often the server can send heartbeats (sx).
/// - `server_in`: how often the server wants to receive them (sy).
///
/// Returns `(outgoing, incoming)`. A direction is enabled only when both
/// sides offer a non-zero value; the interval is then the larger of the two.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Timer periods in milliseconds for the negotiated intervals; `0` disables
/// a monitor.
///
/// The outgoing timer runs at half the interval (rounded up) and the
/// incoming one allows [`INCOMING_GRACE`].
pub fn heartbeat_periods(outgoing: Option<Duration>, incoming: Option<Duration>) -> (i64, i64) {
    let millis = |d: Duration| i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
    let out = outgoing.map(|d| {
        let x = millis(d);
        x - x / 2
    });
    let inc = incoming.map(|d| millis(d).saturating_add(millis(INCOMING_GRACE)));
    (out.unwrap_or(0), inc.unwrap_or(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, CONNECTED not yet received
    Pending,
    Established,
    Closed,
}

/// A STOMP connection: transport, protocol client and the handshake state.
///
/// Dropping the last handle closes the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    name: String,
    options: StompOptions,
    client: Client,
    state: Mutex<ConnectionState>,
    closer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    connected: OnceLock<Frame>,
}

impl Connection {
    /// Connect over TCP to `options.host:options.port` and perform the
    /// STOMP handshake.
    pub async fn open(options: StompOptions) -> Result<Connection, StompError> {
        let transport = Transport::connect_tcp(
            &options.host,
            options.port,
            options.connect_timeout,
            options.read_poll_interval,
        )
        .await?;
        Self::with_transport(transport, options).await
    }

    /// Perform the handshake over an already open transport.
    pub async fn with_transport(
        transport: Transport,
        options: StompOptions,
    ) -> Result<Connection, StompError> {
        let name = format!("{}:{}", options.host, options.port);
        let Transport {
            reader,
            writer,
            closer,
        } = transport;
        let (client, errors) = match Client::start(&name, reader, writer, options.client_settings()) {
            Ok(started) => started,
            Err(e) => {
                if let Some(close) = closer {
                    close();
                }
                return Err(e);
            }
        };

        let inner = Arc::new(ConnectionInner {
            name,
            options,
            client,
            state: Mutex::new(ConnectionState::Pending),
            closer: Mutex::new(closer),
            connected: OnceLock::new(),
        });
        tokio::spawn(watch_errors(Arc::downgrade(&inner), errors));

        match inner.handshake().await {
            Ok(()) => Ok(Connection { inner }),
            Err(e) => {
                error!(connection = %inner.name, error = %e, "handshake failed");
                shutdown_blocking(inner).await;
                Err(e)
            }
        }
    }

    /// A session handle over this connection.
    pub fn session(&self) -> Session {
        Session {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// The CONNECTED frame received during the handshake.
    pub fn connected_frame(&self) -> Option<&Frame> {
        self.inner.connected.get()
    }

    /// Tear down without sending DISCONNECT. Idempotent; blocks while the
    /// agent threads are joined.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Closed)
    }

    async fn handshake(&self) -> Result<(), StompError> {
        let options = &self.options;
        let mut connect = Frame::connect(
            STOMP_VERSION,
            &options.virtual_host,
            (options.outgoing_heartbeat_ms, options.incoming_heartbeat_ms),
        );
        if let Some(login) = &options.login {
            connect.set_header(LOGIN, login.as_str());
        }
        if let Some(passcode) = &options.passcode {
            connect.set_header(PASSCODE, passcode.as_str());
        }

        let connected = self.client.connect(connect, options.connect_timeout).await?;
        let (server_out, server_in) = match connected.get_header(HEART_BEAT) {
            None => (0, 0),
            Some(value) => parse_heartbeat_header(value).unwrap_or_else(|e| {
                warn!(connection = %self.name, error = %e, "server heart-beats ignored");
                (0, 0)
            }),
        };
        let (outgoing, incoming) = negotiate_heartbeats(
            options.outgoing_heartbeat_ms,
            options.incoming_heartbeat_ms,
            server_out,
            server_in,
        );
        let (out_ms, in_ms) = heartbeat_periods(outgoing, incoming);
        self.client.start_heartbeats(out_ms, in_ms);
        info!(
            connection = %self.name,
            session = connected.get_header(SESSION).unwrap_or_default(),
            ?outgoing,
            ?incoming,
            "session established"
        );

        let _ = self.connected.set(connected);
        let mut state = self
            .state
            .lock()
            .map_err(|_| StompError::Closed("connection state poisoned".into()))?;
        if *state == ConnectionState::Closed {
            return Err(StompError::Closed(format!(
                "connection {} closed during handshake",
                self.name
            )));
        }
        *state = ConnectionState::Established;
        Ok(())
    }

    /// Dispose the client, then close the transport. Runs once.
    fn shutdown(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Closed;
        info!(connection = %self.name, "closing connection");
        self.client.dispose();
        let closer = self.closer.lock().ok().and_then(|mut c| c.take());
        if let Some(close) = closer {
            close();
        }
        info!(connection = %self.name, "connection closed");
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn shutdown_blocking(inner: Arc<ConnectionInner>) {
    if let Err(e) = tokio::task::spawn_blocking(move || inner.shutdown()).await {
        error!(error = %e, "shutdown task failed");
    }
}

/// Log every reported error; tear the connection down on fatal ones.
async fn watch_errors(connection: Weak<ConnectionInner>, mut errors: mpsc::UnboundedReceiver<StompError>) {
    while let Some(err) = errors.recv().await {
        let Some(inner) = connection.upgrade() else {
            break;
        };
        if inner.state() == ConnectionState::Closed {
            debug!(connection = %inner.name, error = %err, "error after close");
            break;
        }
        if err.is_fatal() {
            error!(connection = %inner.name, error = %err, "fatal error, closing connection");
            shutdown_blocking(inner).await;
            break;
        }
        warn!(connection = %inner.name, error = %err, "connection error");
    }
}

/// Application-facing handle to an established connection.
///
/// Clones share the connection. Sends and requests are checked against the
/// configured server strategy before they are queued.
#[derive(Clone)]
pub struct Session {
    inner: Arc<ConnectionInner>,
}

impl Session {
    fn client(&self) -> &Client {
        &self.inner.client
    }

    fn ensure_open(&self) -> Result<(), StompError> {
        match self.inner.state() {
            ConnectionState::Closed => Err(StompError::Closed(format!(
                "connection {} is closed",
                self.inner.name
            ))),
            _ => Ok(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Session id the broker assigned in CONNECTED, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.inner.connected.get().and_then(|f| f.get_header(SESSION))
    }

    /// Send `frame`, waiting for its receipt when it carries one.
    pub async fn send(&self, frame: Frame, timeout: Option<Duration>) -> Result<(), StompError> {
        self.ensure_open()?;
        self.inner
            .options
            .strategy
            .validate(&ValidationContext::send(&frame))?;
        self.client().send(frame, timeout).await
    }

    /// Send a request and wait for the reply MESSAGE.
    pub async fn request(&self, frame: Frame, timeout: Option<Duration>) -> Result<Frame, StompError> {
        self.ensure_open()?;
        self.inner
            .options
            .strategy
            .validate(&ValidationContext::request(&frame))?;
        self.client().request(frame, timeout).await
    }

    /// Subscribe `id` to `destination`.
    ///
    /// `handler` receives each MESSAGE together with a session handle and
    /// returns anything convertible into an [`Outcome`]. A returned frame is
    /// sent to the message's `reply-to`. Unless `ack_mode` is `auto`, the
    /// outcome's [`Disposition`](crate::Disposition) picks ACK, NACK or
    /// leaves the acknowledgement to [`Session::ack`]; a failure is
    /// answered with NACK.
    pub async fn subscribe<F, Fut, O>(
        &self,
        id: &str,
        destination: &str,
        ack_mode: AckMode,
        handler: F,
    ) -> Result<(), StompError>
    where
        F: Fn(Frame, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StompError>> + Send + 'static,
        O: Into<Outcome>,
    {
        self.ensure_open()?;
        let connection = Arc::downgrade(&self.inner);
        let handler: MessageHandler = Arc::new(move |frame: Frame| match connection.upgrade() {
            Some(inner) => handler(frame, Session { inner })
                .map(|result| result.map(Into::into))
                .boxed(),
            None => future::ready(Err(StompError::Closed("connection dropped".into()))).boxed(),
        });
        self.client()
            .subscribe(id, destination, ack_mode, handler)
            .await
    }

    /// Returns `false` when `id` was not subscribed.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool, StompError> {
        self.ensure_open()?;
        self.client().unsubscribe(id).await
    }

    pub async fn ack(&self, ack_id: &str) -> Result<(), StompError> {
        self.ensure_open()?;
        self.client().ack(ack_id).await
    }

    pub async fn nack(&self, ack_id: &str) -> Result<(), StompError> {
        self.ensure_open()?;
        self.client().nack(ack_id).await
    }

    pub async fn begin(&self, transaction: &str) -> Result<(), StompError> {
        self.ensure_open()?;
        self.client().send(Frame::begin(transaction), None).await
    }

    pub async fn commit(&self, transaction: &str) -> Result<(), StompError> {
        self.ensure_open()?;
        self.client().send(Frame::commit(transaction), None).await
    }

    pub async fn abort(&self, transaction: &str) -> Result<(), StompError> {
        self.ensure_open()?;
        self.client().send(Frame::abort(transaction), None).await
    }

    /// Send DISCONNECT, wait for its receipt and tear the connection down.
    ///
    /// The connection is closed even when the broker does not confirm the
    /// DISCONNECT in time; that failure is still returned.
    pub async fn close(&self) -> Result<(), StompError> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self.client().send(Frame::disconnect(), None).await;
        if let Err(e) = &result {
            warn!(connection = %self.inner.name, error = %e, "DISCONNECT not confirmed");
        }
        shutdown_blocking(Arc::clone(&self.inner)).await;
        result
    }
}
