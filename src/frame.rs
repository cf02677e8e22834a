use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::StompError;
use crate::headers::Headers;

pub const ACCEPT_VERSION: &str = "accept-version";
pub const ACK: &str = "ack";
pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_TYPE: &str = "content-type";
pub const DESTINATION: &str = "destination";
pub const HEART_BEAT: &str = "heart-beat";
pub const HOST: &str = "host";
pub const ID: &str = "id";
pub const LOGIN: &str = "login";
pub const MESSAGE: &str = "message";
pub const MESSAGE_ID: &str = "message-id";
pub const PASSCODE: &str = "passcode";
pub const RECEIPT: &str = "receipt";
pub const RECEIPT_ID: &str = "receipt-id";
pub const REPLY_TO: &str = "reply-to";
pub const SESSION: &str = "session";
pub const SUBSCRIPTION: &str = "subscription";
pub const TRANSACTION: &str = "transaction";
pub const VERSION: &str = "version";

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a process-unique identifier such as `rcpt-42`.
pub fn generate_id(prefix: &str) -> String {
    let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", prefix, n)
}

/// Which side of the connection a frame is travelling to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Sent by the broker, received by this client
    ClientBound,
    /// Sent by this client to the broker
    ServerBound,
}

/// The closed set of frame kinds the engine understands.
///
/// `Heartbeat` and `Shutdown` have no command line on the wire: a heartbeat
/// is a bare EOL (or a single NUL when sent by the client) and a shutdown is
/// the sentinel produced when the stream yields a lone NUL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Message,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Receipt,
    Error,
    Disconnect,
    Begin,
    Commit,
    Abort,
    Heartbeat,
    Shutdown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Heartbeat => "HEARTBEAT",
            Command::Shutdown => "SHUTDOWN",
        }
    }

    /// Map a command line read from the wire (case-insensitive). `STOMP` is
    /// accepted as an alias of `CONNECT`.
    pub fn from_wire(command: &str) -> Option<Command> {
        const WIRE: [Command; 14] = [
            Command::Connect,
            Command::Connected,
            Command::Send,
            Command::Message,
            Command::Subscribe,
            Command::Unsubscribe,
            Command::Ack,
            Command::Nack,
            Command::Receipt,
            Command::Error,
            Command::Disconnect,
            Command::Begin,
            Command::Commit,
            Command::Abort,
        ];
        if command.eq_ignore_ascii_case("STOMP") {
            return Some(Command::Connect);
        }
        WIRE.into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(command))
    }

    /// Outbox priority: lower values are written first.
    pub fn default_priority(&self) -> u8 {
        match self {
            Command::Heartbeat => 0,
            Command::Subscribe | Command::Unsubscribe | Command::Ack => 5,
            _ => 10,
        }
    }

    /// Direction a frame of this kind travels when built locally.
    pub fn default_direction(&self) -> Direction {
        match self {
            Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error
            | Command::Shutdown => Direction::ClientBound,
            _ => Direction::ServerBound,
        }
    }

    fn required_headers(&self) -> &'static [&'static str] {
        match self {
            Command::Connect => &[ACCEPT_VERSION, HOST],
            Command::Connected => &[VERSION, HEART_BEAT, SESSION],
            Command::Send => &[DESTINATION, CONTENT_TYPE],
            Command::Subscribe => &[ID, DESTINATION],
            Command::Unsubscribe | Command::Ack | Command::Nack => &[ID],
            Command::Begin | Command::Commit | Command::Abort => &[TRANSACTION],
            _ => &[],
        }
    }

    fn allows_transaction(&self) -> bool {
        matches!(self, Command::Begin | Command::Commit | Command::Abort)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription acknowledgement modes as defined by STOMP 1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }
}

impl FromStr for AckMode {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            _ => Err(StompError::Conversion {
                key: ACK.to_string(),
                value: s.to_string(),
                target: "AckMode",
            }),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A STOMP frame.
///
/// The command and direction are fixed at construction. Headers and body
/// stay mutable until the frame is handed to the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    direction: Direction,
    priority: u8,
    headers: Headers,
    body: Vec<u8>,
    received_at: Option<u64>,
}

impl Frame {
    /// Create an empty frame travelling in the command's default direction.
    pub fn new(command: Command) -> Self {
        Self::with_direction(command, command.default_direction())
    }

    pub(crate) fn with_direction(command: Command, direction: Direction) -> Self {
        Self {
            command,
            direction,
            priority: command.default_priority(),
            headers: Headers::new(),
            body: Vec::new(),
            received_at: None,
        }
    }

    /// Build a frame read from the wire. Received frames are always
    /// client-bound.
    pub(crate) fn received(command: Command, headers: Headers, body: Vec<u8>) -> Self {
        let mut frame = Self::with_direction(command, Direction::ClientBound);
        frame.headers = headers;
        frame.body = body;
        frame
    }

    /// CONNECT frame offering `accept_version` to virtual host `host` with
    /// the client heart-beat proposal `(cx, cy)` in milliseconds.
    pub fn connect(accept_version: &str, host: &str, heart_beat: (u64, u64)) -> Self {
        Frame::new(Command::Connect)
            .header(ACCEPT_VERSION, accept_version)
            .header(HOST, host)
            .header(HEART_BEAT, format!("{},{}", heart_beat.0, heart_beat.1))
    }

    pub fn connected(version: &str, session: &str, heart_beat: (u64, u64)) -> Self {
        Frame::new(Command::Connected)
            .header(VERSION, version)
            .header(SESSION, session)
            .header(HEART_BEAT, format!("{},{}", heart_beat.0, heart_beat.1))
    }

    /// SEND frame for `destination`. A `content-type` is still required
    /// before the frame validates, usually via [`Frame::set_text_body`].
    pub fn send(destination: &str) -> Self {
        Frame::new(Command::Send).header(DESTINATION, destination)
    }

    pub fn message(destination: &str, subscription: &str, message_id: &str) -> Self {
        Frame::new(Command::Message)
            .header(DESTINATION, destination)
            .header(SUBSCRIPTION, subscription)
            .header(MESSAGE_ID, message_id)
    }

    pub fn receipt(receipt_id: &str) -> Self {
        Frame::new(Command::Receipt).header(RECEIPT_ID, receipt_id)
    }

    pub fn error(message: &str) -> Self {
        Frame::new(Command::Error).header(MESSAGE, message)
    }

    /// SUBSCRIBE frame. A receipt is always requested.
    pub fn subscribe(id: &str, destination: &str, ack: AckMode) -> Self {
        Frame::new(Command::Subscribe)
            .header(ID, id)
            .header(DESTINATION, destination)
            .header(ACK, ack.as_str())
            .with_receipt()
    }

    /// UNSUBSCRIBE frame. A receipt is always requested.
    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header(ID, id).with_receipt()
    }

    /// ACK for the `ack` header value of a received MESSAGE.
    pub fn ack(ack_id: &str) -> Self {
        Frame::new(Command::Ack).header(ID, ack_id)
    }

    /// NACK for the `ack` header value of a received MESSAGE.
    pub fn nack(ack_id: &str) -> Self {
        Frame::new(Command::Nack).header(ID, ack_id)
    }

    /// DISCONNECT frame. A receipt is always requested.
    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect).with_receipt()
    }

    pub fn begin(transaction: &str) -> Self {
        Frame::new(Command::Begin).header(TRANSACTION, transaction)
    }

    pub fn commit(transaction: &str) -> Self {
        Frame::new(Command::Commit).header(TRANSACTION, transaction)
    }

    pub fn abort(transaction: &str) -> Self {
        Frame::new(Command::Abort).header(TRANSACTION, transaction)
    }

    /// Heartbeat frame. Client heartbeats are server-bound, heartbeats
    /// read from the wire are client-bound.
    pub fn heartbeat(direction: Direction) -> Self {
        Frame::with_direction(Command::Heartbeat, direction)
    }

    /// Sentinel produced when the stream delivers a lone NUL.
    pub fn shutdown() -> Self {
        Frame::new(Command::Shutdown)
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Override the outbox priority (builder style).
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    /// Add a header (builder style). Repeating a key keeps the older
    /// value behind the new one.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    pub fn remove_header(&mut self, key: &str) -> bool {
        self.headers.remove(key)
    }

    /// Most recently set value of `key`.
    pub fn get_header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Every value ever set for `key`, comma-joined, newest first.
    pub fn joined_header(&self, key: &str) -> Option<String> {
        self.headers.joined(key)
    }

    /// Typed header access.
    ///
    /// Returns `MissingHeader` when the key is absent and `Conversion` when
    /// the value does not parse as `T`.
    pub fn get_header_as<T: FromStr>(&self, key: &str) -> Result<T, StompError> {
        let value = self
            .get_header(key)
            .ok_or_else(|| StompError::MissingHeader(key.to_string()))?;
        value.trim().parse::<T>().map_err(|_| StompError::Conversion {
            key: key.to_string(),
            value: value.to_string(),
            target: std::any::type_name::<T>(),
        })
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8 text, if it is valid UTF-8.
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Replace the body. `content-length` is computed when the frame is
    /// marshalled, so a frame that already carries one is rejected.
    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) -> Result<(), StompError> {
        if self.headers.contains(CONTENT_LENGTH) {
            return Err(StompError::Validation(vec![
                "header 'content-length' is computed when marshalling and must not be set"
                    .to_string(),
            ]));
        }
        self.body = body.into();
        Ok(())
    }

    /// Set a text body together with its `content-type`.
    pub fn set_text_body(&mut self, text: &str, content_type: &str) -> Result<(), StompError> {
        self.set_body(text.as_bytes().to_vec())?;
        self.headers.set(CONTENT_TYPE, content_type);
        Ok(())
    }

    /// Tick at which the inbox read this frame.
    pub fn received_at(&self) -> Option<u64> {
        self.received_at
    }

    pub fn mark_received(&mut self, ticks: u64) {
        self.received_at = Some(ticks);
    }

    pub fn receipt_id(&self) -> Option<&str> {
        self.get_header(RECEIPT)
    }

    /// Request a receipt under a generated id unless one is already set.
    pub fn with_receipt(mut self) -> Self {
        if !self.headers.contains(RECEIPT) {
            self.headers.set(RECEIPT, generate_id("rcpt"));
        }
        self
    }

    pub fn destination(&self) -> Option<&str> {
        self.get_header(DESTINATION)
    }

    pub fn set_destination(&mut self, destination: &str) {
        self.headers.set(DESTINATION, destination);
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.get_header(REPLY_TO)
    }

    pub fn set_reply_to(&mut self, reply_to: &str) {
        self.headers.set(REPLY_TO, reply_to);
    }

    /// Check the structural rules for this frame's command.
    ///
    /// Every failure is reported in one `StompError::Validation`.
    pub fn validate(&self) -> Result<(), StompError> {
        let mut failures = Vec::new();
        for key in self.command.required_headers() {
            if !self.headers.contains(key) {
                failures.push(format!("{} frame requires header '{}'", self.command, key));
            }
        }
        if !self.command.allows_transaction() && self.headers.contains(TRANSACTION) {
            failures.push(format!(
                "header '{}' is reserved and not supported on {}",
                TRANSACTION, self.command
            ));
        }
        if self.direction == Direction::ServerBound && self.headers.contains(CONTENT_LENGTH) {
            failures.push(format!(
                "header '{}' is computed when marshalling and must not be set",
                CONTENT_LENGTH
            ));
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(StompError::Validation(failures))
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command: {}", self.command)?;
        write!(f, "{}", self.headers)?;
        writeln!(f, "Body ({} bytes)", self.body.len())
    }
}
