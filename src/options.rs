use std::sync::Arc;
use std::time::Duration;

use crate::strategy::{GenericStrategy, ServerStrategy};

pub const DEFAULT_PORT: u16 = 61613;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(1000);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Options for [`crate::connection::Connection::open`].
///
/// Builder methods consume and return `self`:
///
/// ```ignore
/// let options = StompOptions::new("localhost")
///     .login("guest")
///     .passcode("guest")
///     .heartbeat(10_000, 10_000);
/// ```
#[derive(Debug, Clone)]
pub struct StompOptions {
    pub host: String,
    pub port: u16,
    /// Sent as the CONNECT `host` header
    pub virtual_host: String,
    pub login: Option<String>,
    pub passcode: Option<String>,
    /// How often the client offers to send heartbeats (cx), in ms
    pub outgoing_heartbeat_ms: u64,
    /// How often the client wants to receive heartbeats (cy), in ms
    pub incoming_heartbeat_ms: u64,
    /// Default deadline for send, request, subscribe and ack
    pub operation_timeout: Duration,
    pub connect_timeout: Duration,
    /// Socket read timeout; bounds how long a blocked read takes to notice
    /// cancellation
    pub read_poll_interval: Duration,
    pub strategy: Arc<dyn ServerStrategy>,
}

impl Default for StompOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            virtual_host: "/".to_string(),
            login: None,
            passcode: None,
            outgoing_heartbeat_ms: 0,
            incoming_heartbeat_ms: 0,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_poll_interval: DEFAULT_READ_POLL_INTERVAL,
            strategy: Arc::new(GenericStrategy),
        }
    }
}

impl StompOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn virtual_host(mut self, virtual_host: impl Into<String>) -> Self {
        self.virtual_host = virtual_host.into();
        self
    }

    pub fn login(mut self, login: impl Into<String>) -> Self {
        self.login = Some(login.into());
        self
    }

    pub fn passcode(mut self, passcode: impl Into<String>) -> Self {
        self.passcode = Some(passcode.into());
        self
    }

    /// Client heart-beat proposal `(cx, cy)` in milliseconds.
    pub fn heartbeat(mut self, outgoing_ms: u64, incoming_ms: u64) -> Self {
        self.outgoing_heartbeat_ms = outgoing_ms;
        self.incoming_heartbeat_ms = incoming_ms;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn strategy(mut self, strategy: impl ServerStrategy + 'static) -> Self {
        self.strategy = Arc::new(strategy);
        self
    }

    /// The subset of options the protocol client needs.
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            operation_timeout: self.operation_timeout,
            strategy: Arc::clone(&self.strategy),
        }
    }
}

/// Settings for [`crate::client::Client`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub operation_timeout: Duration,
    pub strategy: Arc<dyn ServerStrategy>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            strategy: Arc::new(GenericStrategy),
        }
    }
}
