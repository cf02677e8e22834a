use thiserror::Error;

/// Errors produced by the STOMP engine.
///
/// Validation and conversion failures are local to the call that produced
/// them. Protocol, I/O and heartbeat failures are reported on the error
/// channel returned by [`crate::client::Client::start`] and normally end the
/// connection (see [`StompError::is_fatal`]).
#[derive(Error, Debug)]
pub enum StompError {
    /// A frame is missing mandatory headers or uses a reserved one. All
    /// failures found during validation are collected.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// Malformed bytes on the wire (bad escape, unknown command, bad EOL)
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A frame that is invalid for its context, including broker ERROR frames
    #[error("frame error ({frame}): {message}")]
    Frame { frame: String, message: String },
    /// A receipt or reply was not observed in time
    #[error("timeout: {0}")]
    Timeout(String),
    /// The broker stopped sending frames and heartbeats
    #[error("heartbeat missing: no frame received from the server within the negotiated interval")]
    HeartbeatMissing,
    /// I/O-level error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// A header could not be converted to the requested type
    #[error("header '{key}' value '{value}' cannot be converted to {target}")]
    Conversion {
        key: String,
        value: String,
        target: &'static str,
    },
    /// A header required by the caller is absent
    #[error("missing header '{0}'")]
    MissingHeader(String),
    /// The agent or connection is gone
    #[error("closed: {0}")]
    Closed(String),
    /// No tokio runtime is available
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl StompError {
    pub(crate) fn frame(frame: impl Into<String>, message: impl Into<String>) -> Self {
        StompError::Frame {
            frame: frame.into(),
            message: message.into(),
        }
    }

    /// Whether the error requires the connection to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StompError::Io(_) | StompError::Protocol(_) | StompError::HeartbeatMissing
        )
    }
}
