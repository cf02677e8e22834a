//! Broker-specific policies consulted by the session before frames reach the
//! engine.

use std::fmt;

use crate::error::StompError;
use crate::frame::{Frame, REPLY_TO};

/// Prefix RabbitMQ requires for reply destinations.
pub const TEMP_QUEUE_PREFIX: &str = "/temp-queue/";

/// A frame about to be sent, and whether it is a request expecting a reply.
#[derive(Debug, Clone, Copy)]
pub struct ValidationContext<'a> {
    pub frame: &'a Frame,
    pub is_request: bool,
}

impl<'a> ValidationContext<'a> {
    pub fn send(frame: &'a Frame) -> Self {
        Self {
            frame,
            is_request: false,
        }
    }

    pub fn request(frame: &'a Frame) -> Self {
        Self {
            frame,
            is_request: true,
        }
    }
}

/// Server-specific validation and reply correlation.
pub trait ServerStrategy: Send + Sync + fmt::Debug {
    /// Reject frames the broker would mishandle.
    fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), StompError>;

    /// Subscription id under which the reply to `frame` will arrive.
    fn reply_header(&self, frame: &Frame) -> Result<String, StompError> {
        frame
            .reply_to()
            .map(str::to_string)
            .ok_or_else(|| StompError::MissingHeader(REPLY_TO.to_string()))
    }
}

/// No broker-specific rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericStrategy;

impl ServerStrategy for GenericStrategy {
    fn validate(&self, _ctx: &ValidationContext<'_>) -> Result<(), StompError> {
        Ok(())
    }
}

/// RabbitMQ rules: replies travel over temporary queues only.
///
/// - a request must carry `reply-to` starting with `/temp-queue/`;
/// - a plain send must not carry `reply-to` at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct RabbitMqStrategy;

impl RabbitMqStrategy {
    /// Reply destination for temporary queue `name`.
    pub fn temp_queue(name: &str) -> String {
        format!("{}{}", TEMP_QUEUE_PREFIX, name)
    }
}

impl ServerStrategy for RabbitMqStrategy {
    fn validate(&self, ctx: &ValidationContext<'_>) -> Result<(), StompError> {
        match (ctx.is_request, ctx.frame.reply_to()) {
            (true, None) => Err(StompError::Validation(vec![
                "a request to RabbitMQ requires a 'reply-to' header".to_string(),
            ])),
            (true, Some(reply_to)) if !reply_to.starts_with(TEMP_QUEUE_PREFIX) => {
                Err(StompError::Validation(vec![format!(
                    "'reply-to' must target a temp queue ({}...) on RabbitMQ, got '{}'",
                    TEMP_QUEUE_PREFIX, reply_to
                )]))
            }
            (false, Some(_)) => Err(StompError::Validation(vec![
                "a plain SEND to RabbitMQ must not carry a 'reply-to' header".to_string(),
            ])),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_accepts_everything() {
        let mut frame = Frame::send("/q");
        frame.set_reply_to("/queue/anything");
        assert!(GenericStrategy.validate(&ValidationContext::send(&frame)).is_ok());
        assert!(GenericStrategy.validate(&ValidationContext::request(&frame)).is_ok());
    }

    #[test]
    fn reply_header_requires_reply_to() {
        let frame = Frame::send("/q");
        assert!(matches!(
            RabbitMqStrategy.reply_header(&frame),
            Err(StompError::MissingHeader(_))
        ));
        let frame = Frame::send("/q").header(REPLY_TO, "/queue/foo");
        assert_eq!(RabbitMqStrategy.reply_header(&frame).unwrap(), "/queue/foo");
    }
}
