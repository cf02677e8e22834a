pub mod acknowledge;
pub mod client;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod headers;
pub mod heartbeat;
pub mod inbox;
pub mod options;
pub mod outbox;
pub mod parser;
pub mod pipeline;
pub mod receipt;
pub mod strategy;
pub mod subscription;
pub mod timer;
pub mod transport;

pub use client::{Client, Disposition, MessageHandler, Outcome, message_handler};
pub use codec::{encode_header, marshal};
pub use connection::{
    Connection, ConnectionState, Session, negotiate_heartbeats, parse_heartbeat_header,
};
pub use error::StompError;
pub use frame::{AckMode, Command, Direction, Frame};
pub use options::{ClientSettings, StompOptions};
pub use parser::{decode_header, unmarshal};
pub use strategy::{GenericStrategy, RabbitMqStrategy, ServerStrategy};
pub use transport::{ByteRead, ByteWrite, Transport};
