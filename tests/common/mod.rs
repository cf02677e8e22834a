//! In-memory broker used by the end-to-end tests.
//!
//! The client side gets a [`Transport`] whose writer parses every frame with
//! the crate's own unmarshaller and whose reader is fed from a channel. A
//! responder task answers CONNECT, receipts and requests the way a broker
//! would.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::time::Duration;

use stomp_duplex::transport::{ReadFn, WriteFn};
use stomp_duplex::{Command, Direction, Frame, Transport, marshal, unmarshal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct BrokerConfig {
    /// `heart-beat` header sent in CONNECTED
    pub heart_beat: (u64, u64),
    /// Answer every `receipt` header with a RECEIPT
    pub receipts: bool,
    /// Answer CONNECT with an ERROR carrying this message
    pub reject_connect: Option<String>,
    /// Echo a SEND carrying `reply-to` back as a MESSAGE on that reply id
    pub echo_requests: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heart_beat: (0, 0),
            receipts: true,
            reject_connect: None,
            echo_requests: true,
        }
    }
}

pub struct Broker {
    to_client: std_mpsc::Sender<Vec<u8>>,
    frames: mpsc::UnboundedReceiver<Frame>,
    heartbeats: Arc<AtomicUsize>,
    receipts: Arc<AtomicBool>,
}

impl Broker {
    /// Push `frame` to the client.
    pub fn deliver(&self, frame: &Frame) {
        let bytes = marshal(frame).expect("broker frame marshals");
        self.to_client.send(bytes.to_vec()).expect("client reader alive");
    }

    pub fn deliver_raw(&self, bytes: &[u8]) {
        self.to_client.send(bytes.to_vec()).expect("client reader alive");
    }

    pub fn set_receipts(&self, enabled: bool) {
        self.receipts.store(enabled, Ordering::SeqCst);
    }

    /// Client heartbeats seen so far.
    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Next non-heartbeat frame written by the client.
    pub async fn next(&mut self) -> Frame {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("client wrote a frame in time")
            .expect("broker channel open")
    }

    /// Skip frames until one with `command` arrives.
    pub async fn expect(&mut self, command: Command) -> Frame {
        loop {
            let frame = self.next().await;
            if frame.command() == command {
                return frame;
            }
        }
    }

    /// Assert nothing but heartbeats was written within `quiet`.
    pub async fn assert_silent(&mut self, quiet: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(quiet, self.frames.recv()).await {
            panic!("unexpected frame from client:\n{}", frame);
        }
    }
}

/// Build a connected transport/broker pair and start the responder task.
pub fn start(config: BrokerConfig) -> (Transport, Broker) {
    let (to_client, client_rx) = std_mpsc::channel::<Vec<u8>>();
    let (written_tx, mut written_rx) = mpsc::unbounded_channel::<Frame>();
    let (frames_tx, frames) = mpsc::unbounded_channel::<Frame>();
    let heartbeats = Arc::new(AtomicUsize::new(0));
    let receipts = Arc::new(AtomicBool::new(config.receipts));

    let mut pending: VecDeque<u8> = VecDeque::new();
    let reader = ReadFn(move |cancel: &CancellationToken| loop {
        if let Some(byte) = pending.pop_front() {
            return Ok(byte);
        }
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "read cancelled"));
        }
        match client_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(chunk) => pending.extend(chunk),
            Err(std_mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "broker gone"));
            }
        }
    });

    let writer = WriteFn(move |bytes: &[u8]| -> io::Result<()> {
        let frame = if bytes == [0u8] {
            Frame::heartbeat(Direction::ServerBound)
        } else {
            let mut input = bytes;
            unmarshal(&mut input, &CancellationToken::new())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        };
        written_tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "broker gone"))
    });

    let responder_out = to_client.clone();
    let counter = Arc::clone(&heartbeats);
    let receipts_on = Arc::clone(&receipts);
    tokio::spawn(async move {
        let send = |frame: Frame| {
            if let Ok(bytes) = marshal(&frame) {
                let _ = responder_out.send(bytes.to_vec());
            }
        };
        while let Some(frame) = written_rx.recv().await {
            if frame.is_heartbeat() {
                counter.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            match frame.command() {
                Command::Connect => match &config.reject_connect {
                    Some(message) => send(Frame::error(message)),
                    None => send(Frame::connected("1.2", "session-1", config.heart_beat)),
                },
                Command::Send if config.echo_requests => {
                    if let Some(reply_to) = frame.reply_to() {
                        let mut reply = Frame::message(reply_to, reply_to, "reply-1");
                        if let Some(text) = frame.body_text() {
                            reply.set_text_body(text, "text/plain").ok();
                        }
                        send(reply);
                    }
                }
                _ => {}
            }
            if receipts_on.load(Ordering::SeqCst) {
                if let Some(id) = frame.receipt_id() {
                    send(Frame::receipt(id));
                }
            }
            if frames_tx.send(frame).is_err() {
                break;
            }
        }
    });

    let transport = Transport::new(reader, writer);
    let broker = Broker {
        to_client,
        frames,
        heartbeats,
        receipts,
    };
    (transport, broker)
}

/// MESSAGE for subscription `subscription`, optionally carrying an `ack` id.
pub fn message(subscription: &str, message_id: &str, ack: Option<&str>, body: &str) -> Frame {
    let mut frame = Frame::message("/queue/test", subscription, message_id);
    if let Some(ack) = ack {
        frame.set_header("ack", ack);
    }
    frame.set_text_body(body, "text/plain").expect("fresh frame has no content-length");
    frame
}
