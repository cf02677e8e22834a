//! End-to-end tests of the protocol client against the in-memory broker.

mod common;

use std::time::Duration;

use common::{Broker, BrokerConfig, WAIT, message};
use stomp_duplex::frame::{DESTINATION, ID, REPLY_TO, SUBSCRIPTION};
use stomp_duplex::{
    AckMode, Client, ClientSettings, Command, Disposition, Frame, MessageHandler, StompError,
    message_handler,
};
use tokio::sync::mpsc;

async fn connected_client(config: BrokerConfig) -> (Client, mpsc::UnboundedReceiver<StompError>, Broker) {
    let (transport, mut broker) = common::start(config);
    let (client, errors) = Client::start(
        "e2e",
        transport.reader,
        transport.writer,
        ClientSettings::default(),
    )
    .expect("client starts inside a runtime");
    let connected = client
        .connect(Frame::connect("1.2", "/", (0, 0)), WAIT)
        .await
        .expect("handshake");
    assert_eq!(connected.command(), Command::Connected);
    broker.expect(Command::Connect).await;
    (client, errors, broker)
}

fn ignore_messages() -> MessageHandler {
    message_handler(|_: Frame| async { Ok::<Option<Frame>, StompError>(None) })
}

/// Handler that forwards every message and fails the ones whose body is
/// "fail".
fn forwarding(tx: mpsc::UnboundedSender<Frame>) -> MessageHandler {
    message_handler(move |frame: Frame| {
        let tx = tx.clone();
        async move {
            let fail = frame.body_text() == Some("fail");
            let slow = frame.body_text() == Some("slow");
            let _ = tx.send(frame);
            if slow {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if fail {
                Err(StompError::Validation(vec!["rejected by handler".into()]))
            } else {
                Ok::<Option<Frame>, StompError>(None)
            }
        }
    })
}

fn text(destination: &str, body: &str) -> Frame {
    let mut frame = Frame::send(destination);
    frame.set_text_body(body, "text/plain").unwrap();
    frame
}

// ============================================================================
// Receipts
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn receipted_sends_leave_nothing_pending() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;

    client
        .subscribe("sub-1", "/queue/test", AckMode::Auto, ignore_messages())
        .await
        .unwrap();
    let subscribe = broker.expect(Command::Subscribe).await;
    assert_eq!(subscribe.get_header(ID), Some("sub-1"));
    assert_eq!(subscribe.get_header("ack"), Some("auto"));

    for i in 0..10 {
        let frame = text("/queue/test", &format!("message {}", i)).with_receipt();
        client.send(frame, Some(WAIT)).await.unwrap();
    }
    assert_eq!(client.pending_receipts(), 0);

    for i in 0..10 {
        let frame = broker.expect(Command::Send).await;
        assert_eq!(frame.body_text(), Some(format!("message {}", i).as_str()));
        assert!(frame.receipt_id().is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_receipt_times_out_and_is_released() {
    let (client, _errors, broker) = connected_client(BrokerConfig::default()).await;
    broker.set_receipts(false);

    let frame = text("/queue/test", "lost").with_receipt();
    let err = client
        .send(frame, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::Timeout(_)), "got {:?}", err);
    assert_eq!(client.pending_receipts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_without_receipt_completes_once_written() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    client.send(text("/queue/test", "plain"), None).await.unwrap();
    let frame = broker.expect(Command::Send).await;
    assert_eq!(frame.receipt_id(), None);
    assert_eq!(frame.get_header(DESTINATION), Some("/queue/test"));
}

// ============================================================================
// Subscriptions and acknowledgements
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn auto_subscription_delivers_without_acknowledging() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe("sub-1", "/queue/test", AckMode::Auto, forwarding(tx))
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    broker.deliver(&message("sub-1", "m-1", Some("a-1"), "hello"));
    let received = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(received.body_text(), Some("hello"));
    assert_eq!(received.get_header(SUBSCRIPTION), Some("sub-1"));
    assert!(received.received_at().is_some());

    broker.assert_silent(Duration::from_millis(300)).await;
    assert_eq!(client.pending_acknowledgements(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_individual_acks_success_and_nacks_failure() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    client
        .subscribe("sub-2", "/queue/test", AckMode::ClientIndividual, forwarding(tx))
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    broker.deliver(&message("sub-2", "m-1", Some("a-1"), "ok"));
    let ack = broker.next().await;
    assert_eq!(ack.command(), Command::Ack);
    assert_eq!(ack.get_header(ID), Some("a-1"));

    broker.deliver(&message("sub-2", "m-2", Some("a-2"), "fail"));
    let nack = broker.next().await;
    assert_eq!(nack.command(), Command::Nack);
    assert_eq!(nack.get_header(ID), Some("a-2"));
    assert_eq!(client.pending_acknowledgements(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_mode_suppresses_acks_older_than_the_last_one() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    client
        .subscribe("sub-3", "/queue/test", AckMode::Client, forwarding(tx))
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    // the older message finishes last; its ACK is covered by the newer one
    broker.deliver(&message("sub-3", "m-3", Some("a-3"), "slow"));
    broker.deliver(&message("sub-3", "m-4", Some("a-4"), "fast"));

    let ack = broker.next().await;
    assert_eq!(ack.command(), Command::Ack);
    assert_eq!(ack.get_header(ID), Some("a-4"));
    broker.assert_silent(Duration::from_millis(600)).await;
    assert_eq!(client.pending_acknowledgements(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_individual_acks_every_message_regardless_of_order() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let (tx, _rx) = mpsc::unbounded_channel();
    client
        .subscribe("sub-4", "/queue/test", AckMode::ClientIndividual, forwarding(tx))
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    broker.deliver(&message("sub-4", "m-5", Some("a-5"), "slow"));
    broker.deliver(&message("sub-4", "m-6", Some("a-6"), "fast"));

    let first = broker.expect(Command::Ack).await;
    let second = broker.expect(Command::Ack).await;
    assert_eq!(first.get_header(ID), Some("a-6"));
    assert_eq!(second.get_header(ID), Some("a-5"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redundant_manual_ack_never_reaches_the_wire() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    client.ack("never-delivered").await.unwrap();
    client.nack("never-delivered").await.unwrap();
    broker.assert_silent(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_disposition_leaves_acknowledgement_to_the_caller() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = message_handler(move |frame: Frame| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(frame);
            Ok::<Disposition, StompError>(Disposition::Manual)
        }
    });
    client
        .subscribe("batch", "/queue/batch", AckMode::Client, handler)
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    for (message_id, ack) in [("m-1", "a-1"), ("m-2", "a-2"), ("m-3", "a-3")] {
        broker.deliver(&message("batch", message_id, Some(ack), "item"));
    }
    for _ in 0..3 {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    }
    broker.assert_silent(Duration::from_millis(300)).await;
    assert_eq!(client.pending_acknowledgements(), 3);

    // one ACK for the newest message covers the whole batch
    client.ack("a-3").await.unwrap();
    let ack = broker.expect(Command::Ack).await;
    assert_eq!(ack.get_header(ID), Some("a-3"));

    client.ack("a-1").await.unwrap();
    broker.assert_silent(Duration::from_millis(200)).await;
    assert_eq!(client.pending_acknowledgements(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_reply_is_sent_to_reply_to() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let handler = message_handler(|frame: Frame| async move {
        let body = format!("re: {}", frame.body_text().unwrap_or_default());
        Ok::<Option<Frame>, StompError>(Some(text("/placeholder", &body)))
    });
    client
        .subscribe("sub-5", "/queue/test", AckMode::Auto, handler)
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    let mut request = message("sub-5", "m-7", None, "ping");
    request.set_header(REPLY_TO, "/queue/replies");
    broker.deliver(&request);

    let reply = broker.expect(Command::Send).await;
    assert_eq!(reply.destination(), Some("/queue/replies"));
    assert_eq!(reply.body_text(), Some("re: ping"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_ids_are_unique_and_unsubscribe_is_idempotent() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    client
        .subscribe("dup", "/queue/a", AckMode::Auto, ignore_messages())
        .await
        .unwrap();
    let err = client
        .subscribe("dup", "/queue/b", AckMode::Auto, ignore_messages())
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::Validation(_)));
    assert_eq!(client.listener_count(), 1);

    assert!(client.unsubscribe("dup").await.unwrap());
    assert!(!client.unsubscribe("dup").await.unwrap());
    assert_eq!(client.listener_count(), 0);

    broker.expect(Command::Subscribe).await;
    let unsubscribe = broker.expect(Command::Unsubscribe).await;
    assert_eq!(unsubscribe.get_header(ID), Some("dup"));
    broker.assert_silent(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconfirmed_subscribe_is_withdrawn() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    broker.set_receipts(false);

    let err = client
        .subscribe("late", "/queue/test", AckMode::Auto, ignore_messages())
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::Timeout(_)));
    assert_eq!(client.listener_count(), 0);

    broker.expect(Command::Subscribe).await;
    let withdraw = broker.expect(Command::Unsubscribe).await;
    assert_eq!(withdraw.get_header(ID), Some("late"));
    assert!(withdraw.receipt_id().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_unsubscribe_keeps_delivering() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .subscribe("kept", "/queue/test", AckMode::Auto, forwarding(tx))
        .await
        .unwrap();
    broker.expect(Command::Subscribe).await;

    broker.set_receipts(false);
    let err = client.unsubscribe("kept").await.unwrap_err();
    assert!(matches!(err, StompError::Timeout(_)));
    broker.expect(Command::Unsubscribe).await;
    assert_eq!(client.listener_count(), 1);

    broker.deliver(&message("kept", "m-1", None, "still subscribed"));
    let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got.body_text(), Some("still subscribed"));
}

// ============================================================================
// Request / reply
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_resolves_with_the_reply() {
    let (client, _errors, _broker) = connected_client(BrokerConfig::default()).await;
    let mut frame = text("/queue/service", "ping");
    frame.set_reply_to("/temp-queue/r1");

    let reply = client.request(frame, Some(WAIT)).await.unwrap();
    assert_eq!(reply.command(), Command::Message);
    assert_eq!(reply.get_header(SUBSCRIPTION), Some("/temp-queue/r1"));
    assert_eq!(reply.body_text(), Some("ping"));
    assert_eq!(client.listener_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_requires_send_with_reply_to() {
    let (client, _errors, _broker) = connected_client(BrokerConfig::default()).await;

    let err = client.request(text("/queue/service", "x"), None).await.unwrap_err();
    assert!(matches!(err, StompError::MissingHeader(ref h) if h == "reply-to"));

    let err = client.request(Frame::begin("tx-1"), None).await.unwrap_err();
    assert!(matches!(err, StompError::Validation(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_request_times_out_and_removes_its_listener() {
    let config = BrokerConfig {
        echo_requests: false,
        ..BrokerConfig::default()
    };
    let (client, _errors, _broker) = connected_client(config).await;
    let mut frame = text("/queue/service", "ping");
    frame.set_reply_to("/temp-queue/r2");

    let err = client
        .request(frame, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::Timeout(_)));
    assert_eq!(client.listener_count(), 0);
}

// ============================================================================
// Errors and lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_error_frame_is_reported() {
    let (_client, mut errors, broker) = connected_client(BrokerConfig::default()).await;
    broker.deliver(&Frame::error("queue not found"));

    let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    match err {
        StompError::Frame { frame, message } => {
            assert_eq!(frame, "ERROR");
            assert_eq!(message, "queue not found");
        }
        other => panic!("expected frame error, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_input_is_reported_as_fatal() {
    let (_client, mut errors, broker) = connected_client(BrokerConfig::default()).await;
    broker.deliver_raw(b"BOGUS\n\n\0");

    let err = tokio::time::timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert!(matches!(err, StompError::Protocol(_)), "got {:?}", err);
    assert!(err.is_fatal());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_bound_frames_cannot_be_sent() {
    let (client, _errors, mut broker) = connected_client(BrokerConfig::default()).await;
    let err = client.send(Frame::receipt("r-1"), None).await.unwrap_err();
    assert!(matches!(err, StompError::Frame { .. }));

    let err = client.send(Frame::send("/queue/no-type"), None).await.unwrap_err();
    assert!(matches!(err, StompError::Validation(_)));
    broker.assert_silent(Duration::from_millis(200)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_is_idempotent_and_rejects_later_sends() {
    let (client, _errors, _broker) = connected_client(BrokerConfig::default()).await;
    let other = client.clone();
    tokio::task::spawn_blocking(move || {
        other.dispose();
        other.dispose();
    })
    .await
    .unwrap();

    assert!(client.is_disposed());
    assert_eq!(client.listener_count(), 0);
    let err = client.send(text("/queue/test", "late"), None).await.unwrap_err();
    assert!(matches!(err, StompError::Closed(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_rejected_by_broker_fails() {
    let config = BrokerConfig {
        reject_connect: Some("bad credentials".into()),
        ..BrokerConfig::default()
    };
    let (transport, _broker) = common::start(config);
    let (client, _errors) = Client::start(
        "rejected",
        transport.reader,
        transport.writer,
        ClientSettings::default(),
    )
    .unwrap();
    let err = client
        .connect(Frame::connect("1.2", "/", (0, 0)), WAIT)
        .await
        .unwrap_err();
    assert!(matches!(err, StompError::Frame { ref message, .. } if message == "bad credentials"));
}
