use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stomp_duplex::frame::generate_id;
use stomp_duplex::{
    AckMode, Connection, Frame, RabbitMqStrategy, Session, StompError, StompOptions,
    parse_heartbeat_header,
};
use tokio::sync::Notify;

use super::args::{BrokerArgs, Cli, Command};
use super::exit_codes;

const CLOSE_POLL: Duration = Duration::from_millis(250);

/// Connect, run the selected subcommand and disconnect.
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    let address = format!("{}:{}", cli.broker.host, cli.broker.port);
    let options = options(&cli.broker).map_err(|e| format_error(&e, &address))?;
    let connection = Connection::open(options)
        .await
        .map_err(|e| format_error(&e, &address))?;
    let session = connection.session();
    if let Some(id) = session.session_id() {
        eprintln!("Connected to {} (session {})", address, id);
    }

    let result = match &cli.command {
        Command::Send {
            destination,
            message,
            content_type,
        } => send(&session, destination, message, content_type).await,
        Command::Subscribe {
            destination,
            ack,
            count,
        } => subscribe(&session, destination, (*ack).into(), *count).await,
    };

    if let Err(e) = session.close().await {
        tracing::warn!(error = %e, "disconnect not confirmed");
    }
    result.map_err(|e| format_error(&e, &address))
}

fn options(args: &BrokerArgs) -> Result<StompOptions, StompError> {
    let (cx, cy) = parse_heartbeat_header(&args.heartbeat)?;
    let options = StompOptions::new(&args.host)
        .port(args.port)
        .virtual_host(&args.vhost)
        .login(&args.login)
        .passcode(&args.passcode)
        .heartbeat(cx, cy)
        .operation_timeout(Duration::from_millis(args.timeout_ms));
    Ok(if args.rabbitmq {
        options.strategy(RabbitMqStrategy)
    } else {
        options
    })
}

async fn send(
    session: &Session,
    destination: &str,
    message: &str,
    content_type: &str,
) -> Result<(), StompError> {
    let mut frame = Frame::send(destination).with_receipt();
    frame.set_text_body(message, content_type)?;
    session.send(frame, None).await?;
    println!("Sent {} bytes to {}", message.len(), destination);
    Ok(())
}

async fn subscribe(
    session: &Session,
    destination: &str,
    ack: AckMode,
    count: Option<usize>,
) -> Result<(), StompError> {
    if count == Some(0) {
        return Ok(());
    }
    let remaining = Arc::new(AtomicUsize::new(count.unwrap_or(usize::MAX)));
    let done = Arc::new(Notify::new());

    let (left, finished) = (Arc::clone(&remaining), Arc::clone(&done));
    session
        .subscribe(&generate_id("cli"), destination, ack, move |frame: Frame, _: Session| {
            let left = Arc::clone(&left);
            let finished = Arc::clone(&finished);
            async move {
                print_message(&frame);
                if left.fetch_sub(1, Ordering::SeqCst) == 1 {
                    finished.notify_one();
                }
                Ok::<Option<Frame>, StompError>(None)
            }
        })
        .await?;
    eprintln!("Subscribed to {} ({} ack)", destination, ack);

    tokio::select! {
        _ = done.notified() => Ok(()),
        _ = wait_closed(session) => Err(StompError::Closed("connection lost".into())),
    }
}

async fn wait_closed(session: &Session) {
    while !session.is_closed() {
        tokio::time::sleep(CLOSE_POLL).await;
    }
}

fn print_message(frame: &Frame) {
    println!("[{}] MESSAGE", frame.destination().unwrap_or("?"));
    for (k, v) in frame.headers().sorted() {
        println!("  {}: {}", k, v);
    }
    if !frame.body().is_empty() {
        match frame.body_text() {
            Some(s) => println!("  Body: {}", s),
            None => println!("  Body: ({} bytes, binary)", frame.body().len()),
        }
    }
}

/// Map an error to a user-facing message and exit code.
pub fn format_error(err: &StompError, address: &str) -> (String, u8) {
    match err {
        StompError::Io(io_err) => {
            let message = match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => format!("Connection refused: {}", address),
                std::io::ErrorKind::TimedOut => format!("Connection timed out: {}", address),
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        StompError::Timeout(msg) => (format!("Timed out: {}", msg), exit_codes::NETWORK_ERROR),
        StompError::Frame { frame, message } if frame == "ERROR" => (
            format!("Broker rejected the request: {}", message),
            exit_codes::AUTH_ERROR,
        ),
        other => (other.to_string(), exit_codes::PROTOCOL_ERROR),
    }
}
