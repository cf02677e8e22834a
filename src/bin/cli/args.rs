use clap::{Args, Parser, Subcommand, ValueEnum};
use stomp_duplex::AckMode;

#[derive(Parser)]
#[command(name = "stomp")]
#[command(version)]
#[command(about = "Send to and subscribe on a STOMP 1.2 broker")]
pub struct Cli {
    #[command(flatten)]
    pub broker: BrokerArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct BrokerArgs {
    /// Broker host
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(long, default_value_t = 61613)]
    pub port: u16,

    /// Virtual host sent in CONNECT
    #[arg(long, default_value = "/")]
    pub vhost: String,

    /// Login username
    #[arg(short, long, default_value = "guest")]
    pub login: String,

    /// Passcode
    #[arg(short, long, default_value = "guest")]
    pub passcode: String,

    /// Heartbeat settings (client-send,client-receive in ms)
    #[arg(long, default_value = "10000,10000")]
    pub heartbeat: String,

    /// Apply RabbitMQ reply-to rules
    #[arg(long)]
    pub rabbitmq: bool,

    /// Operation timeout in milliseconds
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Subcommand)]
pub enum Command {
    /// Send one text message and wait for the broker's receipt
    Send {
        destination: String,
        message: String,

        #[arg(long, default_value = "text/plain")]
        content_type: String,
    },
    /// Print messages arriving on a destination
    Subscribe {
        destination: String,

        #[arg(long, value_enum, default_value_t = Ack::Auto)]
        ack: Ack,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Ack {
    Auto,
    Client,
    ClientIndividual,
}

impl From<Ack> for AckMode {
    fn from(ack: Ack) -> Self {
        match ack {
            Ack::Auto => AckMode::Auto,
            Ack::Client => AckMode::Client,
            Ack::ClientIndividual => AckMode::ClientIndividual,
        }
    }
}
