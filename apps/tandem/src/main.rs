use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use tandem_core::chat::StdoutChat;
use tandem_core::config::Config;
use tandem_core::media::{LogDisplay, MediaConstraints, SyntheticMedia};
use tandem_core::negotiation::NegotiationConfig;
use tandem_core::peer::WebRtcConnector;
use tandem_core::session::{CallEvent, Collaborators, ControllerConfig, SessionController};
use tandem_core::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use tandem_core::transport::{WebSocketRelay, room_url};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "tandem",
    about = "Two-party call over a chat relay room",
    author,
    version
)]
struct Cli {
    #[arg(long, help = "Relay room to join")]
    room: String,

    #[arg(long, default_value = "anonymous", help = "Name shown next to your chat lines")]
    name: String,

    #[arg(long, help = "Relay base URL (overrides TANDEM_RELAY_URL)")]
    relay: Option<String>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "TANDEM_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "TANDEM_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

enum Command<'a> {
    Call,
    Hangup,
    Quit,
    Chat(&'a str),
}

fn parse_command(line: &str) -> Option<Command<'_>> {
    match line.trim() {
        "" => None,
        "/call" => Some(Command::Call),
        "/hangup" => Some(Command::Hangup),
        "/quit" => Some(Command::Quit),
        _ => Some(Command::Chat(line)),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

// Failures are reported to the user; only `/quit` stops the loop.
async fn handle_command(controller: &SessionController, command: Command<'_>) -> Flow {
    match command {
        Command::Call => {
            if let Err(err) = controller.start_call().await {
                println!("call failed: {err}");
            }
        }
        Command::Hangup => controller.end_call().await,
        Command::Quit => return Flow::Quit,
        Command::Chat(body) => {
            if let Err(err) = controller.send_chat(body) {
                println!("chat not sent: {err}");
            }
        }
    }
    Flow::Continue
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging setup")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env();
    if let Some(relay) = cli.relay {
        config.relay_url = relay;
    }

    let url = room_url(&config.relay_url, &cli.room)?;
    info!(%url, "joining relay room");
    let relay = WebSocketRelay::connect(&url)
        .await
        .with_context(|| format!("connect to {url}"))?;

    let controller = SessionController::new(
        ControllerConfig {
            display_name: cli.name,
            negotiation: NegotiationConfig {
                max_pending_candidates: Some(config.max_pending_candidates),
            },
            constraints: MediaConstraints::default(),
            auto_answer: config.auto_answer,
        },
        Collaborators {
            relay,
            connector: Arc::new(WebRtcConnector::new(config.ice_servers.clone())),
            media: Arc::new(SyntheticMedia),
            display: Arc::new(LogDisplay),
            chat: Arc::new(StdoutChat),
        },
    );
    let mut event_loop = controller.spawn()?;
    tokio::spawn(print_events(controller.subscribe()));

    println!("joined room {}; /call, /hangup, /quit", cli.room);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("read stdin")? else {
                    break;
                };
                let Some(command) = parse_command(&line) else {
                    continue;
                };
                if handle_command(&controller, command).await == Flow::Quit {
                    break;
                }
            }
            _ = &mut event_loop => {
                println!("relay connection closed");
                return Ok(());
            }
        }
    }

    controller.end_call().await;
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<CallEvent>) {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged { state, .. }) => println!("[call] {state}"),
            Ok(CallEvent::RemoteTrack(track)) => {
                println!("[call] receiving {:?} from peer", track.kind)
            }
            Ok(CallEvent::PeerState(state)) => debug!(?state, "peer connection state"),
            Ok(CallEvent::MediaAcquisitionFailed(detail)) => {
                println!("[call] could not access camera/microphone: {detail}")
            }
            Ok(CallEvent::Ended { reason, .. }) => println!("[call] ended: {reason}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event printer lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
