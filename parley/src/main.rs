//! `parley`: line-oriented chat client with live sync.
//!
//! Reads commands from stdin and prints timeline changes and notices.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/parley/config.toml`).
//!
//! ```bash
//! parley --server-url https://chat.example.com --token $TOKEN \
//!     --user-id 7 --conversation 42
//!
//! # Or via environment variables
//! PARLEY_SERVER=https://chat.example.com PARLEY_TOKEN=... PARLEY_USER_ID=7 \
//!     parley --peer 9
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use parley::chat::ClearedMarkers;
use parley::config::{CliArgs, ClientConfig};
use parley::net::{self, NetCommand, NetEvent};
use parley::sync::{Notice, Timeline};
use parley_proto::message::{ConversationId, Message, MessageId, Timestamp, UserId};

const HELP: &str = "\
commands:
  <text>                 send a message
  /reply <id> <text>     reply to a message
  /edit <id>             start editing one of your messages
  /save <text>           submit the edit
  /cancel                leave edit mode
  /recall <id>           recall one of your messages
  /emoji <code>          send an emoji
  /upload <path> [text]  send an image, audio or video file
  /switch <conversation> open another conversation
  /peer <user id>        message a user you have no conversation with
  /read <id>...          refresh read status
  /clear                 clear this conversation
  /reconnect             reconnect the stream
  /quit                  exit";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("parley starting");

    let Some(net_config) = config.to_net_config() else {
        eprintln!("server URL, token and user id are required (--server-url, --token, --user-id)");
        return ExitCode::from(2);
    };
    let local_user = UserId::new(net_config.user_id);

    let cleared = match config.cleared_markers_path().map(ClearedMarkers::load) {
        Ok(Ok(markers)) => markers,
        Ok(Err(e)) => {
            eprintln!("Warning: {e}; cleared conversations will not be remembered");
            ClearedMarkers::in_memory()
        }
        Err(e) => {
            eprintln!("Warning: {e}; cleared conversations will not be remembered");
            ClearedMarkers::in_memory()
        }
    };

    let start = NetCommand::Switch {
        conversation: config.conversation.clone().map(ConversationId::new),
        peer: config.peer.map(UserId::new),
    };
    let (cmd_tx, evt_rx) = match net::spawn_net(net_config, &config.sync, cleared, start).await {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("cannot start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let printer = tokio::spawn(print_events(evt_rx, local_user));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(err = %e, "stdin read failed");
                break;
            }
        };
        match parse_line(&line) {
            Ok(Some(NetCommand::Shutdown)) => break,
            Ok(Some(cmd)) => {
                if cmd_tx.send(cmd).await.is_err() {
                    eprintln!("network task stopped");
                    break;
                }
            }
            Ok(None) => {}
            Err(usage) => eprintln!("{usage}"),
        }
    }

    let _ = cmd_tx.send(NetCommand::Shutdown).await;
    drop(cmd_tx);
    let _ = printer.await;
    tracing::info!("parley exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Logs go to a file so they never interleave with the conversation on
/// stdout. Returns a [`WorkerGuard`] that must be held until shutdown to
/// flush buffered entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("parley.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Turn one input line into a command. `Ok(None)` for blank lines,
/// `Err` with a usage hint for malformed commands.
fn parse_line(line: &str) -> Result<Option<NetCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(NetCommand::Send {
            text: line.to_string(),
        }));
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    let id_and_text = || -> Result<(MessageId, String), String> {
        let (id, text) = rest
            .split_once(' ')
            .ok_or_else(|| format!("usage: /{name} <id> <text>"))?;
        Ok((MessageId::new(id), text.trim().to_string()))
    };
    let require = |usage: &str| -> Result<&str, String> {
        if rest.is_empty() {
            Err(format!("usage: /{name} {usage}"))
        } else {
            Ok(rest)
        }
    };

    let cmd = match name {
        "quit" | "q" => NetCommand::Shutdown,
        "help" => {
            println!("{HELP}");
            return Ok(None);
        }
        "reply" => {
            let (to, text) = id_and_text()?;
            NetCommand::Reply { to, text }
        }
        "edit" => NetCommand::StartEdit {
            id: MessageId::new(require("<id>")?),
        },
        "save" => NetCommand::SubmitEdit {
            text: require("<text>")?.to_string(),
        },
        "cancel" => NetCommand::CancelEdit,
        "recall" => NetCommand::Recall {
            id: MessageId::new(require("<id>")?),
        },
        "emoji" => NetCommand::Emoji {
            code: require("<code>")?.to_string(),
        },
        "upload" => {
            let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
            if path.is_empty() {
                return Err("usage: /upload <path> [caption]".to_string());
            }
            NetCommand::Upload {
                path: PathBuf::from(path),
                caption: Some(caption.trim().to_string()).filter(|c| !c.is_empty()),
            }
        }
        "switch" => NetCommand::Switch {
            conversation: Some(ConversationId::new(require("<conversation>")?)),
            peer: None,
        },
        "peer" => {
            let id = require("<user id>")?
                .parse::<i64>()
                .map_err(|_| "usage: /peer <numeric user id>".to_string())?;
            NetCommand::Switch {
                conversation: None,
                peer: Some(UserId::new(id)),
            }
        }
        "read" => NetCommand::RefreshReadStatus {
            ids: require("<id>...")?
                .split_whitespace()
                .map(MessageId::new)
                .collect(),
        },
        "clear" => NetCommand::Clear,
        "reconnect" => NetCommand::Reconnect,
        other => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(cmd))
}

/// Print events until the network task goes away.
async fn print_events(mut evt_rx: mpsc::Receiver<NetEvent>, local_user: UserId) {
    let mut printer = TimelinePrinter::new(local_user);
    while let Some(event) = evt_rx.recv().await {
        match event {
            NetEvent::Timeline(timeline) => {
                for line in printer.changes(&timeline) {
                    println!("{line}");
                }
            }
            NetEvent::Notice(notice) => {
                if let Some(text) = describe_notice(&notice) {
                    println!("* {text}");
                }
            }
            NetEvent::EditReady { id, text } => {
                println!("* editing #{id}: {text}  (/save <text> or /cancel)");
            }
            NetEvent::CommandFailed(reason) => println!("! {reason}"),
        }
    }
}

/// Prints only the timeline entries that are new or changed since the
/// last snapshot.
struct TimelinePrinter {
    local_user: UserId,
    shown: HashMap<MessageId, String>,
}

impl TimelinePrinter {
    fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            shown: HashMap::new(),
        }
    }

    fn changes(&mut self, timeline: &Timeline) -> Vec<String> {
        if timeline.is_empty() && !self.shown.is_empty() {
            self.shown.clear();
            return vec!["-- conversation empty --".to_string()];
        }
        let mut lines = Vec::new();
        for message in timeline.iter() {
            let rendered = self.render(message);
            if self.shown.get(&message.id) != Some(&rendered) {
                lines.push(rendered.clone());
                self.shown.insert(message.id.clone(), rendered);
            }
        }
        lines
    }

    fn render(&self, message: &Message) -> String {
        let who = if message.is_from(self.local_user) {
            "you"
        } else {
            message.sender_name.as_str()
        };
        let mut line = format!(
            "[{}] #{} {who}: ",
            format_time(message.created_at),
            message.id
        );
        if let Some(reply) = &message.reply_to {
            line.push_str(&format!("(re {}: \"{}\") ", reply.sender_name, reply.content));
        }
        if message.kind.is_media() {
            let url = message.media.as_ref().map_or("", |m| m.url.as_str());
            line.push_str(&format!("[{}] {url} ", message.kind.as_str()));
        }
        line.push_str(&message.content);
        if message.id.is_provisional() {
            line.push_str(" (sending)");
        } else if message.is_edited && !message.is_recalled {
            line.push_str(" (edited)");
        }
        line
    }
}

fn describe_notice(notice: &Notice) -> Option<String> {
    let text = match notice {
        Notice::NewMessage { .. } | Notice::ReadStatusUpdated(_) => return None,
        Notice::Recalled { sender_name, .. } => format!("{sender_name} recalled a message"),
        Notice::RecallSucceeded(id) => format!("recalled #{id}"),
        Notice::RecallFailed { message_id, reason } => {
            format!("could not recall #{message_id}: {reason}")
        }
        Notice::EditConfirmed(id) => format!("edited #{id}"),
        Notice::EditFailed {
            message_id,
            reason,
            draft,
        } => format!("could not edit #{message_id}: {reason}; still editing \"{draft}\""),
        Notice::ServerError(reason) => format!("server error: {reason}"),
        Notice::TransportFault(reason) => format!("connection problem: {reason}"),
        Notice::TypingChanged { typing, .. } => match typing {
            0 => return None,
            1 => "someone is typing...".to_string(),
            n => format!("{n} people are typing..."),
        },
        Notice::Connected => "connected".to_string(),
        Notice::ConnectionLost { reason, retry } => {
            if *retry {
                format!("{reason} (/reconnect to retry)")
            } else {
                reason.clone()
            }
        }
    };
    Some(text)
}

/// Format a timestamp as local "HH:MM".
fn format_time(at: Timestamp) -> String {
    use chrono::{Local, TimeZone};
    match Local.timestamp_millis_opt(at.as_millis()) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M").to_string(),
        _ => "??:??".to_string(),
    }
}
