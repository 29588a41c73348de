//! Networking coordinator between the line-oriented front end and the
//! async client core.
//!
//! The front end sends [`NetCommand`]s and drains [`NetEvent`]s; the
//! background tasks own the [`ChatSession`].
//!
//! ```text
//! front end  ←── NetEvent ───  tokio background tasks
//!            ─── NetCommand →
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use parley_proto::message::{ConversationId, MessageId, MessageKind, UserId};

use crate::api::http::HttpChatApi;
use crate::api::{ApiError, ChatApi, MediaUpload};
use crate::chat::{ClearedMarkers, CommandConfig};
use crate::config::SyncConfig;
use crate::session::{ChatSession, SessionSettings};
use crate::sync::engine::EngineConfig;
use crate::sync::{Notice, Timeline};
use crate::transport::session::{SessionConfig, TransportSession};
use crate::transport::websocket::WsDialer;
use crate::transport::Dialer;

/// Commands sent from the front end to the background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetCommand {
    /// Send a text message.
    Send {
        /// Message text.
        text: String,
    },
    /// Reply to a message.
    Reply {
        /// Quoted message.
        to: MessageId,
        /// Reply text.
        text: String,
    },
    /// Upload a file and post it.
    Upload {
        /// File to upload.
        path: PathBuf,
        /// Optional caption.
        caption: Option<String>,
    },
    /// Post an emoji.
    Emoji {
        /// Emoji code.
        code: String,
    },
    /// The input line changed (drives the typing indicator).
    Input {
        /// Current input.
        text: String,
    },
    /// Open edit mode on a message.
    StartEdit {
        /// Message to edit.
        id: MessageId,
    },
    /// Submit the open edit.
    SubmitEdit {
        /// Replacement text.
        text: String,
    },
    /// Leave edit mode.
    CancelEdit,
    /// Recall a message.
    Recall {
        /// Message to recall.
        id: MessageId,
    },
    /// Switch to another conversation or first-contact peer.
    Switch {
        /// Conversation to open.
        conversation: Option<ConversationId>,
        /// Peer for a first-contact conversation.
        peer: Option<UserId>,
    },
    /// Look up read state of the given messages again.
    RefreshReadStatus {
        /// Messages to look up.
        ids: Vec<MessageId>,
    },
    /// Clear the active conversation.
    Clear,
    /// Reconnect the stream.
    Reconnect,
    /// Shut down the background tasks.
    Shutdown,
}

/// Events sent from the background tasks to the front end.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// The timeline changed.
    Timeline(Timeline),
    /// A user-facing notice.
    Notice(Notice),
    /// Edit mode opened with this text.
    EditReady {
        /// Message being edited.
        id: MessageId,
        /// Text to edit.
        text: String,
    },
    /// A command was refused.
    CommandFailed(String),
}

/// Errors from [`spawn_net`].
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The REST client could not be built.
    #[error("api client: {0}")]
    Api(#[from] ApiError),
}

/// Configuration for the networking layer.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Backend base URL (`http(s)://host`).
    pub server_url: String,
    /// Authentication token.
    pub token: String,
    /// The authenticated user's numeric id.
    pub user_id: i64,
    /// Upgrade absolute `http` media URLs to `https`.
    pub force_https_media: bool,
    /// Stream dial timeout.
    pub connect_timeout: Duration,
    /// Keep-alive ping interval.
    pub heartbeat_interval: Duration,
    /// Channel capacity for command, event and notice channels.
    pub channel_capacity: usize,
}

impl NetConfig {
    /// Transport settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server_url.clone(),
            token: self.token.clone(),
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            event_buffer: self.channel_capacity,
        }
    }

    /// Orchestrator settings, with sync timing taken from `sync`.
    #[must_use]
    pub fn session_settings(&self, sync: &SyncConfig) -> SessionSettings {
        SessionSettings {
            engine: EngineConfig {
                local_user: UserId::new(self.user_id),
                duplicate_window: sync.duplicate_window,
                echo_window: sync.echo_window,
                media_base: self.server_url.clone(),
                force_https_media: self.force_https_media,
            },
            commands: CommandConfig {
                send_latch_timeout: sync.send_latch_timeout,
                typing_idle: sync.typing_idle,
                edit_window: sync.edit_window,
            },
            page_size: sync.page_size,
            notice_buffer: self.channel_capacity,
        }
    }
}

/// Connect to the backend and spawn the background tasks.
///
/// A failed stream connect is not fatal: it is reported as a notice and
/// the caller may send [`NetCommand::Reconnect`].
///
/// # Errors
///
/// Returns [`NetError::Api`] if the REST client cannot be built.
pub async fn spawn_net(
    config: NetConfig,
    sync: &SyncConfig,
    cleared: ClearedMarkers,
    start: NetCommand,
) -> Result<(mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>), NetError> {
    let api = Arc::new(HttpChatApi::new(config.server_url.clone(), &config.token)?);
    let (transport, events) = TransportSession::new(WsDialer, config.session_config());
    let (session, notices) = ChatSession::new(
        transport,
        events,
        api,
        cleared,
        config.session_settings(sync),
    );
    session.attach();
    if let Err(e) = session.connect().await {
        tracing::warn!(err = %e, "initial connect failed");
    }
    Ok(run_session(session, notices, start, config.channel_capacity))
}

/// Drive an already-built session from a command channel.
///
/// `start` is applied before any other command, typically a
/// [`NetCommand::Switch`].
pub fn run_session<D: Dialer, A: ChatApi>(
    session: ChatSession<D, A>,
    notices: mpsc::Receiver<Notice>,
    start: NetCommand,
    capacity: usize,
) -> (mpsc::Sender<NetCommand>, mpsc::Receiver<NetEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<NetCommand>(capacity);
    let (evt_tx, evt_rx) = mpsc::channel::<NetEvent>(capacity);
    let session = Arc::new(session);

    tokio::spawn(timeline_forwarder(session.timeline(), evt_tx.clone()));
    tokio::spawn(notice_forwarder(notices, evt_tx.clone()));
    tokio::spawn(async move {
        execute(&session, start, &evt_tx).await;
        command_handler(session, cmd_rx, evt_tx).await;
    });

    (cmd_tx, evt_rx)
}

/// Background task: apply commands until shutdown or the front end leaves.
async fn command_handler<D: Dialer, A: ChatApi>(
    session: Arc<ChatSession<D, A>>,
    mut cmd_rx: mpsc::Receiver<NetCommand>,
    evt_tx: mpsc::Sender<NetEvent>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        if cmd == NetCommand::Shutdown {
            break;
        }
        execute(&session, cmd, &evt_tx).await;
    }
    tracing::info!("net command handler shutting down");
    session.detach().await;
    session.transport().close().await;
}

async fn execute<D: Dialer, A: ChatApi>(
    session: &ChatSession<D, A>,
    cmd: NetCommand,
    evt_tx: &mpsc::Sender<NetEvent>,
) {
    let commands = session.commands();
    let outcome: Result<(), String> = match cmd {
        NetCommand::Send { text } => commands.send_text(&text).await.map(drop).map_err(|e| e.to_string()),
        NetCommand::Reply { to, text } => commands
            .send_reply(&text, &to)
            .await
            .map(drop)
            .map_err(|e| e.to_string()),
        NetCommand::Upload { path, caption } => match read_upload(&path).await {
            Ok(upload) => commands
                .send_media(upload, caption)
                .await
                .map(drop)
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        },
        NetCommand::Emoji { code } => commands.send_emoji(&code).await.map(drop).map_err(|e| e.to_string()),
        NetCommand::Input { text } => {
            commands.input_changed(&text).await;
            Ok(())
        }
        NetCommand::StartEdit { id } => match commands.start_edit(&id).await {
            Ok(text) => {
                let _ = evt_tx.send(NetEvent::EditReady { id, text }).await;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        },
        NetCommand::SubmitEdit { text } => commands.submit_edit(&text).await.map(drop).map_err(|e| e.to_string()),
        NetCommand::CancelEdit => {
            commands.cancel_edit();
            Ok(())
        }
        NetCommand::Recall { id } => commands.recall(&id).await.map_err(|e| e.to_string()),
        NetCommand::Switch { conversation, peer } => {
            session.switch_to(conversation, peer).await;
            Ok(())
        }
        NetCommand::RefreshReadStatus { ids } => {
            session.refresh_read_status(ids, true);
            Ok(())
        }
        NetCommand::Clear => match session.conversation_id() {
            Some(conversation) => {
                session.clear(&conversation);
                Ok(())
            }
            None => Err("no conversation selected".to_string()),
        },
        NetCommand::Reconnect => session.connect().await.map_err(|e| e.to_string()),
        NetCommand::Shutdown => Ok(()),
    };
    if let Err(reason) = outcome {
        tracing::debug!(%reason, "command refused");
        let _ = evt_tx.send(NetEvent::CommandFailed(reason)).await;
    }
}

/// Background task: forward every published timeline.
async fn timeline_forwarder(
    mut timeline: tokio::sync::watch::Receiver<Timeline>,
    evt_tx: mpsc::Sender<NetEvent>,
) {
    while timeline.changed().await.is_ok() {
        let snapshot = Arc::clone(&timeline.borrow_and_update());
        if evt_tx.send(NetEvent::Timeline(snapshot)).await.is_err() {
            break;
        }
    }
}

/// Background task: forward notices.
async fn notice_forwarder(mut notices: mpsc::Receiver<Notice>, evt_tx: mpsc::Sender<NetEvent>) {
    while let Some(notice) = notices.recv().await {
        if evt_tx.send(NetEvent::Notice(notice)).await.is_err() {
            break;
        }
    }
}

/// Read a file for upload, deriving the kind from its extension.
async fn read_upload(path: &Path) -> Result<MediaUpload, String> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let (kind, mime) = media_kind_for(&extension)
        .ok_or_else(|| format!("unsupported file type: .{extension}"))?;
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(MediaUpload {
        kind,
        file_name,
        mime: mime.to_string(),
        bytes,
    })
}

/// Media kind and MIME type for a lowercase file extension.
fn media_kind_for(extension: &str) -> Option<(MessageKind, &'static str)> {
    let found = match extension {
        "png" => (MessageKind::Image, "image/png"),
        "jpg" | "jpeg" => (MessageKind::Image, "image/jpeg"),
        "gif" => (MessageKind::Image, "image/gif"),
        "webp" => (MessageKind::Image, "image/webp"),
        "mp3" => (MessageKind::Audio, "audio/mpeg"),
        "wav" => (MessageKind::Audio, "audio/wav"),
        "ogg" => (MessageKind::Audio, "audio/ogg"),
        "m4a" => (MessageKind::Audio, "audio/mp4"),
        "mp4" => (MessageKind::Video, "video/mp4"),
        "mov" => (MessageKind::Video, "video/quicktime"),
        "webm" => (MessageKind::Video, "video/webm"),
        _ => return None,
    };
    Some(found)
}
