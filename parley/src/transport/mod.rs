//! Transport layer for the `Parley` chat stream.
//!
//! Defines the [`Dialer`] seam that opens one bidirectional text channel,
//! split into a [`FrameSink`] and a [`FrameStream`]. Concrete implementations:
//! - [`websocket::WsDialer`]: WebSocket over `tokio-tungstenite`
//! - [`loopback::LoopbackDialer`]: in-process channels for testing
//!
//! [`session::TransportSession`] owns the lifecycle (connect, keep-alive,
//! close classification) on top of whichever dialer it is given.

pub mod loopback;
pub mod session;
pub mod websocket;

use std::fmt;
use std::future::Future;

/// Close code for a normal, intentional shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text payload (one JSON envelope).
    Text(String),
    /// The server closed the channel.
    Close {
        /// Close code ([`CLOSE_ABNORMAL`] if the server sent none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Lifecycle state of a [`session::TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected.
    Idle,
    /// Dial in progress.
    Connecting,
    /// Channel open.
    Connected,
    /// Channel closed, cleanly or not. `connect()` may be called again.
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// An envelope was sent while the channel was not open.
    #[error("not connected")]
    NotConnected,

    /// The dial did not complete in time.
    #[error("connection attempt timed out")]
    Timeout,

    /// Nothing accepted the connection at the server address.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server answered the upgrade request with an HTTP error.
    #[error("server rejected the connection (HTTP {0})")]
    Rejected(u16),

    /// The configured server URL cannot be turned into a stream URL.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// The peer sent a frame that is not a JSON object.
    #[error("message parsing failed: {0}")]
    Malformed(String),

    /// The channel failed while sending or receiving.
    #[error("transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether the error is worth showing to the user. Malformed frames are
    /// logged and dropped instead.
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

/// How the channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closure {
    /// Close code.
    pub code: u16,
    /// Close reason, possibly empty.
    pub reason: String,
}

/// Classification of a [`Closure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Intentional shutdown.
    Clean,
    /// The connection dropped without a close frame; usually the stream
    /// endpoint is not running or not routed.
    ServerUnreachable,
    /// Any other close code.
    Abnormal,
}

impl Closure {
    /// A clean local shutdown.
    #[must_use]
    pub const fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }

    /// A drop without a close frame.
    #[must_use]
    pub const fn abnormal() -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
        }
    }

    /// Classifies the close code.
    #[must_use]
    pub const fn kind(&self) -> CloseKind {
        match self.code {
            CLOSE_NORMAL => CloseKind::Clean,
            CLOSE_ABNORMAL => CloseKind::ServerUnreachable,
            _ => CloseKind::Abnormal,
        }
    }

    /// Whether a user-triggered reconnect is worth offering. Unreachable
    /// servers are a configuration or availability problem, not a blip.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        matches!(self.kind(), CloseKind::Abnormal)
    }

    /// Human-readable explanation, or `None` for a clean close.
    #[must_use]
    pub fn describe(&self) -> Option<String> {
        match self.kind() {
            CloseKind::Clean => None,
            CloseKind::ServerUnreachable => Some(
                "cannot connect to server: the chat stream endpoint is not running \
                 or not reachable at /ws/chat/"
                    .to_string(),
            ),
            CloseKind::Abnormal if self.reason.is_empty() => Some(format!(
                "connection closed (code: {}, {})",
                self.code,
                close_code_meaning(self.code)
            )),
            CloseKind::Abnormal => Some(format!(
                "connection closed (code: {}, reason: {})",
                self.code, self.reason
            )),
        }
    }
}

/// Registered meaning of a WebSocket close code.
#[must_use]
pub const fn close_code_meaning(code: u16) -> &'static str {
    match code {
        1000 => "normal closure",
        1001 => "going away",
        1002 => "protocol error",
        1003 => "unsupported data",
        1005 => "no status received",
        1006 => "abnormal closure",
        1007 => "invalid frame payload data",
        1008 => "policy violation",
        1009 => "message too big",
        1010 => "mandatory extension",
        1011 => "internal server error",
        1012 => "service restart",
        1013 => "try again later",
        1014 => "bad gateway",
        1015 => "TLS handshake",
        _ => "unknown",
    }
}

/// Write half of an open channel.
pub trait FrameSink: Send + 'static {
    /// Transmit one text frame.
    fn send_text(
        &mut self,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Request a graceful close with the given code.
    fn close(
        &mut self,
        code: u16,
        reason: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Read half of an open channel.
pub trait FrameStream: Send + 'static {
    /// Wait for the next frame. `None` means the channel ended without a
    /// close frame.
    fn next_frame(&mut self)
    -> impl Future<Output = Option<Result<Frame, TransportError>>> + Send;
}

/// Opens channels to the chat server.
pub trait Dialer: Send + Sync + 'static {
    /// Write half produced by this dialer.
    type Sink: FrameSink;
    /// Read half produced by this dialer.
    type Stream: FrameStream;

    /// Open a channel to `url` (credential already embedded).
    fn dial(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Stream), TransportError>> + Send;
}

/// Builds the stream URL: `<base>/ws/chat/?token=<credential>`.
///
/// `http` and `https` base URLs are mapped to `ws` and `wss`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] if `base` does not parse or uses
/// an unsupported scheme.
pub fn stream_url(base: &str, token: &str) -> Result<String, TransportError> {
    let mut url = url::Url::parse(base).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(TransportError::InvalidUrl(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(base.to_string()))?;
    let path = format!("{}/ws/chat/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url.to_string())
}

/// Replaces the credential in a stream URL for logging.
#[must_use]
pub fn mask_token(url: &str, token: &str) -> String {
    if token.is_empty() {
        return url.to_string();
    }
    let encoded: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    url.replace(&encoded, "***").replace(token, "***")
}
