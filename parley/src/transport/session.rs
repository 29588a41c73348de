//! Lifecycle of the single chat stream connection.
//!
//! [`TransportSession`] owns one channel opened through a [`Dialer`]. It
//! runs a background reader task that decodes every text frame and a
//! keep-alive task that pings at a fixed interval. Everything observable
//! leaves through one `mpsc` channel of [`SessionEvent`]s.
//!
//! State machine: `idle → connecting → connected → disconnected`, with
//! `disconnected → connecting` re-entered only by an explicit `connect()`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_proto::codec::{self, CodecError};
use parley_proto::envelope::{Inbound, Outbound};
use parley_proto::message::Timestamp;
use parley_proto::typing::TypingStatus;

use super::{
    CLOSE_NORMAL, Closure, Dialer, Frame, FrameSink, FrameStream, SessionState, TransportError,
    mask_token, stream_url,
};

/// Events emitted by a [`TransportSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The channel opened.
    Connected,
    /// A decoded inbound envelope. Every valid frame produces one.
    Envelope(Inbound),
    /// A typing status frame, emitted in addition to its `Envelope`.
    Typing(TypingStatus),
    /// A transport fault or a send attempted while disconnected.
    Error(TransportError),
    /// The channel closed.
    Closed(Closure),
}

/// Settings for one [`TransportSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend base URL; the stream path and token are appended.
    pub server_url: String,
    /// Authentication credential.
    pub token: String,
    /// Dial timeout.
    pub connect_timeout: Duration,
    /// Keep-alive ping interval.
    pub heartbeat_interval: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
}

impl SessionConfig {
    /// Settings with the default timeouts.
    #[must_use]
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token: token.into(),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            event_buffer: 256,
        }
    }
}

/// One bidirectional connection to the chat server.
///
/// Cheap to clone; clones share the same connection.
pub struct TransportSession<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for TransportSession<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<D: Dialer> {
    dialer: D,
    config: SessionConfig,
    state: parking_lot::Mutex<SessionState>,
    /// Write half, present only while connected.
    sink: tokio::sync::Mutex<Option<D::Sink>>,
    /// Bumped on every connect and close so stale tasks stay silent.
    generation: AtomicU64,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    heartbeat: parking_lot::Mutex<Option<JoinHandle<()>>>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl<D: Dialer> TransportSession<D> {
    /// Create an idle session and the receiver for its events.
    #[must_use]
    pub fn new(dialer: D, config: SessionConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let inner = Inner {
            dialer,
            config,
            state: parking_lot::Mutex::new(SessionState::Idle),
            sink: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            reader: parking_lot::Mutex::new(None),
            heartbeat: parking_lot::Mutex::new(None),
            event_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            event_rx,
        )
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Whether the channel is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Open the channel.
    ///
    /// A no-op if the session is already connecting or connected. On
    /// success emits [`SessionEvent::Connected`] and starts the reader and
    /// keep-alive tasks. On failure the session is `Disconnected` and the
    /// fault is also emitted as [`SessionEvent::Error`].
    ///
    /// # Errors
    ///
    /// Returns the dial failure, [`TransportError::Timeout`] if the dial
    /// exceeds the connect timeout, or [`TransportError::InvalidUrl`].
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, SessionState::Connecting | SessionState::Connected) {
                tracing::debug!(state = %*state, "connect ignored, already active");
                return Ok(());
            }
            *state = SessionState::Connecting;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let config = &self.inner.config;
        let url = match stream_url(&config.server_url, &config.token) {
            Ok(url) => url,
            Err(e) => return Err(self.inner.fail_connect(generation, e).await),
        };
        tracing::info!(url = %mask_token(&url, &config.token), "connecting chat stream");

        let dialed = tokio::time::timeout(config.connect_timeout, self.inner.dialer.dial(&url))
            .await
            .map_err(|_| TransportError::Timeout)
            .and_then(|r| r);

        if self.inner.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("session closed while dialing, dropping channel");
            return Ok(());
        }

        let (sink, stream) = match dialed {
            Ok(halves) => halves,
            Err(e) => {
                tracing::warn!(err = %e, "chat stream connect failed");
                return Err(self.inner.fail_connect(generation, e).await);
            }
        };

        *self.inner.sink.lock().await = Some(sink);
        *self.inner.state.lock() = SessionState::Connected;
        tracing::info!("chat stream connected");
        self.inner.emit(SessionEvent::Connected).await;

        let reader = tokio::spawn(reader_loop(Arc::clone(&self.inner), stream, generation));
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&self.inner), generation));
        *self.inner.reader.lock() = Some(reader);
        if let Some(old) = self.inner.heartbeat.lock().replace(heartbeat) {
            old.abort();
        }
        Ok(())
    }

    /// Transmit one envelope, stamping the send time if it has none.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] when the channel is not
    /// open, or the sink failure. Either is also emitted as
    /// [`SessionEvent::Error`] unless the event channel is full.
    pub async fn send(&self, envelope: Outbound) -> Result<(), TransportError> {
        self.inner.send(envelope).await
    }

    /// Close the channel.
    ///
    /// Sends a normal close frame if the channel is open or opening. State
    /// is cleared before any I/O, so a following `connect()` is always safe.
    pub async fn close(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut *state, SessionState::Disconnected)
        };
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.inner.heartbeat.lock().take() {
            task.abort();
        }
        if let Some(task) = self.inner.reader.lock().take() {
            task.abort();
        }
        let sink = self.inner.sink.lock().await.take();

        if matches!(previous, SessionState::Connected | SessionState::Connecting) {
            if let Some(mut sink) = sink {
                if let Err(e) = sink.close(CLOSE_NORMAL, "").await {
                    tracing::debug!(err = %e, "close frame not delivered");
                }
            }
            tracing::info!("chat stream closed");
            self.inner.emit(SessionEvent::Closed(Closure::normal())).await;
        }
    }
}

impl<D: Dialer> Inner<D> {
    async fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Emit from the send path without waiting for room: the consumer of
    /// the event channel may be the caller of `send` itself.
    fn report(&self, err: TransportError) {
        if let Err(mpsc::error::TrySendError::Full(event)) =
            self.event_tx.try_send(SessionEvent::Error(err))
        {
            tracing::debug!(?event, "event channel full, send error not queued");
        }
    }

    async fn fail_connect(&self, generation: u64, err: TransportError) -> TransportError {
        if self.generation.load(Ordering::SeqCst) == generation {
            *self.state.lock() = SessionState::Disconnected;
            self.emit(SessionEvent::Error(err.clone())).await;
        }
        err
    }

    async fn send(&self, mut envelope: Outbound) -> Result<(), TransportError> {
        if *self.state.lock() != SessionState::Connected {
            tracing::warn!(kind = envelope.kind(), "send while not connected");
            self.report(TransportError::NotConnected);
            return Err(TransportError::NotConnected);
        }
        envelope.stamp(Timestamp::now());
        let text = codec::encode(&envelope).map_err(|e| TransportError::Io(e.to_string()))?;

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            drop(guard);
            self.report(TransportError::NotConnected);
            return Err(TransportError::NotConnected);
        };
        let result = sink.send_text(text).await;
        drop(guard);
        if let Err(e) = &result {
            tracing::warn!(kind = envelope.kind(), err = %e, "chat stream send failed");
            self.report(e.clone());
        } else {
            tracing::trace!(kind = envelope.kind(), "envelope sent");
        }
        result
    }

    /// Decode one text frame and forward it.
    async fn dispatch(&self, text: &str) {
        match codec::decode(text) {
            Ok(inbound) => {
                let typing = match &inbound {
                    Inbound::Typing(status) => Some(status.clone()),
                    _ => None,
                };
                self.emit(SessionEvent::Envelope(inbound)).await;
                if let Some(status) = typing {
                    self.emit(SessionEvent::Typing(status)).await;
                }
            }
            Err(e @ (CodecError::Malformed(_) | CodecError::NotAnObject)) => {
                tracing::warn!(err = %e, "unparseable frame");
                self.emit(SessionEvent::Error(TransportError::Malformed(e.to_string())))
                    .await;
            }
            Err(e) => tracing::warn!(err = %e, "dropping malformed envelope"),
        }
    }

    /// Tear down after the reader saw the channel end.
    async fn finish(&self, generation: u64, closure: Closure) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *self.state.lock() = SessionState::Disconnected;
        if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        drop(self.reader.lock().take());
        self.sink.lock().await.take();
        match closure.describe() {
            Some(reason) => tracing::warn!(code = closure.code, %reason, "chat stream lost"),
            None => tracing::info!("chat stream closed by server"),
        }
        self.emit(SessionEvent::Closed(closure)).await;
    }
}

/// Background task that reads frames until the channel ends.
///
/// Read errors carry no useful detail; they end the loop and are reported
/// through the close classification.
async fn reader_loop<D: Dialer>(inner: Arc<Inner<D>>, mut stream: D::Stream, generation: u64) {
    let closure = loop {
        match stream.next_frame().await {
            Some(Ok(Frame::Text(text))) => inner.dispatch(&text).await,
            Some(Ok(Frame::Close { code, reason })) => break Closure { code, reason },
            Some(Err(e)) => {
                tracing::debug!(err = %e, "chat stream read failed");
                break Closure::abnormal();
            }
            None => break Closure::abnormal(),
        }
    };
    inner.finish(generation, closure).await;
    tracing::debug!("chat stream reader exiting");
}

/// Background task that pings at the configured interval.
async fn heartbeat_loop<D: Dialer>(inner: Arc<Inner<D>>, generation: u64) {
    let period = inner.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            break;
        }
        if inner.send(Outbound::ping()).await.is_err() {
            break;
        }
    }
}
