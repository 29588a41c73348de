//! Loopback dialer for testing.
//!
//! Uses in-process [`tokio::sync::mpsc`] channels to simulate the chat
//! server. Created via [`LoopbackDialer::create_pair`], which returns the
//! dialer handed to a session and a [`LoopbackAcceptor`] that yields one
//! [`LoopbackServer`] per successful dial.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Dialer, Frame, FrameSink, FrameStream, TransportError};

/// How the next dial should behave.
#[derive(Debug, Clone, Default)]
enum DialMode {
    /// Hand the connection to the acceptor.
    #[default]
    Accept,
    /// Fail with the given error.
    Fail(TransportError),
    /// Never complete.
    Stall,
}

/// Dialer whose connections terminate in the test process.
#[derive(Clone)]
pub struct LoopbackDialer {
    /// Delivers the server end of each new connection.
    accept_tx: mpsc::Sender<LoopbackServer>,
    /// Per-direction channel capacity.
    buffer: usize,
    /// Behavior for the next dial.
    mode: Arc<Mutex<DialMode>>,
    /// URLs dialed so far.
    dialed: Arc<Mutex<Vec<String>>>,
}

/// Receives the server end of each connection opened by a [`LoopbackDialer`].
pub struct LoopbackAcceptor {
    rx: mpsc::Receiver<LoopbackServer>,
}

/// Server end of one loopback connection.
pub struct LoopbackServer {
    /// Frames toward the client.
    tx: mpsc::Sender<Frame>,
    /// Frames the client sent, including its close request.
    rx: mpsc::Receiver<Frame>,
}

/// Client write half.
pub struct LoopbackSink {
    tx: mpsc::Sender<Frame>,
}

/// Client read half.
pub struct LoopbackStream {
    rx: mpsc::Receiver<Frame>,
}

impl LoopbackDialer {
    /// Create a dialer and the acceptor that observes its connections.
    ///
    /// The `buffer` parameter controls the channel capacity for each
    /// direction of every connection.
    #[must_use]
    pub fn create_pair(buffer: usize) -> (Self, LoopbackAcceptor) {
        let (accept_tx, rx) = mpsc::channel(8);
        let dialer = Self {
            accept_tx,
            buffer,
            mode: Arc::new(Mutex::new(DialMode::Accept)),
            dialed: Arc::new(Mutex::new(Vec::new())),
        };
        (dialer, LoopbackAcceptor { rx })
    }

    /// Make subsequent dials fail with `err`.
    pub fn fail_with(&self, err: TransportError) {
        *self.mode.lock() = DialMode::Fail(err);
    }

    /// Make subsequent dials hang until the caller times out.
    pub fn stall(&self) {
        *self.mode.lock() = DialMode::Stall;
    }

    /// Make subsequent dials succeed again.
    pub fn accept(&self) {
        *self.mode.lock() = DialMode::Accept;
    }

    /// URLs dialed so far, in order.
    #[must_use]
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }
}

impl Dialer for LoopbackDialer {
    type Sink = LoopbackSink;
    type Stream = LoopbackStream;

    async fn dial(&self, url: &str) -> Result<(LoopbackSink, LoopbackStream), TransportError> {
        self.dialed.lock().push(url.to_string());
        let mode = self.mode.lock().clone();
        match mode {
            DialMode::Accept => {}
            DialMode::Fail(err) => return Err(err),
            DialMode::Stall => std::future::pending::<()>().await,
        }

        let (to_client, client_rx) = mpsc::channel(self.buffer);
        let (client_tx, from_client) = mpsc::channel(self.buffer);
        let server = LoopbackServer {
            tx: to_client,
            rx: from_client,
        };
        self.accept_tx
            .send(server)
            .await
            .map_err(|_| TransportError::Unreachable("loopback acceptor dropped".into()))?;
        Ok((LoopbackSink { tx: client_tx }, LoopbackStream { rx: client_rx }))
    }
}

impl LoopbackAcceptor {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<LoopbackServer> {
        self.rx.recv().await
    }
}

impl LoopbackServer {
    /// Push a text frame to the client.
    pub async fn push(&self, text: impl Into<String>) -> bool {
        self.tx.send(Frame::Text(text.into())).await.is_ok()
    }

    /// Push a JSON value to the client.
    pub async fn push_json(&self, value: &serde_json::Value) -> bool {
        self.push(value.to_string()).await
    }

    /// Close the connection with a close frame.
    pub async fn close(self, code: u16, reason: &str) {
        let _ = self
            .tx
            .send(Frame::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Stop accepting frames from the client. Later client writes fail
    /// while frames toward the client still flow.
    pub fn stop_reading(&mut self) {
        self.rx.close();
    }

    /// Wait for the next frame from the client.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Wait for the next text frame from the client, parsed as JSON.
    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close { .. } => return None,
            }
        }
    }
}

impl FrameSink for LoopbackSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Text(text))
            .await
            .map_err(|_| TransportError::Io("loopback peer dropped".into()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.tx
            .send(Frame::Close {
                code,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| TransportError::Io("loopback peer dropped".into()))
    }
}

impl FrameStream for LoopbackStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}
