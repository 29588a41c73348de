//! WebSocket dialer for the chat stream.
//!
//! Opens the stream with `tokio-tungstenite` and splits it into a
//! [`WsSink`] and a [`WsStream`]. Binary, ping and pong frames are handled
//! by the library or ignored; only text and close frames reach the session.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{CLOSE_ABNORMAL, Dialer, Frame, FrameSink, FrameStream, TransportError};

/// Type alias for the underlying WebSocket connection.
type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Write half of a WebSocket stream.
pub struct WsSink(futures_util::stream::SplitSink<Ws, Message>);

/// Read half of a WebSocket stream.
pub struct WsStream(futures_util::stream::SplitStream<Ws>);

/// Dials `ws://` and `wss://` URLs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

impl Dialer for WsDialer {
    type Sink = WsSink;
    type Stream = WsStream;

    async fn dial(&self, url: &str) -> Result<(WsSink, WsStream), TransportError> {
        let (ws, _response) = connect_async(url).await.map_err(map_ws_connect_error)?;
        let (sink, stream) = ws.split();
        Ok((WsSink(sink), WsStream(stream)))
    }
}

impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.0
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame.map_or((CLOSE_ABNORMAL, String::new()), |f| {
                        (u16::from(f.code), f.reason.to_string())
                    });
                    return Some(Ok(Frame::Close { code, reason }));
                }
                Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => {
                    tracing::warn!(err = %e, "chat stream read error");
                    return Some(Err(TransportError::Io(e.to_string())));
                }
            }
        }
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            // DNS/network failures surface as io errors.
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                TransportError::Unreachable(io_err.to_string())
            } else {
                TransportError::Io(io_err.to_string())
            }
        }
        WsError::Tls(_) => TransportError::Io(format!("TLS error: {err}")),
        WsError::Http(response) => TransportError::Rejected(response.status().as_u16()),
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        other => TransportError::Io(format!("chat stream connection error: {other}")),
    }
}
