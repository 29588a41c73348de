//! Integration tests for the chat stream session over the loopback dialer.
//!
//! Verifies:
//! 1. Every valid frame surfaces as an envelope; typing frames also surface
//!    as a typing event.
//! 2. Unparseable frames are reported and do not end the stream.
//! 3. Server closes are classified (clean, unreachable, abnormal).
//! 4. A local close is clean and a following connect opens a new channel.
//! 5. The keep-alive pings on its interval.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use parley::transport::loopback::{LoopbackAcceptor, LoopbackDialer, LoopbackServer};
use parley::transport::session::{SessionConfig, SessionEvent, TransportSession};
use parley::transport::{CloseKind, Closure, Frame, SessionState, TransportError};
use parley_proto::envelope::{Inbound, Outbound, Target};
use parley_proto::message::{ConversationId, UserId};
use parley_proto::typing::TypingStatus;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(heartbeat: Duration) -> SessionConfig {
    SessionConfig {
        heartbeat_interval: heartbeat,
        ..SessionConfig::new("https://chat.test", "tok")
    }
}

/// Connect a session and return it with its event receiver and the server
/// end, with the `Connected` event already consumed.
async fn connected(
    heartbeat: Duration,
) -> (
    TransportSession<LoopbackDialer>,
    mpsc::Receiver<SessionEvent>,
    LoopbackServer,
    LoopbackAcceptor,
) {
    let (dialer, mut acceptor) = LoopbackDialer::create_pair(32);
    let (session, mut events) = TransportSession::new(dialer, config(heartbeat));
    session.connect().await.unwrap();
    let server = acceptor.accept().await.unwrap();
    assert_eq!(events.recv().await, Some(SessionEvent::Connected));
    (session, events, server, acceptor)
}

fn closed(event: Option<SessionEvent>) -> Closure {
    match event {
        Some(SessionEvent::Closed(closure)) => closure,
        other => panic!("expected Closed, got {other:?}"),
    }
}

const HOUR: Duration = Duration::from_secs(3600);

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typing_frame_surfaces_twice() {
    let (_session, mut events, server, _acceptor) = connected(HOUR).await;

    server
        .push_json(&json!({
            "type": "typing_status",
            "user_id": "5",
            "conversation_id": 9,
            "is_typing": true,
        }))
        .await;

    let status = TypingStatus {
        user_id: UserId::new(5),
        conversation_id: Some(ConversationId::new("9")),
        is_typing: true,
    };
    assert_eq!(
        events.recv().await,
        Some(SessionEvent::Envelope(Inbound::Typing(status.clone())))
    );
    assert_eq!(events.recv().await, Some(SessionEvent::Typing(status)));
}

#[tokio::test]
async fn malformed_frame_is_reported_and_stream_continues() {
    let (session, mut events, server, _acceptor) = connected(HOUR).await;

    server.push("{not json").await;
    server.push(r#"{"type":"pong"}"#).await;

    assert!(matches!(
        events.recv().await,
        Some(SessionEvent::Error(TransportError::Malformed(_)))
    ));
    assert_eq!(events.recv().await, Some(SessionEvent::Envelope(Inbound::Pong)));
    assert!(session.is_connected());
}

#[tokio::test]
async fn unknown_envelopes_are_passed_through() {
    let (_session, mut events, server, _acceptor) = connected(HOUR).await;
    server.push(r#"{"type":"presence_update","user_id":3}"#).await;
    assert_eq!(
        events.recv().await,
        Some(SessionEvent::Envelope(Inbound::Unknown {
            tag: "presence_update".into()
        }))
    );
}

// ---------------------------------------------------------------------------
// Closure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_close_with_reason_is_abnormal_and_retryable() {
    let (session, mut events, server, _acceptor) = connected(HOUR).await;

    server.close(4001, "token expired").await;

    let closure = closed(events.recv().await);
    assert_eq!(closure.kind(), CloseKind::Abnormal);
    assert!(closure.should_retry());
    assert!(closure.describe().unwrap().contains("token expired"));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn dropped_channel_reads_as_unreachable() {
    let (session, mut events, server, _acceptor) = connected(HOUR).await;

    drop(server);

    let closure = closed(events.recv().await);
    assert_eq!(closure.kind(), CloseKind::ServerUnreachable);
    assert!(!closure.should_retry());
    assert!(!session.is_connected());
}

#[tokio::test]
async fn local_close_is_clean_and_reconnect_opens_new_channel() {
    let (session, mut events, mut server, mut acceptor) = connected(HOUR).await;

    session.close().await;
    assert_eq!(
        server.recv().await,
        Some(Frame::Close {
            code: 1000,
            reason: String::new()
        })
    );
    let closure = closed(events.recv().await);
    assert_eq!(closure.describe(), None);

    let send = session
        .send(Outbound::text(
            "late",
            Target::Conversation {
                conversation_id: ConversationId::new("1"),
            },
        ))
        .await;
    assert_eq!(send, Err(TransportError::NotConnected));
    assert_eq!(
        events.recv().await,
        Some(SessionEvent::Error(TransportError::NotConnected))
    );

    session.connect().await.unwrap();
    let second = acceptor.accept().await.unwrap();
    assert_eq!(events.recv().await, Some(SessionEvent::Connected));
    second.push(r#"{"type":"pong"}"#).await;
    assert_eq!(events.recv().await, Some(SessionEvent::Envelope(Inbound::Pong)));
}

#[tokio::test]
async fn close_while_idle_emits_nothing() {
    let (dialer, _acceptor) = LoopbackDialer::create_pair(8);
    let (session, mut events) = TransportSession::new(dialer, config(HOUR));
    session.close().await;
    assert!(events.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_on_interval() {
    let (_session, _events, mut server, _acceptor) = connected(Duration::from_secs(30)).await;

    let start = tokio::time::Instant::now();
    let first = server.recv_json().await.unwrap();
    assert_eq!(first["type"], "ping");
    assert!(start.elapsed() >= Duration::from_secs(30));

    let second = server.recv_json().await.unwrap();
    assert_eq!(second["type"], "ping");
    assert!(start.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_stops_after_close() {
    let (session, _events, mut server, _acceptor) = connected(Duration::from_secs(30)).await;
    session.close().await;
    assert!(matches!(server.recv().await, Some(Frame::Close { .. })));

    tokio::time::sleep(Duration::from_secs(120)).await;
    // the session dropped its sink, so the channel ends without a ping
    assert_eq!(server.recv().await, None);
}
