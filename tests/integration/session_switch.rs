//! Integration tests for the session orchestrator: conversation switches,
//! visibility gating, clear markers and the stream event pump.
//!
//! Verifies:
//! 1. History loaded for a conversation that is no longer active is
//!    discarded.
//! 2. A hidden session ignores live traffic; showing it again reloads
//!    history and resumes.
//! 3. A cleared conversation's next history load is swallowed once.
//! 4. Pushed messages reach the timeline and are acknowledged on the wire;
//!    failing acknowledgments never stall the event pump.
//! 5. Reconnects catch up on history; abnormal closes are reported.
//! 6. Typing and read state are scoped to the active conversation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use parley::api::memory::{Call, MemoryChatApi};
use parley::chat::ClearedMarkers;
use parley::session::{ChatSession, SessionSettings};
use parley::sync::Notice;
use parley::transport::loopback::{LoopbackAcceptor, LoopbackDialer, LoopbackServer};
use parley::transport::session::{SessionConfig, TransportSession};
use parley_proto::message::{ConversationId, MessageId, ReadStatus, UserId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ME: i64 = 1;
const BOB: i64 = 2;

type Session = ChatSession<LoopbackDialer, MemoryChatApi>;

struct Harness {
    session: Session,
    notices: mpsc::Receiver<Notice>,
    api: Arc<MemoryChatApi>,
    acceptor: LoopbackAcceptor,
}

fn harness() -> Harness {
    harness_with_events(256)
}

fn harness_with_events(event_buffer: usize) -> Harness {
    let (dialer, acceptor) = LoopbackDialer::create_pair(32);
    let config = SessionConfig {
        heartbeat_interval: Duration::from_secs(3600),
        event_buffer,
        ..SessionConfig::new("http://chat.test", "tok")
    };
    let (transport, events) = TransportSession::new(dialer, config);
    let api = Arc::new(MemoryChatApi::new(UserId::new(ME)));
    let (session, notices) = ChatSession::new(
        transport,
        events,
        Arc::clone(&api),
        ClearedMarkers::in_memory(),
        SessionSettings::new(UserId::new(ME)),
    );
    Harness {
        session,
        notices,
        api,
        acceptor,
    }
}

impl Harness {
    /// Attach the pump, connect, and return the server end.
    async fn online(&mut self) -> LoopbackServer {
        self.session.attach();
        self.session.connect().await.unwrap();
        self.acceptor.accept().await.unwrap()
    }

    fn ids(&self) -> Vec<String> {
        self.session
            .snapshot()
            .iter()
            .map(|m| m.id.as_str().to_string())
            .collect()
    }

    /// Next notice matching `pred`, skipping others.
    async fn expect_notice(&mut self, pred: impl Fn(&Notice) -> bool) -> Notice {
        loop {
            let notice = tokio::time::timeout(Duration::from_secs(5), self.notices.recv())
                .await
                .expect("notice in time")
                .expect("notice channel open");
            if pred(&notice) {
                return notice;
            }
        }
    }

    fn fetches_of(&self, conversation: &str) -> usize {
        self.api
            .calls()
            .iter()
            .filter(|c| {
                matches!(c, Call::FetchPage { conversation: id, cursor: None }
                    if id.as_str() == conversation)
            })
            .count()
    }
}

fn record(id: &str, sender: i64, content: &str, at: i64) -> Value {
    json!({
        "id": id,
        "sender_id": sender,
        "sender_name": if sender == ME { "alice" } else { "bob" },
        "content": content,
        "timestamp": at,
    })
}

fn pushed(id: &str, conversation: &str, sender: i64, content: &str, at: i64) -> Value {
    let mut frame = record(id, sender, content, at);
    frame["type"] = json!("new_message");
    frame["conversation_id"] = json!(conversation);
    frame
}

/// Let spawned tasks run until they block.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(500)).await;
}

fn c(id: &str) -> ConversationId {
    ConversationId::new(id)
}

// ---------------------------------------------------------------------------
// Switching
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn history_of_previous_conversation_is_discarded() {
    let h = harness();
    h.api.set_history(&c("c1"), vec![vec![record("1", BOB, "old", 1_000)]]);
    h.api.set_history(&c("c2"), vec![vec![record("2", BOB, "new", 2_000)]]);
    h.api.set_page_delay(Duration::from_millis(200));

    h.session.switch_to(Some(c("c1")), None).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.session.switch_to(Some(c("c2")), None).await;
    settle().await;

    assert_eq!(h.ids(), ["2"]);
    assert_eq!(h.session.conversation_id(), Some(c("c2")));
}

#[tokio::test(start_paused = true)]
async fn switching_drops_open_edit_and_typing() {
    let mut h = harness();
    let now = parley_proto::message::Timestamp::now().as_millis();
    h.api.set_history(&c("c1"), vec![vec![record("1", ME, "mine", now)]]);
    let mut server = h.online().await;

    h.session.switch_to(Some(c("c1")), None).await;
    settle().await;
    h.session.commands().start_edit(&MessageId::new("1")).await.unwrap();
    h.session.commands().input_changed("typing...").await;
    assert_eq!(server.recv_json().await.unwrap()["is_typing"], true);

    h.session.switch_to(Some(c("c2")), None).await;
    assert_eq!(h.session.editing(), None);
    let stop = server.recv_json().await.unwrap();
    assert_eq!(stop["is_typing"], false);
    assert_eq!(stop["conversation_id"], "c1");
}

#[tokio::test(start_paused = true)]
async fn first_contact_adopts_conversation_and_loads_it() {
    let mut h = harness();
    let server = h.online().await;
    h.session.switch_to(None, Some(UserId::new(BOB))).await;

    server
        .push_json(&pushed("9", "c9", BOB, "hello stranger", 1_000))
        .await;
    settle().await;

    assert_eq!(h.session.conversation_id(), Some(c("c9")));
    assert_eq!(h.ids(), ["9"]);
    assert_eq!(h.fetches_of("c9"), 1);
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn hidden_session_ignores_traffic_until_shown() {
    let mut h = harness();
    let server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;
    h.session.set_visible(false);

    server.push_json(&pushed("1", "c1", BOB, "while away", 1_000)).await;
    server
        .push_json(&json!({"type": "typing_status", "user_id": BOB, "conversation_id": "c1", "is_typing": true}))
        .await;
    settle().await;
    assert!(h.ids().is_empty());
    assert!(h.session.typing_in(&c("c1")).is_empty());

    // the server kept what was pushed while hidden
    h.api
        .set_history(&c("c1"), vec![vec![record("1", BOB, "while away", 1_000)]]);
    h.session.set_visible(true);
    settle().await;
    assert_eq!(h.ids(), ["1"]);
    assert_eq!(h.fetches_of("c1"), 2);

    server.push_json(&pushed("2", "c1", BOB, "back", 2_000)).await;
    settle().await;
    assert_eq!(h.ids(), ["1", "2"]);

    h.session.set_visible(true);
    settle().await;
    assert_eq!(h.fetches_of("c1"), 2);
}

#[tokio::test(start_paused = true)]
async fn detach_stops_applying_events() {
    let mut h = harness();
    let server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;
    h.session.detach().await;

    server.push_json(&pushed("1", "c1", BOB, "ignored", 1_000)).await;
    settle().await;
    assert!(h.ids().is_empty());
    assert!(!h.session.is_visible());
    assert!(h.session.transport().is_connected());
}

// ---------------------------------------------------------------------------
// Clear markers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cleared_conversation_skips_next_history_load() {
    let h = harness();
    h.api.set_history(&c("c1"), vec![vec![record("1", BOB, "hi", 1_000)]]);

    h.session.switch_to(Some(c("c1")), None).await;
    settle().await;
    assert_eq!(h.ids(), ["1"]);

    assert!(h.session.clear(&c("c1")));
    assert!(h.ids().is_empty());

    h.session.switch_to(Some(c("c1")), None).await;
    settle().await;
    assert!(h.ids().is_empty(), "marker swallows one load");

    h.session.reload_history();
    settle().await;
    assert_eq!(h.ids(), ["1"]);
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pushed_message_is_shown_and_acknowledged() {
    let mut h = harness();
    let mut server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;

    server.push_json(&pushed("5", "c1", BOB, "hey", 1_000)).await;

    let notice = h
        .expect_notice(|n| matches!(n, Notice::NewMessage { .. }))
        .await;
    assert_eq!(
        notice,
        Notice::NewMessage {
            conversation_id: Some(c("c1")),
            message_id: MessageId::new("5"),
            sender_name: "bob".into(),
            preview: "hey".into(),
        }
    );
    let receipt = server.recv_json().await.unwrap();
    assert_eq!(receipt["type"], "read_receipt");
    assert_eq!(receipt["message_id"], "5");
    assert_eq!(h.ids(), ["5"]);
}

#[tokio::test(start_paused = true)]
async fn failing_receipts_do_not_stall_a_full_event_channel() {
    let mut h = harness_with_events(1);
    let mut server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;
    server.stop_reading();

    for n in 1..=5 {
        let id = format!("m{n}");
        server
            .push_json(&pushed(&id, "c1", BOB, &format!("burst {n}"), n * 1_000))
            .await;
    }

    h.expect_notice(|n| matches!(n, Notice::NewMessage { message_id, .. } if message_id.as_str() == "m5"))
        .await;
    assert_eq!(h.ids(), ["m1", "m2", "m3", "m4", "m5"]);
}

#[tokio::test(start_paused = true)]
async fn echo_releases_send_latch() {
    let mut h = harness();
    let mut server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;

    h.session.commands().send_text("hello").await.unwrap();
    assert!(h.session.commands().latch().is_held());
    assert_eq!(server.recv_json().await.unwrap()["type"], "chat_message");

    server
        .push_json(&json!({"type": "message_sent", "message_id": 70, "conversation_id": "c1"}))
        .await;
    server.push_json(&pushed("70", "c1", ME, "hello", 1_000)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!h.session.commands().latch().is_held());
    assert_eq!(h.ids(), ["70"]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_catches_up_on_history() {
    let mut h = harness();
    h.api.set_history(&c("c1"), vec![vec![record("1", BOB, "hi", 1_000)]]);
    h.session.attach();
    h.session.switch_to(Some(c("c1")), None).await;
    settle().await;
    assert_eq!(h.fetches_of("c1"), 1);

    h.session.connect().await.unwrap();
    let _server = h.acceptor.accept().await.unwrap();
    h.expect_notice(|n| *n == Notice::Connected).await;
    settle().await;
    assert_eq!(h.fetches_of("c1"), 2);
    assert_eq!(h.ids(), ["1"]);
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_is_reported() {
    let mut h = harness();
    let server = h.online().await;
    server.close(1011, "").await;

    let notice = h
        .expect_notice(|n| matches!(n, Notice::ConnectionLost { .. }))
        .await;
    assert_eq!(
        notice,
        Notice::ConnectionLost {
            reason: "connection closed (code: 1011, internal server error)".into(),
            retry: true,
        }
    );
    assert!(!h.session.transport().is_connected());
}

#[tokio::test(start_paused = true)]
async fn server_error_frame_becomes_notice() {
    let mut h = harness();
    let server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;

    server
        .push_json(&json!({"type": "error", "message": "rate limited"}))
        .await;
    let notice = h
        .expect_notice(|n| matches!(n, Notice::ServerError(_)))
        .await;
    assert_eq!(notice, Notice::ServerError("rate limited".into()));
}

// ---------------------------------------------------------------------------
// Typing and read state
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn typing_is_scoped_to_active_conversation() {
    let mut h = harness();
    let server = h.online().await;
    h.session.switch_to(Some(c("c1")), None).await;

    server
        .push_json(&json!({"type": "typing_status", "user_id": BOB, "conversation_id": "c2", "is_typing": true}))
        .await;
    server
        .push_json(&json!({"type": "typing_status", "user_id": BOB, "conversation_id": "c1", "is_typing": true}))
        .await;

    let notice = h
        .expect_notice(|n| matches!(n, Notice::TypingChanged { .. }))
        .await;
    assert_eq!(
        notice,
        Notice::TypingChanged {
            conversation_id: c("c1"),
            typing: 1,
        }
    );
    assert_eq!(h.session.typing_in(&c("c1")), [UserId::new(BOB)]);
}

#[tokio::test(start_paused = true)]
async fn own_messages_get_read_state_after_history_load() {
    let mut h = harness();
    h.api.set_history(
        &c("c1"),
        vec![vec![
            record("1", BOB, "question", 1_000),
            record("2", ME, "answer", 2_000),
        ]],
    );
    h.api.set_read_status(ReadStatus {
        message_id: MessageId::new("2"),
        total_recipients: 1,
        read_count: 1,
        readers: Vec::new(),
        unread_users: Vec::new(),
    });

    h.session.switch_to(Some(c("c1")), None).await;
    let notice = h
        .expect_notice(|n| matches!(n, Notice::ReadStatusUpdated(_)))
        .await;
    assert_eq!(notice, Notice::ReadStatusUpdated(vec![MessageId::new("2")]));
    assert_eq!(h.session.read_status(&MessageId::new("2")).unwrap().read_count, 1);

    let calls = h.api.calls();
    assert!(calls.contains(&Call::MarkRead {
        conversation: c("c1"),
        up_to: Some(MessageId::new("1")),
    }));
    assert!(calls.contains(&Call::ReadStatus(MessageId::new("2"))));
    assert!(!calls.contains(&Call::ReadStatus(MessageId::new("1"))));
}
