//! Integration tests for outbound commands over a loopback stream and a
//! scripted REST backend.
//!
//! Verifies:
//! 1. Text sends are guarded, go out as `chat_message` envelopes and show a
//!    provisional entry that collapses into the server echo.
//! 2. The send latch blocks a second send until confirmed or timed out.
//! 3. Edits are applied optimistically and rolled back on refusal with
//!    edit mode left open.
//! 4. Recalls show the tombstone first and restore the exact entry on
//!    failure.
//! 5. Replies, media and emoji go through REST and append the confirmed
//!    copy; an uploaded attachment can also go out over the stream.
//! 6. Typing is announced once per burst and stopped after the idle time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use parley::api::memory::{Call, MemoryChatApi, Op};
use parley::api::{ApiError, Editability, MediaPost, MediaUpload, UploadedMedia};
use parley::chat::{CommandBuilder, CommandConfig, SendError};
use parley::sync::Notice;
use parley::sync::engine::{EngineConfig, SyncEngine};
use parley::transport::loopback::{LoopbackDialer, LoopbackServer};
use parley::transport::session::{SessionConfig, SessionEvent, TransportSession};
use parley_proto::codec;
use parley_proto::message::{
    ConversationId, MessageId, MessageKind, RECALL_TOMBSTONE, Timestamp, UserId,
};
use parley_proto::normalize::message_from_value;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const ME: i64 = 1;
const BOB: i64 = 2;

struct Harness {
    commands: CommandBuilder<LoopbackDialer, MemoryChatApi>,
    engine: Arc<Mutex<SyncEngine>>,
    api: Arc<MemoryChatApi>,
    notices: mpsc::Receiver<Notice>,
    server: Option<LoopbackServer>,
    _events: mpsc::Receiver<SessionEvent>,
}

fn conv() -> ConversationId {
    ConversationId::new("c1")
}

async fn harness(connect: bool, conversation: Option<ConversationId>, peer: Option<UserId>) -> Harness {
    let (dialer, mut acceptor) = LoopbackDialer::create_pair(32);
    let config = SessionConfig {
        heartbeat_interval: Duration::from_secs(3600),
        ..SessionConfig::new("http://chat.test", "tok")
    };
    let (transport, events) = TransportSession::new(dialer, config);
    let server = if connect {
        transport.connect().await.unwrap();
        acceptor.accept().await
    } else {
        None
    };

    let mut engine = SyncEngine::new(EngineConfig::new(UserId::new(ME)));
    engine.reset(conversation, peer);
    let engine = Arc::new(Mutex::new(engine));
    let api = Arc::new(MemoryChatApi::new(UserId::new(ME)));
    let (notice_tx, notices) = mpsc::channel(32);
    let commands = CommandBuilder::new(
        transport,
        Arc::clone(&api),
        Arc::clone(&engine),
        notice_tx,
        CommandConfig::default(),
    );
    Harness {
        commands,
        engine,
        api,
        notices,
        server,
        _events: events,
    }
}

impl Harness {
    fn server(&mut self) -> &mut LoopbackServer {
        self.server.as_mut().unwrap()
    }

    fn seed(&self, records: &[Value]) {
        let messages = records
            .iter()
            .map(|r| message_from_value(r, Some(&conv())).unwrap())
            .collect();
        self.engine.lock().ingest_history(messages);
    }

    fn content(&self, id: &str) -> String {
        self.engine
            .lock()
            .message(&MessageId::new(id))
            .unwrap()
            .content
    }
}

fn record(id: &str, sender: i64, content: &str, at: Timestamp) -> Value {
    json!({
        "id": id,
        "sender_id": sender,
        "sender_name": if sender == ME { "alice" } else { "bob" },
        "content": content,
        "timestamp": at.as_millis(),
    })
}

fn recent(id: &str, sender: i64, content: &str) -> Value {
    record(id, sender, content, Timestamp::now())
}

// ---------------------------------------------------------------------------
// Text sends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_guards_report_distinct_reasons() {
    let offline = harness(false, Some(conv()), None).await;
    assert_eq!(offline.commands.send_text("  ").await, Err(SendError::EmptyMessage));
    assert_eq!(offline.commands.send_text("hi").await, Err(SendError::NotConnected));

    let nowhere = harness(true, None, None).await;
    assert_eq!(nowhere.commands.send_text("hi").await, Err(SendError::NoConversation));
}

#[tokio::test]
async fn text_send_goes_out_and_collapses_into_echo() {
    let mut h = harness(true, Some(conv()), None).await;

    let provisional = h.commands.send_text("  hello  ").await.unwrap();
    assert!(provisional.is_provisional());
    assert_eq!(h.content(provisional.as_str()), "hello");

    let frame = h.server().recv_json().await.unwrap();
    assert_eq!(frame["type"], "chat_message");
    assert_eq!(frame["content"], "hello");
    assert_eq!(frame["message_type"], "text");
    assert_eq!(frame["conversation_id"], "c1");
    assert!(frame["timestamp"].as_i64().is_some());

    let echo = codec::decode(
        &json!({
            "type": "new_message",
            "message_id": 501,
            "conversation_id": "c1",
            "sender_id": ME,
            "sender_name": "alice",
            "content": "hello",
        })
        .to_string(),
    )
    .unwrap();
    h.engine.lock().ingest_live(echo);

    let timeline = h.engine.lock().snapshot();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].id, MessageId::new("501"));
}

#[tokio::test]
async fn first_contact_send_targets_receiver() {
    let mut h = harness(true, None, Some(UserId::new(BOB))).await;
    h.commands.send_text("hi bob").await.unwrap();

    let frame = h.server().recv_json().await.unwrap();
    assert_eq!(frame["receiver_id"], BOB);
    assert!(frame.get("conversation_id").is_none());
}

#[tokio::test(start_paused = true)]
async fn latch_blocks_until_release_or_timeout() {
    let h = harness(true, Some(conv()), None).await;

    h.commands.send_text("one").await.unwrap();
    assert_eq!(h.commands.send_text("two").await, Err(SendError::SendInProgress));

    h.commands.latch().release();
    h.commands.send_text("two").await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    h.commands.send_text("three").await.unwrap();
}

// ---------------------------------------------------------------------------
// Edit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn edit_is_confirmed() {
    let mut h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("10", ME, "helo")]);
    let id = MessageId::new("10");

    assert_eq!(h.commands.start_edit(&id).await.unwrap(), "helo");
    assert_eq!(h.commands.submit_edit("hello").await, Ok(id.clone()));

    let message = h.engine.lock().message(&id).unwrap();
    assert_eq!(message.content, "hello");
    assert!(message.is_edited);
    assert_eq!(h.engine.lock().editing(), None);
    assert_eq!(h.notices.recv().await, Some(Notice::EditConfirmed(id.clone())));
    assert_eq!(
        h.api.calls(),
        vec![
            Call::Editable(id.clone()),
            Call::Edit {
                message: id,
                content: "hello".into()
            },
        ]
    );
}

#[tokio::test]
async fn refused_edit_rolls_back_and_stays_in_edit_mode() {
    let mut h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("10", ME, "helo")]);
    let id = MessageId::new("10");
    h.api.fail(
        Op::Edit,
        ApiError::Status {
            status: 403,
            reason: None,
        },
    );

    h.commands.start_edit(&id).await.unwrap();
    assert_eq!(h.commands.submit_edit("hello").await, Err(SendError::NotYourMessage));

    let message = h.engine.lock().message(&id).unwrap();
    assert_eq!(message.content, "helo");
    assert!(!message.is_edited);
    assert_eq!(h.engine.lock().editing(), Some(&id));
    assert_eq!(
        h.notices.recv().await,
        Some(Notice::EditFailed {
            message_id: id.clone(),
            reason: "not your message".into(),
            draft: "helo".into(),
        })
    );

    // edit mode is still open, so a retry goes through once the server agrees
    h.api.succeed(Op::Edit);
    assert_eq!(h.commands.submit_edit("hello").await, Ok(id.clone()));
    assert_eq!(h.content("10"), "hello");
}

#[tokio::test]
async fn edit_preflight_guards() {
    let h = harness(true, Some(conv()), None).await;
    let old = Timestamp::from_millis(Timestamp::now().as_millis() - 10 * 60 * 1_000);
    h.seed(&[
        record("1", ME, "ancient", old),
        recent("2", BOB, "theirs"),
        recent("3", ME, "locked"),
    ]);

    assert_eq!(
        h.commands.start_edit(&MessageId::new("1")).await,
        Err(SendError::EditWindowExpired(Duration::from_secs(120)))
    );
    assert_eq!(
        h.commands.start_edit(&MessageId::new("2")).await,
        Err(SendError::NotYourMessage)
    );
    assert_eq!(
        h.commands.start_edit(&MessageId::new("404")).await,
        Err(SendError::MessageMissing)
    );

    h.api.set_editability(Editability {
        is_editable: false,
        reason: Some("message is pinned".into()),
    });
    assert_eq!(
        h.commands.start_edit(&MessageId::new("3")).await,
        Err(SendError::EditRefused("message is pinned".into()))
    );
    assert_eq!(h.engine.lock().editing(), None);
    assert_eq!(h.commands.submit_edit("x").await, Err(SendError::NotEditing));

    // only the last attempt reached the server
    assert_eq!(h.api.calls(), vec![Call::Editable(MessageId::new("3"))]);
}

#[tokio::test]
async fn cancel_after_failed_submit_keeps_original_text() {
    let h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("10", ME, "draft")]);
    h.api.fail(Op::Edit, ApiError::Request("offline".into()));

    h.commands.start_edit(&MessageId::new("10")).await.unwrap();
    assert!(matches!(
        h.commands.submit_edit("final").await,
        Err(SendError::Api(_))
    ));
    assert_eq!(h.commands.cancel_edit(), Some(MessageId::new("10")));
    assert_eq!(h.content("10"), "draft");
}

// ---------------------------------------------------------------------------
// Recall
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recall_shows_tombstone() {
    let mut h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("7", ME, "oops")]);
    let id = MessageId::new("7");

    h.commands.recall(&id).await.unwrap();
    assert_eq!(h.content("7"), RECALL_TOMBSTONE);
    assert_eq!(h.notices.recv().await, Some(Notice::RecallSucceeded(id.clone())));
    assert_eq!(h.commands.recall(&id).await, Err(SendError::Recalled));
}

#[tokio::test]
async fn failed_recall_restores_exact_entry() {
    let mut h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("7", ME, "keep me")]);
    let id = MessageId::new("7");
    let before = h.engine.lock().message(&id).unwrap();
    h.api.fail(
        Op::Recall,
        ApiError::Status {
            status: 404,
            reason: Some("Not found".into()),
        },
    );

    assert_eq!(h.commands.recall(&id).await, Err(SendError::MessageMissing));
    assert_eq!(h.engine.lock().message(&id).unwrap(), before);
    assert_eq!(
        h.notices.recv().await,
        Some(Notice::RecallFailed {
            message_id: id,
            reason: "message missing".into(),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn recall_confirmed_on_stream_is_kept_when_request_fails() {
    let mut h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("7", ME, "keep me")]);
    let id = MessageId::new("7");
    h.api.set_recall_delay(Duration::from_millis(500));
    h.api.fail(
        Op::Recall,
        ApiError::Status {
            status: 500,
            reason: None,
        },
    );

    let echo = codec::decode(
        &json!({
            "type": "command_message",
            "command_type": "recall",
            "conversation_id": "c1",
            "command_data": {"recalled_message_id": 7},
        })
        .to_string(),
    )
    .unwrap();
    let engine = Arc::clone(&h.engine);
    let (result, ()) = tokio::join!(h.commands.recall(&id), async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.lock().ingest_live(echo);
    });

    assert_eq!(result, Ok(()));
    let entry = h.engine.lock().message(&id).unwrap();
    assert!(entry.is_recalled);
    assert_eq!(entry.content, RECALL_TOMBSTONE);
    assert_eq!(h.notices.recv().await, Some(Notice::RecallSucceeded(id)));
}

// ---------------------------------------------------------------------------
// REST sends
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reply_appends_confirmed_copy_with_quote() {
    let h = harness(true, Some(conv()), None).await;
    h.seed(&[recent("1", BOB, "lunch?")]);
    let quoted = MessageId::new("1");

    let id = h.commands.send_reply("sure", &quoted).await.unwrap();
    assert_eq!(id, MessageId::new("srv-1"));
    assert!(!h.commands.latch().is_held());

    let reply = h.engine.lock().message(&id).unwrap();
    let quote = reply.reply_to.unwrap();
    assert_eq!(quote.content, "lunch?");
    assert_eq!(quote.sender_name, "bob");

    assert_eq!(
        h.commands.send_reply("again", &MessageId::new("404")).await,
        Err(SendError::MessageMissing)
    );
}

#[tokio::test]
async fn media_is_uploaded_then_posted() {
    let h = harness(true, Some(conv()), None).await;
    let upload = MediaUpload {
        kind: MessageKind::Image,
        file_name: "cat.png".into(),
        mime: "image/png".into(),
        bytes: vec![0x89, 0x50],
    };

    let id = h.commands.send_media(upload, Some("look".into())).await.unwrap();
    assert_eq!(h.engine.lock().message(&id).unwrap().kind, MessageKind::Image);
    assert_eq!(
        h.api.calls(),
        vec![
            Call::Upload("cat.png".into()),
            Call::PostMedia {
                conversation: conv(),
                post: MediaPost {
                    kind: MessageKind::Image,
                    media: UploadedMedia {
                        url: "/media/cat.png".into(),
                        duration: None,
                        thumbnail_url: None,
                    },
                    caption: Some("look".into()),
                },
            },
        ]
    );
}

#[tokio::test]
async fn failed_upload_releases_latch() {
    let h = harness(true, Some(conv()), None).await;
    h.api.fail(Op::Upload, ApiError::Request("too large".into()));
    let upload = MediaUpload {
        kind: MessageKind::Video,
        file_name: "clip.mp4".into(),
        mime: "video/mp4".into(),
        bytes: vec![0; 4],
    };

    assert!(matches!(
        h.commands.send_media(upload, None).await,
        Err(SendError::Api(ApiError::Request(_)))
    ));
    assert!(!h.commands.latch().is_held());
    assert!(h.engine.lock().snapshot().is_empty());
}

#[tokio::test]
async fn uploaded_audio_can_go_over_the_stream() {
    let mut h = harness(true, Some(conv()), None).await;
    let media = parley_proto::message::MediaRef {
        url: "/media/note.ogg".into(),
        duration: Some(3.5),
        thumbnail_url: None,
    };

    h.commands
        .send_media_envelope(MessageKind::Audio, &media, " ")
        .await
        .unwrap();
    let frame = h.server().recv_json().await.unwrap();
    assert_eq!(frame["type"], "chat_message");
    assert_eq!(frame["message_type"], "audio");
    assert_eq!(frame["audio_url"], "/media/note.ogg");
    assert_eq!(frame["audio_duration"], 3.5);
    assert_eq!(frame["content"], "");
    assert!(h.commands.latch().is_held());
    // no placeholder: the stream echo is the first copy shown
    assert!(h.engine.lock().snapshot().is_empty());
}

#[tokio::test]
async fn emoji_goes_through_rest() {
    let h = harness(true, Some(conv()), None).await;
    let id = h.commands.send_emoji(":wave:").await.unwrap();
    assert_eq!(h.engine.lock().message(&id).unwrap().kind, MessageKind::Emoji);
    assert_eq!(h.commands.send_emoji(" ").await, Err(SendError::EmptyMessage));
}

// ---------------------------------------------------------------------------
// Typing and read receipts
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn typing_announced_once_and_stopped_when_idle() {
    let mut h = harness(true, Some(conv()), None).await;

    h.commands.input_changed("h").await;
    h.commands.input_changed("he").await;
    h.commands.input_changed("hel").await;

    let start = tokio::time::Instant::now();
    let first = h.server().recv_json().await.unwrap();
    assert_eq!(first["type"], "typing");
    assert_eq!(first["is_typing"], true);
    assert_eq!(first["conversation_id"], "c1");

    let second = h.server().recv_json().await.unwrap();
    assert_eq!(second["is_typing"], false);
    assert!(start.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn clearing_input_stops_typing_at_once() {
    let mut h = harness(true, Some(conv()), None).await;
    h.commands.input_changed("x").await;
    h.commands.input_changed("").await;

    assert_eq!(h.server().recv_json().await.unwrap()["is_typing"], true);
    assert_eq!(h.server().recv_json().await.unwrap()["is_typing"], false);
}

#[tokio::test]
async fn receipts_and_mark_read() {
    let mut h = harness(true, Some(conv()), None).await;

    h.commands
        .send_read_receipt(conv(), MessageId::new("55"))
        .await;
    let frame = h.server().recv_json().await.unwrap();
    assert_eq!(frame["type"], "read_receipt");
    assert_eq!(frame["message_id"], "55");

    h.seed(&[
        record("1", BOB, "a", Timestamp::from_millis(1_000)),
        record("2", BOB, "b", Timestamp::from_millis(2_000)),
        record("3", ME, "c", Timestamp::from_millis(3_000)),
    ]);
    let history = h.engine.lock().snapshot();
    h.commands.mark_history_read(&conv(), &history).await;
    h.commands.mark_history_read(&conv(), &history[2..]).await;
    assert_eq!(
        h.api.calls(),
        vec![
            Call::MarkRead {
                conversation: conv(),
                up_to: Some(MessageId::new("2")),
            },
            Call::MarkRead {
                conversation: conv(),
                up_to: None,
            },
        ]
    );
}
