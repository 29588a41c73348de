//! Integration tests for the REST client and paginated history retrieval
//! against a mock backend.
//!
//! Verifies:
//! 1. History pages are followed through `next` cursors, normalized and
//!    returned oldest first.
//! 2. A failed page ends the walk with what was collected so far.
//! 3. Bare-array and missing-results bodies are handled.
//! 4. Error bodies map to the reason shown to the user.
//! 5. Side calls (mark read, read status, emoji) hit the expected endpoints.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley::api::http::HttpChatApi;
use parley::api::{ApiError, ChatApi};
use parley::chat::{HistoryFetcher, SendError};
use parley_proto::message::{ConversationId, MessageId};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const MESSAGES: &str = "/api/chat/conversations/c1/messages/";

fn conv() -> ConversationId {
    ConversationId::new("c1")
}

fn api(server: &MockServer) -> Arc<HttpChatApi> {
    Arc::new(HttpChatApi::new(server.uri(), "tok").unwrap())
}

fn record(id: u64, at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "sender": {"id": 2, "username": "bob"},
        "content": format!("message {id}"),
        "message_type": "text",
        "created_at": at,
    })
}

fn ids(messages: &[parley_proto::message::Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pages_are_followed_and_sorted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MESSAGES))
        .and(query_param("page_size", "2"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                record(3, "2024-01-01T10:03:00Z"),
                record(1, "2024-01-01T10:01:00Z"),
            ],
            "next": format!("{}{MESSAGES}?page=2", server.uri()),
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(MESSAGES))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [record(2, "2024-01-01T10:02:00Z")],
            "next": null,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = HistoryFetcher::new(api(&server), 2);
    let history = fetcher.fetch(&conv()).await.unwrap();

    assert_eq!(ids(&history), ["1", "2", "3"]);
    assert!(history.iter().all(|m| m.conversation_id == Some(conv())));
    assert!(history.iter().all(|m| m.sender_name == "bob"));
    assert!(!fetcher.is_fetching(&conv()));
}

#[tokio::test]
async fn failed_second_page_keeps_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MESSAGES))
        .and(query_param("page_size", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [record(1, "2024-01-01T10:01:00Z")],
            "next": format!("{}{MESSAGES}?page=2", server.uri()),
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(MESSAGES))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"detail": "boom"})))
        .mount(&server)
        .await;

    let history = HistoryFetcher::new(api(&server), 50)
        .fetch(&conv())
        .await
        .unwrap();
    assert_eq!(ids(&history), ["1"]);
}

#[tokio::test]
async fn bare_array_body_is_one_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MESSAGES))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            record(5, "2024-01-01T10:05:00Z"),
            {"id": 6, "message_type": "command", "content": "{}"},
            {"id": 7, "content": "   "},
        ])))
        .mount(&server)
        .await;

    let history = HistoryFetcher::new(api(&server), 50)
        .fetch(&conv())
        .await
        .unwrap();
    assert_eq!(ids(&history), ["5"]);
}

#[tokio::test]
async fn first_page_failure_yields_empty_history() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(MESSAGES))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "bad token"})))
        .mount(&server)
        .await;

    let history = HistoryFetcher::new(api(&server), 50)
        .fetch(&conv())
        .await
        .unwrap();
    assert!(history.is_empty());
}

// ---------------------------------------------------------------------------
// Error bodies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_bodies_map_to_user_reasons() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/chat/messages/5/recall/"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"detail": "not the sender"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/chat/messages/6/edit/"))
        .and(body_json(json!({"content": "new"})))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "too late"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/chat/messages/7/editable/"))
        .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
        .mount(&server)
        .await;

    let api = api(&server);

    let recall = api.recall(&MessageId::new("5")).await.unwrap_err();
    assert_eq!(
        recall,
        ApiError::Status {
            status: 403,
            reason: Some("not the sender".into())
        }
    );
    assert_eq!(SendError::from_api(recall), SendError::NotYourMessage);

    let edit = api.edit(&MessageId::new("6"), "new").await.unwrap_err();
    assert_eq!(SendError::from_api(edit), SendError::Rejected("too late".into()));

    let editable = api.editable(&MessageId::new("7")).await.unwrap_err();
    assert_eq!(editable.reason(), None);
    assert_eq!(SendError::from_api(editable), SendError::MessageMissing);
}

// ---------------------------------------------------------------------------
// Side calls
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mark_read_names_newest_message_or_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/conversations/c1/mark_read/"))
        .and(body_json(json!({"message_id": "9"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/chat/conversations/c1/mark_read/"))
        .and(body_json(json!({})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = api(&server);
    api.mark_read(&conv(), Some(&MessageId::new("9"))).await.unwrap();
    api.mark_read(&conv(), None).await.unwrap();
}

#[tokio::test]
async fn read_status_is_keyed_by_requested_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chat/messages/12/read_status/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total_recipients": 3,
            "read_count": 2,
            "readers": [{"user_id": 2, "username": "bob", "read_at": "2024-01-01T10:00:00Z"}],
            "unread_users": [{"user_id": 4, "username": "dan"}],
        })))
        .mount(&server)
        .await;

    let status = api(&server)
        .read_status(&MessageId::new("12"))
        .await
        .unwrap();
    assert_eq!(status.message_id, MessageId::new("12"));
    assert_eq!((status.read_count, status.total_recipients), (2, 3));
    assert_eq!(status.readers[0].username, "bob");
    assert_eq!(status.unread_users.len(), 1);
}

#[tokio::test]
async fn emoji_posts_code_to_emoji_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat/conversations/c1/emoji_message/"))
        .and(body_json(json!({"emoji_code": ":wave:"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 40,
            "sender_id": 1,
            "content": ":wave:",
            "message_type": "emoji",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let post = parley::api::MediaPost {
        kind: parley_proto::message::MessageKind::Emoji,
        media: parley::api::UploadedMedia {
            url: ":wave:".into(),
            duration: None,
            thumbnail_url: None,
        },
        caption: None,
    };
    let body = api(&server).post_media(&conv(), &post).await.unwrap();
    assert_eq!(body["id"], 40);
}
