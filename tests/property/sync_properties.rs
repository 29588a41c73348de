//! Property-based reconciliation tests.
//!
//! Feeds random interleavings of history batches, live messages, edits and
//! recalls through the codec into one engine and checks after every step:
//! 1. No id appears twice in the timeline.
//! 2. The timeline is in non-decreasing creation order.
//! 3. Edited and recalled flags never go back to `false`.
//! 4. Recalled entries always show the tombstone.

use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::{Value, json};

use parley::sync::engine::{EngineConfig, SyncEngine};
use parley_proto::codec;
use parley_proto::message::{ConversationId, MessageId, RECALL_TOMBSTONE, UserId};
use parley_proto::normalize::message_from_value;

// --- Strategies ---

#[derive(Debug, Clone)]
enum Step {
    History(Vec<Value>),
    Live(Value),
    Edit { id: u8, content: String },
    Recall { id: u8 },
}

fn arb_record() -> impl Strategy<Value = Value> {
    (
        0u8..12,
        1i64..4,
        prop::sample::select(vec!["hi", "hello", "ok", "see you"]),
        0i64..20_000,
        any::<bool>(),
    )
        .prop_map(|(id, sender, content, at, edited)| {
            json!({
                "id": id,
                "sender_id": sender,
                "content": content,
                "timestamp": at,
                "is_edited": edited,
            })
        })
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        prop::collection::vec(arb_record(), 0..6).prop_map(Step::History),
        arb_record().prop_map(|mut r| {
            r["type"] = json!("new_message");
            r["conversation_id"] = json!("c1");
            // edited live copies decode as edit events; keep them plain here
            r["is_edited"] = json!(false);
            Step::Live(r)
        }),
        (0u8..12, "[a-z]{1,8}").prop_map(|(id, content)| Step::Edit { id, content }),
        (0u8..12).prop_map(|id| Step::Recall { id }),
    ]
}

// --- Helpers ---

fn apply(engine: &mut SyncEngine, step: Step) {
    let conversation = ConversationId::new("c1");
    match step {
        Step::History(records) => {
            let batch = records
                .iter()
                .filter_map(|r| message_from_value(r, Some(&conversation)).ok())
                .collect();
            engine.ingest_history(batch);
        }
        Step::Live(frame) => live(engine, &frame),
        Step::Edit { id, content } => live(
            engine,
            &json!({
                "type": "command_message",
                "command_type": "edit",
                "conversation_id": "c1",
                "command_data": {"edited_message_id": id, "new_content": content},
            }),
        ),
        Step::Recall { id } => live(
            engine,
            &json!({
                "type": "command_message",
                "command_type": "recall",
                "conversation_id": "c1",
                "command_data": {"recalled_message_id": id},
            }),
        ),
    }
}

fn live(engine: &mut SyncEngine, frame: &Value) {
    if let Ok(inbound) = codec::decode(&frame.to_string()) {
        engine.ingest_live(inbound);
    }
}

// --- Properties ---

proptest! {
    #[test]
    fn timeline_invariants_hold(steps in prop::collection::vec(arb_step(), 1..40)) {
        let mut engine = SyncEngine::new(EngineConfig::new(UserId::new(1)));
        engine.reset(Some(ConversationId::new("c1")), None);
        let mut edited: HashSet<MessageId> = HashSet::new();
        let mut recalled: HashSet<MessageId> = HashSet::new();

        for step in steps {
            apply(&mut engine, step);
            let timeline = engine.snapshot();

            let mut seen = HashSet::new();
            for message in timeline.iter() {
                prop_assert!(
                    seen.insert(message.id.clone()),
                    "duplicate id {}", message.id
                );
            }

            prop_assert!(timeline
                .windows(2)
                .all(|pair| pair[0].created_at <= pair[1].created_at));

            for message in timeline.iter() {
                if edited.contains(&message.id) {
                    prop_assert!(message.is_edited, "edited flag reset on {}", message.id);
                }
                if recalled.contains(&message.id) {
                    prop_assert!(message.is_recalled, "recall reset on {}", message.id);
                }
                if message.is_recalled {
                    prop_assert_eq!(message.content.as_str(), RECALL_TOMBSTONE);
                    recalled.insert(message.id.clone());
                }
                if message.is_edited {
                    edited.insert(message.id.clone());
                }
            }
        }
    }

    #[test]
    fn history_is_idempotent(records in prop::collection::vec(arb_record(), 0..12)) {
        let conversation = ConversationId::new("c1");
        let batch: Vec<_> = records
            .iter()
            .filter_map(|r| message_from_value(r, Some(&conversation)).ok())
            .collect();

        let mut engine = SyncEngine::new(EngineConfig::new(UserId::new(1)));
        engine.reset(Some(conversation), None);
        engine.ingest_history(batch.clone());
        let once = engine.snapshot();
        engine.ingest_history(batch);
        prop_assert_eq!(once, engine.snapshot());
    }
}
