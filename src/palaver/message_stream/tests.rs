//! Reconciler scenarios against the in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;

use super::*;
use crate::gateway::memory::{GatewayOp, MemoryGateway};
use crate::gateway::{ConversationId, Session};
use crate::palaver::Palaver;
use crate::palaver::composer::Draft;
use crate::palaver::retry::RetryPolicy;
use crate::palaver::test_utils::*;

const WAIT: Duration = Duration::from_secs(5);

fn fast_stream_config(max_attempts: u32) -> StreamConfig {
    StreamConfig {
        ordering: AppendOrdering::TrustGateway,
        resubscribe: RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(20),
            backoff_factor: 1,
        },
        update_buffer: 64,
    }
}

async fn setup(stream: StreamConfig) -> (Palaver, Arc<MemoryGateway>, Session, TempDir) {
    let (mut config, logs_temp) = create_test_config();
    config.stream = stream;
    let gateway = Arc::new(MemoryGateway::new());
    gateway.add_user(TEST_EMAIL, TEST_PASSWORD);
    let palaver = Palaver::with_gateway(config, gateway.clone()).unwrap();
    let session = sign_in_test_user(&palaver).await;
    (palaver, gateway, session, logs_temp)
}

async fn wait_for_update(
    updates: &mut broadcast::Receiver<StreamUpdate>,
    mut predicate: impl FnMut(&StreamUpdate) -> bool,
) -> StreamUpdate {
    timeout(WAIT, async {
        loop {
            match updates.recv().await {
                Ok(update) if predicate(&update) => return update,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("update channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for stream update")
}

async fn wait_for_loaded(
    updates: &mut broadcast::Receiver<StreamUpdate>,
    conversation_id: &ConversationId,
) -> usize {
    match wait_for_update(updates, |update| {
        matches!(update, StreamUpdate::Loaded { conversation_id: id, .. } if id == conversation_id)
    })
    .await
    {
        StreamUpdate::Loaded { count, .. } => count,
        _ => unreachable!(),
    }
}

async fn wait_for_appended(
    updates: &mut broadcast::Receiver<StreamUpdate>,
    content: &str,
) -> crate::palaver::messages::Message {
    match wait_for_update(updates, |update| {
        matches!(update, StreamUpdate::Appended { message, .. } if message.content == content)
    })
    .await
    {
        StreamUpdate::Appended { message, .. } => message,
        _ => unreachable!(),
    }
}

async fn wait_for_feed_count(
    gateway: &MemoryGateway,
    conversation_id: &ConversationId,
    expected: usize,
) {
    timeout(WAIT, async {
        while gateway.live_feed_count(conversation_id) != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for live feed count");
}

fn contents(messages: &[crate::palaver::messages::Message]) -> Vec<&str> {
    messages.iter().map(|message| message.content.as_str()).collect()
}

#[tokio::test]
async fn test_history_then_live_inserts() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    let now = Utc::now();
    gateway.add_message(&conversation_id, "bob@example.com", "one", now - chrono::Duration::minutes(2));
    gateway.add_message(&conversation_id, "bob@example.com", "two", now - chrono::Duration::minutes(1));

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;

    assert_eq!(wait_for_loaded(&mut updates, &conversation_id).await, 2);
    assert_eq!(contents(&reconciler.messages().await), vec!["one", "two"]);

    gateway.add_message(&conversation_id, "bob@example.com", "three", Utc::now());
    wait_for_appended(&mut updates, "three").await;

    assert_eq!(
        contents(&reconciler.messages().await),
        vec!["one", "two", "three"]
    );
    assert_eq!(reconciler.selected(), Some(&conversation_id));
}

#[tokio::test]
async fn test_redelivered_insert_is_merged_once() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    let seeded = gateway.add_message(&conversation_id, "bob@example.com", "hello", Utc::now());

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    gateway.redeliver(&conversation_id, seeded.clone());
    gateway.redeliver(&conversation_id, seeded);
    // Feed order guarantees the duplicates were processed before this one
    gateway.add_message(&conversation_id, "bob@example.com", "marker", Utc::now());
    wait_for_appended(&mut updates, "marker").await;

    assert_eq!(contents(&reconciler.messages().await), vec!["hello", "marker"]);
}

#[tokio::test]
async fn test_insert_during_slow_fetch_is_not_lost() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    gateway.add_message(&conversation_id, "bob@example.com", "old", Utc::now());
    gateway.delay_list_messages(&conversation_id, Duration::from_millis(200));

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;

    wait_for_feed_count(&gateway, &conversation_id, 1).await;
    assert!(reconciler.snapshot().await.is_loading());
    gateway.add_message(&conversation_id, "bob@example.com", "during load", Utc::now());

    wait_for_loaded(&mut updates, &conversation_id).await;
    assert_eq!(
        contents(&reconciler.messages().await),
        vec!["old", "during load"]
    );
}

#[tokio::test]
async fn test_switching_discards_slow_fetch_of_previous_selection() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let slow = create_test_conversation(&gateway, "slow");
    let fast = create_test_conversation(&gateway, "fast");
    gateway.add_message(&slow, "bob@example.com", "from slow", Utc::now());
    gateway.add_message(&fast, "bob@example.com", "from fast", Utc::now());
    gateway.delay_list_messages(&slow, Duration::from_millis(300));

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    let mut history = reconciler.subscribe();
    reconciler.select(Some(slow.clone())).await;
    reconciler.select(Some(fast.clone())).await;

    wait_for_loaded(&mut updates, &fast).await;
    // Give the slow fetch time to have completed had it not been cancelled
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(contents(&reconciler.messages().await), vec!["from fast"]);
    assert_eq!(reconciler.selected(), Some(&fast));
    wait_for_feed_count(&gateway, &slow, 0).await;

    // Inserts into the old conversation never reach the stream
    gateway.add_message(&slow, "bob@example.com", "late", Utc::now());
    gateway.add_message(&fast, "bob@example.com", "marker", Utc::now());
    wait_for_appended(&mut updates, "marker").await;
    assert_eq!(
        contents(&reconciler.messages().await),
        vec!["from fast", "marker"]
    );

    while let Ok(update) = history.try_recv() {
        assert!(
            !matches!(&update, StreamUpdate::Loaded { conversation_id, .. } if *conversation_id == slow),
            "stale load published: {:?}",
            update
        );
    }
}

#[tokio::test]
async fn test_fetch_failure_is_distinct_from_loading() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    gateway.fail(GatewayOp::ListMessages);

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;

    let update = wait_for_update(&mut updates, |update| {
        matches!(update, StreamUpdate::Failed { .. })
    })
    .await;
    let StreamUpdate::Failed { reason, .. } = update else {
        unreachable!()
    };
    assert!(reason.contains("ListMessages"));

    match reconciler.snapshot().await {
        StreamState::Failed(state_reason) => assert_eq!(state_reason, reason),
        other => panic!("expected failed state, got {:?}", other),
    }
    assert!(reconciler.messages().await.is_empty());

    // A failed selection does not keep a live feed open
    wait_for_feed_count(&gateway, &conversation_id, 0).await;
}

#[tokio::test]
async fn test_deselect_makes_no_gateway_calls() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(None).await;

    assert_eq!(
        wait_for_update(&mut updates, |_| true).await,
        StreamUpdate::Selected {
            conversation_id: None
        }
    );
    assert_eq!(reconciler.snapshot().await, StreamState::Idle);
    assert_eq!(reconciler.selected(), None);
    assert_eq!(gateway.call_count(GatewayOp::ListMessages), 0);
    assert_eq!(gateway.call_count(GatewayOp::SubscribeInserts), 0);
}

#[tokio::test]
async fn test_deselect_after_selection_clears_stream() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    gateway.add_message(&conversation_id, "bob@example.com", "hi", Utc::now());

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    reconciler.select(None).await;

    assert_eq!(reconciler.snapshot().await, StreamState::Idle);
    wait_for_feed_count(&gateway, &conversation_id, 0).await;
}

#[tokio::test]
async fn test_teardown_closes_live_feed() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;
    assert_eq!(gateway.live_feed_count(&conversation_id), 1);

    reconciler.teardown().await;

    wait_for_feed_count(&gateway, &conversation_id, 0).await;
    assert_eq!(reconciler.snapshot().await, StreamState::Idle);
    assert_eq!(reconciler.selected(), None);
    assert_eq!(
        wait_for_update(&mut updates, |update| matches!(
            update,
            StreamUpdate::Selected { .. }
        ))
        .await,
        StreamUpdate::Selected {
            conversation_id: None
        }
    );
}

#[tokio::test]
async fn test_dropping_reconciler_closes_live_feed() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    drop(reconciler);

    wait_for_feed_count(&gateway, &conversation_id, 0).await;
}

#[tokio::test]
async fn test_dropped_feed_resubscribes_and_recovers_missed_inserts() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(5)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    gateway.add_message(&conversation_id, "bob@example.com", "before", Utc::now());

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    // Keep the feed down long enough for an insert to be missed
    gateway.fail(GatewayOp::SubscribeInserts);
    gateway.drop_feeds(&conversation_id);
    gateway.add_message(&conversation_id, "bob@example.com", "missed", Utc::now());
    gateway.restore(GatewayOp::SubscribeInserts);

    let update = wait_for_update(&mut updates, |update| {
        matches!(update, StreamUpdate::Resynced { .. })
    })
    .await;
    let StreamUpdate::Resynced { added, .. } = update else {
        unreachable!()
    };
    assert_eq!(contents(&added), vec!["missed"]);

    gateway.add_message(&conversation_id, "bob@example.com", "after", Utc::now());
    wait_for_appended(&mut updates, "after").await;

    assert_eq!(
        contents(&reconciler.messages().await),
        vec!["before", "missed", "after"]
    );
    assert!(gateway.call_count(GatewayOp::SubscribeInserts) >= 2);
}

#[tokio::test]
async fn test_live_feed_lost_after_retries_keeps_messages() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(2)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    gateway.add_message(&conversation_id, "bob@example.com", "kept", Utc::now());

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    gateway.fail(GatewayOp::SubscribeInserts);
    gateway.drop_feeds(&conversation_id);

    wait_for_update(&mut updates, |update| {
        matches!(update, StreamUpdate::LiveFeedLost { .. })
    })
    .await;

    assert_eq!(contents(reconciler.snapshot().await.messages()), vec!["kept"]);
    // One initial subscribe plus the two failed retries
    assert_eq!(gateway.call_count(GatewayOp::SubscribeInserts), 3);
}

#[tokio::test]
async fn test_initial_subscribe_failure_recovers() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(5)).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    gateway.fail(GatewayOp::SubscribeInserts);

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    gateway.restore(GatewayOp::SubscribeInserts);
    wait_for_feed_count(&gateway, &conversation_id, 1).await;

    gateway.add_message(&conversation_id, "bob@example.com", "live", Utc::now());
    wait_for_appended(&mut updates, "live").await;
    assert_eq!(contents(&reconciler.messages().await), vec!["live"]);
}

#[tokio::test]
async fn test_sent_message_arrives_through_feed() {
    let (palaver, gateway, session, _logs_temp) = setup(fast_stream_config(3)).await;
    let conversation_id = create_test_conversation(&gateway, "general");

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    let mut draft = Draft::new("  my words ");
    palaver
        .send_text(&session, &conversation_id, &mut draft)
        .await
        .unwrap();

    let echoed = wait_for_appended(&mut updates, "my words").await;
    assert_eq!(echoed.sender, TEST_EMAIL);
    assert_eq!(contents(&reconciler.messages().await), vec!["my words"]);
}

#[tokio::test]
async fn test_sort_by_timestamp_places_late_arrivals() {
    let mut config = fast_stream_config(3);
    config.ordering = AppendOrdering::SortByTimestamp;
    let (palaver, gateway, session, _logs_temp) = setup(config).await;
    let conversation_id = create_test_conversation(&gateway, "general");
    let now = Utc::now();
    gateway.add_message(&conversation_id, "bob@example.com", "first", now - chrono::Duration::minutes(10));
    gateway.add_message(&conversation_id, "bob@example.com", "last", now);

    let mut reconciler = palaver.open_message_stream(&session);
    let mut updates = reconciler.subscribe();
    reconciler.select(Some(conversation_id.clone())).await;
    wait_for_loaded(&mut updates, &conversation_id).await;

    gateway.add_message(
        &conversation_id,
        "bob@example.com",
        "middle",
        now - chrono::Duration::minutes(5),
    );
    wait_for_appended(&mut updates, "middle").await;

    assert_eq!(
        contents(&reconciler.messages().await),
        vec!["first", "middle", "last"]
    );
}
