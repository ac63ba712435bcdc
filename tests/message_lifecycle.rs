//! Integration tests for the message lifecycle: optimistic send, id
//! reconciliation, status monotonicity and cursor pagination, driven through
//! the crate's public API.

use std::sync::Arc;

use chatrelay::cache::CacheBus;
use chatrelay::catalog::CatalogManager;
use chatrelay::config::Config;
use chatrelay::media::LocalMediaStorage;
use chatrelay::processor::{MessageProcessor, OutgoingMessage};
use chatrelay::registry::ConnectionRegistry;
use chatrelay::shop::ShopClient;
use chatrelay::store::{MessageRecord, SqliteStore, Store};
use chatrelay::whatsapp::WhatsAppClient;

fn test_config() -> Config {
    Config {
        port: 8080,
        base_url: "http://localhost:8080".into(),
        media_dir: std::env::temp_dir()
            .join(format!("chatrelay_it_{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string(),
        db_path: ":memory:".into(),
        database_url: None,
        cache_url: None,
        verify_token: "verify".into(),
        access_token: String::new(),
        phone_number_id: String::new(),
        catalog_id: String::new(),
        wa_max_concurrency: 4,
        send_text_per_min: 30,
        send_media_per_min: 5,
        burst_window_sec: 10,
        enable_ws_pubsub: false,
        auto_reply_catalog_match: false,
        auto_reply_min_score: 0.6,
        auto_reply_test_numbers: Default::default(),
        shop_api_base: None,
        shop_api_token: None,
        log_verbose: false,
    }
}

struct Harness {
    processor: Arc<MessageProcessor>,
    store: Arc<SqliteStore>,
    registry: Arc<ConnectionRegistry>,
}

fn harness() -> Harness {
    let config = test_config();
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let cache = Arc::new(CacheBus::disabled());
    let registry = Arc::new(ConnectionRegistry::new(
        store.clone() as Arc<dyn Store>,
        cache.clone(),
        &config,
    ));
    let processor = Arc::new(MessageProcessor::new(
        registry.clone(),
        cache,
        store.clone() as Arc<dyn Store>,
        Arc::new(WhatsAppClient::new(&config)),
        Arc::new(CatalogManager::new(&config)),
        Arc::new(ShopClient::new(None, None)),
        Arc::new(LocalMediaStorage::new(
            &config.base_url,
            &config.media_dir_path(),
        )),
        &config,
    ));
    Harness {
        processor,
        store,
        registry,
    }
}

#[tokio::test]
async fn optimistic_send_reconciles_on_internal_channel() {
    let h = harness();
    let (_session, mut rx) = h.registry.connect("team:support");

    let record = h
        .processor
        .process_outgoing_message(OutgoingMessage {
            user_id: "team:support".into(),
            kind: Some("text".into()),
            message: Some("shift change at 6".into()),
            temp_id: Some("t_lifecycle".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(record.status.as_deref(), Some("sending"));

    // Exactly one message_sent with the returned temp id...
    let sent = rx.recv().await.unwrap();
    assert_eq!(sent["type"], "message_sent");
    assert_eq!(sent["data"]["temp_id"], "t_lifecycle");

    // ...followed by exactly one sent status update.
    let update = rx.recv().await.unwrap();
    assert_eq!(update["type"], "message_status_update");
    assert_eq!(update["data"]["temp_id"], "t_lifecycle");
    assert_eq!(update["data"]["status"], "sent");
    assert!(rx.try_recv().is_err());

    // The background task persists right after emitting the event.
    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = h.store.get_messages("team:support", 0, 10).await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status.as_deref(), Some("sent"));
}

#[tokio::test]
async fn resend_with_same_temp_id_is_idempotent() {
    let h = harness();
    for _ in 0..3 {
        h.processor
            .process_outgoing_message(OutgoingMessage {
                user_id: "team:support".into(),
                kind: Some("text".into()),
                message: Some("once only".into()),
                temp_id: Some("t_retry".into()),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    // Give the background tasks a chance to settle.
    let mut rows = Vec::new();
    for _ in 0..50 {
        rows = h.store.get_messages("team:support", 0, 10).await.unwrap();
        if !rows.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn receipts_only_upgrade_status() {
    let h = harness();
    let record = MessageRecord {
        user_id: "212600000001".into(),
        temp_id: Some("t_1".into()),
        upstream_id: Some("wamid.X".into()),
        body: Some("hello".into()),
        kind: Some("text".into()),
        from_agent: Some(true),
        status: Some("sent".into()),
        client_ts: Some("2024-01-01T00:00:00Z".into()),
        ..Default::default()
    };
    h.store.upsert_message(&record).await.unwrap();

    // Receipts can arrive reordered; the rank decides.
    h.store.update_status("wamid.X", "read").await.unwrap();
    h.store.update_status("wamid.X", "delivered").await.unwrap();
    h.store.update_status("wamid.X", "sent").await.unwrap();

    let rows = h.store.get_messages("212600000001", 0, 10).await.unwrap();
    assert_eq!(rows[0].status.as_deref(), Some("read"));
}

#[tokio::test]
async fn pagination_windows_stay_chronological() {
    let h = harness();
    for i in 0..120 {
        h.store
            .upsert_message(&MessageRecord {
                user_id: "212600000001".into(),
                temp_id: Some(format!("t_{i}")),
                body: Some(format!("m{i}")),
                kind: Some("text".into()),
                from_agent: Some(i % 2 == 0),
                status: Some("sent".into()),
                client_ts: Some(format!("2024-01-01T00:{:02}:{:02}Z", i / 60, i % 60)),
                ..Default::default()
            })
            .await
            .unwrap();
    }

    let page = h.store.get_messages("212600000001", 50, 50).await.unwrap();
    assert_eq!(page.len(), 50);
    assert_eq!(page.first().unwrap().body.as_deref(), Some("m20"));
    assert_eq!(page.last().unwrap().body.as_deref(), Some("m69"));

    let cursor = page.last().unwrap().client_ts.clone().unwrap();
    let resumed = h
        .store
        .get_messages_since("212600000001", &cursor, 500)
        .await
        .unwrap();
    assert_eq!(resumed.len(), 50);
    assert_eq!(resumed.first().unwrap().body.as_deref(), Some("m70"));
    assert_eq!(resumed.last().unwrap().body.as_deref(), Some("m119"));
}
