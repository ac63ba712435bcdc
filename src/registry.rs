use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheBus;
use crate::config::Config;
use crate::store::Store;

const OFFLINE_QUEUE_CAP: usize = 100;
const OFFLINE_QUEUE_KEEP: usize = 50;

pub type SessionSender = mpsc::UnboundedSender<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendKind {
    Text,
    Media,
}

struct Bucket {
    allowance: f64,
    last: Instant,
}

/// Per-agent token buckets, one per send kind, refilled over monotonic time
/// at `capacity / 60` tokens per second.
pub struct TokenBuckets {
    text_capacity: f64,
    media_capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBuckets {
    pub fn new(text_per_min: u32, media_per_min: u32) -> Self {
        TokenBuckets {
            text_capacity: text_per_min as f64,
            media_capacity: media_per_min as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn consume(&self, agent: &str, kind: SendKind) -> bool {
        self.consume_at(agent, kind, Instant::now())
    }

    fn consume_at(&self, agent: &str, kind: SendKind, now: Instant) -> bool {
        let capacity = match kind {
            SendKind::Text => self.text_capacity,
            SendKind::Media => self.media_capacity,
        };
        let key = format!(
            "{agent}:{}",
            if kind == SendKind::Media { "media" } else { "text" }
        );
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key).or_insert(Bucket {
            allowance: capacity,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.allowance = (bucket.allowance + elapsed * capacity / 60.0).min(capacity);
        bucket.last = now;
        if bucket.allowance < 1.0 {
            return false;
        }
        bucket.allowance -= 1.0;
        true
    }
}

/// Per-user set of live duplex sessions plus the offline queue. Delivery is
/// local; `send_to_user` additionally publishes on the bus so other instances
/// can reach their own sessions.
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<String, HashMap<Uuid, SessionSender>>>,
    offline_queue: Mutex<HashMap<String, Vec<Value>>>,
    pub buckets: TokenBuckets,
    store: Arc<dyn Store>,
    cache: Arc<CacheBus>,
    enable_pubsub: bool,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn Store>, cache: Arc<CacheBus>, config: &Config) -> Self {
        ConnectionRegistry {
            sessions: Mutex::new(HashMap::new()),
            offline_queue: Mutex::new(HashMap::new()),
            buckets: TokenBuckets::new(config.send_text_per_min, config.send_media_per_min),
            store,
            cache,
            enable_pubsub: config.enable_ws_pubsub,
        }
    }

    /// Register a new session and drain any queued payloads into it (FIFO).
    pub fn connect(&self, user_id: &str) -> (Uuid, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        let queued = {
            let mut queue = self.offline_queue.lock().unwrap();
            queue.remove(user_id).unwrap_or_default()
        };
        for payload in queued {
            let _ = tx.send(payload);
        }
        let mut sessions = self.sessions.lock().unwrap();
        let count = {
            let entry = sessions.entry(user_id.to_string()).or_default();
            entry.insert(session_id, tx);
            entry.len()
        };
        info!("User {user_id} connected ({count} sessions)");
        (session_id, rx)
    }

    pub fn disconnect(&self, user_id: &str, session_id: Uuid) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(entry) = sessions.get_mut(user_id) {
            entry.remove(&session_id);
            if entry.is_empty() {
                sessions.remove(user_id);
            }
        }
        info!("User {user_id} disconnected");
    }

    /// Deliver to every live local session for a user; dead sessions are
    /// culled mid-iteration. With no session the payload joins the offline
    /// queue, capped at 100 with the oldest half dropped on overflow.
    pub fn deliver_local(&self, user_id: &str, payload: Value) {
        let senders: Vec<(Uuid, SessionSender)> = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(user_id) {
                Some(entry) => entry.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => Vec::new(),
            }
        };

        if senders.is_empty() {
            let mut queue = self.offline_queue.lock().unwrap();
            let entry = queue.entry(user_id.to_string()).or_default();
            entry.push(payload);
            if entry.len() > OFFLINE_QUEUE_CAP {
                let drop_count = entry.len() - OFFLINE_QUEUE_KEEP;
                entry.drain(..drop_count);
            }
            return;
        }

        let mut dead = Vec::new();
        for (session_id, tx) in senders {
            if tx.send(payload.clone()).is_err() {
                dead.push(session_id);
            }
        }
        for session_id in dead {
            self.disconnect(user_id, session_id);
        }
    }

    /// Deliver to every session of a user except the originating one. Used
    /// for typing echoes between an agent's own tabs.
    pub fn deliver_to_peers(&self, user_id: &str, exclude: Uuid, payload: Value) {
        let senders: Vec<(Uuid, SessionSender)> = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(user_id) {
                Some(entry) => entry
                    .iter()
                    .filter(|(id, _)| **id != exclude)
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };
        let mut dead = Vec::new();
        for (session_id, tx) in senders {
            if tx.send(payload.clone()).is_err() {
                dead.push(session_id);
            }
        }
        for session_id in dead {
            self.disconnect(user_id, session_id);
        }
    }

    /// Local delivery plus, when enabled, a bus publish for other instances.
    pub async fn send_to_user(&self, user_id: &str, payload: Value) {
        self.deliver_local(user_id, payload.clone());
        if self.enable_pubsub {
            self.cache.publish_ws_event(user_id, &payload).await;
        }
    }

    pub async fn broadcast_to_admins(&self, payload: Value, exclude_user: Option<&str>) {
        let admins = match self.store.get_admin_users().await {
            Ok(admins) => admins,
            Err(e) => {
                warn!("Admin lookup failed: {e}");
                return;
            }
        };
        for admin_id in admins {
            if Some(admin_id.as_str()) != exclude_user {
                self.send_to_user(&admin_id, payload.clone()).await;
            }
        }
    }

    pub fn active_users(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    pub fn active_connection_count(&self) -> usize {
        self.sessions.lock().unwrap().values().map(|s| s.len()).sum()
    }
}

/// Long-lived bus subscriber. Events received here are forwarded to LOCAL
/// sessions only and never republished, which keeps the topology loop-free.
pub async fn run_bus_subscriber(registry: Arc<ConnectionRegistry>, cache: Arc<CacheBus>) {
    let Some(mut pubsub) = cache.ws_events_pubsub().await else {
        return;
    };
    info!("Bus subscriber started");
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let raw: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                debug!("Bus payload read failed: {e}");
                continue;
            }
        };
        let Ok(envelope) = serde_json::from_str::<Value>(&raw) else {
            debug!("Bus payload was not JSON");
            continue;
        };
        let user_id = envelope.get("user_id").and_then(|v| v.as_str());
        let payload = envelope.get("payload");
        if let (Some(user_id), Some(payload)) = (user_id, payload) {
            registry.deliver_local(user_id, payload.clone());
        }
    }
    warn!("Bus subscriber stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use serde_json::json;
    use std::time::Duration;

    fn test_registry() -> (ConnectionRegistry, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheBus::disabled());
        let config = Config {
            port: 8080,
            base_url: "http://localhost:8080".into(),
            media_dir: "media".into(),
            db_path: ":memory:".into(),
            database_url: None,
            cache_url: None,
            verify_token: String::new(),
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
        };
        let registry = ConnectionRegistry::new(store.clone() as Arc<dyn Store>, cache, &config);
        (registry, store)
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let (registry, _store) = test_registry();
        let (_session, mut rx) = registry.connect("u1");
        registry.send_to_user("u1", json!({"type": "ping"})).await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], "ping");
    }

    #[tokio::test]
    async fn test_offline_queue_and_drain() {
        let (registry, _store) = test_registry();
        registry.send_to_user("u1", json!({"n": 1})).await;
        registry.send_to_user("u1", json!({"n": 2})).await;

        let (_session, mut rx) = registry.connect("u1");
        assert_eq!(rx.recv().await.unwrap()["n"], 1);
        assert_eq!(rx.recv().await.unwrap()["n"], 2);

        // Queue is drained on connect, not replayed to later sessions.
        let (_session2, mut rx2) = registry.connect("u1");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offline_queue_trims_oldest_on_overflow() {
        let (registry, _store) = test_registry();
        for i in 0..101 {
            registry.deliver_local("u1", json!({"n": i}));
        }
        let (_session, mut rx) = registry.connect("u1");
        let first = rx.recv().await.unwrap();
        // 101 payloads overflow the 100 cap and only the newest 50 survive.
        assert_eq!(first["n"], 51);
        let mut count = 1;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 50);
    }

    #[tokio::test]
    async fn test_multi_session_fanout_and_peer_exclusion() {
        let (registry, _store) = test_registry();
        let (session_a, mut rx_a) = registry.connect("u1");
        let (_session_b, mut rx_b) = registry.connect("u1");

        registry.deliver_local("u1", json!({"type": "message_received"}));
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());

        registry.deliver_to_peers("u1", session_a, json!({"type": "typing"}));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.recv().await.unwrap()["type"], "typing");
    }

    #[tokio::test]
    async fn test_dead_sessions_culled() {
        let (registry, _store) = test_registry();
        let (_session, rx) = registry.connect("u1");
        drop(rx);
        registry.deliver_local("u1", json!({"n": 1}));
        assert!(registry.active_users().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_admins_excludes_sender() {
        let (registry, store) = test_registry();
        store.upsert_user("admin", None, None, Some(true)).await.unwrap();
        store.upsert_user("u1", None, None, Some(false)).await.unwrap();

        let (_a, mut rx_admin) = registry.connect("admin");
        let (_b, mut rx_user) = registry.connect("u1");

        registry
            .broadcast_to_admins(json!({"type": "message_received"}), Some("u1"))
            .await;
        assert!(rx_admin.recv().await.is_some());
        assert!(rx_user.try_recv().is_err());

        registry
            .broadcast_to_admins(json!({"type": "x"}), Some("admin"))
            .await;
        assert!(rx_admin.try_recv().is_err());
    }

    #[test]
    fn test_token_bucket_capacity() {
        let buckets = TokenBuckets::new(30, 5);
        let now = Instant::now();
        for _ in 0..30 {
            assert!(buckets.consume_at("agent", SendKind::Text, now));
        }
        assert!(!buckets.consume_at("agent", SendKind::Text, now));

        for _ in 0..5 {
            assert!(buckets.consume_at("agent", SendKind::Media, now));
        }
        assert!(!buckets.consume_at("agent", SendKind::Media, now));
        // Separate agents have separate buckets.
        assert!(buckets.consume_at("other", SendKind::Media, now));
    }

    #[test]
    fn test_token_bucket_refill() {
        let buckets = TokenBuckets::new(30, 5);
        let start = Instant::now();
        for _ in 0..30 {
            assert!(buckets.consume_at("agent", SendKind::Text, start));
        }
        assert!(!buckets.consume_at("agent", SendKind::Text, start));
        // 30/min refills one token every 2 seconds.
        assert!(buckets.consume_at("agent", SendKind::Text, start + Duration::from_secs(2)));
        assert!(!buckets.consume_at("agent", SendKind::Text, start + Duration::from_secs(2)));
        // A long idle period refills to capacity, not beyond.
        let later = start + Duration::from_secs(600);
        for _ in 0..30 {
            assert!(buckets.consume_at("agent", SendKind::Text, later));
        }
        assert!(!buckets.consume_at("agent", SendKind::Text, later));
    }
}
