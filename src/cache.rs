use redis::aio::ConnectionManager;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const RECENT_MESSAGES_TTL_SEC: u64 = 3600;
pub const AUTO_REPLY_COOLDOWN_SEC: u64 = 24 * 60 * 60;
pub const SURVEY_INVITE_COOLDOWN_SEC: u64 = 30 * 24 * 60 * 60;
pub const SURVEY_STATE_TTL_SEC: u64 = 3 * 24 * 60 * 60;
pub const WS_EVENTS_CHANNEL: &str = "ws_events";

/// Recent-message cache, cooldown markers, survey state and the cross-instance
/// event bus. The whole tier is advisory: when no cache URL is configured (or
/// the server is unreachable) every operation degrades to a no-op.
pub struct CacheBus {
    client: Option<redis::Client>,
    conn: Option<ConnectionManager>,
}

impl CacheBus {
    pub fn disabled() -> Self {
        CacheBus {
            client: None,
            conn: None,
        }
    }

    pub async fn connect(url: Option<&str>) -> Self {
        let Some(url) = url else {
            return Self::disabled();
        };
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cache URL invalid, running without cache: {e}");
                return Self::disabled();
            }
        };
        match client.get_connection_manager().await {
            Ok(conn) => {
                info!("Cache connected");
                CacheBus {
                    client: Some(client),
                    conn: Some(conn),
                }
            }
            Err(e) => {
                warn!("Cache connection failed, running without cache: {e}");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> Option<ConnectionManager> {
        self.conn.clone()
    }

    /// Push a message to the head of the per-user capped list.
    pub async fn cache_message(&self, user_id: &str, message: &Value) {
        let Some(mut conn) = self.conn() else { return };
        let key = format!("recent_messages:{user_id}");
        let payload = message.to_string();
        let result: redis::RedisResult<()> = redis::pipe()
            .cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(49)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(RECENT_MESSAGES_TTL_SEC)
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            debug!("cache_message failed: {e}");
        }
    }

    pub async fn recent_messages(&self, user_id: &str, limit: usize) -> Vec<Value> {
        let Some(mut conn) = self.conn() else {
            return Vec::new();
        };
        let key = format!("recent_messages:{user_id}");
        let raw: redis::RedisResult<Vec<String>> = redis::cmd("LRANGE")
            .arg(&key)
            .arg(0)
            .arg(limit.saturating_sub(1) as i64)
            .query_async(&mut conn)
            .await;
        match raw {
            Ok(items) => items
                .iter()
                .filter_map(|s| serde_json::from_str(s).ok())
                .collect(),
            Err(e) => {
                debug!("recent_messages failed: {e}");
                Vec::new()
            }
        }
    }

    /// Publish a WebSocket event so other instances can deliver it to their
    /// local sessions.
    pub async fn publish_ws_event(&self, user_id: &str, payload: &Value) {
        let Some(mut conn) = self.conn() else { return };
        let envelope = serde_json::json!({ "user_id": user_id, "payload": payload });
        let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(WS_EVENTS_CHANNEL)
            .arg(envelope.to_string())
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            debug!("publish_ws_event failed: {e}");
        }
    }

    /// Dedicated pub/sub connection for the bus subscriber task.
    pub async fn ws_events_pubsub(&self) -> Option<redis::aio::PubSub> {
        let client = self.client.as_ref()?;
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => match pubsub.subscribe(WS_EVENTS_CHANNEL).await {
                Ok(()) => Some(pubsub),
                Err(e) => {
                    warn!("Bus subscribe failed: {e}");
                    None
                }
            },
            Err(e) => {
                warn!("Bus connection failed: {e}");
                None
            }
        }
    }

    pub async fn cooldown_set(&self, key: &str, ttl_sec: u64) {
        let Some(mut conn) = self.conn() else { return };
        let result: redis::RedisResult<()> = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_sec)
            .arg("1")
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            debug!("cooldown_set failed: {e}");
        }
    }

    pub async fn cooldown_exists(&self, key: &str) -> bool {
        let Some(mut conn) = self.conn() else {
            return false;
        };
        let result: redis::RedisResult<i64> =
            redis::cmd("EXISTS").arg(key).query_async(&mut conn).await;
        matches!(result, Ok(n) if n > 0)
    }

    pub async fn was_auto_reply_recent(&self, user_id: &str) -> bool {
        self.cooldown_exists(&format!("auto_reply_sent:{user_id}")).await
    }

    pub async fn mark_auto_reply_sent(&self, user_id: &str) {
        self.cooldown_set(&format!("auto_reply_sent:{user_id}"), AUTO_REPLY_COOLDOWN_SEC)
            .await;
    }

    pub async fn was_survey_invited_recent(&self, user_id: &str) -> bool {
        self.cooldown_exists(&format!("survey_invited:{user_id}")).await
    }

    pub async fn mark_survey_invited(&self, user_id: &str) {
        self.cooldown_set(&format!("survey_invited:{user_id}"), SURVEY_INVITE_COOLDOWN_SEC)
            .await;
    }

    pub async fn get_json(&self, key: &str) -> Option<Value> {
        let Some(mut conn) = self.conn() else {
            return None;
        };
        let raw: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        match raw {
            Ok(Some(s)) => serde_json::from_str(&s).ok(),
            _ => None,
        }
    }

    pub async fn set_json(&self, key: &str, value: &Value, ttl_sec: Option<u64>) {
        let Some(mut conn) = self.conn() else { return };
        let data = value.to_string();
        let result: redis::RedisResult<()> = match ttl_sec {
            Some(ttl) if ttl > 0 => redis::cmd("SETEX")
                .arg(key)
                .arg(ttl)
                .arg(data)
                .query_async(&mut conn)
                .await,
            _ => redis::cmd("SET").arg(key).arg(data).query_async(&mut conn).await,
        };
        if let Err(e) = result {
            debug!("set_json failed: {e}");
        }
    }

    pub async fn delete(&self, key: &str) {
        let Some(mut conn) = self.conn() else { return };
        let result: redis::RedisResult<()> =
            redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        if let Err(e) = result {
            debug!("delete failed: {e}");
        }
    }

    pub async fn get_survey_state(&self, user_id: &str) -> Option<Value> {
        self.get_json(&format!("survey_state:{user_id}")).await
    }

    pub async fn set_survey_state(&self, user_id: &str, state: &Value, ttl_sec: u64) {
        self.set_json(&format!("survey_state:{user_id}"), state, Some(ttl_sec))
            .await;
    }

    pub async fn clear_survey_state(&self, user_id: &str) {
        self.delete(&format!("survey_state:{user_id}")).await;
    }

    /// Coarse cluster-wide admission counter. Returns the current count for
    /// the window, or `None` when the cache tier is unavailable (callers must
    /// treat that as "allow").
    pub async fn incr_window(&self, key: &str, window_sec: u64) -> Option<i64> {
        let mut conn = self.conn()?;
        let result: redis::RedisResult<(i64,)> = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("EXPIRE")
            .arg(key)
            .arg(window_sec)
            .arg("NX")
            .ignore()
            .query_async(&mut conn)
            .await;
        match result {
            Ok((count,)) => Some(count),
            Err(e) => {
                debug!("incr_window failed: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let cache = CacheBus::disabled();
        assert!(!cache.is_enabled());
        cache
            .cache_message("u1", &serde_json::json!({"body": "hi"}))
            .await;
        assert!(cache.recent_messages("u1", 20).await.is_empty());
        assert!(!cache.was_auto_reply_recent("u1").await);
        assert!(!cache.was_survey_invited_recent("u1").await);
        assert!(cache.get_survey_state("u1").await.is_none());
        assert!(cache.incr_window("rl:test", 60).await.is_none());
        assert!(cache.ws_events_pubsub().await.is_none());
    }
}
