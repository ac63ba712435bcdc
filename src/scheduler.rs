use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::processor::{is_internal_channel, MessageProcessor};
use crate::store::{ConversationFilter, ConversationSummary};
use crate::workflows;

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const MIN_IDLE_HOURS: i64 = 4;

pub fn spawn_survey_scheduler(processor: Arc<MessageProcessor>) {
    tokio::spawn(async move {
        info!("Survey scheduler started");
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            survey_sweep_once(&processor).await;
        }
    });
}

/// Lenient timestamp parser: epoch seconds or milliseconds, RFC 3339, or a
/// naive `YYYY-MM-DD HH:MM:SS` as SQLite's CURRENT_TIMESTAMP emits.
pub fn parse_iso_ts(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = s.parse().ok()?;
        return if s.len() > 10 {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        };
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// All invite gates except the send itself: not an internal channel, nothing
/// awaiting a reply, the last outbound is old enough, no invite within the
/// cooldown window, and no invoice was issued in this chat.
pub async fn survey_eligible(
    processor: &Arc<MessageProcessor>,
    conversation: &ConversationSummary,
    now: DateTime<Utc>,
) -> bool {
    let user_id = &conversation.user_id;
    if is_internal_channel(user_id) {
        return false;
    }
    if conversation.unresponded_count != 0 {
        return false;
    }
    let last_agent_ts = match processor.store.last_agent_message_time(user_id).await {
        Ok(Some(ts)) => ts,
        _ => return false,
    };
    let Some(last_agent) = parse_iso_ts(&last_agent_ts) else {
        return false;
    };
    if now - last_agent < chrono::Duration::hours(MIN_IDLE_HOURS) {
        return false;
    }
    if processor.cache.was_survey_invited_recent(user_id).await {
        return false;
    }
    // On a store error be safe and skip.
    !matches!(processor.store.has_invoice_message(user_id).await, Ok(true) | Err(_))
}

pub async fn survey_sweep_once(processor: &Arc<MessageProcessor>) {
    let conversations = match processor
        .store
        .list_conversations(&ConversationFilter::default())
        .await
    {
        Ok(conversations) => conversations,
        Err(e) => {
            warn!("Survey sweep: listing conversations failed: {e}");
            return;
        }
    };
    let now = Utc::now();
    for conversation in conversations {
        if !survey_eligible(processor, &conversation, now).await {
            continue;
        }
        let user_id = conversation.user_id;
        match workflows::send_survey_invite(processor, &user_id).await {
            Ok(()) => {
                processor.cache.mark_survey_invited(&user_id).await;
                info!("Survey invite sent to {user_id}");
            }
            Err(e) => error!("Survey invite failed for {user_id}: {e}"),
        }
    }
}
