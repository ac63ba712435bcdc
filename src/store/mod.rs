use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

pub const ORDER_STATUS_PAYOUT: &str = "payout";
pub const ORDER_STATUS_ARCHIVED: &str = "archived";

/// Rank used for status monotonicity. A write carrying a lower-ranked status
/// than the stored one is ignored. `failed` is a terminal sentinel.
pub fn status_rank(status: &str) -> i32 {
    match status {
        "sent" => 1,
        "delivered" => 2,
        "read" => 3,
        "failed" => 99,
        // "sending", "received" and anything unknown rank lowest
        _ => 0,
    }
}

/// Canonical conversational event. All columns except `user_id` are optional
/// so callers can upsert partial payloads (status upgrades, late media URLs)
/// against an existing row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quoted_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_emoji: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reaction_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waveform: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_retailer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retailer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_ts: Option<String>,
}

impl MessageRecord {
    pub fn kind_str(&self) -> &str {
        self.kind.as_deref().unwrap_or("text")
    }

    /// Merge an incoming partial payload over an existing row. Fields the
    /// payload carries win; everything else keeps the stored value.
    pub fn merged_over(&self, existing: &MessageRecord) -> MessageRecord {
        MessageRecord {
            id: existing.id,
            user_id: self.user_id.clone(),
            upstream_id: self.upstream_id.clone().or_else(|| existing.upstream_id.clone()),
            temp_id: self.temp_id.clone().or_else(|| existing.temp_id.clone()),
            body: self.body.clone().or_else(|| existing.body.clone()),
            kind: self.kind.clone().or_else(|| existing.kind.clone()),
            from_agent: self.from_agent.or(existing.from_agent),
            status: self.status.clone().or_else(|| existing.status.clone()),
            price: self.price.clone().or_else(|| existing.price.clone()),
            caption: self.caption.clone().or_else(|| existing.caption.clone()),
            media_url: self.media_url.clone().or_else(|| existing.media_url.clone()),
            media_path: self.media_path.clone().or_else(|| existing.media_path.clone()),
            reply_to: self.reply_to.clone().or_else(|| existing.reply_to.clone()),
            quoted_snippet: self
                .quoted_snippet
                .clone()
                .or_else(|| existing.quoted_snippet.clone()),
            reaction_target: self
                .reaction_target
                .clone()
                .or_else(|| existing.reaction_target.clone()),
            reaction_emoji: self
                .reaction_emoji
                .clone()
                .or_else(|| existing.reaction_emoji.clone()),
            reaction_action: self
                .reaction_action
                .clone()
                .or_else(|| existing.reaction_action.clone()),
            waveform: self.waveform.clone().or_else(|| existing.waveform.clone()),
            product_retailer_id: self
                .product_retailer_id
                .clone()
                .or_else(|| existing.product_retailer_id.clone()),
            retailer_id: self.retailer_id.clone().or_else(|| existing.retailer_id.clone()),
            product_id: self.product_id.clone().or_else(|| existing.product_id.clone()),
            client_ts: self.client_ts.clone().or_else(|| existing.client_ts.clone()),
            server_ts: self.server_ts.clone().or_else(|| existing.server_ts.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub q: Option<String>,
    pub unread_only: bool,
    pub assigned: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub user_id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub last_message: Option<String>,
    pub last_message_time: Option<String>,
    pub unread_count: i64,
    pub unresponded_count: i64,
    pub avatar: Option<String>,
    pub assigned_agent: Option<String>,
    pub tags: Vec<String>,
}

impl ConversationSummary {
    /// In-memory filter application shared by both backends.
    pub(crate) fn matches(&self, filter: &ConversationFilter) -> bool {
        if let Some(q) = &filter.q {
            let haystack = self
                .name
                .as_deref()
                .unwrap_or(&self.user_id)
                .to_lowercase();
            if !haystack.contains(&q.to_lowercase()) {
                return false;
            }
        }
        if filter.unread_only && self.unread_count == 0 {
            return false;
        }
        match filter.assigned.as_deref() {
            Some("unassigned") => {
                if self.assigned_agent.is_some() {
                    return false;
                }
            }
            Some(agent) => {
                if self.assigned_agent.as_deref() != Some(agent) {
                    return false;
                }
            }
            None => {}
        }
        if let Some(tags) = &filter.tags {
            if !tags.iter().all(|t| self.tags.contains(t)) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationMeta {
    pub assigned_agent: Option<String>,
    pub tags: Vec<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub username: String,
    pub name: String,
    pub is_admin: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub id: i64,
    pub order_id: String,
    pub status: String,
    pub created_at: String,
}

/// Durable message/user/conversation/settings persistence. Implemented by an
/// embedded single-file backend and a networked backend behind the same
/// contract.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a message row located by (`user_id`, `upstream_id`)
    /// then (`user_id`, `temp_id`). Status writes are upgrade-only.
    async fn upsert_message(&self, record: &MessageRecord) -> Result<(), GatewayError>;

    /// Newest-first window of `limit` rows at `offset`, reversed to
    /// chronological order for display.
    async fn get_messages(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError>;

    /// Rows with `client_ts` strictly greater than `since`, ascending.
    async fn get_messages_since(
        &self,
        user_id: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError>;

    /// Rows with `client_ts` strictly less than `before`, ascending.
    async fn get_messages_before(
        &self,
        user_id: &str,
        before: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError>;

    /// Monotonic status upgrade keyed by the upstream-assigned id.
    async fn update_status(&self, upstream_id: &str, status: &str) -> Result<(), GatewayError>;

    async fn get_user_for_message(
        &self,
        upstream_id: &str,
    ) -> Result<Option<String>, GatewayError>;

    async fn get_temp_id_for_message(
        &self,
        upstream_id: &str,
    ) -> Result<Option<String>, GatewayError>;

    async fn upsert_user(
        &self,
        user_id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        is_admin: Option<bool>,
    ) -> Result<(), GatewayError>;

    async fn get_user_phone(&self, user_id: &str) -> Result<Option<String>, GatewayError>;

    /// Mark the given inbound upstream ids as read, or every unread inbound
    /// row when `message_ids` is `None`.
    async fn mark_read(
        &self,
        user_id: &str,
        message_ids: Option<&[String]>,
    ) -> Result<(), GatewayError>;

    async fn get_admin_users(&self) -> Result<Vec<String>, GatewayError>;

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, GatewayError>;

    /// ISO timestamp of the newest outbound message for a conversation.
    async fn last_agent_message_time(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, GatewayError>;

    /// Invoice heuristic: an outbound image whose caption contains the Arabic
    /// word for "your invoice".
    async fn has_invoice_message(&self, user_id: &str) -> Result<bool, GatewayError>;

    async fn get_conversation_meta(
        &self,
        user_id: &str,
    ) -> Result<ConversationMeta, GatewayError>;

    async fn set_conversation_assignment(
        &self,
        user_id: &str,
        agent: Option<&str>,
    ) -> Result<(), GatewayError>;

    async fn set_conversation_tags(
        &self,
        user_id: &str,
        tags: &[String],
    ) -> Result<(), GatewayError>;

    async fn create_agent(
        &self,
        username: &str,
        name: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<(), GatewayError>;

    async fn list_agents(&self) -> Result<Vec<AgentInfo>, GatewayError>;

    async fn delete_agent(&self, username: &str) -> Result<(), GatewayError>;

    async fn get_agent_password_hash(
        &self,
        username: &str,
    ) -> Result<Option<String>, GatewayError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, GatewayError>;

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), GatewayError>;

    async fn add_delivered_order(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn mark_payout_paid(&self, order_id: &str) -> Result<(), GatewayError>;

    async fn get_payouts(&self) -> Result<Vec<OrderRecord>, GatewayError>;

    async fn get_archived_orders(&self) -> Result<Vec<OrderRecord>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_rank_ordering() {
        assert!(status_rank("sending") < status_rank("sent"));
        assert!(status_rank("sent") < status_rank("delivered"));
        assert!(status_rank("delivered") < status_rank("read"));
        assert!(status_rank("read") < status_rank("failed"));
        assert_eq!(status_rank("received"), status_rank("sending"));
        assert_eq!(status_rank("bogus"), 0);
    }

    #[test]
    fn test_merged_over_prefers_payload_fields() {
        let existing = MessageRecord {
            id: Some(7),
            user_id: "212600000001".into(),
            temp_id: Some("t_1".into()),
            body: Some("hello".into()),
            kind: Some("text".into()),
            from_agent: Some(true),
            status: Some("sending".into()),
            client_ts: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let payload = MessageRecord {
            user_id: "212600000001".into(),
            upstream_id: Some("wamid.X".into()),
            status: Some("sent".into()),
            ..Default::default()
        };
        let merged = payload.merged_over(&existing);
        assert_eq!(merged.id, Some(7));
        assert_eq!(merged.upstream_id.as_deref(), Some("wamid.X"));
        assert_eq!(merged.temp_id.as_deref(), Some("t_1"));
        assert_eq!(merged.body.as_deref(), Some("hello"));
        assert_eq!(merged.status.as_deref(), Some("sent"));
        assert_eq!(merged.from_agent, Some(true));
    }

    #[test]
    fn test_summary_filters() {
        let summary = ConversationSummary {
            user_id: "212600000001".into(),
            name: Some("Amine".into()),
            phone: None,
            last_message: None,
            last_message_time: None,
            unread_count: 2,
            unresponded_count: 0,
            avatar: None,
            assigned_agent: Some("sara".into()),
            tags: vec!["vip".into(), "shoes".into()],
        };
        assert!(summary.matches(&ConversationFilter {
            q: Some("ami".into()),
            ..Default::default()
        }));
        assert!(!summary.matches(&ConversationFilter {
            q: Some("nope".into()),
            ..Default::default()
        }));
        assert!(summary.matches(&ConversationFilter {
            unread_only: true,
            ..Default::default()
        }));
        assert!(!summary.matches(&ConversationFilter {
            assigned: Some("unassigned".into()),
            ..Default::default()
        }));
        assert!(summary.matches(&ConversationFilter {
            assigned: Some("sara".into()),
            tags: Some(vec!["vip".into()]),
            ..Default::default()
        }));
        assert!(!summary.matches(&ConversationFilter {
            tags: Some(vec!["vip".into(), "bags".into()]),
            ..Default::default()
        }));
    }
}
