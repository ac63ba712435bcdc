use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{
    status_rank, AgentInfo, ConversationFilter, ConversationMeta, ConversationSummary,
    MessageRecord, OrderRecord, Store, ORDER_STATUS_ARCHIVED, ORDER_STATUS_PAYOUT,
};
use crate::error::GatewayError;

const MESSAGE_COLUMNS: &str = "id, upstream_id, temp_id, user_id, body, kind, from_agent, status, \
     price, caption, media_url, media_path, reply_to, quoted_snippet, reaction_target, \
     reaction_emoji, reaction_action, waveform, product_retailer_id, retailer_id, product_id, \
     client_ts, server_ts";

/// Networked backend. Same contract and the same SQL shapes as the embedded
/// store; timestamps stay ISO-8601 TEXT so lexicographic ordering holds on
/// both backends.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = PostgresStore { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), GatewayError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS messages (
                id                  BIGSERIAL PRIMARY KEY,
                upstream_id         TEXT,
                temp_id             TEXT,
                user_id             TEXT NOT NULL,
                body                TEXT,
                kind                TEXT DEFAULT 'text',
                from_agent          INTEGER DEFAULT 0,
                status              TEXT DEFAULT 'sending',
                price               TEXT,
                caption             TEXT,
                media_url           TEXT,
                media_path          TEXT,
                reply_to            TEXT,
                quoted_snippet      TEXT,
                reaction_target     TEXT,
                reaction_emoji      TEXT,
                reaction_action     TEXT,
                waveform            TEXT,
                client_ts           TEXT,
                server_ts           TEXT
            )",
            "CREATE TABLE IF NOT EXISTS users (
                user_id    TEXT PRIMARY KEY,
                name       TEXT,
                phone      TEXT,
                is_admin   INTEGER DEFAULT 0,
                last_seen  TEXT,
                created_at TEXT DEFAULT (CURRENT_TIMESTAMP)::text
            )",
            "CREATE TABLE IF NOT EXISTS agents (
                username      TEXT PRIMARY KEY,
                name          TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                is_admin      INTEGER DEFAULT 0,
                created_at    TEXT DEFAULT (CURRENT_TIMESTAMP)::text
            )",
            "CREATE TABLE IF NOT EXISTS conversation_meta (
                user_id        TEXT PRIMARY KEY,
                assigned_agent TEXT REFERENCES agents(username),
                tags           TEXT,
                avatar_url     TEXT
            )",
            "CREATE TABLE IF NOT EXISTS orders (
                id         BIGSERIAL PRIMARY KEY,
                order_id   TEXT UNIQUE,
                status     TEXT,
                created_at TEXT DEFAULT (CURRENT_TIMESTAMP)::text
            )",
            "CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_msg_upstream ON messages (upstream_id)",
            "CREATE INDEX IF NOT EXISTS idx_msg_user_client_ts ON messages (user_id, client_ts)",
            "CREATE INDEX IF NOT EXISTS idx_msg_user_server_ts ON messages (user_id, server_ts)",
            "CREATE UNIQUE INDEX IF NOT EXISTS uniq_msg_user_upstream ON messages (user_id, upstream_id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS uniq_msg_user_temp ON messages (user_id, temp_id)",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        for (column, col_def) in [
            ("quoted_snippet", "TEXT"),
            ("waveform", "TEXT"),
            ("server_ts", "TEXT"),
            ("product_retailer_id", "TEXT"),
            ("retailer_id", "TEXT"),
            ("product_id", "TEXT"),
        ] {
            self.add_column_if_missing("messages", column, col_def).await?;
        }
        Ok(())
    }

    async fn add_column_if_missing(
        &self,
        table: &str,
        column: &str,
        col_def: &str,
    ) -> Result<(), GatewayError> {
        let exists = sqlx::query(
            "SELECT 1 FROM information_schema.columns WHERE table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&self.pool)
        .await?
        .is_some();
        if !exists {
            sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {col_def}"))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn find_existing(
        &self,
        record: &MessageRecord,
    ) -> Result<Option<MessageRecord>, GatewayError> {
        if let Some(upstream_id) = &record.upstream_id {
            let row = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1 AND upstream_id = $2"
            ))
            .bind(&record.user_id)
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return Ok(Some(row_to_record(&row)?));
            }
        }
        if let Some(temp_id) = &record.temp_id {
            let row = sqlx::query(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1 AND temp_id = $2"
            ))
            .bind(&record.user_id)
            .bind(temp_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                return Ok(Some(row_to_record(&row)?));
            }
        }
        Ok(None)
    }

    async fn update_row(&self, merged: &MessageRecord) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE messages SET
                upstream_id = $1, temp_id = $2, user_id = $3, body = $4, kind = $5,
                from_agent = $6, status = $7, price = $8, caption = $9, media_url = $10,
                media_path = $11, reply_to = $12, quoted_snippet = $13, reaction_target = $14,
                reaction_emoji = $15, reaction_action = $16, waveform = $17,
                product_retailer_id = $18, retailer_id = $19, product_id = $20,
                client_ts = $21, server_ts = $22
             WHERE id = $23",
        )
        .bind(&merged.upstream_id)
        .bind(&merged.temp_id)
        .bind(&merged.user_id)
        .bind(&merged.body)
        .bind(merged.kind_str())
        .bind(merged.from_agent.unwrap_or(false) as i32)
        .bind(merged.status.as_deref().unwrap_or("sending"))
        .bind(&merged.price)
        .bind(&merged.caption)
        .bind(&merged.media_url)
        .bind(&merged.media_path)
        .bind(&merged.reply_to)
        .bind(&merged.quoted_snippet)
        .bind(&merged.reaction_target)
        .bind(&merged.reaction_emoji)
        .bind(&merged.reaction_action)
        .bind(waveform_json(merged))
        .bind(&merged.product_retailer_id)
        .bind(&merged.retailer_id)
        .bind(&merged.product_id)
        .bind(&merged.client_ts)
        .bind(&merged.server_ts)
        .bind(merged.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_row(&self, record: &MessageRecord) -> Result<(), sqlx::Error> {
        let client_ts = record
            .client_ts
            .clone()
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        sqlx::query(
            "INSERT INTO messages (
                upstream_id, temp_id, user_id, body, kind, from_agent, status, price, caption,
                media_url, media_path, reply_to, quoted_snippet, reaction_target, reaction_emoji,
                reaction_action, waveform, product_retailer_id, retailer_id, product_id,
                client_ts, server_ts
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                       $17, $18, $19, $20, $21, $22)",
        )
        .bind(&record.upstream_id)
        .bind(&record.temp_id)
        .bind(&record.user_id)
        .bind(&record.body)
        .bind(record.kind_str())
        .bind(record.from_agent.unwrap_or(false) as i32)
        .bind(record.status.as_deref().unwrap_or("sending"))
        .bind(&record.price)
        .bind(&record.caption)
        .bind(&record.media_url)
        .bind(&record.media_path)
        .bind(&record.reply_to)
        .bind(&record.quoted_snippet)
        .bind(&record.reaction_target)
        .bind(&record.reaction_emoji)
        .bind(&record.reaction_action)
        .bind(waveform_json(record))
        .bind(&record.product_retailer_id)
        .bind(&record.retailer_id)
        .bind(&record.product_id)
        .bind(client_ts)
        .bind(&record.server_ts)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn conversation_meta_inner(
        &self,
        user_id: &str,
    ) -> Result<ConversationMeta, GatewayError> {
        let row = sqlx::query(
            "SELECT assigned_agent, tags, avatar_url FROM conversation_meta WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(ConversationMeta::default());
        };
        let tags: Option<String> = row.try_get("tags")?;
        Ok(ConversationMeta {
            assigned_agent: row.try_get("assigned_agent")?,
            tags: tags
                .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
                .unwrap_or_default(),
            avatar_url: row.try_get("avatar_url")?,
        })
    }

    async fn upsert_meta(
        &self,
        user_id: &str,
        assigned_agent: Option<&str>,
        tags: Option<&[String]>,
        avatar_url: Option<&str>,
    ) -> Result<(), GatewayError> {
        let existing = self.conversation_meta_inner(user_id).await?;
        let new_assignee = assigned_agent
            .map(|a| a.to_string())
            .or(existing.assigned_agent);
        let new_tags = tags.map(|t| t.to_vec()).unwrap_or(existing.tags);
        let new_avatar = avatar_url.map(|a| a.to_string()).or(existing.avatar_url);
        sqlx::query(
            "INSERT INTO conversation_meta (user_id, assigned_agent, tags, avatar_url)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT(user_id) DO UPDATE SET
                assigned_agent = EXCLUDED.assigned_agent,
                tags = EXCLUDED.tags,
                avatar_url = EXCLUDED.avatar_url",
        )
        .bind(user_id)
        .bind(new_assignee)
        .bind(serde_json::to_string(&new_tags)?)
        .bind(new_avatar)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn orders_by_status(&self, status: &str) -> Result<Vec<OrderRecord>, GatewayError> {
        let rows = sqlx::query(
            "SELECT id, order_id, status, created_at FROM orders
             WHERE status = $1 ORDER BY created_at DESC",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(OrderRecord {
                    id: row.try_get("id")?,
                    order_id: row.try_get("order_id")?,
                    status: row.try_get("status")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

fn waveform_json(record: &MessageRecord) -> Option<String> {
    record
        .waveform
        .as_ref()
        .and_then(|w| serde_json::to_string(w).ok())
}

fn row_to_record(row: &PgRow) -> Result<MessageRecord, GatewayError> {
    let waveform: Option<String> = row.try_get("waveform")?;
    let from_agent: Option<i32> = row.try_get("from_agent")?;
    Ok(MessageRecord {
        id: row.try_get("id")?,
        upstream_id: row.try_get("upstream_id")?,
        temp_id: row.try_get("temp_id")?,
        user_id: row.try_get("user_id")?,
        body: row.try_get("body")?,
        kind: row.try_get("kind")?,
        from_agent: from_agent.map(|v| v != 0),
        status: row.try_get("status")?,
        price: row.try_get("price")?,
        caption: row.try_get("caption")?,
        media_url: row.try_get("media_url")?,
        media_path: row.try_get("media_path")?,
        reply_to: row.try_get("reply_to")?,
        quoted_snippet: row.try_get("quoted_snippet")?,
        reaction_target: row.try_get("reaction_target")?,
        reaction_emoji: row.try_get("reaction_emoji")?,
        reaction_action: row.try_get("reaction_action")?,
        waveform: waveform.and_then(|w| serde_json::from_str(&w).ok()),
        product_retailer_id: row.try_get("product_retailer_id")?,
        retailer_id: row.try_get("retailer_id")?,
        product_id: row.try_get("product_id")?,
        client_ts: row.try_get("client_ts")?,
        server_ts: row.try_get("server_ts")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_message(&self, record: &MessageRecord) -> Result<(), GatewayError> {
        if record.user_id.is_empty() {
            return Err(GatewayError::Validation("message row requires a user_id".into()));
        }
        if let Some(existing) = self.find_existing(record).await? {
            let current = existing.status.as_deref().unwrap_or("sending");
            let incoming = record.status.as_deref().unwrap_or(current);
            if status_rank(incoming) < status_rank(current) {
                return Ok(());
            }
            let merged = record.merged_over(&existing);
            return self.update_row(&merged).await;
        }
        match self.insert_row(record).await {
            Ok(()) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                if let Some(existing) = self.find_existing(record).await? {
                    let current = existing.status.as_deref().unwrap_or("sending");
                    let incoming = record.status.as_deref().unwrap_or(current);
                    if status_rank(incoming) < status_rank(current) {
                        return Ok(());
                    }
                    let merged = record.merged_over(&existing);
                    self.update_row(&merged).await
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_messages(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1
             ORDER BY client_ts DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut records: Vec<MessageRecord> = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<_, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn get_messages_since(
        &self,
        user_id: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1 AND client_ts > $2
             ORDER BY client_ts ASC LIMIT $3"
        ))
        .bind(user_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn get_messages_before(
        &self,
        user_id: &str,
        before: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = $1 AND client_ts < $2
             ORDER BY client_ts DESC LIMIT $3"
        ))
        .bind(user_id)
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut records: Vec<MessageRecord> = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<_, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn update_status(&self, upstream_id: &str, status: &str) -> Result<(), GatewayError> {
        let row = sqlx::query("SELECT status FROM messages WHERE upstream_id = $1")
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let current: Option<String> = row.try_get("status")?;
        let current = current.unwrap_or_else(|| "sending".into());
        if status_rank(status) < status_rank(&current) {
            return Ok(());
        }
        sqlx::query("UPDATE messages SET status = $1 WHERE upstream_id = $2")
            .bind(status)
            .bind(upstream_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user_for_message(
        &self,
        upstream_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row = sqlx::query("SELECT user_id FROM messages WHERE upstream_id = $1")
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("user_id")?,
            None => None,
        })
    }

    async fn get_temp_id_for_message(
        &self,
        upstream_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row = sqlx::query("SELECT temp_id FROM messages WHERE upstream_id = $1")
            .bind(upstream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("temp_id")?,
            None => None,
        })
    }

    async fn upsert_user(
        &self,
        user_id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        is_admin: Option<bool>,
    ) -> Result<(), GatewayError> {
        let now = chrono::Utc::now().to_rfc3339();
        match is_admin {
            None => {
                sqlx::query(
                    "INSERT INTO users (user_id, name, phone, last_seen)
                     VALUES ($1, $2, $3, $4)
                     ON CONFLICT(user_id) DO UPDATE SET
                        name = COALESCE(EXCLUDED.name, users.name),
                        phone = COALESCE(EXCLUDED.phone, users.phone),
                        last_seen = EXCLUDED.last_seen",
                )
                .bind(user_id)
                .bind(name)
                .bind(phone)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            Some(admin) => {
                sqlx::query(
                    "INSERT INTO users (user_id, name, phone, is_admin, last_seen)
                     VALUES ($1, $2, $3, $4, $5)
                     ON CONFLICT(user_id) DO UPDATE SET
                        name = COALESCE(EXCLUDED.name, users.name),
                        phone = COALESCE(EXCLUDED.phone, users.phone),
                        is_admin = EXCLUDED.is_admin,
                        last_seen = EXCLUDED.last_seen",
                )
                .bind(user_id)
                .bind(name)
                .bind(phone)
                .bind(admin as i32)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn get_user_phone(&self, user_id: &str) -> Result<Option<String>, GatewayError> {
        let row = sqlx::query("SELECT phone FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("phone")?,
            None => None,
        })
    }

    async fn mark_read(
        &self,
        user_id: &str,
        message_ids: Option<&[String]>,
    ) -> Result<(), GatewayError> {
        match message_ids {
            Some(ids) if !ids.is_empty() => {
                let placeholders = (0..ids.len())
                    .map(|i| format!("${}", i + 2))
                    .collect::<Vec<_>>()
                    .join(",");
                let sql = format!(
                    "UPDATE messages SET status = 'read'
                     WHERE user_id = $1 AND upstream_id IN ({placeholders})"
                );
                let mut query = sqlx::query(&sql).bind(user_id);
                for id in ids {
                    query = query.bind(id);
                }
                query.execute(&self.pool).await?;
            }
            _ => {
                sqlx::query(
                    "UPDATE messages SET status = 'read'
                     WHERE user_id = $1 AND from_agent = 0 AND status != 'read'",
                )
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn get_admin_users(&self) -> Result<Vec<String>, GatewayError> {
        let rows = sqlx::query("SELECT user_id FROM users WHERE is_admin = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("user_id")?))
            .collect()
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let rows = sqlx::query("SELECT DISTINCT user_id FROM messages")
            .fetch_all(&self.pool)
            .await?;
        let user_ids: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>("user_id"))
            .collect::<Result<_, _>>()?;

        let mut conversations = Vec::new();
        for uid in user_ids {
            let user = sqlx::query("SELECT name, phone FROM users WHERE user_id = $1")
                .bind(&uid)
                .fetch_optional(&self.pool)
                .await?;
            let (name, phone) = match &user {
                Some(row) => (row.try_get("name")?, row.try_get("phone")?),
                None => (None, None),
            };
            let last = sqlx::query(
                "SELECT body, COALESCE(server_ts, client_ts) AS ts FROM messages
                 WHERE user_id = $1 ORDER BY COALESCE(server_ts, client_ts) DESC LIMIT 1",
            )
            .bind(&uid)
            .fetch_optional(&self.pool)
            .await?;
            let (last_message, last_message_time) = match &last {
                Some(row) => (row.try_get("body")?, row.try_get("ts")?),
                None => (None, None),
            };
            let unread: i64 = sqlx::query(
                "SELECT COUNT(*) AS c FROM messages
                 WHERE user_id = $1 AND from_agent = 0 AND status != 'read'",
            )
            .bind(&uid)
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
            let last_agent: Option<String> = sqlx::query(
                "SELECT MAX(COALESCE(server_ts, client_ts)) AS t FROM messages
                 WHERE user_id = $1 AND from_agent = 1",
            )
            .bind(&uid)
            .fetch_one(&self.pool)
            .await?
            .try_get("t")?;
            let last_agent = last_agent.unwrap_or_else(|| "1970-01-01".into());
            let unresponded: i64 = sqlx::query(
                "SELECT COUNT(*) AS c FROM messages
                 WHERE user_id = $1 AND from_agent = 0 AND COALESCE(server_ts, client_ts) > $2",
            )
            .bind(&uid)
            .bind(&last_agent)
            .fetch_one(&self.pool)
            .await?
            .try_get("c")?;
            let meta = self.conversation_meta_inner(&uid).await?;

            let summary = ConversationSummary {
                user_id: uid,
                name,
                phone,
                last_message,
                last_message_time,
                unread_count: unread,
                unresponded_count: unresponded,
                avatar: meta.avatar_url,
                assigned_agent: meta.assigned_agent,
                tags: meta.tags,
            };
            if summary.matches(filter) {
                conversations.push(summary);
            }
        }

        conversations.sort_by(|a, b| {
            b.last_message_time
                .as_deref()
                .unwrap_or("")
                .cmp(a.last_message_time.as_deref().unwrap_or(""))
        });
        Ok(conversations)
    }

    async fn last_agent_message_time(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row = sqlx::query(
            "SELECT MAX(COALESCE(server_ts, client_ts)) AS t FROM messages
             WHERE user_id = $1 AND from_agent = 1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("t")?)
    }

    async fn has_invoice_message(&self, user_id: &str) -> Result<bool, GatewayError> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS c FROM messages
             WHERE user_id = $1 AND from_agent = 1 AND kind = 'image'
               AND COALESCE(caption, '') LIKE $2",
        )
        .bind(user_id)
        .bind("%فاتورتك%")
        .fetch_one(&self.pool)
        .await?
        .try_get("c")?;
        Ok(count > 0)
    }

    async fn get_conversation_meta(
        &self,
        user_id: &str,
    ) -> Result<ConversationMeta, GatewayError> {
        self.conversation_meta_inner(user_id).await
    }

    async fn set_conversation_assignment(
        &self,
        user_id: &str,
        agent: Option<&str>,
    ) -> Result<(), GatewayError> {
        self.upsert_meta(user_id, agent, None, None).await
    }

    async fn set_conversation_tags(
        &self,
        user_id: &str,
        tags: &[String],
    ) -> Result<(), GatewayError> {
        self.upsert_meta(user_id, None, Some(tags), None).await
    }

    async fn create_agent(
        &self,
        username: &str,
        name: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO agents (username, name, password_hash, is_admin)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT(username) DO UPDATE SET
                name = EXCLUDED.name,
                password_hash = EXCLUDED.password_hash,
                is_admin = EXCLUDED.is_admin",
        )
        .bind(username)
        .bind(name)
        .bind(password_hash)
        .bind(is_admin as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentInfo>, GatewayError> {
        let rows = sqlx::query(
            "SELECT username, name, is_admin, created_at FROM agents ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(AgentInfo {
                    username: row.try_get("username")?,
                    name: row.try_get("name")?,
                    is_admin: row.try_get::<i32, _>("is_admin")? != 0,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn delete_agent(&self, username: &str) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM agents WHERE username = $1")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_agent_password_hash(
        &self,
        username: &str,
    ) -> Result<Option<String>, GatewayError> {
        let row = sqlx::query("SELECT password_hash FROM agents WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("password_hash")?),
            None => None,
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => row.try_get("value")?,
            None => None,
        })
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT(key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_delivered_order(&self, order_id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO orders (order_id, status) VALUES ($1, $2)
             ON CONFLICT(order_id) DO UPDATE SET status = EXCLUDED.status",
        )
        .bind(order_id)
        .bind(ORDER_STATUS_PAYOUT)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_payout_paid(&self, order_id: &str) -> Result<(), GatewayError> {
        sqlx::query("UPDATE orders SET status = $1 WHERE order_id = $2")
            .bind(ORDER_STATUS_ARCHIVED)
            .bind(order_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_payouts(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.orders_by_status(ORDER_STATUS_PAYOUT).await
    }

    async fn get_archived_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        self.orders_by_status(ORDER_STATUS_ARCHIVED).await
    }
}
