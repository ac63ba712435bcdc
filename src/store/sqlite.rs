use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    status_rank, AgentInfo, ConversationFilter, ConversationMeta, ConversationSummary,
    MessageRecord, OrderRecord, Store, ORDER_STATUS_ARCHIVED, ORDER_STATUS_PAYOUT,
};
use crate::error::GatewayError;

const MESSAGE_COLUMNS: &str = "id, upstream_id, temp_id, user_id, body, kind, from_agent, status, \
     price, caption, media_url, media_path, reply_to, quoted_snippet, reaction_target, \
     reaction_emoji, reaction_action, waveform, product_retailer_id, retailer_id, product_id, \
     client_ts, server_ts";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(db_path: &str) -> Result<Self, GatewayError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, GatewayError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), GatewayError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
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
        );

        CREATE TABLE IF NOT EXISTS users (
            user_id    TEXT PRIMARY KEY,
            name       TEXT,
            phone      TEXT,
            is_admin   INTEGER DEFAULT 0,
            last_seen  TEXT,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS agents (
            username      TEXT PRIMARY KEY,
            name          TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            is_admin      INTEGER DEFAULT 0,
            created_at    TEXT DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS conversation_meta (
            user_id        TEXT PRIMARY KEY,
            assigned_agent TEXT REFERENCES agents(username),
            tags           TEXT,
            avatar_url     TEXT
        );

        CREATE TABLE IF NOT EXISTS orders (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            order_id   TEXT UNIQUE,
            status     TEXT,
            created_at TEXT DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_msg_upstream
            ON messages (upstream_id);
        CREATE INDEX IF NOT EXISTS idx_msg_user_client_ts
            ON messages (user_id, client_ts);
        CREATE UNIQUE INDEX IF NOT EXISTS uniq_msg_user_upstream
            ON messages (user_id, upstream_id);
        CREATE UNIQUE INDEX IF NOT EXISTS uniq_msg_user_temp
            ON messages (user_id, temp_id);",
    )?;

    // Deployments created before these columns existed get them added here.
    // Additive only; columns are never dropped or renamed.
    add_column_if_missing(conn, "messages", "quoted_snippet", "TEXT")?;
    add_column_if_missing(conn, "messages", "waveform", "TEXT")?;
    add_column_if_missing(conn, "messages", "server_ts", "TEXT")?;
    add_column_if_missing(conn, "messages", "product_retailer_id", "TEXT")?;
    add_column_if_missing(conn, "messages", "retailer_id", "TEXT")?;
    add_column_if_missing(conn, "messages", "product_id", "TEXT")?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_msg_user_server_ts ON messages (user_id, server_ts)",
        [],
    )?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    col_def: &str,
) -> Result<(), GatewayError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {col_def}"),
            [],
        )?;
    }
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let waveform: Option<String> = row.get(17)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        upstream_id: row.get(1)?,
        temp_id: row.get(2)?,
        user_id: row.get(3)?,
        body: row.get(4)?,
        kind: row.get(5)?,
        from_agent: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
        status: row.get(7)?,
        price: row.get(8)?,
        caption: row.get(9)?,
        media_url: row.get(10)?,
        media_path: row.get(11)?,
        reply_to: row.get(12)?,
        quoted_snippet: row.get(13)?,
        reaction_target: row.get(14)?,
        reaction_emoji: row.get(15)?,
        reaction_action: row.get(16)?,
        waveform: waveform.and_then(|w| serde_json::from_str(&w).ok()),
        product_retailer_id: row.get(18)?,
        retailer_id: row.get(19)?,
        product_id: row.get(20)?,
        client_ts: row.get(21)?,
        server_ts: row.get(22)?,
    })
}

fn waveform_json(record: &MessageRecord) -> Option<String> {
    record
        .waveform
        .as_ref()
        .and_then(|w| serde_json::to_string(w).ok())
}

fn find_existing(
    conn: &Connection,
    record: &MessageRecord,
) -> Result<Option<MessageRecord>, GatewayError> {
    if let Some(upstream_id) = &record.upstream_id {
        let found = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1 AND upstream_id = ?2"
                ),
                params![record.user_id, upstream_id],
                row_to_record,
            )
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    if let Some(temp_id) = &record.temp_id {
        let found = conn
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1 AND temp_id = ?2"
                ),
                params![record.user_id, temp_id],
                row_to_record,
            )
            .optional()?;
        return Ok(found);
    }
    Ok(None)
}

fn update_row(conn: &Connection, merged: &MessageRecord) -> Result<(), GatewayError> {
    conn.execute(
        "UPDATE messages SET
            upstream_id = ?1, temp_id = ?2, user_id = ?3, body = ?4, kind = ?5,
            from_agent = ?6, status = ?7, price = ?8, caption = ?9, media_url = ?10,
            media_path = ?11, reply_to = ?12, quoted_snippet = ?13, reaction_target = ?14,
            reaction_emoji = ?15, reaction_action = ?16, waveform = ?17,
            product_retailer_id = ?18, retailer_id = ?19, product_id = ?20,
            client_ts = ?21, server_ts = ?22
         WHERE id = ?23",
        params![
            merged.upstream_id,
            merged.temp_id,
            merged.user_id,
            merged.body,
            merged.kind_str(),
            merged.from_agent.unwrap_or(false) as i64,
            merged.status.as_deref().unwrap_or("sending"),
            merged.price,
            merged.caption,
            merged.media_url,
            merged.media_path,
            merged.reply_to,
            merged.quoted_snippet,
            merged.reaction_target,
            merged.reaction_emoji,
            merged.reaction_action,
            waveform_json(merged),
            merged.product_retailer_id,
            merged.retailer_id,
            merged.product_id,
            merged.client_ts,
            merged.server_ts,
            merged.id,
        ],
    )?;
    Ok(())
}

fn insert_row(conn: &Connection, record: &MessageRecord) -> Result<(), rusqlite::Error> {
    let client_ts = record
        .client_ts
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    conn.execute(
        "INSERT INTO messages (
            upstream_id, temp_id, user_id, body, kind, from_agent, status, price, caption,
            media_url, media_path, reply_to, quoted_snippet, reaction_target, reaction_emoji,
            reaction_action, waveform, product_retailer_id, retailer_id, product_id,
            client_ts, server_ts
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
        params![
            record.upstream_id,
            record.temp_id,
            record.user_id,
            record.body,
            record.kind_str(),
            record.from_agent.unwrap_or(false) as i64,
            record.status.as_deref().unwrap_or("sending"),
            record.price,
            record.caption,
            record.media_url,
            record.media_path,
            record.reply_to,
            record.quoted_snippet,
            record.reaction_target,
            record.reaction_emoji,
            record.reaction_action,
            waveform_json(record),
            record.product_retailer_id,
            record.retailer_id,
            record.product_id,
            client_ts,
            record.server_ts,
        ],
    )?;
    Ok(())
}

fn upsert_message_sync(conn: &Connection, record: &MessageRecord) -> Result<(), GatewayError> {
    if record.user_id.is_empty() {
        return Err(GatewayError::Validation("message row requires a user_id".into()));
    }

    if let Some(existing) = find_existing(conn, record)? {
        let current = existing.status.as_deref().unwrap_or("sending");
        let incoming = record.status.as_deref().unwrap_or(current);
        if status_rank(incoming) < status_rank(current) {
            return Ok(()); // downgrade, ignore
        }
        let merged = record.merged_over(&existing);
        return update_row(conn, &merged);
    }

    match insert_row(conn, record) {
        Ok(()) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // Concurrent insert won the unique index; retry as an update.
            if let Some(existing) = find_existing(conn, record)? {
                let current = existing.status.as_deref().unwrap_or("sending");
                let incoming = record.status.as_deref().unwrap_or(current);
                if status_rank(incoming) < status_rank(current) {
                    return Ok(());
                }
                let merged = record.merged_over(&existing);
                update_row(conn, &merged)
            } else {
                Ok(())
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_message(&self, record: &MessageRecord) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        upsert_message_sync(&conn, record)
    }

    async fn get_messages(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1
             ORDER BY client_ts DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let mut rows: Vec<MessageRecord> = stmt
            .query_map(params![user_id, limit as i64, offset as i64], row_to_record)?
            .collect::<Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    async fn get_messages_since(
        &self,
        user_id: &str,
        since: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1 AND client_ts > ?2
             ORDER BY client_ts ASC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![user_id, since, limit as i64], row_to_record)?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    async fn get_messages_before(
        &self,
        user_id: &str,
        before: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1 AND client_ts < ?2
             ORDER BY client_ts DESC LIMIT ?3"
        ))?;
        let mut rows: Vec<MessageRecord> = stmt
            .query_map(params![user_id, before, limit as i64], row_to_record)?
            .collect::<Result<_, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    async fn update_status(&self, upstream_id: &str, status: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM messages WHERE upstream_id = ?1",
                params![upstream_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(()); // unknown id, drop
        };
        if status_rank(status) < status_rank(&current) {
            return Ok(());
        }
        conn.execute(
            "UPDATE messages SET status = ?1 WHERE upstream_id = ?2",
            params![status, upstream_id],
        )?;
        Ok(())
    }

    async fn get_user_for_message(
        &self,
        upstream_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let user_id = conn
            .query_row(
                "SELECT user_id FROM messages WHERE upstream_id = ?1",
                params![upstream_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    async fn get_temp_id_for_message(
        &self,
        upstream_id: &str,
    ) -> Result<Option<String>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let temp_id = conn
            .query_row(
                "SELECT temp_id FROM messages WHERE upstream_id = ?1",
                params![upstream_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(temp_id)
    }

    async fn upsert_user(
        &self,
        user_id: &str,
        name: Option<&str>,
        phone: Option<&str>,
        is_admin: Option<bool>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        match is_admin {
            None => {
                conn.execute(
                    "INSERT INTO users (user_id, name, phone, last_seen)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                        name = COALESCE(excluded.name, users.name),
                        phone = COALESCE(excluded.phone, users.phone),
                        last_seen = excluded.last_seen",
                    params![user_id, name, phone, now],
                )?;
            }
            Some(admin) => {
                conn.execute(
                    "INSERT INTO users (user_id, name, phone, is_admin, last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(user_id) DO UPDATE SET
                        name = COALESCE(excluded.name, users.name),
                        phone = COALESCE(excluded.phone, users.phone),
                        is_admin = excluded.is_admin,
                        last_seen = excluded.last_seen",
                    params![user_id, name, phone, admin as i64, now],
                )?;
            }
        }
        Ok(())
    }

    async fn get_user_phone(&self, user_id: &str) -> Result<Option<String>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let phone: Option<Option<String>> = conn
            .query_row(
                "SELECT phone FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(phone.flatten())
    }

    async fn mark_read(
        &self,
        user_id: &str,
        message_ids: Option<&[String]>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        match message_ids {
            Some(ids) if !ids.is_empty() => {
                let placeholders = (0..ids.len())
                    .map(|i| format!("?{}", i + 2))
                    .collect::<Vec<_>>()
                    .join(",");
                let sql = format!(
                    "UPDATE messages SET status = 'read'
                     WHERE user_id = ?1 AND upstream_id IN ({placeholders})"
                );
                let mut values: Vec<&dyn rusqlite::ToSql> = vec![&user_id];
                for id in ids {
                    values.push(id);
                }
                conn.execute(&sql, values.as_slice())?;
            }
            _ => {
                conn.execute(
                    "UPDATE messages SET status = 'read'
                     WHERE user_id = ?1 AND from_agent = 0 AND status != 'read'",
                    params![user_id],
                )?;
            }
        }
        Ok(())
    }

    async fn get_admin_users(&self) -> Result<Vec<String>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT user_id FROM users WHERE is_admin = 1")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(users)
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT user_id FROM messages")?;
        let user_ids: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        let mut conversations = Vec::new();
        for uid in user_ids {
            let user: Option<(Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT name, phone FROM users WHERE user_id = ?1",
                    params![uid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let last: Option<(Option<String>, Option<String>)> = conn
                .query_row(
                    "SELECT body, COALESCE(server_ts, client_ts) AS ts FROM messages
                     WHERE user_id = ?1 ORDER BY COALESCE(server_ts, client_ts) DESC LIMIT 1",
                    params![uid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let unread: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE user_id = ?1 AND from_agent = 0 AND status != 'read'",
                params![uid],
                |row| row.get(0),
            )?;
            let last_agent: Option<String> = conn.query_row(
                "SELECT MAX(COALESCE(server_ts, client_ts)) FROM messages
                 WHERE user_id = ?1 AND from_agent = 1",
                params![uid],
                |row| row.get(0),
            )?;
            let last_agent = last_agent.unwrap_or_else(|| "1970-01-01".into());
            let unresponded: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE user_id = ?1 AND from_agent = 0 AND COALESCE(server_ts, client_ts) > ?2",
                params![uid, last_agent],
                |row| row.get(0),
            )?;
            let meta = conversation_meta_sync(&conn, &uid)?;

            let (name, phone) = user.unwrap_or((None, None));
            let (last_message, last_message_time) = last.unwrap_or((None, None));
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
        let conn = self.conn.lock().unwrap();
        let ts: Option<String> = conn.query_row(
            "SELECT MAX(COALESCE(server_ts, client_ts)) FROM messages
             WHERE user_id = ?1 AND from_agent = 1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(ts)
    }

    async fn has_invoice_message(&self, user_id: &str) -> Result<bool, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE user_id = ?1 AND from_agent = 1 AND kind = 'image'
               AND COALESCE(caption, '') LIKE ?2",
            params![user_id, "%فاتورتك%"],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn get_conversation_meta(
        &self,
        user_id: &str,
    ) -> Result<ConversationMeta, GatewayError> {
        let conn = self.conn.lock().unwrap();
        conversation_meta_sync(&conn, user_id)
    }

    async fn set_conversation_assignment(
        &self,
        user_id: &str,
        agent: Option<&str>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        upsert_meta_sync(&conn, user_id, agent, None, None)
    }

    async fn set_conversation_tags(
        &self,
        user_id: &str,
        tags: &[String],
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        upsert_meta_sync(&conn, user_id, None, Some(tags), None)
    }

    async fn create_agent(
        &self,
        username: &str,
        name: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agents (username, name, password_hash, is_admin)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(username) DO UPDATE SET
                name = excluded.name,
                password_hash = excluded.password_hash,
                is_admin = excluded.is_admin",
            params![username, name, password_hash, is_admin as i64],
        )?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentInfo>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT username, name, is_admin, created_at FROM agents ORDER BY created_at DESC",
        )?;
        let agents = stmt
            .query_map([], |row| {
                Ok(AgentInfo {
                    username: row.get(0)?,
                    name: row.get(1)?,
                    is_admin: row.get::<_, i64>(2)? != 0,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(agents)
    }

    async fn delete_agent(&self, username: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM agents WHERE username = ?1", params![username])?;
        Ok(())
    }

    async fn get_agent_password_hash(
        &self,
        username: &str,
    ) -> Result<Option<String>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let hash = conn
            .query_row(
                "SELECT password_hash FROM agents WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_setting(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    async fn add_delivered_order(&self, order_id: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO orders (order_id, status) VALUES (?1, ?2)
             ON CONFLICT(order_id) DO UPDATE SET status = excluded.status",
            params![order_id, ORDER_STATUS_PAYOUT],
        )?;
        Ok(())
    }

    async fn mark_payout_paid(&self, order_id: &str) -> Result<(), GatewayError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE orders SET status = ?1 WHERE order_id = ?2",
            params![ORDER_STATUS_ARCHIVED, order_id],
        )?;
        Ok(())
    }

    async fn get_payouts(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        orders_by_status_sync(&conn, ORDER_STATUS_PAYOUT)
    }

    async fn get_archived_orders(&self) -> Result<Vec<OrderRecord>, GatewayError> {
        let conn = self.conn.lock().unwrap();
        orders_by_status_sync(&conn, ORDER_STATUS_ARCHIVED)
    }
}

fn conversation_meta_sync(
    conn: &Connection,
    user_id: &str,
) -> Result<ConversationMeta, GatewayError> {
    let row: Option<(Option<String>, Option<String>, Option<String>)> = conn
        .query_row(
            "SELECT assigned_agent, tags, avatar_url FROM conversation_meta WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((assigned_agent, tags, avatar_url)) = row else {
        return Ok(ConversationMeta::default());
    };
    let tags = tags
        .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).ok())
        .unwrap_or_default();
    Ok(ConversationMeta {
        assigned_agent,
        tags,
        avatar_url,
    })
}

fn upsert_meta_sync(
    conn: &Connection,
    user_id: &str,
    assigned_agent: Option<&str>,
    tags: Option<&[String]>,
    avatar_url: Option<&str>,
) -> Result<(), GatewayError> {
    let existing = conversation_meta_sync(conn, user_id)?;
    let new_assignee = assigned_agent
        .map(|a| a.to_string())
        .or(existing.assigned_agent);
    let new_tags = tags.map(|t| t.to_vec()).unwrap_or(existing.tags);
    let new_avatar = avatar_url.map(|a| a.to_string()).or(existing.avatar_url);
    conn.execute(
        "INSERT INTO conversation_meta (user_id, assigned_agent, tags, avatar_url)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(user_id) DO UPDATE SET
            assigned_agent = excluded.assigned_agent,
            tags = excluded.tags,
            avatar_url = excluded.avatar_url",
        params![
            user_id,
            new_assignee,
            serde_json::to_string(&new_tags)?,
            new_avatar
        ],
    )?;
    Ok(())
}

fn orders_by_status_sync(
    conn: &Connection,
    status: &str,
) -> Result<Vec<OrderRecord>, GatewayError> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, status, created_at FROM orders
         WHERE status = ?1 ORDER BY created_at DESC",
    )?;
    let orders = stmt
        .query_map(params![status], |row| {
            Ok(OrderRecord {
                id: row.get(0)?,
                order_id: row.get(1)?,
                status: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn text_message(user_id: &str, temp_id: &str, body: &str, ts: &str) -> MessageRecord {
        MessageRecord {
            user_id: user_id.into(),
            temp_id: Some(temp_id.into()),
            body: Some(body.into()),
            kind: Some("text".into()),
            from_agent: Some(true),
            status: Some("sending".into()),
            client_ts: Some(ts.into()),
            server_ts: Some(ts.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let db = store();
        db.upsert_message(&text_message("u1", "t_1", "hello", "2024-01-01T00:00:01Z"))
            .await
            .unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body.as_deref(), Some("hello"));
        assert_eq!(rows[0].status.as_deref(), Some("sending"));
        assert!(db.get_messages("u2", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_rejects_empty_user() {
        let db = store();
        let record = MessageRecord {
            upstream_id: Some("wamid.X".into()),
            status: Some("sent".into()),
            ..Default::default()
        };
        assert!(db.upsert_message(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_temp_id_reconciliation_attaches_upstream_id() {
        let db = store();
        db.upsert_message(&text_message("u1", "t_1", "hello", "2024-01-01T00:00:01Z"))
            .await
            .unwrap();
        // Background dispatch learned the upstream id and upgraded the status.
        let update = MessageRecord {
            user_id: "u1".into(),
            temp_id: Some("t_1".into()),
            upstream_id: Some("wamid.X".into()),
            status: Some("sent".into()),
            ..Default::default()
        };
        db.upsert_message(&update).await.unwrap();

        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].upstream_id.as_deref(), Some("wamid.X"));
        assert_eq!(rows[0].status.as_deref(), Some("sent"));
        assert_eq!(rows[0].body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_status_downgrade_ignored() {
        let db = store();
        let mut record = text_message("u1", "t_1", "hello", "2024-01-01T00:00:01Z");
        record.upstream_id = Some("wamid.X".into());
        record.status = Some("delivered".into());
        db.upsert_message(&record).await.unwrap();

        db.update_status("wamid.X", "sent").await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("delivered"));

        db.update_status("wamid.X", "read").await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("read"));
    }

    #[tokio::test]
    async fn test_status_downgrade_ignored_via_upsert() {
        let db = store();
        let mut record = text_message("u1", "t_1", "hello", "2024-01-01T00:00:01Z");
        record.upstream_id = Some("wamid.X".into());
        record.status = Some("read".into());
        db.upsert_message(&record).await.unwrap();

        let mut downgrade = MessageRecord {
            user_id: "u1".into(),
            upstream_id: Some("wamid.X".into()),
            status: Some("sending".into()),
            body: Some("should not overwrite".into()),
            ..Default::default()
        };
        db.upsert_message(&downgrade).await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("read"));
        assert_eq!(rows[0].body.as_deref(), Some("hello"));

        // A failed write is terminal and survives later receipts.
        downgrade.status = Some("failed".into());
        db.upsert_message(&downgrade).await.unwrap();
        db.update_status("wamid.X", "delivered").await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_update_status_unknown_id_is_noop() {
        let db = store();
        db.update_status("wamid.unknown", "delivered").await.unwrap();
        assert!(db.get_user_for_message("wamid.unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pagination_window() {
        let db = store();
        for i in 0..120 {
            db.upsert_message(&text_message(
                "u1",
                &format!("t_{i}"),
                &format!("m{i}"),
                &format!("2024-01-01T00:{:02}:{:02}Z", i / 60, i % 60),
            ))
            .await
            .unwrap();
        }
        // offset=50, limit=50 over 120 rows: newest-first rows 51..100 from the
        // top, i.e. m20..m69 in chronological order.
        let rows = db.get_messages("u1", 50, 50).await.unwrap();
        assert_eq!(rows.len(), 50);
        assert_eq!(rows[0].body.as_deref(), Some("m20"));
        assert_eq!(rows[49].body.as_deref(), Some("m69"));
    }

    #[tokio::test]
    async fn test_since_is_strictly_greater() {
        let db = store();
        for i in 1..=5 {
            db.upsert_message(&text_message(
                "u1",
                &format!("t_{i}"),
                &format!("m{i}"),
                &format!("2024-01-01T00:00:0{i}Z"),
            ))
            .await
            .unwrap();
        }
        let rows = db
            .get_messages_since("u1", "2024-01-01T00:00:03Z", 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].body.as_deref(), Some("m4"));
        assert_eq!(rows[1].body.as_deref(), Some("m5"));

        let rows = db
            .get_messages_before("u1", "2024-01-01T00:00:03Z", 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].body.as_deref(), Some("m1"));
        assert_eq!(rows[1].body.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_mark_read_all_inbound() {
        let db = store();
        let mut inbound = text_message("u1", "t_1", "hi", "2024-01-01T00:00:01Z");
        inbound.from_agent = Some(false);
        inbound.status = Some("received".into());
        inbound.upstream_id = Some("wamid.A".into());
        db.upsert_message(&inbound).await.unwrap();

        let mut outbound = text_message("u1", "t_2", "yo", "2024-01-01T00:00:02Z");
        outbound.status = Some("sent".into());
        db.upsert_message(&outbound).await.unwrap();

        db.mark_read("u1", None).await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("read"));
        assert_eq!(rows[1].status.as_deref(), Some("sent"));
    }

    #[tokio::test]
    async fn test_mark_read_specific_ids() {
        let db = store();
        for (i, wamid) in ["wamid.A", "wamid.B"].iter().enumerate() {
            let mut inbound = text_message("u1", &format!("t_{i}"), "hi", "2024-01-01T00:00:01Z");
            inbound.from_agent = Some(false);
            inbound.status = Some("received".into());
            inbound.upstream_id = Some(wamid.to_string());
            db.upsert_message(&inbound).await.unwrap();
        }
        db.mark_read("u1", Some(&["wamid.A".to_string()])).await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        let read_count = rows
            .iter()
            .filter(|r| r.status.as_deref() == Some("read"))
            .count();
        assert_eq!(read_count, 1);
    }

    #[tokio::test]
    async fn test_conversation_stats() {
        let db = store();
        db.upsert_user("u1", Some("Amine"), Some("212600000001"), None)
            .await
            .unwrap();

        let mut outbound = text_message("u1", "t_1", "invoice below", "2024-01-01T00:00:01Z");
        outbound.status = Some("sent".into());
        db.upsert_message(&outbound).await.unwrap();

        let mut inbound = text_message("u1", "t_2", "thanks", "2024-01-01T00:00:02Z");
        inbound.from_agent = Some(false);
        inbound.status = Some("received".into());
        db.upsert_message(&inbound).await.unwrap();

        let conversations = db
            .list_conversations(&ConversationFilter::default())
            .await
            .unwrap();
        assert_eq!(conversations.len(), 1);
        let conv = &conversations[0];
        assert_eq!(conv.user_id, "u1");
        assert_eq!(conv.name.as_deref(), Some("Amine"));
        assert_eq!(conv.unread_count, 1);
        assert_eq!(conv.unresponded_count, 1);
        assert_eq!(conv.last_message.as_deref(), Some("thanks"));

        // Agent replies; nothing unresponded anymore.
        let mut reply = text_message("u1", "t_3", "welcome", "2024-01-01T00:00:03Z");
        reply.status = Some("sent".into());
        db.upsert_message(&reply).await.unwrap();
        let conversations = db
            .list_conversations(&ConversationFilter::default())
            .await
            .unwrap();
        assert_eq!(conversations[0].unresponded_count, 0);
    }

    #[tokio::test]
    async fn test_conversations_sorted_newest_first() {
        let db = store();
        db.upsert_message(&text_message("old", "t_1", "a", "2024-01-01T00:00:01Z"))
            .await
            .unwrap();
        db.upsert_message(&text_message("new", "t_2", "b", "2024-01-02T00:00:01Z"))
            .await
            .unwrap();
        let conversations = db
            .list_conversations(&ConversationFilter::default())
            .await
            .unwrap();
        assert_eq!(conversations[0].user_id, "new");
        assert_eq!(conversations[1].user_id, "old");
    }

    #[tokio::test]
    async fn test_invoice_heuristic() {
        let db = store();
        assert!(!db.has_invoice_message("u1").await.unwrap());
        let mut invoice = text_message("u1", "t_1", "img", "2024-01-01T00:00:01Z");
        invoice.kind = Some("image".into());
        invoice.caption = Some("هذه فاتورتك".into());
        invoice.status = Some("sent".into());
        db.upsert_message(&invoice).await.unwrap();
        assert!(db.has_invoice_message("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_conversation_meta_roundtrip() {
        let db = store();
        let meta = db.get_conversation_meta("u1").await.unwrap();
        assert!(meta.assigned_agent.is_none());
        assert!(meta.tags.is_empty());

        db.set_conversation_assignment("u1", Some("sara")).await.unwrap();
        db.set_conversation_tags("u1", &["vip".into(), "done".into()])
            .await
            .unwrap();
        let meta = db.get_conversation_meta("u1").await.unwrap();
        assert_eq!(meta.assigned_agent.as_deref(), Some("sara"));
        assert_eq!(meta.tags, vec!["vip".to_string(), "done".to_string()]);

        // Updating tags keeps the assignment.
        db.set_conversation_tags("u1", &["vip".into()]).await.unwrap();
        let meta = db.get_conversation_meta("u1").await.unwrap();
        assert_eq!(meta.assigned_agent.as_deref(), Some("sara"));
        assert_eq!(meta.tags, vec!["vip".to_string()]);
    }

    #[tokio::test]
    async fn test_agent_crud() {
        let db = store();
        db.create_agent("sara", "Sara", "salt$hash", true).await.unwrap();
        db.create_agent("omar", "Omar", "salt$hash2", false).await.unwrap();
        let agents = db.list_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(
            db.get_agent_password_hash("sara").await.unwrap().as_deref(),
            Some("salt$hash")
        );

        // Upsert replaces the hash.
        db.create_agent("sara", "Sara", "salt$new", true).await.unwrap();
        assert_eq!(
            db.get_agent_password_hash("sara").await.unwrap().as_deref(),
            Some("salt$new")
        );

        db.delete_agent("omar").await.unwrap();
        assert!(db.get_agent_password_hash("omar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settings_roundtrip() {
        let db = store();
        assert!(db.get_setting("tag_options").await.unwrap().is_none());
        db.set_setting(
            "tag_options",
            &serde_json::json!([{"label": "Done", "icon": "✅"}]),
        )
        .await
        .unwrap();
        let raw = db.get_setting("tag_options").await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed[0]["label"], "Done");
    }

    #[tokio::test]
    async fn test_payout_lifecycle() {
        let db = store();
        db.add_delivered_order("1001").await.unwrap();
        db.add_delivered_order("1002").await.unwrap();
        // Idempotent.
        db.add_delivered_order("1001").await.unwrap();

        let payouts = db.get_payouts().await.unwrap();
        assert_eq!(payouts.len(), 2);
        assert!(db.get_archived_orders().await.unwrap().is_empty());

        db.mark_payout_paid("1001").await.unwrap();
        let payouts = db.get_payouts().await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].order_id, "1002");
        let archived = db.get_archived_orders().await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].order_id, "1001");
    }

    #[tokio::test]
    async fn test_waveform_roundtrip() {
        let db = store();
        let mut audio = text_message("u1", "t_1", "voice.ogg", "2024-01-01T00:00:01Z");
        audio.kind = Some("audio".into());
        audio.waveform = Some(vec![10, 40, 90, 30]);
        db.upsert_message(&audio).await.unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows[0].waveform.as_deref(), Some(&[10u8, 40, 90, 30][..]));
    }

    #[tokio::test]
    async fn test_schema_init_is_idempotent() {
        let dir = std::env::temp_dir().join(format!("chatrelay_test_{}", uuid::Uuid::new_v4()));
        let path = dir.join("relay.db").to_string_lossy().to_string();
        {
            let db = SqliteStore::new(&path).unwrap();
            db.upsert_message(&text_message("u1", "t_1", "hello", "2024-01-01T00:00:01Z"))
                .await
                .unwrap();
        }
        // Re-opening runs the schema and migrations again over existing data.
        let db = SqliteStore::new(&path).unwrap();
        let rows = db.get_messages("u1", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
