use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Form, Json, Router};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CacheBus;
use crate::catalog::CatalogManager;
use crate::config::Config;
use crate::error::GatewayError;
use crate::media::{self, compute_audio_waveform, convert_to_ogg_opus, WAVEFORM_BUCKETS};
use crate::processor::{MessageProcessor, OutgoingMessage};
use crate::registry::{ConnectionRegistry, SendKind};
use crate::scheduler::parse_iso_ts;
use crate::store::{ConversationFilter, MessageRecord, Store};
use crate::whatsapp::WhatsAppClient;

const PBKDF2_ITERATIONS: u32 = 100_000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub cache: Arc<CacheBus>,
    pub registry: Arc<ConnectionRegistry>,
    pub processor: Arc<MessageProcessor>,
    pub client: Arc<WhatsAppClient>,
    pub catalog: Arc<CatalogManager>,
    pub metrics: PrometheusHandle,
}

// ---------------- password hashing ----------------

/// PBKDF2-HMAC-SHA256 with a 16-byte random salt, stored as `salt$hex`.
pub fn hash_password(password: &str) -> String {
    let salt = *uuid::Uuid::new_v4().as_bytes();
    let mut derived = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut derived);
    format!("{}${}", hex::encode(salt), hex::encode(derived))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, hash_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let mut derived = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut derived);
    hash_hex.eq_ignore_ascii_case(&hex::encode(derived))
}

// ---------------- admission control ----------------

/// Coarse cluster-wide per-minute limit backed by the cache tier, plus the
/// per-agent token bucket. A missing cache makes the coarse check a no-op.
async fn admit_send(state: &AppState, user_id: &str, kind: SendKind) -> Result<(), GatewayError> {
    let (label, per_min) = match kind {
        SendKind::Text => ("text", state.config.send_text_per_min),
        SendKind::Media => ("media", state.config.send_media_per_min),
    };
    if let Some(count) = state
        .cache
        .incr_window(&format!("rl:{label}:{user_id}"), 60)
        .await
    {
        if count > per_min as i64 {
            return Err(GatewayError::RateLimited);
        }
    }
    if !state.registry.buckets.consume(user_id, kind) {
        return Err(GatewayError::RateLimited);
    }
    Ok(())
}

fn error_json(error: impl std::fmt::Display) -> Json<Value> {
    Json(json!({"error": error.to_string(), "status": "failed"}))
}

// ---------------- webhook ----------------

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    #[serde(rename = "hub.mode", default)]
    hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token", default)]
    hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge", default)]
    hub_challenge: Option<String>,
}

async fn verify_webhook(
    Query(params): Query<WebhookQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if params.hub_mode.as_deref() == Some("subscribe")
        && params.hub_verify_token.as_deref() == Some(state.config.verify_token.as_str())
    {
        if let Some(challenge) = params.hub_challenge {
            info!("Webhook verified");
            return (StatusCode::OK, challenge);
        }
    }
    (StatusCode::FORBIDDEN, "Verification failed".to_string())
}

async fn handle_webhook(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    // The upstream requires a fast 200; processing continues in the background.
    tokio::spawn(async move {
        state.processor.process_incoming_webhook(&payload).await;
    });
    Json(json!({"ok": true}))
}

// ---------------- duplex sessions ----------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsClientMessage {
    SendMessage {
        #[serde(default)]
        data: OutgoingMessage,
    },
    MarkAsRead {
        #[serde(default)]
        message_ids: Vec<String>,
    },
    Typing {
        #[serde(default)]
        is_typing: bool,
    },
    React {
        #[serde(default)]
        target_upstream_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        emoji: Option<String>,
        #[serde(default)]
        action: Option<String>,
    },
    GetConversationHistory {
        #[serde(default)]
        offset: usize,
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
    ResumeSince {
        #[serde(default)]
        since: Option<String>,
        #[serde(default = "default_resume_limit")]
        limit: usize,
    },
    Ping {
        #[serde(default)]
        ts: Value,
    },
}

fn default_history_limit() -> usize {
    50
}

fn default_resume_limit() -> usize {
    500
}

fn sort_key_ms(message: &Value) -> i64 {
    let ts = message
        .get("server_ts")
        .and_then(|v| v.as_str())
        .or_else(|| message.get("client_ts").and_then(|v| v.as_str()))
        .unwrap_or("");
    parse_iso_ts(ts).map(|dt| dt.timestamp_millis()).unwrap_or(0)
}

async fn ws_endpoint(
    AxumPath(user_id): AxumPath<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, user_id, state))
}

async fn handle_session(socket: WebSocket, user_id: String, state: AppState) {
    counter!("chatrelay_ws_connections_total").increment(1);
    let (session_id, mut outgoing) = state.registry.connect(&user_id);
    if user_id == "admin" {
        if let Err(e) = state.store.upsert_user(&user_id, None, None, Some(true)).await {
            warn!("Admin upsert failed: {e}");
        }
    }

    let (mut sink, mut stream) = socket.split();

    // Recent window on connect: cache first, store fallback, sorted by
    // server receive time for the client.
    let mut recent = state.cache.recent_messages(&user_id, 20).await;
    if recent.is_empty() {
        if let Ok(rows) = state.store.get_messages(&user_id, 0, 20).await {
            recent = rows
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect();
        }
    }
    if !recent.is_empty() {
        recent.sort_by_key(sort_key_ms);
        let hello = json!({"type": "recent_messages", "data": recent});
        if sink.send(Message::Text(hello.to_string())).await.is_err() {
            state.registry.disconnect(&user_id, session_id);
            return;
        }
    }

    loop {
        tokio::select! {
            payload = outgoing.recv() => {
                match payload {
                    Some(payload) => {
                        if sink.send(Message::Text(payload.to_string())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let replies = handle_ws_message(&state, &user_id, session_id, &text).await;
                        let mut closed = false;
                        for reply in replies {
                            if sink.send(Message::Text(reply.to_string())).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("WebSocket receive error for {user_id}: {e}");
                        break;
                    }
                }
            }
        }
    }
    state.registry.disconnect(&user_id, session_id);
}

/// Handle one client frame. Returned values are delivered to the originating
/// session only; everything else fans out through the registry.
async fn handle_ws_message(
    state: &AppState,
    user_id: &str,
    session_id: Uuid,
    text: &str,
) -> Vec<Value> {
    let parsed: WsClientMessage = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Unparseable ws message from {user_id}: {e}");
            return Vec::new();
        }
    };

    match parsed {
        WsClientMessage::SendMessage { mut data } => {
            data.user_id = user_id.to_string();
            let is_media = matches!(
                data.kind.as_deref().unwrap_or("text"),
                "image" | "audio" | "video" | "document"
            );
            let kind = if is_media { SendKind::Media } else { SendKind::Text };
            if !state.registry.buckets.consume(user_id, kind) {
                counter!("chatrelay_rate_limited_total").increment(1);
                let label = if is_media { "media" } else { "text" };
                return vec![json!({
                    "type": "error",
                    "data": {
                        "code": "rate_limited",
                        "message": format!(
                            "Rate limit exceeded for {label} messages. Please slow down."
                        ),
                    }
                })];
            }
            if let Err(e) = state.processor.process_outgoing_message(data).await {
                return vec![json!({
                    "type": "error",
                    "data": {"code": "send_failed", "message": e.to_string()},
                })];
            }
            Vec::new()
        }
        WsClientMessage::MarkAsRead { message_ids } => {
            let mut ids = message_ids;
            ids.sort();
            ids.dedup();
            let selection = if ids.is_empty() { None } else { Some(ids.as_slice()) };
            if let Err(e) = state.store.mark_read(user_id, selection).await {
                warn!("mark_read failed for {user_id}: {e}");
            }
            for id in &ids {
                if let Err(e) = state.client.mark_message_as_read(id).await {
                    debug!("Read receipt for {id} failed: {e}");
                }
            }
            state
                .registry
                .send_to_user(
                    user_id,
                    json!({
                        "type": "messages_marked_read",
                        "data": {"user_id": user_id, "message_ids": ids},
                    }),
                )
                .await;
            Vec::new()
        }
        WsClientMessage::Typing { is_typing } => {
            let event = json!({
                "type": "typing",
                "data": {"user_id": user_id, "is_typing": is_typing},
            });
            state
                .registry
                .deliver_to_peers(user_id, session_id, event.clone());
            state
                .registry
                .broadcast_to_admins(event, Some(user_id))
                .await;
            Vec::new()
        }
        WsClientMessage::React {
            target_upstream_id,
            message_id,
            emoji,
            action,
        } => {
            let Some(target_id) = target_upstream_id.or(message_id) else {
                return Vec::new();
            };
            let Some(emoji) = emoji else { return Vec::new() };
            let action = action.unwrap_or_else(|| "react".into());
            if let Err(e) = state
                .client
                .send_reaction(user_id, &target_id, &emoji, &action)
                .await
            {
                warn!("Reaction send failed: {e}");
                return Vec::new();
            }
            let timestamp = chrono::Utc::now().to_rfc3339();
            let event = json!({
                "type": "reaction_update",
                "data": {
                    "user_id": user_id,
                    "target_upstream_id": target_id.clone(),
                    "emoji": emoji.clone(),
                    "action": action.clone(),
                    "from_agent": true,
                    "timestamp": timestamp.clone(),
                },
            });
            state.registry.send_to_user(user_id, event.clone()).await;
            state
                .registry
                .broadcast_to_admins(event, Some(user_id))
                .await;
            let audit = MessageRecord {
                user_id: user_id.to_string(),
                kind: Some("reaction".into()),
                from_agent: Some(true),
                status: Some("sent".into()),
                client_ts: Some(timestamp),
                reaction_target: Some(target_id),
                reaction_emoji: Some(emoji),
                reaction_action: Some(action),
                ..Default::default()
            };
            if let Err(e) = state.store.upsert_message(&audit).await {
                debug!("Reaction audit row failed: {e}");
            }
            Vec::new()
        }
        WsClientMessage::GetConversationHistory { offset, limit } => {
            match state.store.get_messages(user_id, offset, limit).await {
                Ok(rows) => vec![json!({"type": "conversation_history", "data": rows})],
                Err(e) => {
                    warn!("History fetch failed for {user_id}: {e}");
                    Vec::new()
                }
            }
        }
        WsClientMessage::ResumeSince { since, limit } => {
            let Some(since) = since else { return Vec::new() };
            let limit = limit.clamp(1, 500);
            match state.store.get_messages_since(user_id, &since, limit).await {
                Ok(rows) if !rows.is_empty() => {
                    vec![json!({"type": "conversation_history", "data": rows})]
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!("resume_since failed for {user_id}: {e}");
                    Vec::new()
                }
            }
        }
        WsClientMessage::Ping { ts } => {
            vec![json!({"type": "pong", "ts": ts})]
        }
    }
}

// ---------------- REST: messaging ----------------

async fn send_message_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let user_id = payload.get("user_id").and_then(|v| v.as_str()).unwrap_or("");
    let message = payload.get("message").and_then(|v| v.as_str()).unwrap_or("");
    if user_id.is_empty() || message.is_empty() {
        return Ok(error_json("Missing user_id or message"));
    }
    if admit_send(&state, user_id, SendKind::Text).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }
    let request = OutgoingMessage {
        user_id: user_id.to_string(),
        message: Some(message.to_string()),
        kind: payload
            .get("type")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or(Some("text".into())),
        ..Default::default()
    };
    match state.processor.process_outgoing_message(request).await {
        Ok(record) => Ok(Json(json!({"status": "success", "message": record}))),
        Err(e) => {
            error!("Error sending message: {e}");
            Ok(error_json(e))
        }
    }
}

struct UploadedFile {
    filename: String,
    content: Vec<u8>,
}

struct MediaForm {
    user_id: String,
    media_type: String,
    caption: String,
    price: String,
    temp_id: Option<String>,
    files: Vec<UploadedFile>,
}

async fn read_media_form(mut multipart: Multipart) -> Result<MediaForm, GatewayError> {
    let mut form = MediaForm {
        user_id: String::new(),
        media_type: String::new(),
        caption: String::new(),
        price: String::new(),
        temp_id: None,
        files: Vec::new(),
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::Validation(e.to_string()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "user_id" => form.user_id = field.text().await.unwrap_or_default(),
            "media_type" => form.media_type = field.text().await.unwrap_or_default(),
            "caption" => form.caption = field.text().await.unwrap_or_default(),
            "price" => form.price = field.text().await.unwrap_or_default(),
            "temp_id" => {
                let value = field.text().await.unwrap_or_default();
                if !value.is_empty() {
                    form.temp_id = Some(value);
                }
            }
            "files" | "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.bin")
                    .to_string();
                let content = field
                    .bytes()
                    .await
                    .map_err(|e| GatewayError::Validation(e.to_string()))?
                    .to_vec();
                form.files.push(UploadedFile { filename, content });
            }
            _ => {}
        }
    }
    Ok(form)
}

fn validate_media_form(form: &MediaForm) -> Result<(), String> {
    if form.user_id.is_empty() {
        return Err("user_id is required".into());
    }
    if !matches!(form.media_type.as_str(), "image" | "audio" | "video" | "document") {
        return Err("Invalid media_type. Must be: image, audio, video, or document".into());
    }
    if form.files.is_empty() {
        return Err("No files uploaded".into());
    }
    Ok(())
}

async fn save_upload(
    state: &AppState,
    media_type: &str,
    file: &UploadedFile,
) -> Result<std::path::PathBuf, GatewayError> {
    let extension = std::path::Path::new(&file.filename)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_else(|| ".bin".into());
    let filename = media::media_filename(media_type, &extension);
    let media_dir = state.config.media_dir_path();
    tokio::fs::create_dir_all(&media_dir).await?;
    let file_path = media_dir.join(filename);
    tokio::fs::write(&file_path, &file.content).await?;
    Ok(file_path)
}

async fn send_media_endpoint(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Value>, (StatusCode, String)> {
    let form = match read_media_form(multipart).await {
        Ok(form) => form,
        Err(e) => return Ok(error_json(e)),
    };
    if let Err(e) = validate_media_form(&form) {
        return Ok(error_json(e));
    }
    if admit_send(&state, &form.user_id, SendKind::Media).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }

    let mut results = Vec::new();
    for file in &form.files {
        let mut file_path = match save_upload(&state, &form.media_type, file).await {
            Ok(path) => path,
            Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        };

        if form.media_type == "audio"
            && !file_path.to_string_lossy().to_lowercase().ends_with(".ogg")
        {
            match convert_to_ogg_opus(&file_path).await {
                Ok(converted) => {
                    let _ = tokio::fs::remove_file(&file_path).await;
                    file_path = converted;
                }
                Err(e) => {
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Audio conversion failed: {e}"),
                    ))
                }
            }
        }

        let waveform = if form.media_type == "audio" {
            Some(compute_audio_waveform(&file_path, WAVEFORM_BUCKETS).await)
        } else {
            None
        };

        let path_str = file_path.to_string_lossy().to_string();
        let media_url = state
            .processor
            .storage
            .upload(&path_str, None)
            .await
            .unwrap_or_else(|| {
                let name = file_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("{}/media/{name}", state.config.base_url.trim_end_matches('/'))
            });

        let request = OutgoingMessage {
            user_id: form.user_id.clone(),
            message: Some(media_url.clone()),
            url: Some(media_url.clone()),
            kind: Some(form.media_type.clone()),
            caption: Some(form.caption.clone()),
            price: Some(form.price.clone()),
            media_path: Some(path_str),
            waveform,
            ..Default::default()
        };
        match state.processor.process_outgoing_message(request).await {
            Ok(record) => results.push(json!({
                "filename": file_path.file_name().map(|n| n.to_string_lossy().to_string()),
                "media_url": media_url,
                "result": record,
            })),
            Err(e) => return Ok(error_json(e)),
        }
    }
    Ok(Json(json!({"status": "success", "messages": results})))
}

/// Accept media quickly and process in the background; the UI catches up over
/// the duplex session. Keeps p95 low under bursts.
async fn send_media_async_endpoint(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let form = match read_media_form(multipart).await {
        Ok(form) => form,
        Err(e) => return Ok((StatusCode::OK, error_json(e))),
    };
    if let Err(e) = validate_media_form(&form) {
        return Ok((StatusCode::OK, error_json(e)));
    }
    if admit_send(&state, &form.user_id, SendKind::Media).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }

    let mut accepted = Vec::new();
    for file in &form.files {
        let file_path = match save_upload(&state, &form.media_type, file).await {
            Ok(path) => path,
            Err(e) => return Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        };
        let filename = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let path_str = file_path.to_string_lossy().to_string();
        let request = OutgoingMessage {
            user_id: form.user_id.clone(),
            message: Some(path_str.clone()),
            url: Some(path_str.clone()),
            kind: Some(form.media_type.clone()),
            caption: Some(form.caption.clone()),
            price: Some(form.price.clone()),
            media_path: Some(path_str),
            temp_id: form.temp_id.clone(),
            ..Default::default()
        };
        let processor = state.processor.clone();
        tokio::spawn(async move {
            if let Err(e) = processor.process_outgoing_message(request).await {
                error!("Async media send failed: {e}");
            }
        });
        let mut entry = json!({"filename": filename});
        if let Some(temp_id) = &form.temp_id {
            entry["temp_id"] = json!(temp_id);
        }
        accepted.push(entry);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "accepted": accepted})),
    ))
}

// ---------------- REST: history & conversations ----------------

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_history_limit")]
    limit: usize,
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    before: Option<String>,
}

async fn get_messages_endpoint(
    AxumPath(user_id): AxumPath<String>,
    Query(query): Query<MessagesQuery>,
    State(state): State<AppState>,
) -> Json<Value> {
    if let Some(since) = &query.since {
        let limit = query.limit.clamp(1, 500);
        return match state.store.get_messages_since(&user_id, since, limit).await {
            Ok(rows) => Json(json!(rows)),
            Err(e) => {
                error!("Error fetching messages since: {e}");
                Json(json!([]))
            }
        };
    }
    if let Some(before) = &query.before {
        let limit = query.limit.clamp(1, 200);
        return match state.store.get_messages_before(&user_id, before, limit).await {
            Ok(rows) => Json(json!(rows)),
            Err(e) => {
                error!("Error fetching messages before: {e}");
                Json(json!([]))
            }
        };
    }
    if query.offset == 0 {
        let cached = state.cache.recent_messages(&user_id, query.limit).await;
        if !cached.is_empty() {
            return Json(json!(cached));
        }
    }
    match state
        .store
        .get_messages(&user_id, query.offset, query.limit)
        .await
    {
        Ok(rows) => Json(json!(rows)),
        Err(e) => {
            error!("Error fetching messages: {e}");
            Json(json!([]))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConversationsQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    unread_only: bool,
    #[serde(default)]
    assigned: Option<String>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    unresponded_only: bool,
}

async fn get_conversations_endpoint(
    Query(query): Query<ConversationsQuery>,
    State(state): State<AppState>,
) -> Json<Value> {
    let filter = ConversationFilter {
        q: query.q,
        unread_only: query.unread_only,
        assigned: query.assigned,
        tags: query.tags.map(|raw| {
            raw.split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        }),
    };
    match state.store.list_conversations(&filter).await {
        Ok(mut conversations) => {
            if query.unresponded_only {
                conversations.retain(|c| c.unresponded_count > 0);
            }
            Json(json!(conversations))
        }
        Err(e) => {
            error!("Error fetching conversations: {e}");
            Json(json!([]))
        }
    }
}

async fn mark_conversation_read(
    AxumPath(user_id): AxumPath<String>,
    State(state): State<AppState>,
    body: Option<Json<Vec<String>>>,
) -> Json<Value> {
    let mut ids = body.map(|Json(ids)| ids).unwrap_or_default();
    ids.sort();
    ids.dedup();
    let selection = if ids.is_empty() { None } else { Some(ids.as_slice()) };
    if let Err(e) = state.store.mark_read(&user_id, selection).await {
        error!("Error marking messages as read: {e}");
        return error_json(e);
    }
    for id in &ids {
        if let Err(e) = state.client.mark_message_as_read(id).await {
            debug!("Read receipt for {id} failed: {e}");
        }
    }
    state
        .registry
        .send_to_user(
            &user_id,
            json!({
                "type": "messages_marked_read",
                "data": {"user_id": user_id, "message_ids": ids},
            }),
        )
        .await;
    Json(json!({"status": "success"}))
}

async fn assign_conversation(
    AxumPath(user_id): AxumPath<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let agent = payload.get("agent").and_then(|v| v.as_str());
    state
        .store
        .set_conversation_assignment(&user_id, agent)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(
        json!({"ok": true, "user_id": user_id, "assigned_agent": agent}),
    ))
}

async fn update_conversation_tags(
    AxumPath(user_id): AxumPath<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(tags) = payload.get("tags").and_then(|v| v.as_array()) else {
        return Err((StatusCode::BAD_REQUEST, "tags must be a list".into()));
    };
    let tags: Vec<String> = tags
        .iter()
        .filter_map(|t| t.as_str())
        .map(|t| t.to_string())
        .collect();
    state
        .store
        .set_conversation_tags(&user_id, &tags)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"ok": true, "user_id": user_id, "tags": tags})))
}

async fn get_online_users(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"online_users": state.registry.active_users()}))
}

async fn get_active_users(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"active_users": state.registry.active_users()}))
}

// ---------------- REST: agents & auth ----------------

async fn list_agents_endpoint(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let agents = state
        .store
        .list_agents()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!(agents)))
}

async fn create_agent_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let username = payload
        .get("username")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let password = payload.get("password").and_then(|v| v.as_str()).unwrap_or("");
    let name = payload
        .get("name")
        .and_then(|v| v.as_str())
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .unwrap_or(&username)
        .to_string();
    let is_admin = payload
        .get("is_admin")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if username.is_empty() || password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "username and password are required".into(),
        ));
    }
    state
        .store
        .create_agent(&username, &name, &hash_password(password), is_admin)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"ok": true})))
}

async fn delete_agent_endpoint(
    AxumPath(username): AxumPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .store
        .delete_agent(&username)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"ok": true})))
}

async fn auth_login(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let username = payload
        .get("username")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let password = payload.get("password").and_then(|v| v.as_str()).unwrap_or("");
    let stored = state
        .store
        .get_agent_password_hash(&username)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    match stored {
        Some(hash) if verify_password(password, &hash) => {
            let token = uuid::Uuid::new_v4().simple().to_string();
            Ok(Json(json!({"token": token, "username": username})))
        }
        _ => Err((StatusCode::UNAUTHORIZED, "Invalid credentials".into())),
    }
}

// ---------------- REST: tag options ----------------

async fn get_tag_options_endpoint(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let raw = state
        .store
        .get_setting("tag_options")
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let options = raw
        .and_then(|raw| serde_json::from_str::<Vec<Value>>(&raw).ok())
        .unwrap_or_default();
    let cleaned: Vec<Value> = options
        .iter()
        .filter_map(|opt| match opt {
            Value::Object(map) => map.get("label").and_then(|l| l.as_str()).map(|label| {
                json!({
                    "label": label,
                    "icon": map.get("icon").and_then(|i| i.as_str()).unwrap_or(""),
                })
            }),
            Value::String(label) => Some(json!({"label": label, "icon": ""})),
            _ => None,
        })
        .collect();
    Ok(Json(json!(cleaned)))
}

async fn set_tag_options_endpoint(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let Some(options) = payload.get("options").and_then(|v| v.as_array()) else {
        return Err((StatusCode::BAD_REQUEST, "options must be a list".into()));
    };
    let normalized: Vec<Value> = options
        .iter()
        .filter_map(|opt| match opt {
            Value::Object(map) => map.get("label").and_then(|l| l.as_str()).map(|label| {
                json!({
                    "label": label,
                    "icon": map.get("icon").and_then(|i| i.as_str()).unwrap_or(""),
                })
            }),
            Value::String(label) => Some(json!({"label": label, "icon": ""})),
            _ => None,
        })
        .collect();
    state
        .store
        .set_setting("tag_options", &json!(normalized))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"ok": true, "count": normalized.len()})))
}

// ---------------- REST: orders & payouts ----------------

async fn order_delivered(
    AxumPath(order_id): AxumPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .store
        .add_delivered_order(&order_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"status": "payout", "order_id": order_id})))
}

async fn mark_payout_paid_endpoint(
    AxumPath(order_id): AxumPath<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state
        .store
        .mark_payout_paid(&order_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({"status": "archived", "order_id": order_id})))
}

async fn list_payouts(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    let orders = state
        .store
        .get_payouts()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!(orders)))
}

async fn list_archive(State(state): State<AppState>) -> Result<Json<Value>, (StatusCode, String)> {
    let orders = state
        .store
        .get_archived_orders()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!(orders)))
}

// ---------------- REST: catalog ----------------

#[derive(Debug, Deserialize)]
struct CatalogSetForm {
    user_id: String,
    product_ids: String,
}

async fn send_catalog_set_endpoint(
    State(state): State<AppState>,
    Form(form): Form<CatalogSetForm>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if admit_send(&state, &form.user_id, SendKind::Text).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }
    let product_ids: Vec<String> = serde_json::from_str(&form.product_ids)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let to = state
        .store
        .get_user_phone(&form.user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| form.user_id.clone());
    let results = state
        .client
        .send_product_list(&to, &product_ids)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({"status": "ok", "results": results})))
}

#[derive(Debug, Deserialize)]
struct CatalogItemForm {
    user_id: String,
    product_retailer_id: String,
    #[serde(default)]
    caption: String,
}

async fn send_catalog_item_endpoint(
    State(state): State<AppState>,
    Form(form): Form<CatalogItemForm>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if admit_send(&state, &form.user_id, SendKind::Text).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }
    let to = state
        .store
        .get_user_phone(&form.user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| form.user_id.clone());
    let response = state
        .client
        .send_interactive_product(&to, &form.product_retailer_id, &form.caption)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({"status": "ok", "response": response})))
}

#[derive(Debug, Deserialize)]
struct CatalogAllForm {
    user_id: String,
    #[serde(default)]
    caption: String,
}

async fn send_catalog_all_endpoint(
    State(state): State<AppState>,
    Form(form): Form<CatalogAllForm>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if admit_send(&state, &form.user_id, SendKind::Text).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }
    let to = state
        .store
        .get_user_phone(&form.user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| form.user_id.clone());
    if !form.caption.is_empty() {
        state
            .client
            .send_text(&to, &form.caption, None)
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    }
    let product_ids: Vec<String> = state
        .catalog
        .get_cached_products()
        .into_iter()
        .filter_map(|p| p.retailer_id)
        .collect();
    if product_ids.is_empty() {
        return Ok(Json(json!({"status": "ok", "results": []})));
    }
    let results = state
        .client
        .send_product_list(&to, &product_ids)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({"status": "ok", "results": results})))
}

#[derive(Debug, Deserialize)]
struct CatalogSetAllForm {
    user_id: String,
    set_id: String,
    #[serde(default)]
    caption: String,
}

/// Optimistic bubble immediately, full set send in the background; failures
/// surface as a `catalog_set_send_error` event on the session.
async fn send_catalog_set_all_endpoint(
    State(state): State<AppState>,
    Form(form): Form<CatalogSetAllForm>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if admit_send(&state, &form.user_id, SendKind::Text).await.is_err() {
        return Err((StatusCode::TOO_MANY_REQUESTS, "rate limited".into()));
    }
    let to = state
        .store
        .get_user_phone(&form.user_id)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| form.user_id.clone());
    let job_id = uuid::Uuid::new_v4().to_string();
    let temp_id = format!("temp_{}", uuid::Uuid::new_v4().simple());
    let timestamp = chrono::Utc::now().to_rfc3339();
    let optimistic = MessageRecord {
        user_id: form.user_id.clone(),
        temp_id: Some(temp_id.clone()),
        body: Some(if form.caption.is_empty() {
            format!("Catalog set {}", form.set_id)
        } else {
            form.caption.clone()
        }),
        kind: Some("catalog_set".into()),
        from_agent: Some(true),
        status: Some("sending".into()),
        caption: Some(form.caption.clone()),
        client_ts: Some(timestamp.clone()),
        server_ts: Some(timestamp),
        ..Default::default()
    };
    let optimistic_value = serde_json::to_value(&optimistic).unwrap_or_default();
    state.cache.cache_message(&form.user_id, &optimistic_value).await;
    state
        .registry
        .send_to_user(
            &form.user_id,
            json!({"type": "message_sent", "data": optimistic_value}),
        )
        .await;

    let job = job_id.clone();
    tokio::spawn(async move {
        let result = async {
            if !form.caption.is_empty() {
                state.client.send_text(&to, &form.caption, None).await?;
            }
            let product_ids: Vec<String> = state
                .catalog
                .get_products_for_set(&form.set_id, 600)
                .await?
                .into_iter()
                .filter_map(|p| p.retailer_id)
                .collect();
            if !product_ids.is_empty() {
                state.client.send_product_list(&to, &product_ids).await?;
            }
            Ok::<(), GatewayError>(())
        }
        .await;
        match result {
            Ok(()) => {
                info!("Catalog set {} sent to {to}", form.set_id);
                state
                    .registry
                    .send_to_user(
                        &form.user_id,
                        json!({
                            "type": "message_status_update",
                            "data": {"temp_id": temp_id, "status": "sent"},
                        }),
                    )
                    .await;
                let mut final_record = optimistic.clone();
                final_record.status = Some("sent".into());
                if let Err(e) = state.store.upsert_message(&final_record).await {
                    error!("Persisting catalog set record failed: {e}");
                }
                let final_value = serde_json::to_value(&final_record).unwrap_or_default();
                state.cache.cache_message(&form.user_id, &final_value).await;
            }
            Err(e) => {
                error!("Error sending catalog set {} to {to}: {e}", form.set_id);
                state
                    .registry
                    .send_to_user(
                        &form.user_id,
                        json!({
                            "type": "catalog_set_send_error",
                            "job_id": job,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
            }
        }
    });

    Ok(Json(json!({"status": "started", "job_id": job_id})))
}

async fn get_catalog_sets_endpoint(State(state): State<AppState>) -> Json<Value> {
    match state.catalog.get_catalog_sets().await {
        Ok(sets) => Json(json!(sets)),
        Err(e) => {
            error!("Error fetching catalog sets: {e}");
            Json(json!([
                {"id": state.catalog.catalog_id(), "name": "All Products"}
            ]))
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogProductsQuery {
    #[serde(default)]
    force_refresh: bool,
}

async fn get_catalog_products_endpoint(
    Query(query): Query<CatalogProductsQuery>,
    State(state): State<AppState>,
) -> Json<Value> {
    if query.force_refresh || !state.catalog.cache_exists_and_fresh() {
        if let Err(e) = state.catalog.refresh_catalog_cache().await {
            warn!("Catalog cache refresh failed: {e}");
        }
    }
    Json(json!(state.catalog.get_cached_products()))
}

#[derive(Debug, Deserialize)]
struct SetProductsQuery {
    set_id: String,
    #[serde(default = "default_set_limit")]
    limit: usize,
}

fn default_set_limit() -> usize {
    60
}

async fn get_catalog_set_products(
    Query(query): Query<SetProductsQuery>,
    State(state): State<AppState>,
) -> Json<Value> {
    match state
        .catalog
        .get_products_for_set(&query.set_id, query.limit)
        .await
    {
        Ok(products) => Json(json!(products)),
        Err(e) => {
            error!("Error fetching set products: {e}");
            Json(json!([]))
        }
    }
}

async fn refresh_catalog_cache_endpoint(State(state): State<AppState>) -> Json<Value> {
    tokio::spawn(async move {
        match state.catalog.refresh_catalog_cache().await {
            Ok(count) => info!("Catalog cache refreshed with {count} items"),
            Err(e) => warn!("Catalog cache refresh failed: {e}"),
        }
    });
    Json(json!({"status": "refresh started"}))
}

// ---------------- health, metrics, media ----------------

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "cache": if state.cache.is_enabled() { "connected" } else { "disconnected" },
        "active_connections": state.registry.active_connection_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "whatsapp_config": {
            "access_token_configured": !state.config.access_token.is_empty(),
            "phone_number_id_configured": !state.config.phone_number_id.is_empty(),
            "verify_token_configured": !state.config.verify_token.is_empty(),
        },
    }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn serve_media_file(
    AxumPath(filename): AxumPath<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }
    let path = state.config.media_dir_path().join(&filename);
    match tokio::fs::read(&path).await {
        Ok(content) => {
            let mime = mime_guess::from_path(&filename)
                .first_or_octet_stream()
                .to_string();
            ([(header::CONTENT_TYPE, mime)], content).into_response()
        }
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

// ---------------- router & server ----------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", get(verify_webhook).post(handle_webhook))
        .route("/ws/:user_id", get(ws_endpoint))
        .route("/send-message", post(send_message_endpoint))
        .route("/send-media", post(send_media_endpoint))
        .route("/send-media-async", post(send_media_async_endpoint))
        .route("/send-catalog-set", post(send_catalog_set_endpoint))
        .route("/send-catalog-item", post(send_catalog_item_endpoint))
        .route("/send-catalog-all", post(send_catalog_all_endpoint))
        .route("/send-catalog-set-all", post(send_catalog_set_all_endpoint))
        .route("/messages/:user_id", get(get_messages_endpoint))
        .route("/conversations", get(get_conversations_endpoint))
        .route("/conversations/:user_id/mark-read", post(mark_conversation_read))
        .route("/conversations/:user_id/assign", post(assign_conversation))
        .route("/conversations/:user_id/tags", post(update_conversation_tags))
        .route("/users/online", get(get_online_users))
        .route("/active-users", get(get_active_users))
        .route("/admin/agents", get(list_agents_endpoint).post(create_agent_endpoint))
        .route("/admin/agents/:username", delete(delete_agent_endpoint))
        .route(
            "/admin/tag-options",
            get(get_tag_options_endpoint).post(set_tag_options_endpoint),
        )
        .route("/auth/login", post(auth_login))
        .route("/orders/:order_id/delivered", post(order_delivered))
        .route("/payouts/:order_id/mark-paid", post(mark_payout_paid_endpoint))
        .route("/payouts", get(list_payouts))
        .route("/archive", get(list_archive))
        .route("/catalog-sets", get(get_catalog_sets_endpoint))
        .route("/catalog-all-products", get(get_catalog_products_endpoint))
        .route("/catalog-set-products", get(get_catalog_set_products))
        .route(
            "/refresh-catalog-cache",
            get(refresh_catalog_cache_endpoint).post(refresh_catalog_cache_endpoint),
        )
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/media/:filename", get(serve_media_file))
        .with_state(state)
}

pub async fn start_web_server(state: AppState) -> Result<(), GatewayError> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    info!("Gateway listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| GatewayError::Io(std::io::Error::other(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalMediaStorage;
    use crate::shop::ShopClient;
    use crate::store::SqliteStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Arc::new(Config {
            port: 8080,
            base_url: "http://localhost:8080".into(),
            media_dir: std::env::temp_dir()
                .join(format!("chatrelay_web_{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .to_string(),
            db_path: ":memory:".into(),
            database_url: None,
            cache_url: None,
            verify_token: "relay-verify".into(),
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
        });
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheBus::disabled());
        let registry = Arc::new(ConnectionRegistry::new(store.clone(), cache.clone(), &config));
        let client = Arc::new(WhatsAppClient::new(&config));
        let catalog = Arc::new(CatalogManager::new(&config));
        let processor = Arc::new(MessageProcessor::new(
            registry.clone(),
            cache.clone(),
            store.clone(),
            client.clone(),
            catalog.clone(),
            Arc::new(ShopClient::new(None, None)),
            Arc::new(LocalMediaStorage::new(&config.base_url, &config.media_dir_path())),
            &config,
        ));
        let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle();
        AppState {
            config,
            store,
            cache,
            registry,
            processor,
            client,
            catalog,
            metrics,
        }
    }

    #[test]
    fn test_password_hash_roundtrip() {
        let stored = hash_password("s3cret");
        let (salt, digest) = stored.split_once('$').unwrap();
        assert_eq!(salt.len(), 32);
        assert_eq!(digest.len(), 64);
        assert!(verify_password("s3cret", &stored));
        assert!(!verify_password("wrong", &stored));
        assert!(!verify_password("s3cret", "garbage"));
        // Salted: two hashes of the same password differ.
        assert_ne!(stored, hash_password("s3cret"));
    }

    #[tokio::test]
    async fn test_webhook_verification() {
        let app = build_router(test_state());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=relay-verify&hub.challenge=challenge-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"challenge-1");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "healthy");
        assert_eq!(parsed["cache"], "disconnected");
    }

    #[tokio::test]
    async fn test_messages_endpoint_returns_history() {
        let state = test_state();
        for i in 1..=3 {
            state
                .store
                .upsert_message(&MessageRecord {
                    user_id: "u1".into(),
                    temp_id: Some(format!("t_{i}")),
                    body: Some(format!("m{i}")),
                    kind: Some("text".into()),
                    from_agent: Some(true),
                    status: Some("sent".into()),
                    client_ts: Some(format!("2024-01-01T00:00:0{i}Z")),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/messages/u1?offset=0&limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let rows = parsed.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["body"], "m2");
        assert_eq!(rows[1]["body"], "m3");
    }

    #[tokio::test]
    async fn test_agent_admin_and_login() {
        let state = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/agents")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        json!({"username": "sara", "password": "pw", "is_admin": true}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"username": "sara", "password": "pw"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"username": "sara", "password": "nope"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_payout_endpoints() {
        let app = build_router(test_state());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/orders/1001/delivered")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/payouts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/payouts/1001/mark-paid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/archive").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.as_array().unwrap()[0]["order_id"], "1001");
    }

    #[tokio::test]
    async fn test_tags_validation() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/conversations/u1/tags")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"tags": "not-a-list"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_media_serving_rejects_traversal() {
        let state = test_state();
        let media_dir = state.config.media_dir_path();
        std::fs::create_dir_all(&media_dir).unwrap();
        std::fs::write(media_dir.join("image_ok.jpg"), b"jpeg").unwrap();

        let app = build_router(state);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/media/image_ok.jpg")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/media/..%2Fsecret.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let _ = std::fs::remove_dir_all(&media_dir);
    }
}
