use std::path::{Path, PathBuf};
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::cache::CacheBus;
use crate::catalog::CatalogManager;
use crate::error::GatewayError;
use crate::media::{
    self, compute_audio_waveform, convert_to_ogg_opus, ObjectStorage, WAVEFORM_BUCKETS,
};
use crate::registry::ConnectionRegistry;
use crate::shop::ShopClient;
use crate::store::{MessageRecord, Store};
use crate::whatsapp::{extract_upstream_id, ListSection, ReplyButton, WhatsAppClient};
use crate::workflows;

/// Conversations with these prefixes live entirely inside the dashboard and
/// never reach the upstream.
pub fn is_internal_channel(user_id: &str) -> bool {
    user_id.starts_with("team:") || user_id.starts_with("agent:") || user_id.starts_with("dm:")
}

pub fn is_media_kind(kind: &str) -> bool {
    matches!(kind, "image" | "audio" | "video" | "document" | "sticker")
}

/// Outbound send request as received from a duplex session or a REST call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub temp_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub buttons: Option<Vec<ReplyButton>>,
    #[serde(default)]
    pub sections: Option<Vec<ListSection>>,
    #[serde(default)]
    pub button_text: Option<String>,
    #[serde(default)]
    pub header_text: Option<String>,
    #[serde(default)]
    pub footer_text: Option<String>,
    #[serde(default)]
    pub product_retailer_id: Option<String>,
    #[serde(default)]
    pub retailer_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub waveform: Option<Vec<u8>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Optimistic record plus the interactive extras the background dispatch
/// needs but the store does not persist.
#[derive(Debug, Clone)]
struct PendingMessage {
    record: MessageRecord,
    buttons: Vec<ReplyButton>,
    sections: Vec<ListSection>,
    button_text: Option<String>,
    header_text: Option<String>,
    footer_text: Option<String>,
}

#[derive(Clone)]
pub struct MessageProcessor {
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) cache: Arc<CacheBus>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) client: Arc<WhatsAppClient>,
    pub(crate) catalog: Arc<CatalogManager>,
    pub(crate) shop: Arc<ShopClient>,
    pub(crate) storage: Arc<dyn ObjectStorage>,
    pub(crate) base_url: String,
    pub(crate) media_dir: PathBuf,
    pub(crate) auto_reply_enabled: bool,
    pub(crate) auto_reply_min_score: f64,
    pub(crate) auto_reply_test_numbers: std::collections::HashSet<String>,
}

fn event(event_type: &str, data: Value) -> Value {
    json!({"type": event_type, "data": data})
}

fn record_to_value(record: &MessageRecord) -> Value {
    serde_json::to_value(record).unwrap_or_else(|_| json!({}))
}

fn epoch_to_iso(raw: Option<&Value>) -> String {
    let secs = raw
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<i64>().ok())
        .or_else(|| raw.and_then(|v| v.as_i64()))
        .unwrap_or(0);
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        cache: Arc<CacheBus>,
        store: Arc<dyn Store>,
        client: Arc<WhatsAppClient>,
        catalog: Arc<CatalogManager>,
        shop: Arc<ShopClient>,
        storage: Arc<dyn ObjectStorage>,
        config: &crate::config::Config,
    ) -> Self {
        MessageProcessor {
            registry,
            cache,
            store,
            client,
            catalog,
            shop,
            storage,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            media_dir: config.media_dir_path(),
            auto_reply_enabled: config.auto_reply_catalog_match,
            auto_reply_min_score: config.auto_reply_min_score,
            auto_reply_test_numbers: config.auto_reply_test_numbers.clone(),
        }
    }

    // ---------------- outbound pipeline ----------------

    /// Optimistic send: deliver a `sending` record to the agent's sessions
    /// immediately, cache it, and dispatch to the upstream in the background.
    pub async fn process_outgoing_message(
        &self,
        request: OutgoingMessage,
    ) -> Result<MessageRecord, GatewayError> {
        if request.user_id.is_empty() {
            return Err(GatewayError::Validation("user_id is required".into()));
        }
        let user_id = request.user_id.clone();
        self.store.upsert_user(&user_id, None, None, None).await?;

        // Reuse the client's temp id so the optimistic bubble is updated
        // instead of duplicated.
        let temp_id = request
            .temp_id
            .clone()
            .or_else(|| request.id.clone())
            .unwrap_or_else(|| format!("temp_{}", uuid::Uuid::new_v4().simple()));
        let now = chrono::Utc::now().to_rfc3339();
        let kind = request.kind.clone().unwrap_or_else(|| "text".into());

        let mut record = MessageRecord {
            user_id: user_id.clone(),
            temp_id: Some(temp_id.clone()),
            body: request.message.clone(),
            kind: Some(kind.clone()),
            from_agent: Some(true),
            status: Some("sending".into()),
            price: request.price.clone(),
            caption: request.caption.clone(),
            media_path: request.media_path.clone(),
            reply_to: request.reply_to.clone(),
            waveform: request.waveform.clone(),
            product_retailer_id: request
                .product_retailer_id
                .clone()
                .or_else(|| request.retailer_id.clone())
                .or_else(|| request.product_id.clone()),
            retailer_id: request.retailer_id.clone(),
            product_id: request.product_id.clone(),
            client_ts: Some(request.timestamp.clone().unwrap_or_else(|| now.clone())),
            server_ts: Some(now),
            ..Default::default()
        };

        if matches!(kind.as_str(), "image" | "audio" | "video" | "document") {
            record.media_url = match (&request.url, &request.message) {
                (Some(url), _) => Some(url.clone()),
                (None, Some(body)) if !body.starts_with("http") => {
                    // Synthesize a servable URL so the UI renders right away.
                    Path::new(body)
                        .file_name()
                        .map(|name| format!("{}/media/{}", self.base_url, name.to_string_lossy()))
                }
                (None, body) => body.clone(),
            };
        }

        let mut data = record_to_value(&record);
        data["id"] = json!(temp_id);
        if let Some(buttons) = &request.buttons {
            data["buttons"] = serde_json::to_value(buttons).unwrap_or(Value::Null);
        }
        self.registry
            .send_to_user(&user_id, event("message_sent", data.clone()))
            .await;
        self.cache.cache_message(&user_id, &data).await;

        let pending = PendingMessage {
            record: record.clone(),
            buttons: request.buttons.clone().unwrap_or_default(),
            sections: request.sections.clone().unwrap_or_default(),
            button_text: request.button_text.clone(),
            header_text: request.header_text.clone(),
            footer_text: request.footer_text.clone(),
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.send_to_whatsapp_bg(pending).await;
        });

        Ok(record)
    }

    // ---------------- background dispatch ----------------

    async fn send_to_whatsapp_bg(&self, pending: PendingMessage) {
        let record = &pending.record;
        let user_id = record.user_id.clone();
        let temp_id = record.temp_id.clone().unwrap_or_default();

        if is_internal_channel(&user_id) {
            if let Err(e) = self.finish_internal_channel(record).await {
                error!("Internal channel processing error: {e}");
            }
            return;
        }

        let result = self.dispatch_upstream(&pending).await;
        match result {
            Ok(envelope) => {
                let Some(upstream_id) = extract_upstream_id(&envelope) else {
                    self.notify_send_failed(
                        &user_id,
                        &temp_id,
                        &format!("no message id in upstream response: {envelope}"),
                    )
                    .await;
                    self.cleanup_media(record).await;
                    return;
                };
                counter!("chatrelay_messages_sent_total").increment(1);
                self.registry
                    .send_to_user(
                        &user_id,
                        event(
                            "message_status_update",
                            json!({
                                "temp_id": temp_id,
                                "upstream_id": upstream_id.clone(),
                                "status": "sent",
                            }),
                        ),
                    )
                    .await;
                let mut final_record = record.clone();
                final_record.upstream_id = Some(upstream_id.clone());
                final_record.status = Some("sent".into());
                if let Err(e) = self.store.upsert_message(&final_record).await {
                    error!("Persisting sent message failed: {e}");
                }
                debug!("Message sent: {upstream_id}");
            }
            Err(e) => {
                counter!("chatrelay_send_failures_total").increment(1);
                error!("WhatsApp send failed: {e}");
                self.notify_send_failed(&user_id, &temp_id, &e.to_string()).await;
            }
        }
        self.cleanup_media(record).await;
    }

    async fn finish_internal_channel(
        &self,
        record: &MessageRecord,
    ) -> Result<(), GatewayError> {
        let user_id = &record.user_id;
        let temp_id = record.temp_id.clone().unwrap_or_default();
        self.registry
            .send_to_user(
                user_id,
                event(
                    "message_status_update",
                    json!({"temp_id": temp_id, "status": "sent"}),
                ),
            )
            .await;
        let mut final_record = record.clone();
        final_record.status = Some("sent".into());
        self.store.upsert_message(&final_record).await?;
        let data = record_to_value(&final_record);
        self.cache.cache_message(user_id, &data).await;
        self.registry
            .broadcast_to_admins(event("message_received", data), None)
            .await;
        Ok(())
    }

    async fn notify_send_failed(&self, user_id: &str, temp_id: &str, error_text: &str) {
        self.registry
            .send_to_user(
                user_id,
                event(
                    "message_status_update",
                    json!({"temp_id": temp_id, "status": "failed", "error": error_text}),
                ),
            )
            .await;
        let failed = MessageRecord {
            user_id: user_id.to_string(),
            temp_id: Some(temp_id.to_string()),
            status: Some("failed".into()),
            ..Default::default()
        };
        if let Err(e) = self.store.upsert_message(&failed).await {
            debug!("Persisting failed status failed: {e}");
        }
    }

    /// Cleanup runs on all exit paths of the background dispatch.
    async fn cleanup_media(&self, record: &MessageRecord) {
        if let Some(path) = &record.media_path {
            if Path::new(path).exists() {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("Cleanup failed for {path}: {e}");
                }
            }
        }
    }

    async fn dispatch_upstream(
        &self,
        pending: &PendingMessage,
    ) -> Result<Value, GatewayError> {
        let record = &pending.record;
        let user_id = &record.user_id;
        let body = record.body.as_deref().unwrap_or("");
        let reply_to = record.reply_to.as_deref();

        match record.kind_str() {
            "text" => self.client.send_text(user_id, body, reply_to).await,
            "catalog_item" | "interactive_product" => {
                self.dispatch_catalog_item(record).await
            }
            "buttons" | "interactive_buttons" => {
                if pending.buttons.is_empty() {
                    self.client.send_text(user_id, body, None).await
                } else {
                    self.client
                        .send_reply_buttons(user_id, body, &pending.buttons)
                        .await
                }
            }
            "list" | "interactive_list" => {
                if pending.sections.is_empty() {
                    self.client.send_text(user_id, body, None).await
                } else {
                    self.client
                        .send_list_message(
                            user_id,
                            body,
                            pending.button_text.as_deref().unwrap_or("Choose"),
                            &pending.sections,
                            pending.header_text.as_deref(),
                            pending.footer_text.as_deref(),
                        )
                        .await
                }
            }
            "order" => self.client.send_text(user_id, body, None).await,
            kind => self.dispatch_media(record, kind).await,
        }
    }

    async fn dispatch_catalog_item(
        &self,
        record: &MessageRecord,
    ) -> Result<Value, GatewayError> {
        let user_id = &record.user_id;
        let retailer_id = record
            .retailer_id
            .clone()
            .or_else(|| record.product_retailer_id.clone())
            .or_else(|| record.product_id.clone())
            .ok_or_else(|| {
                GatewayError::Validation("missing product_retailer_id for catalog_item".into())
            })?;
        let mut caption = record
            .caption
            .clone()
            .or_else(|| record.body.clone())
            .unwrap_or_default();

        match self
            .client
            .send_interactive_product(user_id, &retailer_id, &caption)
            .await
        {
            Ok(envelope) => Ok(envelope),
            Err(first_err) => {
                debug!("Interactive product send failed, falling back: {first_err}");
                // Resolve a fallback image: local catalog cache first, then the
                // e-commerce backend's variant image.
                let mut image_url = None;
                let mut price = String::new();
                let products = self.catalog.get_cached_products();
                if let Some(product) = products
                    .iter()
                    .find(|p| p.retailer_id.as_deref() == Some(retailer_id.as_str()))
                {
                    image_url = product.images.first().map(|img| img.url.clone());
                    price = product.price.clone().unwrap_or_default();
                }
                if image_url.is_none() {
                    let ui_variant_id = record
                        .product_retailer_id
                        .clone()
                        .or_else(|| record.product_id.clone())
                        .unwrap_or_default();
                    if !ui_variant_id.is_empty() {
                        if let Some(variant) = self.shop.fetch_variant(&ui_variant_id).await {
                            image_url = variant.image_src.clone();
                            if let Some(p) = variant.price {
                                price = p;
                            }
                            if caption.is_empty() {
                                caption = variant.title.unwrap_or_default();
                            }
                        }
                    }
                }
                if let Some(url) = image_url {
                    let fallback_caption = if caption.is_empty() && !price.is_empty() {
                        format!("{price} MAD")
                    } else {
                        caption.clone()
                    };
                    self.client
                        .send_media(user_id, "image", &url, &fallback_caption, None)
                        .await
                } else {
                    let text = if caption.is_empty() { &retailer_id } else { &caption };
                    self.client.send_text(user_id, text, None).await
                }
            }
        }
    }

    async fn dispatch_media(
        &self,
        record: &MessageRecord,
        kind: &str,
    ) -> Result<Value, GatewayError> {
        let user_id = &record.user_id;
        let caption = record.caption.as_deref().unwrap_or("");
        let reply_to = record.reply_to.as_deref();
        let temp_id = record.temp_id.clone().unwrap_or_default();

        let local_path = record
            .media_path
            .as_deref()
            .filter(|p| Path::new(p).exists())
            .map(|p| p.to_string());

        if let Some(mut path) = local_path {
            if kind == "audio" && !path.to_lowercase().ends_with(".ogg") {
                match convert_to_ogg_opus(Path::new(&path)).await {
                    Ok(converted) => path = converted.to_string_lossy().to_string(),
                    Err(e) => warn!("Audio normalization skipped: {e}"),
                }
            }
            // Best-effort object-storage upload so the UI gets a durable URL;
            // the upstream send does not wait for it.
            if let Some(public_url) = self.storage.upload(&path, None).await {
                self.registry
                    .send_to_user(
                        user_id,
                        event(
                            "message_status_update",
                            json!({"temp_id": temp_id, "url": public_url.clone()}),
                        ),
                    )
                    .await;
                let url_update = MessageRecord {
                    user_id: user_id.clone(),
                    temp_id: record.temp_id.clone(),
                    media_url: Some(public_url.clone()),
                    body: if is_media_kind(kind) { Some(public_url) } else { None },
                    ..Default::default()
                };
                if let Err(e) = self.store.upsert_message(&url_update).await {
                    debug!("Persisting media URL failed: {e}");
                }
            }

            info!("Uploading media to WhatsApp: {path}");
            let media_id = self.client.upload_media(&path, kind).await?;
            return self
                .client
                .send_media(user_id, kind, &media_id, caption, reply_to)
                .await;
        }

        if let Some(url) = record
            .media_url
            .as_deref()
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        {
            return self
                .client
                .send_media(user_id, kind, url, caption, reply_to)
                .await;
        }

        Err(GatewayError::Validation(
            "no media found: need an http(s) url or a valid media_path".into(),
        ))
    }

    // ---------------- inbound pipeline ----------------

    /// Webhook envelope entry point. Two arrays may appear in each change:
    /// `statuses` and `messages`; both are processed in the order provided.
    pub async fn process_incoming_webhook(&self, payload: &Value) {
        counter!("chatrelay_webhook_batches_total").increment(1);
        let entries = payload.get("entry").and_then(|e| e.as_array());
        for entry in entries.into_iter().flatten() {
            let changes = entry.get("changes").and_then(|c| c.as_array());
            for change in changes.into_iter().flatten() {
                let Some(value) = change.get("value") else { continue };
                if let Some(statuses) = value.get("statuses").and_then(|s| s.as_array()) {
                    self.handle_status_updates(statuses).await;
                }
                if let Some(messages) = value.get("messages").and_then(|m| m.as_array()) {
                    let contacts = value
                        .get("contacts")
                        .and_then(|c| c.as_array())
                        .cloned()
                        .unwrap_or_default();
                    for (idx, message) in messages.iter().enumerate() {
                        let contact = contacts.get(idx);
                        if let Err(e) = self.handle_incoming_message(message, contact).await {
                            error!("Webhook message processing error: {e}");
                        }
                    }
                }
            }
        }
    }

    async fn handle_status_updates(&self, statuses: &[Value]) {
        for item in statuses {
            let Some(upstream_id) = item.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(status) = item.get("status").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Err(e) = self.store.update_status(upstream_id, status).await {
                warn!("Status update failed for {upstream_id}: {e}");
                continue;
            }
            let temp_id = self
                .store
                .get_temp_id_for_message(upstream_id)
                .await
                .ok()
                .flatten();
            let user_id = match self.store.get_user_for_message(upstream_id).await {
                Ok(Some(user_id)) => user_id,
                _ => continue, // owner unknown, drop
            };
            let timestamp = epoch_to_iso(item.get("timestamp"));
            self.registry
                .send_to_user(
                    &user_id,
                    event(
                        "message_status_update",
                        json!({
                            "temp_id": temp_id,
                            "upstream_id": upstream_id,
                            "status": status,
                            "timestamp": timestamp,
                        }),
                    ),
                )
                .await;
        }
    }

    async fn handle_incoming_message(
        &self,
        message: &Value,
        contact: Option<&Value>,
    ) -> Result<(), GatewayError> {
        let sender = message
            .get("from")
            .and_then(|v| v.as_str())
            .or_else(|| contact.and_then(|c| c.get("wa_id")).and_then(|v| v.as_str()))
            .ok_or_else(|| GatewayError::Validation("incoming message missing sender id".into()))?
            .to_string();
        let kind = message
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("text")
            .to_string();
        let upstream_id = message
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let timestamp = epoch_to_iso(message.get("timestamp"));
        let server_now = chrono::Utc::now().to_rfc3339();
        counter!("chatrelay_inbound_messages_total").increment(1);

        let contact_name = contact
            .and_then(|c| c.get("profile"))
            .and_then(|p| p.get("name"))
            .and_then(|v| v.as_str());
        self.store
            .upsert_user(&sender, contact_name, Some(&sender), None)
            .await?;
        self.auto_unarchive(&sender).await;

        // Reactions never create a bubble, only an update event and an audit
        // row.
        if kind == "reaction" {
            return self
                .handle_inbound_reaction(&sender, message, upstream_id, &timestamp)
                .await;
        }

        let mut record = MessageRecord {
            user_id: sender.clone(),
            upstream_id: upstream_id.clone(),
            kind: Some(kind.clone()),
            from_agent: Some(false),
            status: Some("received".into()),
            client_ts: Some(timestamp.clone()),
            server_ts: Some(server_now),
            ..Default::default()
        };

        match kind.as_str() {
            "text" => {
                record.body = message
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
            }
            "interactive" => {
                let interactive = message.get("interactive").cloned().unwrap_or_default();
                let reply = interactive
                    .get("button_reply")
                    .or_else(|| interactive.get("list_reply"))
                    .cloned()
                    .unwrap_or_default();
                let reply_id = reply
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                let title = reply
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                record.kind = Some("text".into());
                record.body = Some(if title.is_empty() {
                    "[interactive_reply]".into()
                } else {
                    title.clone()
                });
                if workflows::is_workflow_reply(&reply_id) {
                    self.capture_reply_context(message, &mut record);
                    self.persist_and_fanout_inbound(&record).await?;
                    if let Err(e) =
                        workflows::handle_workflow_reply(self, &sender, &reply_id, &title).await
                    {
                        error!("Workflow reply error: {e}");
                    }
                    return Ok(());
                }
            }
            "image" => match self.download_inbound_media(message, "image", "image").await {
                Ok((path, url)) => {
                    record.body = Some(path.clone());
                    record.media_path = Some(path);
                    record.media_url = Some(url);
                    record.caption = message
                        .get("image")
                        .and_then(|m| m.get("caption"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                }
                Err(e) => {
                    warn!("Inbound image download failed: {e}");
                    record.kind = Some("text".into());
                    record.body = Some("[image]".into());
                }
            },
            "sticker" => {
                // Stickers render as images; a failed download degrades to a
                // text placeholder instead of dropping the message.
                match self.download_inbound_media(message, "sticker", "image").await {
                    Ok((path, url)) => {
                        record.kind = Some("image".into());
                        record.body = Some(path.clone());
                        record.media_path = Some(path);
                        record.media_url = Some(url);
                    }
                    Err(e) => {
                        warn!("Inbound sticker download failed: {e}");
                        record.kind = Some("text".into());
                        record.body = Some("[sticker]".into());
                    }
                }
            }
            "audio" => match self.download_inbound_media(message, "audio", "audio").await {
                Ok((path, url)) => {
                    record.body = Some(path.clone());
                    record.media_path = Some(path.clone());
                    record.media_url = Some(url);
                    if let Some(file_name) = Path::new(&path).file_name() {
                        let full_path = self.media_dir.join(file_name);
                        record.waveform =
                            Some(compute_audio_waveform(&full_path, WAVEFORM_BUCKETS).await);
                    }
                }
                Err(e) => {
                    warn!("Inbound audio download failed: {e}");
                    record.kind = Some("text".into());
                    record.body = Some("[audio]".into());
                }
            },
            "video" => match self.download_inbound_media(message, "video", "video").await {
                Ok((path, url)) => {
                    record.body = Some(path.clone());
                    record.media_path = Some(path);
                    record.media_url = Some(url);
                    record.caption = message
                        .get("video")
                        .and_then(|m| m.get("caption"))
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                }
                Err(e) => {
                    warn!("Inbound video download failed: {e}");
                    record.kind = Some("text".into());
                    record.body = Some("[video]".into());
                }
            },
            "order" => {
                record.body = message.get("order").map(|o| o.to_string());
            }
            _ => {}
        }

        self.capture_reply_context(message, &mut record);
        self.persist_and_fanout_inbound(&record).await?;

        // Automations never abort the inbound pipeline.
        if kind == "text" {
            let body = record.body.clone().unwrap_or_default();
            if let Err(e) = workflows::maybe_auto_reply_with_catalog(self, &sender, &body).await {
                warn!("Auto-reply failed: {e}");
            }
        } else if kind == "interactive" {
            let ack = OutgoingMessage {
                user_id: sender.clone(),
                kind: Some("text".into()),
                message: Some("Message reçu. Merci !\nتم استلام ردك، شكرًا لك!".into()),
                ..Default::default()
            };
            if let Err(e) = self.process_outgoing_message(ack).await {
                warn!("Interactive acknowledgment failed: {e}");
            }
        }
        Ok(())
    }

    fn capture_reply_context(&self, message: &Value, record: &mut MessageRecord) {
        if let Some(context_id) = message
            .get("context")
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_str())
        {
            record.reply_to = Some(context_id.to_string());
        }
    }

    async fn handle_inbound_reaction(
        &self,
        sender: &str,
        message: &Value,
        upstream_id: Option<String>,
        timestamp: &str,
    ) -> Result<(), GatewayError> {
        let reaction = message.get("reaction").cloned().unwrap_or_default();
        let target_id = reaction.get("message_id").and_then(|v| v.as_str());
        let emoji = reaction.get("emoji").and_then(|v| v.as_str());
        let action = reaction
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("react");

        let audit = MessageRecord {
            user_id: sender.to_string(),
            upstream_id: upstream_id.clone(),
            kind: Some("reaction".into()),
            from_agent: Some(false),
            status: Some("received".into()),
            client_ts: Some(timestamp.to_string()),
            reaction_target: target_id.map(|s| s.to_string()),
            reaction_emoji: emoji.map(|s| s.to_string()),
            reaction_action: Some(action.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.store.upsert_message(&audit).await {
            debug!("Persisting reaction audit row failed: {e}");
        }

        let reaction_event = event(
            "reaction_update",
            json!({
                "user_id": sender,
                "target_upstream_id": target_id,
                "emoji": emoji,
                "action": action,
                "from_agent": false,
                "upstream_id": upstream_id,
                "timestamp": timestamp,
            }),
        );
        self.registry.send_to_user(sender, reaction_event.clone()).await;
        self.registry
            .broadcast_to_admins(reaction_event, Some(sender))
            .await;
        Ok(())
    }

    /// Local fan-out, admin broadcast (excluding the sender), caching, then
    /// durable persistence for an inbound record.
    async fn persist_and_fanout_inbound(
        &self,
        record: &MessageRecord,
    ) -> Result<(), GatewayError> {
        let mut data = record_to_value(record);
        if let Some(upstream_id) = &record.upstream_id {
            data["id"] = json!(upstream_id);
        }
        self.registry
            .send_to_user(&record.user_id, event("message_received", data.clone()))
            .await;
        self.registry
            .broadcast_to_admins(event("message_received", data.clone()), Some(&record.user_id))
            .await;
        self.cache.cache_message(&record.user_id, &data).await;
        self.store.upsert_message(record).await
    }

    /// A new inbound message strips a `done` tag so the conversation comes
    /// back from the archive.
    async fn auto_unarchive(&self, user_id: &str) {
        let meta = match self.store.get_conversation_meta(user_id).await {
            Ok(meta) => meta,
            Err(_) => return,
        };
        if meta.tags.iter().any(|t| t.to_lowercase() == "done") {
            let remaining: Vec<String> = meta
                .tags
                .into_iter()
                .filter(|t| t.to_lowercase() != "done")
                .collect();
            if let Err(e) = self.store.set_conversation_tags(user_id, &remaining).await {
                debug!("Auto-unarchive failed for {user_id}: {e}");
            }
        }
    }

    /// Download inbound media via the upstream client, persist it to the
    /// media directory and object storage, and return the relative path plus
    /// the public URL.
    async fn download_inbound_media(
        &self,
        message: &Value,
        field: &str,
        kind: &str,
    ) -> Result<(String, String), GatewayError> {
        let media_id = message
            .get(field)
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Validation(format!("{field} payload missing media id")))?;
        let (content, mime_type) = self.client.download_media(media_id).await?;
        let extension = media::extension_for_mime(&mime_type);
        let filename = media::media_filename(kind, &extension);
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let file_path = self.media_dir.join(&filename);
        tokio::fs::write(&file_path, &content).await?;

        let public_url = self
            .storage
            .upload(&file_path.to_string_lossy(), Some(&mime_type))
            .await
            .unwrap_or_else(|| format!("{}/media/{filename}", self.base_url));
        Ok((format!("/media/{filename}"), public_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBus;
    use crate::config::Config;
    use crate::media::LocalMediaStorage;
    use crate::store::SqliteStore;

    fn test_config() -> Config {
        Config {
            port: 8080,
            base_url: "http://localhost:8080".into(),
            media_dir: std::env::temp_dir()
                .join(format!("chatrelay_proc_{}", uuid::Uuid::new_v4()))
                .to_string_lossy()
                .to_string(),
            db_path: ":memory:".into(),
            database_url: None,
            cache_url: None,
            verify_token: "token".into(),
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

    fn build_processor() -> (Arc<MessageProcessor>, Arc<SqliteStore>, Arc<ConnectionRegistry>) {
        let config = test_config();
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let cache = Arc::new(CacheBus::disabled());
        let registry = Arc::new(ConnectionRegistry::new(
            store.clone() as Arc<dyn Store>,
            cache.clone(),
            &config,
        ));
        let client = Arc::new(WhatsAppClient::new(&config));
        let catalog = Arc::new(CatalogManager::new(&config));
        let shop = Arc::new(ShopClient::new(None, None));
        let storage = Arc::new(LocalMediaStorage::new(
            &config.base_url,
            &config.media_dir_path(),
        ));
        let processor = Arc::new(MessageProcessor::new(
            registry.clone(),
            cache,
            store.clone() as Arc<dyn Store>,
            client,
            catalog,
            shop,
            storage,
            &config,
        ));
        (processor, store, registry)
    }

    #[test]
    fn test_internal_channel_detection() {
        assert!(is_internal_channel("team:support"));
        assert!(is_internal_channel("agent:sara"));
        assert!(is_internal_channel("dm:sara:omar"));
        assert!(!is_internal_channel("212600000001"));
    }

    #[test]
    fn test_epoch_to_iso() {
        let ts = epoch_to_iso(Some(&json!("1700000000")));
        assert!(ts.starts_with("2023-11-14T"));
        assert!(epoch_to_iso(None).starts_with("1970-01-01T"));
    }

    #[tokio::test]
    async fn test_optimistic_event_precedes_dispatch() {
        let (processor, store, registry) = build_processor();
        let (_session, mut rx) = registry.connect("team:support");

        let record = processor
            .process_outgoing_message(OutgoingMessage {
                user_id: "team:support".into(),
                kind: Some("text".into()),
                message: Some("standup in 5".into()),
                temp_id: Some("t_a".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(record.temp_id.as_deref(), Some("t_a"));
        assert_eq!(record.status.as_deref(), Some("sending"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first["type"], "message_sent");
        assert_eq!(first["data"]["temp_id"], "t_a");
        assert_eq!(first["data"]["status"], "sending");

        // Internal channels are marked sent without touching the upstream.
        let second = rx.recv().await.unwrap();
        assert_eq!(second["type"], "message_status_update");
        assert_eq!(second["data"]["temp_id"], "t_a");
        assert_eq!(second["data"]["status"], "sent");

        // The background task persists right after emitting the event.
        let mut rows = Vec::new();
        for _ in 0..50 {
            rows = store.get_messages("team:support", 0, 10).await.unwrap();
            if !rows.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status.as_deref(), Some("sent"));
    }

    #[tokio::test]
    async fn test_generated_temp_id_when_absent() {
        let (processor, _store, registry) = build_processor();
        let (_session, mut rx) = registry.connect("team:x");
        let record = processor
            .process_outgoing_message(OutgoingMessage {
                user_id: "team:x".into(),
                message: Some("hi".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let temp_id = record.temp_id.unwrap();
        assert!(temp_id.starts_with("temp_"));
        let first = rx.recv().await.unwrap();
        assert_eq!(first["data"]["temp_id"], temp_id.as_str());
    }

    #[tokio::test]
    async fn test_media_fallback_url_synthesized() {
        let (processor, _store, registry) = build_processor();
        let (_session, mut rx) = registry.connect("team:media");
        processor
            .process_outgoing_message(OutgoingMessage {
                user_id: "team:media".into(),
                kind: Some("image".into()),
                message: Some("media/image_x.jpg".into()),
                media_path: Some("media/image_x.jpg".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(
            first["data"]["media_url"],
            "http://localhost:8080/media/image_x.jpg"
        );
    }

    #[tokio::test]
    async fn test_missing_user_id_rejected() {
        let (processor, _store, _registry) = build_processor();
        let result = processor
            .process_outgoing_message(OutgoingMessage {
                message: Some("hello".into()),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_inbound_text_persisted_and_fanned_out() {
        let (processor, store, registry) = build_processor();
        let (_session, mut rx) = registry.connect("212600000001");

        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "contacts": [{"wa_id": "212600000001", "profile": {"name": "Amine"}}],
                "messages": [{
                    "from": "212600000001",
                    "id": "wamid.IN1",
                    "type": "text",
                    "timestamp": "1700000000",
                    "text": {"body": "salam"},
                }],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], "message_received");
        assert_eq!(received["data"]["body"], "salam");
        assert_eq!(received["data"]["from_agent"], false);

        let rows = store.get_messages("212600000001", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].upstream_id.as_deref(), Some("wamid.IN1"));
        assert_eq!(rows[0].status.as_deref(), Some("received"));
    }

    #[tokio::test]
    async fn test_inbound_reaction_creates_no_bubble() {
        let (processor, store, registry) = build_processor();
        let (_session, mut rx) = registry.connect("212600000001");

        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "messages": [{
                    "from": "212600000001",
                    "id": "wamid.R1",
                    "type": "reaction",
                    "timestamp": "1700000000",
                    "reaction": {"message_id": "wamid.T", "emoji": "👍", "action": "react"},
                }],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received["type"], "reaction_update");
        assert_eq!(received["data"]["target_upstream_id"], "wamid.T");
        assert_eq!(received["data"]["emoji"], "👍");
        assert!(rx.try_recv().is_err());

        // Audit row only, flagged as a reaction kind.
        let rows = store.get_messages("212600000001", 0, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind.as_deref(), Some("reaction"));
        assert_eq!(rows[0].reaction_emoji.as_deref(), Some("👍"));
    }

    #[tokio::test]
    async fn test_status_receipt_updates_row_and_notifies() {
        let (processor, store, registry) = build_processor();
        let mut sent = MessageRecord {
            user_id: "212600000001".into(),
            temp_id: Some("t_a".into()),
            upstream_id: Some("wamid.X".into()),
            body: Some("hello".into()),
            kind: Some("text".into()),
            from_agent: Some(true),
            status: Some("sent".into()),
            client_ts: Some("2024-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        store.upsert_message(&sent).await.unwrap();
        let (_session, mut rx) = registry.connect("212600000001");

        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "statuses": [{"id": "wamid.X", "status": "delivered", "timestamp": "1700000000"}],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;

        let update = rx.recv().await.unwrap();
        assert_eq!(update["type"], "message_status_update");
        assert_eq!(update["data"]["upstream_id"], "wamid.X");
        assert_eq!(update["data"]["temp_id"], "t_a");
        assert_eq!(update["data"]["status"], "delivered");

        let rows = store.get_messages("212600000001", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("delivered"));

        // A late downgrade is ignored and the owner of an unknown id is
        // dropped without fan-out.
        sent.status = Some("read".into());
        store.upsert_message(&sent).await.unwrap();
        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "statuses": [
                    {"id": "wamid.X", "status": "sent", "timestamp": "1700000001"},
                    {"id": "wamid.unknown", "status": "read", "timestamp": "1700000002"},
                ],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;
        let rows = store.get_messages("212600000001", 0, 10).await.unwrap();
        assert_eq!(rows[0].status.as_deref(), Some("read"));
    }

    #[tokio::test]
    async fn test_inbound_strips_done_tag() {
        let (processor, store, _registry) = build_processor();
        store
            .set_conversation_tags("212600000001", &["Done".into(), "vip".into()])
            .await
            .unwrap();

        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "messages": [{
                    "from": "212600000001",
                    "id": "wamid.IN2",
                    "type": "text",
                    "timestamp": "1700000000",
                    "text": {"body": "still here"},
                }],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;

        let meta = store.get_conversation_meta("212600000001").await.unwrap();
        assert_eq!(meta.tags, vec!["vip".to_string()]);
    }

    #[tokio::test]
    async fn test_inbound_order_serialized() {
        let (processor, store, _registry) = build_processor();
        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "messages": [{
                    "from": "212600000001",
                    "id": "wamid.O1",
                    "type": "order",
                    "timestamp": "1700000000",
                    "order": {"catalog_id": "cat1", "product_items": [{"product_retailer_id": "123"}]},
                }],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;
        let rows = store.get_messages("212600000001", 0, 10).await.unwrap();
        assert_eq!(rows[0].kind.as_deref(), Some("order"));
        assert!(rows[0].body.as_deref().unwrap().contains("product_retailer_id"));
    }

    #[tokio::test]
    async fn test_reply_context_captured() {
        let (processor, store, _registry) = build_processor();
        let webhook = json!({
            "entry": [{"changes": [{"value": {
                "messages": [{
                    "from": "212600000001",
                    "id": "wamid.IN3",
                    "type": "text",
                    "timestamp": "1700000000",
                    "text": {"body": "replying"},
                    "context": {"id": "wamid.ORIG"},
                }],
            }}]}],
        });
        processor.process_incoming_webhook(&webhook).await;
        let rows = store.get_messages("212600000001", 0, 10).await.unwrap();
        assert_eq!(rows[0].reply_to.as_deref(), Some("wamid.ORIG"));
    }
}
