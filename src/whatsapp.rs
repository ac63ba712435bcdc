use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::config::{Config, MAX_CATALOG_ITEMS};
use crate::error::GatewayError;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(15);
const MEDIA_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyButton {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListSection {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub rows: Vec<ListRow>,
}

/// Character-boundary truncation for WhatsApp field limits.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// First assigned message id in an upstream send envelope.
pub fn extract_upstream_id(envelope: &Value) -> Option<String> {
    envelope
        .get("messages")?
        .as_array()?
        .first()?
        .get("id")?
        .as_str()
        .map(|s| s.to_string())
}

/// Interactive product-list payloads, chunked to the upstream's 30-item cap
/// with bilingual part headers and the covered item range in the body.
pub fn product_list_payloads(catalog_id: &str, to: &str, product_ids: &[String]) -> Vec<Value> {
    let chunks: Vec<&[String]> = product_ids.chunks(MAX_CATALOG_ITEMS).collect();
    let total = chunks.len();
    let mut payloads = Vec::with_capacity(total);
    let mut running_index = 1usize;

    for (idx, chunk) in chunks.iter().enumerate() {
        let part = idx + 1;
        let start = running_index;
        let end = running_index + chunk.len() - 1;
        running_index += chunk.len();

        let header_text = format!("Partie {part}/{total} • الجزء {part}/{total}");
        let body_text = format!(
            "Voici la partie {part}/{total} des articles (№ {start}–{end}).\n\
             هذه هي الجزء {part}/{total} من العناصر (رقم {start}–{end})."
        );
        let section_title = format!("Part {part}/{total}");

        payloads.push(json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "product_list",
                "header": {"type": "text", "text": header_text},
                "body": {"text": body_text},
                "action": {
                    "catalog_id": catalog_id,
                    "sections": [{
                        "title": section_title,
                        "product_items": chunk.iter()
                            .map(|rid| json!({"product_retailer_id": rid}))
                            .collect::<Vec<_>>(),
                    }],
                },
            },
        }));
    }
    payloads
}

/// Drop rows without id/title and apply the upstream's length limits
/// (section titles 24, row titles 24, descriptions 72).
pub fn clean_list_sections(sections: &[ListSection]) -> Vec<Value> {
    let mut cleaned = Vec::new();
    for section in sections {
        let rows: Vec<Value> = section
            .rows
            .iter()
            .filter(|r| !r.id.trim().is_empty() && !r.title.trim().is_empty())
            .map(|r| {
                let mut row = json!({
                    "id": r.id.trim(),
                    "title": truncate_chars(r.title.trim(), 24),
                });
                if let Some(desc) = r.description.as_deref().map(str::trim).filter(|d| !d.is_empty())
                {
                    row["description"] = json!(truncate_chars(desc, 72));
                }
                row
            })
            .collect();
        if rows.is_empty() {
            continue;
        }
        let mut out = json!({ "rows": rows });
        if let Some(title) = section.title.as_deref().filter(|t| !t.is_empty()) {
            out["title"] = json!(truncate_chars(title, 24));
        }
        cleaned.push(out);
    }
    cleaned
}

/// Typed calls to the WhatsApp Cloud API. Every request passes through a
/// process-wide semaphore so bursts cannot exhaust the upstream quota.
pub struct WhatsAppClient {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    catalog_id: String,
    graph_base: String,
    semaphore: Arc<Semaphore>,
}

impl WhatsAppClient {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .unwrap_or_default();
        WhatsAppClient {
            http,
            access_token: config.access_token.clone(),
            phone_number_id: config.phone_number_id.clone(),
            catalog_id: config.catalog_id.clone(),
            graph_base: config.graph_base(),
            semaphore: Arc::new(Semaphore::new(config.wa_max_concurrency)),
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.graph_base, self.phone_number_id)
    }

    async fn make_request(&self, payload: &Value) -> Result<Value, GatewayError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            GatewayError::Upstream {
                status: 0,
                body: "upstream semaphore closed".into(),
            }
        })?;
        let resp = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!("WhatsApp API error {status}: {body}");
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn send_text(
        &self,
        to: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "text",
            "text": {"body": body},
        });
        if let Some(context_id) = reply_to {
            payload["context"] = json!({"message_id": context_id});
        }
        debug!("Sending text to {to}");
        self.make_request(&payload).await
    }

    pub async fn send_reaction(
        &self,
        to: &str,
        target_message_id: &str,
        emoji: &str,
        action: &str,
    ) -> Result<Value, GatewayError> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "reaction",
            "reaction": {
                "message_id": target_message_id,
                "emoji": emoji,
                "action": if action.is_empty() { "react" } else { action },
            },
        });
        self.make_request(&payload).await
    }

    pub async fn send_interactive_product(
        &self,
        to: &str,
        product_retailer_id: &str,
        caption: &str,
    ) -> Result<Value, GatewayError> {
        let body = if caption.is_empty() {
            "Découvrez ce produit !\nتفقد هذا المنتج!"
        } else {
            caption
        };
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "product",
                "body": {"text": body},
                "action": {
                    "catalog_id": self.catalog_id,
                    "product_retailer_id": product_retailer_id,
                },
            },
        });
        self.make_request(&payload).await
    }

    pub async fn send_product_list(
        &self,
        to: &str,
        product_ids: &[String],
    ) -> Result<Vec<Value>, GatewayError> {
        let mut results = Vec::new();
        for payload in product_list_payloads(&self.catalog_id, to, product_ids) {
            results.push(self.make_request(&payload).await?);
        }
        Ok(results)
    }

    pub async fn send_reply_buttons(
        &self,
        to: &str,
        body_text: &str,
        buttons: &[ReplyButton],
    ) -> Result<Value, GatewayError> {
        let cleaned: Vec<Value> = buttons
            .iter()
            .filter(|b| !b.id.is_empty() && !b.title.is_empty())
            .map(|b| {
                json!({
                    "type": "reply",
                    "reply": {"id": b.id, "title": truncate_chars(&b.title, 20)},
                })
            })
            .collect();
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "button",
                "body": {"text": body_text},
                "action": {"buttons": cleaned},
            },
        });
        self.make_request(&payload).await
    }

    pub async fn send_list_message(
        &self,
        to: &str,
        body_text: &str,
        button_text: &str,
        sections: &[ListSection],
        header_text: Option<&str>,
        footer_text: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut interactive = json!({
            "type": "list",
            "body": {"text": body_text},
            "action": {
                "button": truncate_chars(
                    if button_text.is_empty() { "Choose" } else { button_text },
                    20,
                ),
                "sections": clean_list_sections(sections),
            },
        });
        if let Some(header) = header_text {
            interactive["header"] = json!({"type": "text", "text": header});
        }
        if let Some(footer) = footer_text {
            interactive["footer"] = json!({"text": footer});
        }
        let payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": "interactive",
            "interactive": interactive,
        });
        self.make_request(&payload).await
    }

    /// Send media either by an uploaded handle or a public URL.
    pub async fn send_media(
        &self,
        to: &str,
        media_type: &str,
        media_id_or_url: &str,
        caption: &str,
        reply_to: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut media_payload = if media_id_or_url.starts_with("http://")
            || media_id_or_url.starts_with("https://")
        {
            json!({"link": media_id_or_url})
        } else {
            json!({"id": media_id_or_url})
        };
        if !caption.is_empty() {
            media_payload["caption"] = json!(caption);
        }
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "to": to,
            "type": media_type,
        });
        payload[media_type] = media_payload;
        if let Some(context_id) = reply_to {
            payload["context"] = json!({"message_id": context_id});
        }
        debug!("Sending {media_type} to {to}");
        self.make_request(&payload).await
    }

    pub async fn mark_message_as_read(&self, message_id: &str) -> Result<Value, GatewayError> {
        let payload = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
        });
        self.make_request(&payload).await
    }

    /// Upload a local file to the upstream media endpoint, returning the
    /// assigned media id.
    pub async fn upload_media(
        &self,
        file_path: &str,
        media_type: &str,
    ) -> Result<String, GatewayError> {
        let content = tokio::fs::read(file_path).await?;
        let mime_type = match media_type {
            "image" => "image/jpeg".to_string(),
            "audio" => "audio/ogg".to_string(),
            "video" => "video/mp4".to_string(),
            "document" => "application/pdf".to_string(),
            other => format!("{other}/*"),
        };
        let file_name = Path::new(file_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".into());
        let part = multipart::Part::bytes(content)
            .file_name(file_name)
            .mime_str(&mime_type)
            .map_err(|e| GatewayError::Media(e.to_string()))?;
        let form = multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", media_type.to_string())
            .part("file", part);

        let _permit = self.semaphore.acquire().await.map_err(|_| {
            GatewayError::Upstream {
                status: 0,
                body: "upstream semaphore closed".into(),
            }
        })?;
        let url = format!("{}/{}/media", self.graph_base, self.phone_number_id);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.access_token)
            .multipart(form)
            .timeout(MEDIA_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let result: Value = resp.json().await?;
        result
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| GatewayError::Media(format!("no media id in upload response: {result}")))
    }

    /// Two-step media download: fetch metadata for the signed URL, then the
    /// bytes. Returns `(content, content_type)`.
    pub async fn download_media(
        &self,
        media_id: &str,
    ) -> Result<(Vec<u8>, String), GatewayError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            GatewayError::Upstream {
                status: 0,
                body: "upstream semaphore closed".into(),
            }
        })?;
        let meta_url = format!("{}/{media_id}", self.graph_base);
        let resp = self
            .http
            .get(&meta_url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let meta: Value = resp.json().await?;
        let media_url = meta
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Media("no media URL in metadata response".into()))?;

        let media_resp = self
            .http
            .get(media_url)
            .bearer_auth(&self.access_token)
            .timeout(MEDIA_TIMEOUT)
            .send()
            .await?;
        let status = media_resp.status();
        if !status.is_success() {
            let body = media_resp.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let content_type = media_resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let content = media_resp.bytes().await?.to_vec();
        Ok((content, content_type))
    }
}
