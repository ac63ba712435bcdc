use std::time::Duration;

use serde_json::Value;
use tracing::debug;

/// A resolved variant from the e-commerce backend, enriched with the parent
/// product title and a representative image when available.
#[derive(Debug, Clone, Default)]
pub struct ShopVariant {
    pub id: String,
    pub title: Option<String>,
    pub price: Option<String>,
    pub image_src: Option<String>,
    pub product_title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShopLineItem {
    pub title: String,
    pub variant_title: String,
    pub quantity: i64,
    pub variant_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShopOrder {
    pub name: String,
    pub created_at: String,
    pub fulfillment_status: Option<String>,
    pub line_items: Vec<ShopLineItem>,
}

fn string_of(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn variant_from_value(raw: &Value) -> Option<ShopVariant> {
    let id = string_of(raw, "id")?;
    Some(ShopVariant {
        id,
        title: string_of(raw, "title"),
        price: string_of(raw, "price"),
        image_src: string_of(raw, "image_src"),
        product_title: string_of(raw, "product_title"),
    })
}

/// Client for the e-commerce backend used for customer, order and variant
/// lookups. Every call is best-effort: an unconfigured or failing backend
/// yields `None`/empty, never an error that could abort a workflow.
pub struct ShopClient {
    http: reqwest::Client,
    api_base: Option<String>,
    api_token: Option<String>,
}

impl ShopClient {
    pub fn new(api_base: Option<String>, api_token: Option<String>) -> Self {
        ShopClient {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            api_base: api_base.map(|b| b.trim_end_matches('/').to_string()),
            api_token,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.api_base.is_some()
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Option<Value> {
        let base = self.api_base.as_ref()?;
        let mut request = self.http.get(format!("{base}{path}"));
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        if !query.is_empty() {
            request = request.query(query);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => resp.json().await.ok(),
            Ok(resp) => {
                debug!("shop backend {path} returned {}", resp.status());
                None
            }
            Err(e) => {
                debug!("shop backend {path} failed: {e}");
                None
            }
        }
    }

    pub async fn fetch_variant(&self, variant_id: &str) -> Option<ShopVariant> {
        let body = self
            .get_json(&format!("/variants/{variant_id}.json"), &[])
            .await?;
        variant_from_value(body.get("variant")?)
    }

    /// Resolve a numeric id into a valid variant. If the id names a product
    /// rather than a variant, fall back to the product's first variant,
    /// enriched with the product title and image.
    pub async fn resolve_variant(&self, numeric_id: &str) -> Option<(String, ShopVariant)> {
        if let Some(variant) = self.fetch_variant(numeric_id).await {
            return Some((variant.id.clone(), variant));
        }
        let body = self
            .get_json(&format!("/products/{numeric_id}.json"), &[])
            .await?;
        let product = body.get("product")?;
        let first = product.get("variants")?.as_array()?.first()?;
        let mut variant = variant_from_value(first)?;
        variant.product_title = string_of(product, "title");
        if variant.image_src.is_none() {
            variant.image_src = product
                .get("image")
                .and_then(|img| string_of(img, "src"))
                .or_else(|| {
                    product
                        .get("images")
                        .and_then(|imgs| imgs.as_array())
                        .and_then(|imgs| imgs.first())
                        .and_then(|img| string_of(img, "src"))
                });
        }
        Some((variant.id.clone(), variant))
    }

    pub async fn fetch_customer_id_by_phone(&self, phone: &str) -> Option<String> {
        let body = self
            .get_json(
                "/customers/search.json",
                &[("query", format!("phone:{phone}"))],
            )
            .await?;
        let customer = body.get("customers")?.as_array()?.first()?;
        string_of(customer, "id")
    }

    /// Orders created within the last `days` for a customer, newest first.
    pub async fn fetch_recent_orders(
        &self,
        customer_id: &str,
        days: i64,
        limit: usize,
    ) -> Vec<ShopOrder> {
        let since = (chrono::Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let Some(body) = self
            .get_json(
                "/orders.json",
                &[
                    ("customer_id", customer_id.to_string()),
                    ("status", "any".to_string()),
                    ("order", "created_at desc".to_string()),
                    ("limit", limit.to_string()),
                    ("created_at_min", since),
                ],
            )
            .await
        else {
            return Vec::new();
        };
        let Some(orders) = body.get("orders").and_then(|o| o.as_array()) else {
            return Vec::new();
        };
        orders
            .iter()
            .map(|order| {
                let line_items = order
                    .get("line_items")
                    .and_then(|items| items.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .map(|item| ShopLineItem {
                                title: string_of(item, "title").unwrap_or_default(),
                                variant_title: string_of(item, "variant_title").unwrap_or_default(),
                                quantity: item.get("quantity").and_then(|q| q.as_i64()).unwrap_or(1),
                                variant_id: string_of(item, "variant_id"),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                ShopOrder {
                    name: string_of(order, "name")
                        .or_else(|| string_of(order, "id").map(|id| format!("#{id}")))
                        .unwrap_or_default(),
                    created_at: string_of(order, "created_at").unwrap_or_default(),
                    fulfillment_status: string_of(order, "fulfillment_status"),
                    line_items,
                }
            })
            .collect()
    }
}
