use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, CATALOG_CACHE_TTL_SEC};
use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProductImage {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogProduct {
    pub retailer_id: Option<String>,
    pub name: Option<String>,
    pub price: Option<String>,
    pub availability: Option<String>,
    pub quantity: Option<i64>,
    #[serde(default)]
    pub images: Vec<ProductImage>,
}

/// Include everything except explicit out_of_stock; many catalogs omit
/// quantity, so filtering on it hides valid items.
pub fn is_product_available(product: &CatalogProduct) -> bool {
    product
        .availability
        .as_deref()
        .map(|a| a.to_lowercase() != "out_of_stock")
        .unwrap_or(true)
}

/// Normalize a raw Graph product: images may arrive as an array, a
/// `{data: [...]}` wrapper, bare URL strings, or objects with assorted keys.
pub fn format_product(raw: &Value) -> CatalogProduct {
    let images_raw = match raw.get("images") {
        Some(Value::Object(obj)) => obj.get("data").and_then(|d| d.as_array()).cloned(),
        Some(Value::Array(arr)) => Some(arr.clone()),
        _ => None,
    }
    .unwrap_or_default();

    let mut images = Vec::new();
    for img in images_raw {
        let url = match &img {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => ["url", "src", "image_url", "original_url", "href"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(|v| v.as_str()).map(|s| s.to_string())),
            _ => None,
        };
        if let Some(url) = url {
            images.push(ProductImage { url });
        }
    }

    let string_of = |key: &str| -> Option<String> {
        match raw.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    };

    CatalogProduct {
        retailer_id: string_of("retailer_id").or_else(|| string_of("id")),
        name: string_of("name"),
        price: string_of("price"),
        availability: string_of("availability"),
        quantity: raw.get("quantity").and_then(|v| v.as_i64()),
        images,
    }
}

/// Catalog cache manager. Products are fetched from the Graph API with
/// paging and persisted as JSON blobs (one for the whole catalog, one per
/// set) with a 15-minute freshness window.
pub struct CatalogManager {
    http: reqwest::Client,
    access_token: String,
    catalog_id: String,
    graph_base: String,
    cache_dir: PathBuf,
}

impl CatalogManager {
    pub fn new(config: &Config) -> Self {
        CatalogManager {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(40))
                .build()
                .unwrap_or_default(),
            access_token: config.access_token.clone(),
            catalog_id: config.catalog_id.clone(),
            graph_base: config.graph_base(),
            cache_dir: PathBuf::from("."),
        }
    }

    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = dir;
        self
    }

    pub fn catalog_id(&self) -> &str {
        &self.catalog_id
    }

    fn cache_file(&self) -> PathBuf {
        self.cache_dir.join("catalog_cache.json")
    }

    fn set_cache_file(&self, set_id: &str) -> PathBuf {
        self.cache_dir.join(format!("catalog_set_{set_id}.json"))
    }

    fn cache_is_fresh(&self, path: &PathBuf) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .map(|age| age.as_secs() < CATALOG_CACHE_TTL_SEC)
            .unwrap_or(false)
    }

    /// Cached full-catalog products; empty when no blob exists yet.
    pub fn get_cached_products(&self) -> Vec<CatalogProduct> {
        let path = self.cache_file();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };
        let Ok(values) = serde_json::from_str::<Vec<Value>>(&raw) else {
            return Vec::new();
        };
        values
            .iter()
            .map(format_product)
            .filter(is_product_available)
            .collect()
    }

    pub fn cache_exists_and_fresh(&self) -> bool {
        let path = self.cache_file();
        self.cache_is_fresh(&path)
    }

    async fn fetch_paged_products(&self, first_url: String) -> Result<Vec<CatalogProduct>, GatewayError> {
        let mut products = Vec::new();
        let mut url = Some(first_url);
        let mut with_params = true;
        while let Some(current) = url.take() {
            let mut request = self.http.get(&current).bearer_auth(&self.access_token);
            if with_params {
                request = request.query(&[
                    ("fields", "retailer_id,name,price,images{url},availability,quantity"),
                    ("limit", "25"),
                ]);
                with_params = false;
            }
            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(GatewayError::Upstream {
                    status: status.as_u16(),
                    body,
                });
            }
            let data: Value = resp.json().await?;
            for raw in data.get("data").and_then(|d| d.as_array()).into_iter().flatten() {
                let product = format_product(raw);
                if is_product_available(&product) {
                    products.push(product);
                }
            }
            url = data
                .get("paging")
                .and_then(|p| p.get("next"))
                .and_then(|n| n.as_str())
                .map(|s| s.to_string());
        }
        Ok(products)
    }

    /// Refresh the full-catalog blob from the Graph API. Returns the product
    /// count.
    pub async fn refresh_catalog_cache(&self) -> Result<usize, GatewayError> {
        let url = format!("{}/{}/products", self.graph_base, self.catalog_id);
        let products = self.fetch_paged_products(url).await?;
        let serialized = serde_json::to_string(&products)?;
        std::fs::write(self.cache_file(), serialized)?;
        Ok(products.len())
    }

    /// Available product sets, always including the whole catalog as a
    /// fallback entry.
    pub async fn get_catalog_sets(&self) -> Result<Vec<Value>, GatewayError> {
        let mut result = vec![json!({"id": self.catalog_id, "name": "All Products"})];
        let mut seen = std::collections::HashSet::new();
        seen.insert(self.catalog_id.clone());

        let mut url = Some(format!("{}/{}/product_sets", self.graph_base, self.catalog_id));
        let mut with_params = true;
        while let Some(current) = url.take() {
            let mut request = self.http.get(&current).bearer_auth(&self.access_token);
            if with_params {
                request = request.query(&[("fields", "id,name"), ("limit", "200")]);
                with_params = false;
            }
            let resp = request.send().await?;
            if !resp.status().is_success() {
                break;
            }
            let data: Value = resp.json().await?;
            for set in data.get("data").and_then(|d| d.as_array()).into_iter().flatten() {
                let id = set.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                let name = set.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                if !id.is_empty() && !name.is_empty() && seen.insert(id.to_string()) {
                    result.push(json!({"id": id, "name": name}));
                }
            }
            url = data
                .get("paging")
                .and_then(|p| p.get("next"))
                .and_then(|n| n.as_str())
                .map(|s| s.to_string());
        }
        Ok(result)
    }

    /// Products for a set, served from the persisted per-set blob while it is
    /// fresh. Requesting the catalog id itself serves the full-catalog cache.
    pub async fn get_products_for_set(
        &self,
        set_id: &str,
        limit: usize,
    ) -> Result<Vec<CatalogProduct>, GatewayError> {
        let limit = limit.max(1);
        if set_id.is_empty() || set_id == self.catalog_id {
            let cached = self.get_cached_products();
            if !cached.is_empty() {
                return Ok(cached.into_iter().take(limit).collect());
            }
            self.refresh_catalog_cache().await?;
            return Ok(self.get_cached_products().into_iter().take(limit).collect());
        }

        let path = self.set_cache_file(set_id);
        if self.cache_is_fresh(&path) {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(values) = serde_json::from_str::<Vec<Value>>(&raw) {
                    let products: Vec<CatalogProduct> = values
                        .iter()
                        .map(format_product)
                        .filter(is_product_available)
                        .collect();
                    if !products.is_empty() {
                        return Ok(products.into_iter().take(limit).collect());
                    }
                }
            }
        }

        let url = format!("{}/{set_id}/products", self.graph_base);
        let products = self.fetch_paged_products(url).await?;
        match serde_json::to_string(&products) {
            Ok(serialized) => {
                if let Err(e) = std::fs::write(&path, serialized) {
                    warn!("Persisting set cache {} failed: {e}", path.display());
                }
            }
            Err(e) => debug!("Set cache serialization failed: {e}"),
        }
        Ok(products.into_iter().take(limit).collect())
    }
}
