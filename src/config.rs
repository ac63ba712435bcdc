use std::collections::HashSet;
use std::path::PathBuf;

use crate::error::GatewayError;

pub const WHATSAPP_API_VERSION: &str = "v19.0";
pub const MAX_CATALOG_ITEMS: usize = 30;
pub const CATALOG_CACHE_TTL_SEC: u64 = 15 * 60;

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v.trim() == "1",
        Err(_) => default,
    }
}

/// Keep only ASCII digits, used to normalize phone numbers for whitelists.
pub fn digits_only(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub base_url: String,
    pub media_dir: String,

    // Persistence: SQLite file by default, Postgres when DATABASE_URL is set.
    pub db_path: String,
    pub database_url: Option<String>,
    // Cache & bus tier; every dependent feature degrades when absent.
    pub cache_url: Option<String>,

    // Upstream credentials
    pub verify_token: String,
    pub access_token: String,
    pub phone_number_id: String,
    pub catalog_id: String,

    // Backpressure tunables
    pub wa_max_concurrency: usize,
    pub send_text_per_min: u32,
    pub send_media_per_min: u32,
    pub burst_window_sec: u64,
    pub enable_ws_pubsub: bool,

    // Catalog auto-reply
    pub auto_reply_catalog_match: bool,
    pub auto_reply_min_score: f64,
    pub auto_reply_test_numbers: HashSet<String>,

    // E-commerce backend (optional)
    pub shop_api_base: Option<String>,
    pub shop_api_token: Option<String>,

    pub log_verbose: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, GatewayError> {
        let port: u16 = env_parse("PORT", 8080);
        let test_numbers = env_str("AUTO_REPLY_TEST_NUMBERS", "")
            .split(',')
            .map(|n| digits_only(n.trim()))
            .filter(|n| !n.is_empty())
            .collect();

        let config = Config {
            port,
            base_url: env_str("BASE_URL", &format!("http://localhost:{port}")),
            media_dir: env_str("MEDIA_DIR", "media"),
            db_path: env_str("DB_PATH", "data/chatrelay.db"),
            database_url: env_opt("DATABASE_URL"),
            cache_url: env_opt("CACHE_URL").or_else(|| env_opt("REDIS_URL")),
            verify_token: env_str("WHATSAPP_VERIFY_TOKEN", ""),
            access_token: env_str("WHATSAPP_ACCESS_TOKEN", ""),
            phone_number_id: env_str("WHATSAPP_PHONE_NUMBER_ID", ""),
            catalog_id: env_str("CATALOG_ID", ""),
            wa_max_concurrency: env_parse("WA_MAX_CONCURRENCY", 4),
            send_text_per_min: env_parse("SEND_TEXT_PER_MIN", 30),
            send_media_per_min: env_parse("SEND_MEDIA_PER_MIN", 5),
            burst_window_sec: env_parse("BURST_WINDOW_SEC", 10),
            enable_ws_pubsub: env_flag("ENABLE_WS_PUBSUB", true),
            auto_reply_catalog_match: env_flag("AUTO_REPLY_CATALOG_MATCH", false),
            auto_reply_min_score: env_parse("AUTO_REPLY_MIN_SCORE", 0.6),
            auto_reply_test_numbers: test_numbers,
            shop_api_base: env_opt("SHOP_API_BASE"),
            shop_api_token: env_opt("SHOP_API_TOKEN"),
            log_verbose: env_flag("LOG_VERBOSE", false),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.wa_max_concurrency == 0 {
            return Err(GatewayError::Config(
                "WA_MAX_CONCURRENCY must be at least 1".into(),
            ));
        }
        if self.send_text_per_min == 0 || self.send_media_per_min == 0 {
            return Err(GatewayError::Config(
                "SEND_TEXT_PER_MIN and SEND_MEDIA_PER_MIN must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn media_dir_path(&self) -> PathBuf {
        PathBuf::from(&self.media_dir)
    }

    pub fn upstream_base(&self) -> String {
        format!(
            "https://graph.facebook.com/{WHATSAPP_API_VERSION}/{}",
            self.phone_number_id
        )
    }

    pub fn graph_base(&self) -> String {
        format!("https://graph.facebook.com/{WHATSAPP_API_VERSION}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    fn clear_env() {
        for key in [
            "PORT",
            "BASE_URL",
            "AUTO_REPLY_TEST_NUMBERS",
            "WA_MAX_CONCURRENCY",
            "SEND_TEXT_PER_MIN",
            "SEND_MEDIA_PER_MIN",
            "ENABLE_WS_PUBSUB",
            "AUTO_REPLY_MIN_SCORE",
            "CACHE_URL",
            "REDIS_URL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let _guard = env_lock();
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.wa_max_concurrency, 4);
        assert_eq!(config.send_text_per_min, 30);
        assert_eq!(config.send_media_per_min, 5);
        assert!(config.enable_ws_pubsub);
        assert!(!config.auto_reply_catalog_match);
        assert!((config.auto_reply_min_score - 0.6).abs() < f64::EPSILON);
        assert!(config.cache_url.is_none());
    }

    #[test]
    fn test_test_numbers_normalized_to_digits() {
        let _guard = env_lock();
        clear_env();
        std::env::set_var("AUTO_REPLY_TEST_NUMBERS", "+212 600-000-001, 212600000002,");
        let config = Config::from_env().unwrap();
        assert!(config.auto_reply_test_numbers.contains("212600000001"));
        assert!(config.auto_reply_test_numbers.contains("212600000002"));
        assert_eq!(config.auto_reply_test_numbers.len(), 2);
        std::env::remove_var("AUTO_REPLY_TEST_NUMBERS");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let _guard = env_lock();
        clear_env();
        std::env::set_var("WA_MAX_CONCURRENCY", "0");
        assert!(Config::from_env().is_err());
        std::env::remove_var("WA_MAX_CONCURRENCY");
    }

    #[test]
    fn test_digits_only() {
        assert_eq!(digits_only("+212 600-000-001"), "212600000001");
        assert_eq!(digits_only("abc"), "");
    }
}
