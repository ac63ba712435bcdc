use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("WhatsApp API error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Media pipeline error: {0}")]
    Media(String),

    #[error("Config error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let e = GatewayError::Upstream {
            status: 400,
            body: "bad token".into(),
        };
        assert_eq!(e.to_string(), "WhatsApp API error 400: bad token");

        let e = GatewayError::RateLimited;
        assert_eq!(e.to_string(), "Rate limit exceeded");

        let e = GatewayError::Validation("user_id is required".into());
        assert_eq!(e.to_string(), "Invalid request: user_id is required");

        let e = GatewayError::Media("ffmpeg exited with status 1".into());
        assert_eq!(e.to_string(), "Media pipeline error: ffmpeg exited with status 1");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "not found");
        let e: GatewayError = io_err.into();
        assert!(e.to_string().contains("not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{{invalid").unwrap_err();
        let e: GatewayError = json_err.into();
        assert!(e.to_string().contains("JSON error"));
    }
}
