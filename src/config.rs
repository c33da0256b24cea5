//! Environment-driven configuration. Everything is optional and falls back
//! to a built-in default.

use axum::http::{HeaderValue, Method, header};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 1000;
pub const DEFAULT_DATABASE_URL: &str = "sqlite:chat.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Messages are clipped to this many characters after trimming.
    pub max_message_length: usize,
    /// `None` accepts any origin.
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DATABASE_URL.to_owned(),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            allowed_origins: None,
        }
    }
}

impl Config {
    /// Reads `PORT`, `DATABASE_URL`, `MAX_MESSAGE_LENGTH` and
    /// `ALLOWED_ORIGINS`, keeping the default for anything unset, empty or
    /// unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            port: env_var("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database_url: env_var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_message_length: env_var("MAX_MESSAGE_LENGTH")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_message_length),
            allowed_origins: env_var("ALLOWED_ORIGINS")
                .map(|raw| split_origins(&raw))
                .filter(|list| !list.is_empty()),
        }
    }

    /// Origin policy for the query API and the socket upgrade. An explicit
    /// origin list also allows credentials; the unrestricted default cannot,
    /// since wildcard-plus-credentials is rejected by the CORS machinery.
    pub fn cors_layer(&self) -> CorsLayer {
        match &self.allowed_origins {
            Some(origins) => {
                let list: Vec<HeaderValue> = origins
                    .iter()
                    .filter_map(|origin| HeaderValue::from_str(origin).ok())
                    .collect();
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(list))
                    .allow_methods([Method::GET, Method::POST])
                    .allow_headers([header::CONTENT_TYPE])
                    .allow_credentials(true)
            }
            None => CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
        .collect()
}
