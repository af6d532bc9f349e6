use std::env;
use std::time::Duration;

/// Runtime settings, read once at startup. Every knob has a default so a
/// bare environment still boots against a local Ollama.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub ollama_url: String,
    pub chat_model: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub openweather_url: String,
    pub openweather_api_key: String,
    pub alphavantage_url: String,
    pub alphavantage_api_key: String,
    pub search_api_url: String,
    pub search_api_key: Option<String>,
    pub default_city: String,
    pub web_cache_capacity: usize,
    pub web_cache_ttl: Option<Duration>,
    pub chunk_window: usize,
    pub chunk_overlap: usize,
}

impl Settings {
    pub fn from_env() -> Self {
        let web_cache_ttl = env::var("WEB_CACHE_TTL_SECS")
            .ok()
            .and_then(|t| t.parse::<u64>().ok())
            .or(Some(900))
            .filter(|&t| t > 0)
            .map(Duration::from_secs);

        Self {
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "data/chat.db".to_string()),
            ollama_url: env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
            chat_model: env::var("CHAT_MODEL").unwrap_or_else(|_| "phi3:mini".to_string()),
            embedding_model: env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "nomic-embed-text".to_string()),
            embedding_dimension: env::var("EMBEDDING_DIMENSION")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(768),
            openweather_url: env::var("OPENWEATHER_API_URL")
                .unwrap_or_else(|_| "http://api.openweathermap.org".to_string()),
            openweather_api_key: env::var("OPENWEATHER_API_KEY").unwrap_or_default(),
            alphavantage_url: env::var("ALPHA_VANTAGE_API_URL")
                .unwrap_or_else(|_| "https://www.alphavantage.co".to_string()),
            alphavantage_api_key: env::var("ALPHA_VANTAGE_API_KEY").unwrap_or_default(),
            search_api_url: env::var("SEARCH_API_URL")
                .unwrap_or_else(|_| "https://api.tavily.com".to_string()),
            search_api_key: env::var("SEARCH_API_KEY").ok().filter(|k| !k.is_empty()),
            default_city: env::var("DEFAULT_CITY").unwrap_or_else(|_| "Kigali".to_string()),
            web_cache_capacity: env::var("WEB_CACHE_CAPACITY")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(100),
            web_cache_ttl,
            chunk_window: env::var("CHUNK_WINDOW")
                .ok()
                .and_then(|w| w.parse().ok())
                .unwrap_or(crate::document::DEFAULT_WINDOW),
            chunk_overlap: env::var("CHUNK_OVERLAP")
                .ok()
                .and_then(|o| o.parse().ok())
                .unwrap_or(crate::document::DEFAULT_OVERLAP),
        }
    }
}
