//! Configuration management with CLI, environment, and .env support.

use clap::Parser;

/// Gateway configuration.
///
/// Every field can be supplied as a command-line flag or an environment
/// variable; a `.env` file is loaded before parsing when present.
#[derive(Debug, Clone, Parser)]
#[command(name = "rag-gateway")]
#[command(about = "PDF-grounded chat gateway with request-governance middleware")]
#[command(version)]
pub struct Config {
    // =========================================================================
    // CORE SERVER CONFIGURATION
    // =========================================================================
    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    // =========================================================================
    // LLM PROVIDER CONFIGURATION
    // =========================================================================
    /// Base URL of the OpenAI-compatible provider
    #[arg(long, env = "PROVIDER_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub provider_base_url: String,

    /// Chat completion model
    #[arg(long, env = "CHAT_MODEL", default_value = "gpt-4.1-mini")]
    pub chat_model: String,

    /// Embedding model
    #[arg(long, env = "EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// Maximum completion tokens
    #[arg(long, env = "MAX_TOKENS", default_value = "2000")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[arg(long, env = "TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    /// HTTP client timeout in seconds
    #[arg(long, env = "HTTP_CLIENT_TIMEOUT", default_value = "30")]
    pub http_client_timeout: u64,

    // =========================================================================
    // DOCUMENT INDEXING
    // =========================================================================
    /// Maximum upload size in megabytes
    #[arg(long, env = "MAX_UPLOAD_SIZE_MB", default_value = "10")]
    pub max_upload_size_mb: usize,

    /// Chunk size in characters
    #[arg(long, env = "CHUNK_SIZE", default_value = "1500")]
    pub chunk_size: usize,

    /// Chunk overlap in characters
    #[arg(long, env = "CHUNK_OVERLAP", default_value = "300")]
    pub chunk_overlap: usize,

    /// Number of chunks retrieved per query
    #[arg(long, env = "RETRIEVAL_K", default_value = "5")]
    pub retrieval_k: usize,

    /// Number of history turns forwarded to the model
    #[arg(long, env = "HISTORY_LIMIT", default_value = "5")]
    pub history_limit: usize,

    // =========================================================================
    // GOVERNANCE MIDDLEWARE
    // =========================================================================
    /// Maximum cached responses
    #[arg(long, env = "CACHE_MAX_SIZE", default_value = "1000")]
    pub cache_max_size: usize,

    /// Interval for background sweeps (cache expiry, stale rate windows,
    /// memory sampling) in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value = "60")]
    pub sweep_interval_seconds: u64,

    /// Maximum retained error records
    #[arg(long, env = "ERROR_BUFFER_SIZE", default_value = "1000")]
    pub error_buffer_size: usize,

    // =========================================================================
    // LOGGING AND ENVIRONMENT
    // =========================================================================
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[arg(long, env = "ENVIRONMENT", default_value = "development")]
    pub environment: String,
}

impl Config {
    /// Parse configuration from CLI arguments and environment variables,
    /// loading `.env` first and initializing logging.
    pub fn parse_args() -> Self {
        let _ = dotenv::dotenv();

        let config = Self::parse();
        config.setup_logging();

        if let Err(err) = config.validate() {
            eprintln!("Configuration validation failed: {}", err);
            std::process::exit(1);
        }

        config
    }

    /// Initialize the tracing subscriber from the configured log level,
    /// honoring `RUST_LOG` when set.
    pub fn setup_logging(&self) {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.clone()));

        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_overlap >= self.chunk_size {
            return Err(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            ));
        }
        if self.max_upload_size_mb == 0 {
            return Err("max_upload_size_mb must be positive".to_string());
        }
        if self.retrieval_k == 0 {
            return Err("retrieval_k must be positive".to_string());
        }
        url::Url::parse(&self.provider_base_url)
            .map_err(|e| format!("invalid provider_base_url: {}", e))?;
        Ok(())
    }

    /// Maximum upload size in bytes.
    pub fn max_upload_size_bytes(&self) -> usize {
        self.max_upload_size_mb * 1024 * 1024
    }

    /// Configuration for tests: small limits, local provider URL.
    pub fn for_test() -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".to_string(),
            provider_base_url: "http://localhost:9999/v1".to_string(),
            chat_model: "test-chat-model".to_string(),
            embedding_model: "test-embedding-model".to_string(),
            max_tokens: 64,
            temperature: 0.0,
            http_client_timeout: 5,
            max_upload_size_mb: 10,
            chunk_size: 200,
            chunk_overlap: 40,
            retrieval_k: 5,
            history_limit: 5,
            cache_max_size: 16,
            sweep_interval_seconds: 60,
            error_buffer_size: 100,
            log_level: "warn".to_string(),
            environment: "test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validates() {
        let config = Config::for_test();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let mut config = Config::for_test();
        config.chunk_overlap = config.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upload_cap_in_bytes() {
        let config = Config::for_test();
        assert_eq!(config.max_upload_size_bytes(), 10 * 1024 * 1024);
    }
}
