use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf, time::Duration};
use thiserror::Error;

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// The YAML file did not parse.
    #[error("invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yml::Error),
    /// The JSON file did not parse.
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// File extension other than yaml, yml or json.
    #[error("Unsupported configuration format '{0}'. Use 'yaml' or 'json'.")]
    UnsupportedFormat(String),
    /// A `TOKENRELAY_*` variable could not be parsed.
    #[error("Invalid {key} value: {value}")]
    InvalidEnv {
        /// Variable name.
        key: &'static str,
        /// Rejected value.
        value: String,
    },
    /// Every problem found by [`Config::validate`].
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Log output format.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// CORS policy for the stream routes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; empty means any origin.
    pub allowed_origins: Vec<String>,
    /// Preflight cache lifetime.
    pub max_age_seconds: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_age_seconds: 600,
        }
    }
}

/// HTTP listener settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening port.
    pub port: u16,
    /// Header read and echoed by the request id middleware.
    pub request_id_header: String,
    /// CORS policy.
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            request_id_header: "x-request-id".into(),
            cors: CorsConfig::default(),
        }
    }
}

/// Log level and output format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Fan-out bus connection settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// `nats://host:port`, or `memory://` for an in-process bus.
    pub url: String,
    /// Connection name shown by the server.
    pub client_name: String,
    /// Delay between reconnect attempts.
    pub reconnect_wait_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".into(),
            client_name: "tokenrelay".into(),
            reconnect_wait_ms: 2_000,
        }
    }
}

/// Durable source the bridge consumes and the origin proxy publishes to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SourceConfig {
    /// `redis://host:port/db`, or `memory://` for an in-process source.
    pub url: String,
    /// Wildcard pattern subscribed by the bridge.
    pub pattern: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".into(),
            pattern: "llm:tokens:*".into(),
        }
    }
}

/// Ingest bridge settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Name reported to the bus; generated at startup when absent.
    pub instance_id: Option<String>,
    /// Duplicate suppression window; 0 disables suppression.
    pub dedupe_window_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            dedupe_window_seconds: 30,
        }
    }
}

impl BridgeConfig {
    /// Dedupe window as a duration.
    #[must_use]
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_secs(self.dedupe_window_seconds)
    }
}

/// Per-connection delivery policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Envelopes buffered per connection before the newest is dropped.
    pub queue_depth: usize,
    /// Seconds between keep-alive comments.
    pub keep_alive_seconds: u64,
    /// Seconds an orchestrated stream waits for its first token.
    pub first_token_timeout_seconds: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue_depth: 100,
            keep_alive_seconds: 15,
            first_token_timeout_seconds: 30,
        }
    }
}

impl DeliveryConfig {
    /// Keep-alive cadence.
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    /// First-token deadline.
    #[must_use]
    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_secs(self.first_token_timeout_seconds)
    }
}

/// Generation origin the orchestrator forwards prompts to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL; `POST /chat` is disabled when unset.
    pub url: Option<String>,
}

/// Settings of the origin proxy in front of the inference engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    /// OpenAI-compatible inference endpoint base URL.
    pub url: String,
    /// Model name sent with every completion request.
    pub model: String,
    /// Source channel prefix; the conversation id is appended.
    pub channel_prefix: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".into(),
            model: "mistralai/Mistral-7B-Instruct-v0.3".into(),
            channel_prefix: "llm:tokens:".into(),
        }
    }
}

/// Prometheus exposition settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve `GET /metrics`.
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// The main configuration structure shared by every TokenRelay process.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Logging.
    pub logging: LoggingConfig,
    /// Fan-out bus.
    pub bus: BusConfig,
    /// Durable token source.
    pub source: SourceConfig,
    /// Ingest bridge.
    pub bridge: BridgeConfig,
    /// Per-connection delivery policy.
    pub delivery: DeliveryConfig,
    /// Generation origin for `POST /chat`.
    pub origin: OriginConfig,
    /// Inference engine behind the origin proxy.
    pub inference: InferenceConfig,
    /// Metrics exposition.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// Precedence, lowest first: built-in defaults, the file at `config_path`
    /// (`.yaml`/`.yml` or `.json`), `TOKENRELAY_*` environment variables, then
    /// `port_override`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, an environment
    /// variable holds an invalid value, or the resolved configuration fails validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => Ok(serde_yml::from_str(&content)?),
            Some("json") => Ok(serde_json::from_str(&content)?),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(port) = env_parse::<u16>("TOKENRELAY_SERVER_PORT")? {
            self.server.port = port;
        }
        if let Some(level) = env_string("TOKENRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_string("TOKENRELAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "TOKENRELAY_LOG_FORMAT",
                        value: format,
                    });
                }
            };
        }
        if let Some(url) = env_string("TOKENRELAY_BUS_URL") {
            self.bus.url = url;
        }
        if let Some(url) = env_string("TOKENRELAY_SOURCE_URL") {
            self.source.url = url;
        }
        if let Some(pattern) = env_string("TOKENRELAY_SOURCE_PATTERN") {
            self.source.pattern = pattern;
        }
        if let Some(instance_id) = env_string("TOKENRELAY_INSTANCE_ID") {
            self.bridge.instance_id = Some(instance_id);
        }
        if let Some(window) = env_parse::<u64>("TOKENRELAY_DEDUPE_WINDOW_SEC")? {
            self.bridge.dedupe_window_seconds = window;
        }
        if let Some(url) = env_string("TOKENRELAY_ORIGIN_URL") {
            self.origin.url = Some(url);
        }
        if let Some(url) = env_string("TOKENRELAY_INFERENCE_URL") {
            self.inference.url = url;
        }
        if let Some(model) = env_string("TOKENRELAY_MODEL_NAME") {
            self.inference.model = model;
        }
        Ok(())
    }

    /// Validates the resolved configuration, collecting every problem found.
    ///
    /// # Errors
    /// Returns the list of validation failures.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.bus.url.trim().is_empty() {
            errors.push("bus.url must not be empty".to_string());
        }
        if self.source.url.trim().is_empty() {
            errors.push("source.url must not be empty".to_string());
        }
        if self.source.pattern.trim().is_empty() {
            errors.push("source.pattern must not be empty".to_string());
        }
        if self.delivery.queue_depth == 0 {
            errors.push("delivery.queue_depth must be greater than 0".to_string());
        }
        if self.delivery.keep_alive_seconds == 0 {
            errors.push("delivery.keep_alive_seconds must be greater than 0".to_string());
        }
        if self.delivery.first_token_timeout_seconds == 0 {
            errors.push("delivery.first_token_timeout_seconds must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    env_string(key)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidEnv { key, value })
        })
        .transpose()
}
