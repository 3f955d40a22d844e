use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Per-experiment override table (`experiments."suite:stage:name"` in config)
pub type Overrides = Map<String, Value>;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Deployment environment label recorded on processing runs
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Override tables keyed by experiment name
    #[serde(default)]
    pub experiments: HashMap<String, Overrides>,
    /// Optional TOML suite catalogue; built-in suites are used when unset
    #[serde(default)]
    pub suites_file: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_environment() -> String {
    "development".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_url() -> String {
    "postgres://localhost/forecast_pipeline".to_string()
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Market catalogue base URL
    #[serde(default = "default_ingestion_base_url")]
    pub base_url: String,
    /// Relative path of the markets endpoint
    #[serde(default = "default_markets_path")]
    pub markets_path: String,
    /// Markets fetched per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Request timeout in seconds
    #[serde(default = "default_ingestion_timeout")]
    pub timeout_secs: u64,
    /// Extra query parameters applied when listing markets
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
}

fn default_ingestion_base_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_markets_path() -> String {
    "/markets".to_string()
}

fn default_page_size() -> usize {
    200
}

fn default_ingestion_timeout() -> u64 {
    10
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            base_url: default_ingestion_base_url(),
            markets_path: default_markets_path(),
            page_size: default_page_size(),
            timeout_secs: default_ingestion_timeout(),
            filters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Days between the run date and the close date of targeted markets
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Root directory for per-run debug dumps
    #[serde(default)]
    pub debug_dump_dir: Option<PathBuf>,
    /// Number of event groups that may be processed concurrently.
    /// Groups are currently processed one at a time; values above 1 are accepted
    /// and logged but not yet acted on.
    #[serde(default = "default_events_concurrency")]
    pub events_concurrency: usize,
}

fn default_window_days() -> i64 {
    1
}

fn default_events_concurrency() -> usize {
    1
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            debug_dump_dir: None,
            events_concurrency: default_events_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionConfig {
    /// Markets per sweep chunk (<= 0 processes all candidates as one chunk)
    #[serde(default = "default_resolution_batch_size")]
    pub batch_size: i64,
    /// Event ids always included in the sweep filter
    #[serde(default)]
    pub force_event_ids: Vec<String>,
}

fn default_resolution_batch_size() -> i64 {
    50
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_resolution_batch_size(),
            force_event_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Provider used when neither the experiment nor the strategy picks one
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider() -> String {
    "openai".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            openai: OpenAiConfig::default(),
            gemini: GeminiConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Fallback research model when the provider default should not apply
    #[serde(default)]
    pub research_model: Option<String>,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_timeout() -> u64 {
    180
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            organization: None,
            project: None,
            timeout_secs: default_llm_timeout(),
            research_model: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Extra keys rotated through on retryable failures
    #[serde(default)]
    pub additional_api_keys: Vec<String>,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            additional_api_keys: Vec::new(),
            base_url: default_gemini_base_url(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempt budget per provider call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Streaming failures tolerated before switching to non-streaming calls
    #[serde(default = "default_stream_failures")]
    pub stream_failures_before_fallback: u32,
    /// Delay before the first retry; doubles per attempt
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff sleep
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Random extra delay as a fraction of the computed backoff (0.25 = up to 25%)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_stream_failures() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ratio() -> f64 {
    0.25
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stream_failures_before_fallback: default_stream_failures(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("environment", "development")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.url", default_database_url())?
            .set_default("database.max_connections", 5)?
            .set_default("llm.default_provider", "openai")?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FORECAST_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (FORECAST_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("FORECAST")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        config.apply_conventional_env_keys();
        Ok(config)
    }

    /// Fill provider API keys from the conventional environment variables
    fn apply_conventional_env_keys(&mut self) {
        if self.llm.openai.api_key.is_none() {
            self.llm.openai.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }
        if self.llm.gemini.api_key.is_none() {
            self.llm.gemini.api_key = std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }
    }

    /// Configuration with every section at its default, used by tests and dry local runs
    pub fn default_config() -> Self {
        Self {
            environment: default_environment(),
            database: DatabaseConfig::default(),
            ingestion: IngestionConfig::default(),
            pipeline: PipelineConfig::default(),
            resolution: ResolutionConfig::default(),
            llm: LlmConfig::default(),
            experiments: HashMap::new(),
            suites_file: None,
            logging: LoggingConfig {
                level: default_log_level(),
                json: false,
                dir: None,
            },
        }
    }

    /// Override table configured for one experiment (empty when absent)
    pub fn experiment_config(&self, experiment_name: &str) -> Overrides {
        self.experiments
            .get(experiment_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.ingestion.page_size == 0 {
            errors.push("ingestion.page_size must be positive".to_string());
        }

        if self.pipeline.events_concurrency == 0 {
            errors.push("pipeline.events_concurrency must be at least 1".to_string());
        }

        if self.llm.default_provider.trim().is_empty() {
            errors.push("llm.default_provider must not be empty".to_string());
        }

        let retry = &self.llm.retry;
        if retry.max_attempts == 0 {
            errors.push("llm.retry.max_attempts must be at least 1".to_string());
        }
        if retry.stream_failures_before_fallback > retry.max_attempts {
            errors.push(format!(
                "llm.retry.stream_failures_before_fallback ({}) exceeds max_attempts ({})",
                retry.stream_failures_before_fallback, retry.max_attempts
            ));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            errors.push("llm.retry.base_delay_ms must not exceed max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            errors.push("llm.retry.jitter_ratio must be between 0 and 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.llm.retry.max_attempts, 5);
        assert_eq!(config.llm.retry.stream_failures_before_fallback, 2);
    }

    #[test]
    fn test_validate_reports_retry_inconsistency() {
        let mut config = AppConfig::default_config();
        config.llm.retry.max_attempts = 1;
        config.llm.retry.stream_failures_before_fallback = 3;
        config.pipeline.events_concurrency = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("events_concurrency"));
        assert!(errors[1].contains("stream_failures_before_fallback"));
    }

    #[test]
    fn test_experiment_config_lookup() {
        let mut config = AppConfig::default_config();
        let mut overrides = Overrides::new();
        overrides.insert("model".to_string(), json!("gpt-4.1"));
        config
            .experiments
            .insert("openai:research:llm_web_search".to_string(), overrides);

        let found = config.experiment_config("openai:research:llm_web_search");
        assert_eq!(found.get("model"), Some(&json!("gpt-4.1")));
        assert!(config.experiment_config("missing").is_empty());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
environment = "staging"

[pipeline]
window_days = 3

[experiments."openai:research:llm_web_search"]
model = "gpt-4.1-mini"
temperature = 0.2
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.pipeline.window_days, 3);
        let overrides = config.experiment_config("openai:research:llm_web_search");
        assert_eq!(overrides.get("model"), Some(&json!("gpt-4.1-mini")));
        // no [database] table: dry runs still get a usable config
        assert_eq!(config.database.url, default_database_url());
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_shipped_default_toml_loads() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("config");
        let config = AppConfig::load_from(&dir).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolution.batch_size, 50);
        assert_eq!(config.llm.retry.max_attempts, 5);
    }
}
