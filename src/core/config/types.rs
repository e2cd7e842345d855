use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Settings {
    pub(super) runtime: RuntimeSettings,
    pub(super) redis: RedisSettings,
    pub(super) llm: LlmSettings,
    pub(super) ocr: OcrSettings,
    pub(super) evaluation: EvaluationSettings,
    pub(super) upload: UploadSettings,
    pub(super) worker: WorkerSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub environment: Environment,
    pub strict_config: bool,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: u16,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub request_timeout_seconds: u64,
    /// Bounded transport retries (network / 5xx / 429).
    pub max_retries: u32,
    /// Bounded structured-output repair attempts after a parse or schema
    /// failure.
    pub repair_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub max_pages_per_script: u32,
    pub render_dpi: u32,
    /// Pages below this confidence carry a LOW_CONFIDENCE quality flag.
    pub low_confidence_threshold: f64,
}

#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    /// Concurrency cap for the per-criterion scoring fan-out.
    pub scoring_concurrency: usize,
    /// Total token budget per evaluation run; 0 disables enforcement.
    pub token_budget: u64,
    /// Bounded attempts for a whole evaluate-question task on transport
    /// failure.
    pub max_task_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_upload_size_mb: u64,
    pub allowed_mime_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub default_workers: usize,
    pub ocr_workers: usize,
    pub evaluation_workers: usize,
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub prometheus_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl RedisSettings {
    pub fn redis_url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

impl UploadSettings {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_size_mb * 1024 * 1024
    }
}
