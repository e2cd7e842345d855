mod parsing;
mod settings;
mod types;

pub use types::{
    ConfigError, Environment, EvaluationSettings, LlmSettings, OcrSettings, RedisSettings,
    RuntimeSettings, Settings, TelemetrySettings, UploadSettings, WorkerSettings,
};
