use super::parsing::{
    env_optional, env_or_default, parse_bool, parse_environment, parse_f64, parse_string_list,
    parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    ConfigError, EvaluationSettings, LlmSettings, OcrSettings, RedisSettings, RuntimeSettings,
    Settings, TelemetrySettings, UploadSettings, WorkerSettings,
};

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment =
            parse_environment(env_optional("SCRIPTMARK_ENV").or_else(|| env_optional("ENVIRONMENT")));
        let strict_config = env_optional("SCRIPTMARK_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let redis_host = env_or_default("REDIS_HOST", "localhost");
        let redis_port = parse_u16("REDIS_PORT", env_or_default("REDIS_PORT", "6379"))?;
        let redis_db = parse_u16("REDIS_DB", env_or_default("REDIS_DB", "0"))?;
        let redis_password = env_or_default("REDIS_PASSWORD", "");

        let api_key = env_or_default("LLM_API_KEY", "");
        let base_url = env_or_default("LLM_BASE_URL", "https://api.openai.com/v1");
        let model = env_or_default("LLM_MODEL", "gpt-4o");
        let temperature =
            parse_f64("LLM_TEMPERATURE", env_or_default("LLM_TEMPERATURE", "0.1"))?;
        let max_tokens = parse_u32("LLM_MAX_TOKENS", env_or_default("LLM_MAX_TOKENS", "4096"))?;
        let request_timeout_seconds =
            parse_u64("LLM_REQUEST_TIMEOUT", env_or_default("LLM_REQUEST_TIMEOUT", "120"))?;
        let max_retries = parse_u32("LLM_MAX_RETRIES", env_or_default("LLM_MAX_RETRIES", "3"))?;
        let repair_attempts =
            parse_u32("LLM_REPAIR_ATTEMPTS", env_or_default("LLM_REPAIR_ATTEMPTS", "2"))?;

        let max_pages_per_script =
            parse_u32("OCR_MAX_PAGES", env_or_default("OCR_MAX_PAGES", "40"))?;
        let render_dpi = parse_u32("OCR_RENDER_DPI", env_or_default("OCR_RENDER_DPI", "200"))?;
        let low_confidence_threshold = parse_f64(
            "OCR_LOW_CONFIDENCE_THRESHOLD",
            env_or_default("OCR_LOW_CONFIDENCE_THRESHOLD", "0.65"),
        )?;

        let scoring_concurrency = parse_usize(
            "EVAL_SCORING_CONCURRENCY",
            env_or_default("EVAL_SCORING_CONCURRENCY", "4"),
        )?;
        let token_budget =
            parse_u64("EVAL_TOKEN_BUDGET", env_or_default("EVAL_TOKEN_BUDGET", "0"))?;
        let max_task_attempts =
            parse_u32("EVAL_MAX_TASK_ATTEMPTS", env_or_default("EVAL_MAX_TASK_ATTEMPTS", "3"))?;

        let max_upload_size_mb =
            parse_u64("MAX_UPLOAD_SIZE_MB", env_or_default("MAX_UPLOAD_SIZE_MB", "50"))?;
        let allowed_mime_types = parse_string_list(
            env_optional("ALLOWED_MIME_TYPES"),
            &["application/pdf", "image/jpeg", "image/png"],
        );

        let default_workers =
            parse_usize("WORKERS_DEFAULT", env_or_default("WORKERS_DEFAULT", "1"))?;
        let ocr_workers = parse_usize("WORKERS_OCR", env_or_default("WORKERS_OCR", "2"))?;
        let evaluation_workers =
            parse_usize("WORKERS_EVALUATION", env_or_default("WORKERS_EVALUATION", "2"))?;
        let poll_interval_seconds =
            parse_u64("WORKER_POLL_INTERVAL", env_or_default("WORKER_POLL_INTERVAL", "2"))?;

        let log_level = env_or_default("SCRIPTMARK_LOG_LEVEL", "info");
        let json = env_optional("SCRIPTMARK_LOG_JSON").map(|v| parse_bool(&v)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|v| parse_bool(&v)).unwrap_or(false);

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            redis: RedisSettings {
                host: redis_host,
                port: redis_port,
                db: redis_db,
                password: redis_password,
            },
            llm: LlmSettings {
                api_key,
                base_url,
                model,
                temperature,
                max_tokens,
                request_timeout_seconds,
                max_retries,
                repair_attempts,
            },
            ocr: OcrSettings { max_pages_per_script, render_dpi, low_confidence_threshold },
            evaluation: EvaluationSettings { scoring_concurrency, token_budget, max_task_attempts },
            upload: UploadSettings { max_upload_size_mb, allowed_mime_types },
            worker: WorkerSettings {
                default_workers,
                ocr_workers,
                evaluation_workers,
                poll_interval_seconds,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    pub fn redis(&self) -> &RedisSettings {
        &self.redis
    }

    pub fn llm(&self) -> &LlmSettings {
        &self.llm
    }

    pub fn ocr(&self) -> &OcrSettings {
        &self.ocr
    }

    pub fn evaluation(&self) -> &EvaluationSettings {
        &self.evaluation
    }

    pub fn upload(&self) -> &UploadSettings {
        &self.upload
    }

    pub fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.allowed_mime_types.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ALLOWED_MIME_TYPES",
                value: String::from("<empty>"),
            });
        }
        if self.ocr.max_pages_per_script == 0 {
            return Err(ConfigError::InvalidValue {
                field: "OCR_MAX_PAGES",
                value: String::from("0"),
            });
        }
        if self.evaluation.scoring_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "EVAL_SCORING_CONCURRENCY",
                value: String::from("0"),
            });
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "LLM_TEMPERATURE",
                value: self.llm.temperature.to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.llm.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("LLM_API_KEY"));
        }

        Ok(())
    }
}
