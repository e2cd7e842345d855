use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;

use crate::core::config::Settings;
use crate::domain::error::EngineError;
use crate::llm::api::{ChatApi, ChatError, ChatRequest, ImageAttachment};

/// One completed gateway call: the raw string, its parse (when the provider
/// honoured the JSON contract), and accounting.
#[derive(Debug, Clone)]
pub struct LlmPayload {
    pub raw: String,
    pub parsed: Option<Value>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionOpts {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Per-call override of the configured repair budget.
    pub repair_attempts: Option<u32>,
}

/// Single boundary to the chat-completion provider. Transport failures are
/// retried with exponential backoff and jitter; malformed output is handed
/// to the repair protocol by `complete_structured`.
pub struct LlmGateway {
    api: Arc<dyn ChatApi>,
    default_temperature: f64,
    default_max_tokens: u32,
    max_retries: u32,
    repair_attempts: u32,
    backoff_base: Duration,
}

impl LlmGateway {
    pub fn from_settings(settings: &Settings, api: Arc<dyn ChatApi>) -> Self {
        Self {
            api,
            default_temperature: settings.llm().temperature,
            default_max_tokens: settings.llm().max_tokens,
            max_retries: settings.llm().max_retries,
            repair_attempts: settings.llm().repair_attempts,
            backoff_base: Duration::from_millis(500),
        }
    }

    #[cfg(test)]
    pub(crate) fn without_backoff(mut self) -> Self {
        self.backoff_base = Duration::from_millis(0);
        self
    }

    pub fn repair_attempts(&self) -> u32 {
        self.repair_attempts
    }

    pub async fn text_complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: CompletionOpts,
    ) -> Result<LlmPayload, EngineError> {
        self.complete(ChatRequest {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            image: None,
            temperature: opts.temperature.unwrap_or(self.default_temperature),
            max_tokens: opts.max_tokens.unwrap_or(self.default_max_tokens),
        })
        .await
    }

    pub async fn vision_complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        image: ImageAttachment,
        opts: CompletionOpts,
    ) -> Result<LlmPayload, EngineError> {
        self.complete(ChatRequest {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            image: Some(image),
            temperature: opts.temperature.unwrap_or(0.0),
            max_tokens: opts.max_tokens.unwrap_or(self.default_max_tokens),
        })
        .await
    }

    async fn complete(&self, request: ChatRequest) -> Result<LlmPayload, EngineError> {
        let timer = Instant::now();
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            match self.api.chat(request.clone()).await {
                Ok(response) => {
                    let raw = response.content;
                    let parsed = serde_json::from_str::<Value>(strip_code_fences(&raw))
                        .ok()
                        .filter(Value::is_object);
                    return Ok(LlmPayload {
                        raw,
                        parsed,
                        prompt_tokens: response.prompt_tokens,
                        completion_tokens: response.completion_tokens,
                        model: response.model,
                        latency_ms: timer.elapsed().as_millis() as u64,
                    });
                }
                Err(ChatError::Transport(message)) => {
                    tracing::warn!(attempt, error = %message, "LLM transport failure");
                    last_error = Some(message);
                }
                Err(ChatError::Provider(message)) => {
                    return Err(EngineError::LlmUnavailable(message));
                }
            }

            if attempt + 1 < self.max_retries {
                tokio::time::sleep(self.backoff_with_jitter(attempt)).await;
            }
        }

        Err(EngineError::LlmUnavailable(
            last_error.unwrap_or_else(|| "exhausted transport retries".into()),
        ))
    }

    /// Structured completion with repair: call, and while the output fails
    /// to parse or `validate` rejects it, resubmit with the error and the
    /// expected schema silhouette embedded. Bounded by the configured repair
    /// attempts; persistent failure is `LLM_MALFORMED`.
    pub async fn complete_structured(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        schema_silhouette: &str,
        opts: CompletionOpts,
        validate: &(dyn Fn(&Value) -> Result<(), String> + Sync),
    ) -> Result<(Value, StructuredTelemetry), EngineError> {
        let repair_budget = opts.repair_attempts.unwrap_or(self.repair_attempts);
        let mut telemetry = StructuredTelemetry::default();
        let mut payload = self.text_complete(system_prompt, user_prompt, opts).await?;
        telemetry.absorb(&payload);

        let mut failure = check_payload(&payload, validate);
        let mut attempt = 0;

        while let Err(error) = failure {
            if attempt >= repair_budget {
                return Err(EngineError::LlmMalformed(error));
            }
            attempt += 1;
            telemetry.repair_count = attempt;

            tracing::warn!(attempt, error = %error, "structured output invalid, repairing");

            let repair = repair_prompt(user_prompt, schema_silhouette, &error, &payload.raw, attempt);
            payload = self
                .text_complete(system_prompt, &repair, CompletionOpts {
                    temperature: Some(0.0),
                    max_tokens: opts.max_tokens,
                    repair_attempts: None,
                })
                .await?;
            telemetry.absorb(&payload);
            failure = check_payload(&payload, validate);
        }

        let value = payload.parsed.take().expect("validated payload must carry a parse");
        Ok((value, telemetry))
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff_base * 2_u32.saturating_pow(attempt);
        let jitter_ms = if self.backoff_base.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..250)
        };
        base + Duration::from_millis(jitter_ms)
    }
}

/// Accumulated accounting across the initial call and any repairs.
#[derive(Debug, Clone, Default)]
pub struct StructuredTelemetry {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: u64,
    pub repair_count: u32,
    pub model: String,
}

impl StructuredTelemetry {
    fn absorb(&mut self, payload: &LlmPayload) {
        self.prompt_tokens += payload.prompt_tokens;
        self.completion_tokens += payload.completion_tokens;
        self.latency_ms += payload.latency_ms;
        self.model = payload.model.clone();
    }
}

fn check_payload(
    payload: &LlmPayload,
    validate: &(dyn Fn(&Value) -> Result<(), String> + Sync),
) -> Result<(), String> {
    match &payload.parsed {
        None => Err("response was not a JSON object".to_string()),
        Some(value) => validate(value),
    }
}

/// Resubmission prompt: the original request plus an instruction carrying
/// the prior error and the expected schema silhouette. A pure function of
/// (prompt, prior error, attempt), kept apart from transport retry so
/// telemetry can tell provider outages from schema drift.
fn repair_prompt(
    user_prompt: &str,
    schema_silhouette: &str,
    error: &str,
    bad_output: &str,
    attempt: u32,
) -> String {
    format!(
        "{user_prompt}\n\n\
         # REPAIR (attempt {attempt})\n\
         Your previous response was rejected: {error}\n\
         Return ONLY a valid JSON object matching this schema, with no markdown fences \
         and no commentary:\n{schema_silhouette}\n\n\
         Previous invalid output:\n{bad_output}"
    )
}

/// Strip markdown code fences some models wrap around JSON bodies.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, MockChat};

    fn gateway(mock: MockChat) -> LlmGateway {
        let _guard = test_support::env_lock();
        test_support::set_test_env();
        let settings = crate::core::config::Settings::load().expect("settings");
        LlmGateway::from_settings(&settings, Arc::new(mock)).without_backoff()
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn parse_failure_is_repaired_once() {
        let mock = MockChat::scripted(vec![
            Ok("this is not json".to_string()),
            Ok(r#"{"ok": true}"#.to_string()),
        ]);
        let calls = mock.call_counter();
        let gateway = gateway(mock);

        let (value, telemetry) = gateway
            .complete_structured("system", "user", r#"{"ok": <bool>}"#, CompletionOpts::default(), &|_| Ok(()))
            .await
            .expect("repaired");

        assert_eq!(value["ok"], true);
        assert_eq!(telemetry.repair_count, 1);
        assert_eq!(calls.count(), 2);
    }

    #[tokio::test]
    async fn persistent_malformed_output_fails_after_bounded_repairs() {
        let mock = MockChat::scripted(vec![
            Ok("garbage".to_string()),
            Ok("more garbage".to_string()),
            Ok("still garbage".to_string()),
        ]);
        let calls = mock.call_counter();
        let gateway = gateway(mock);

        let result = gateway
            .complete_structured("system", "user", "{}", CompletionOpts::default(), &|_| Ok(()))
            .await;

        assert!(matches!(result, Err(EngineError::LlmMalformed(_))));
        // Initial call + two repair attempts.
        assert_eq!(calls.count(), 3);
    }

    #[tokio::test]
    async fn validation_errors_feed_the_repair_prompt() {
        let mock = MockChat::scripted(vec![
            Ok(r#"{"marks": 99}"#.to_string()),
            Ok(r#"{"marks": 3}"#.to_string()),
        ]);
        let prompts = mock.prompt_log();
        let gateway = gateway(mock);

        let validate = |value: &Value| {
            let marks = value["marks"].as_f64().unwrap_or(-1.0);
            if marks > 10.0 {
                Err(format!("marks {marks} above maximum 10"))
            } else {
                Ok(())
            }
        };

        let (value, telemetry) = gateway
            .complete_structured("system", "user", "{\"marks\": <float>}", CompletionOpts::default(), &validate)
            .await
            .expect("repaired");

        assert_eq!(value["marks"], 3);
        assert_eq!(telemetry.repair_count, 1);
        let second_prompt = prompts.nth(1);
        assert!(second_prompt.contains("user"), "repair resubmits the original prompt");
        assert!(second_prompt.contains("marks 99 above maximum 10"));
        assert!(second_prompt.contains("# REPAIR (attempt 1)"));
    }

    #[tokio::test]
    async fn transport_failures_retry_then_signal_unavailable() {
        let mock = MockChat::scripted(vec![
            Err("connection reset".to_string()),
            Err("503".to_string()),
            Err("rate limited".to_string()),
        ]);
        let calls = mock.call_counter();
        let gateway = gateway(mock);

        let result = gateway.text_complete("system", "user", CompletionOpts::default()).await;
        assert!(matches!(result, Err(EngineError::LlmUnavailable(_))));
        assert_eq!(calls.count(), 3);
    }

    #[tokio::test]
    async fn transport_recovery_within_retry_budget_succeeds() {
        let mock = MockChat::scripted(vec![
            Err("connection reset".to_string()),
            Ok(r#"{"ok": true}"#.to_string()),
        ]);
        let gateway = gateway(mock);

        let payload =
            gateway.text_complete("system", "user", CompletionOpts::default()).await.unwrap();
        assert!(payload.parsed.is_some());
    }

    #[tokio::test]
    async fn token_usage_accumulates_across_repairs() {
        let mock = MockChat::scripted_with_usage(vec![
            (Ok("broken".to_string()), 100, 20),
            (Ok(r#"{"ok": true}"#.to_string()), 120, 30),
        ]);
        let gateway = gateway(mock);

        let (_, telemetry) = gateway
            .complete_structured("system", "user", "{}", CompletionOpts::default(), &|_| Ok(()))
            .await
            .unwrap();
        assert_eq!(telemetry.prompt_tokens, 220);
        assert_eq!(telemetry.completion_tokens, 50);
    }
}
