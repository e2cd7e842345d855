use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::config::Settings;
use crate::llm::api::{ChatApi, ChatError, ChatRequest, ChatResponse};

/// OpenAI-compatible chat-completions transport. One client serves both the
/// text and vision channels; images travel inline as base64 data URLs.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiChat {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.llm().request_timeout_seconds);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|err| anyhow::anyhow!(err).context("Failed to build HTTP client"))?;

        Ok(Self {
            client,
            api_key: settings.llm().api_key.clone(),
            base_url: settings.llm().base_url.trim_end_matches('/').to_string(),
            model: settings.llm().model.clone(),
        })
    }
}

#[async_trait]
impl ChatApi for OpenAiChat {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        let user_content = match &request.image {
            Some(image) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
                json!([
                    {"type": "text", "text": request.user_prompt},
                    {
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image.mime_type, encoded),
                            "detail": "high"
                        }
                    }
                ])
            }
            None => Value::String(request.user_prompt.clone()),
        };

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": user_content}
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "response_format": {"type": "json_object"}
        });

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ChatError::Transport(err.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| ChatError::Transport(format!("unreadable response body: {err}")))?;

        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ChatError::Transport(format!(
                "provider returned {}: {}",
                status,
                extract_error_message(&body)
            )));
        }
        if !status.is_success() {
            return Err(ChatError::Provider(format!(
                "provider returned {}: {}",
                status,
                extract_error_message(&body)
            )));
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::Provider("missing response content".into()))?
            .to_string();

        let usage = body.get("usage");
        let prompt_tokens =
            usage.and_then(|u| u.get("prompt_tokens")).and_then(Value::as_u64).unwrap_or(0);
        let completion_tokens =
            usage.and_then(|u| u.get("completion_tokens")).and_then(Value::as_u64).unwrap_or(0);
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(self.model.as_str())
            .to_string();

        Ok(ChatResponse { content, prompt_tokens, completion_tokens, model })
    }
}

fn extract_error_message(body: &Value) -> String {
    body.get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .unwrap_or("unknown_error")
        .to_string()
}
