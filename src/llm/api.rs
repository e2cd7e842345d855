use async_trait::async_trait;
use thiserror::Error;

/// Inline image for the vision channel.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub image: Option<ImageAttachment>,
    pub temperature: f64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// Network failure, timeout, 5xx, or rate limiting. Retried by the
    /// gateway with backoff.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Non-transient provider rejection (bad request, auth). Not retried.
    #[error("provider error: {0}")]
    Provider(String),
}

/// Raw chat-completion transport under the gateway. Both channels declare a
/// strict JSON-object response contract to the provider.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError>;
}
