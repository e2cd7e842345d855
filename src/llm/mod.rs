mod api;
mod gateway;
mod openai;

pub use api::{ChatApi, ChatError, ChatRequest, ChatResponse, ImageAttachment};
pub use gateway::{CompletionOpts, LlmGateway, LlmPayload, StructuredTelemetry};
pub use openai::OpenAiChat;
