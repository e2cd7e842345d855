use serde::de::DeserializeOwned;

use crate::core::metrics::{AGENT_CALLS_TOTAL, AGENT_LATENCY_MS};
use crate::domain::error::EngineError;
use crate::llm::{CompletionOpts, LlmGateway};

/// Contract every evaluation agent declares: prompts, the JSON silhouette
/// shown to the model on repair, and a semantic validator that runs after
/// schema deserialization. The role codename inside each system prompt is a
/// prompt-authoring device only.
pub(crate) trait Agent: Sync {
    type Output: DeserializeOwned + Send;

    const NAME: &'static str;

    fn system_prompt(&self) -> &'static str;
    fn user_prompt(&self) -> String;
    fn schema_silhouette(&self) -> &'static str;

    /// Logical invariants beyond the schema (bounds, id echoes, grounding).
    /// Rejections feed the repair loop; persistent rejection surfaces as
    /// `LLM_MALFORMED`.
    fn validate(&self, _output: &Self::Output) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AgentTelemetry {
    pub agent: &'static str,
    pub model: String,
    pub latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub repair_count: u32,
}

pub(crate) struct AgentOutcome<T> {
    pub output: T,
    pub telemetry: AgentTelemetry,
}

/// Run one agent call through the gateway: render prompts, complete with the
/// strict JSON contract, deserialize, validate, repair on failure, and emit
/// telemetry.
pub(crate) async fn run_agent<A: Agent>(
    gateway: &LlmGateway,
    agent: &A,
) -> Result<AgentOutcome<A::Output>, EngineError> {
    let user_prompt = agent.user_prompt();

    let validate = |value: &serde_json::Value| {
        let output: A::Output = serde_json::from_value(value.clone())
            .map_err(|err| format!("schema mismatch: {err}"))?;
        agent.validate(&output)
    };

    let result = gateway
        .complete_structured(
            agent.system_prompt(),
            &user_prompt,
            agent.schema_silhouette(),
            CompletionOpts::default(),
            &validate,
        )
        .await;

    let (value, telemetry) = match result {
        Ok(ok) => ok,
        Err(err) => {
            metrics::counter!(AGENT_CALLS_TOTAL, "agent" => A::NAME, "status" => "error")
                .increment(1);
            tracing::error!(agent = A::NAME, error = %err, "agent call failed");
            return Err(err);
        }
    };

    let output: A::Output = serde_json::from_value(value)
        .map_err(|err| EngineError::LlmMalformed(format!("validated output failed to narrow: {err}")))?;

    metrics::counter!(AGENT_CALLS_TOTAL, "agent" => A::NAME, "status" => "success").increment(1);
    metrics::histogram!(AGENT_LATENCY_MS, "agent" => A::NAME).record(telemetry.latency_ms as f64);

    tracing::info!(
        agent = A::NAME,
        latency_ms = telemetry.latency_ms,
        prompt_tokens = telemetry.prompt_tokens,
        completion_tokens = telemetry.completion_tokens,
        repairs = telemetry.repair_count,
        "agent completed"
    );

    Ok(AgentOutcome {
        output,
        telemetry: AgentTelemetry {
            agent: A::NAME,
            model: telemetry.model,
            latency_ms: telemetry.latency_ms,
            prompt_tokens: telemetry.prompt_tokens,
            completion_tokens: telemetry.completion_tokens,
            repair_count: telemetry.repair_count,
        },
    })
}
