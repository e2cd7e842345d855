mod consistency;
mod explainability;
mod feedback;
mod rubric_grounding;
mod runtime;
mod scoring;

pub(crate) use consistency::ConsistencyAgent;
pub(crate) use explainability::{
    agreement_score, decide_review, review_trigger_reason, ExplainabilityAgent,
};
pub(crate) use feedback::FeedbackAgent;
pub(crate) use rubric_grounding::RubricGroundingAgent;
pub(crate) use runtime::{run_agent, Agent, AgentOutcome, AgentTelemetry};
pub(crate) use scoring::ScoringAgent;
