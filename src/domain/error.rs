use thiserror::Error;

/// Error taxonomy for the evaluation engine. Recoverable kinds are handled
/// inside the owning task (retry or repair); everything else is persisted on
/// the affected entity and surfaces to callers only through entity state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error("file too large: {size} bytes (limit {limit})")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("exam not found: {0}")]
    ExamNotFound(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    /// Transport-level LLM failure that survived the bounded retry loop.
    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),

    /// Output that stayed unparseable or schema-invalid after repair.
    #[error("llm output malformed: {0}")]
    LlmMalformed(String),

    /// Structurally valid agent output with a broken logical invariant
    /// (e.g. awarded above max). Handled identically to `LlmMalformed`.
    #[error("agent output violates invariant: {0}")]
    InvariantViolation(String),

    #[error("segmentation failed: {0}")]
    SegmentationFailed(String),

    #[error("token budget exhausted: spent {spent} of {budget}")]
    BudgetExhausted { spent: u64, budget: u64 },

    /// The run id was superseded by a re-evaluation while this task was in
    /// flight; its output must be discarded.
    #[error("run {0} superseded")]
    RunSuperseded(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),
}

impl EngineError {
    /// Whether the enclosing task should be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LlmUnavailable(_) | Self::Storage(_) | Self::Store(_) | Self::Queue(_))
    }

    /// Whether this failure is fatal for exactly one unit of work (page,
    /// question, or segment) without poisoning its siblings.
    pub fn is_unit_fatal(&self) -> bool {
        matches!(
            self,
            Self::LlmMalformed(_)
                | Self::InvariantViolation(_)
                | Self::SegmentationFailed(_)
                | Self::BudgetExhausted { .. }
        )
    }
}
