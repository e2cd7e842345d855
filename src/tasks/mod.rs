mod evaluate;
mod ingest;
mod ocr;
pub(crate) mod scheduler;
mod segment;


use serde::{Deserialize, Serialize};

use crate::core::metrics::{TASKS_ENQUEUED_TOTAL, TASKS_TOTAL};
use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::queue::QueueName;

/// The task graph's wire format. Every variant carries the composite key the
/// worker uses for its idempotency check before any side-effecting work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskMessage {
    Ingest {
        upload_id: String,
        trace_id: String,
    },
    Ocr {
        upload_id: String,
        trace_id: String,
    },
    OcrPage {
        upload_id: String,
        page_number: u32,
        trace_id: String,
    },
    OcrAggregate {
        upload_id: String,
        trace_id: String,
    },
    Segment {
        upload_id: String,
        /// Set by re-segmentation to bypass the replay short-circuit.
        forced: bool,
        attempt: u32,
        trace_id: String,
    },
    EvaluateScript {
        script_id: String,
        run_id: String,
        trace_id: String,
    },
    EvaluateQuestion {
        script_id: String,
        question_id: String,
        run_id: String,
        attempt: u32,
        trace_id: String,
    },
}

impl TaskMessage {
    pub fn queue(&self) -> QueueName {
        match self {
            Self::Ingest { .. } => QueueName::Default,
            Self::Ocr { .. }
            | Self::OcrPage { .. }
            | Self::OcrAggregate { .. }
            | Self::Segment { .. } => QueueName::Ocr,
            Self::EvaluateScript { .. } | Self::EvaluateQuestion { .. } => QueueName::Evaluation,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ingest { .. } => "ingest",
            Self::Ocr { .. } => "ocr",
            Self::OcrPage { .. } => "ocr_page",
            Self::OcrAggregate { .. } => "ocr_aggregate",
            Self::Segment { .. } => "segment",
            Self::EvaluateScript { .. } => "evaluate_script",
            Self::EvaluateQuestion { .. } => "evaluate_question",
        }
    }
}

pub(crate) async fn enqueue(state: &EngineState, message: TaskMessage) -> Result<(), EngineError> {
    let payload = serde_json::to_string(&message)
        .map_err(|err| EngineError::Queue(format!("task serialization failed: {err}")))?;
    state.queue().enqueue(message.queue(), payload).await?;
    metrics::counter!(TASKS_ENQUEUED_TOTAL, "task" => message.name()).increment(1);
    Ok(())
}

pub(crate) async fn dispatch(state: &EngineState, message: TaskMessage) -> Result<(), EngineError> {
    let task_name = message.name();
    let outcome = match message {
        TaskMessage::Ingest { upload_id, trace_id } => {
            ingest::run(state, &upload_id, &trace_id).await
        }
        TaskMessage::Ocr { upload_id, trace_id } => ocr::run(state, &upload_id, &trace_id).await,
        TaskMessage::OcrPage { upload_id, page_number, trace_id } => {
            ocr::run_page(state, &upload_id, page_number, &trace_id).await
        }
        TaskMessage::OcrAggregate { upload_id, trace_id } => {
            ocr::run_aggregate(state, &upload_id, &trace_id).await
        }
        TaskMessage::Segment { upload_id, forced, attempt, trace_id } => {
            segment::run(state, &upload_id, forced, attempt, &trace_id).await
        }
        TaskMessage::EvaluateScript { script_id, run_id, trace_id } => {
            evaluate::run_script(state, &script_id, &run_id, &trace_id).await
        }
        TaskMessage::EvaluateQuestion { script_id, question_id, run_id, attempt, trace_id } => {
            evaluate::run_question(state, &script_id, &question_id, &run_id, attempt, &trace_id)
                .await
        }
    };

    match &outcome {
        Ok(()) => {
            metrics::counter!(TASKS_TOTAL, "task" => task_name, "status" => "success").increment(1)
        }
        Err(err) => {
            metrics::counter!(TASKS_TOTAL, "task" => task_name, "status" => "error").increment(1);
            tracing::error!(task = task_name, error = %err, "task failed");
        }
    }
    outcome
}
