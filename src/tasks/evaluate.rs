use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::metrics::EVALUATIONS_TOTAL;
use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::domain::models::EvaluationResult;
use crate::domain::types::{EvaluationStatus, ScriptStatus, TokenUsage, UploadStatus};
use crate::domain::EVALUATION_VERSION;
use crate::services::evaluation::{EvaluationPipeline, QuestionEvaluation};
use crate::tasks::{self, TaskMessage};

fn fanin_key(script_id: &str, run_id: &str) -> String {
    format!("eval:{script_id}:{run_id}")
}

/// Fan out one evaluation task per evaluable (question, answer) pair.
pub(crate) async fn run_script(
    state: &EngineState,
    script_id: &str,
    run_id: &str,
    trace_id: &str,
) -> Result<(), EngineError> {
    let Some(script) = state.store().get_script(script_id).await? else {
        tracing::error!(script_id, trace_id, "script not found for evaluation");
        return Ok(());
    };
    if script.current_run_id != run_id {
        tracing::info!(script_id, run_id, trace_id, "evaluate_script for superseded run");
        return Ok(());
    }
    if matches!(script.status, ScriptStatus::Complete | ScriptStatus::Flagged) {
        tracing::info!(script_id, run_id, trace_id, "evaluate_script replay, run already finalized");
        return Ok(());
    }

    state.store().set_script_status(script_id, ScriptStatus::Evaluating).await?;
    state.store().advance_upload_status(&script.upload_id, UploadStatus::Evaluating).await?;

    let evaluable: Vec<String> =
        script.evaluable_answers().map(|answer| answer.question_id.clone()).collect();

    if evaluable.is_empty() {
        tracing::warn!(script_id, trace_id, "no evaluable answers, finalizing immediately");
        return finalize_script(state, script_id, run_id).await;
    }

    state.store().fanin_init(&fanin_key(script_id, run_id), evaluable.len() as u32).await?;

    tracing::info!(script_id, run_id, trace_id, questions = evaluable.len(), "fanning out evaluation");
    for question_id in evaluable {
        tasks::enqueue(state, TaskMessage::EvaluateQuestion {
            script_id: script_id.to_string(),
            question_id,
            run_id: run_id.to_string(),
            attempt: 0,
            trace_id: trace_id.to_string(),
        })
        .await?;
    }
    Ok(())
}

/// Run the five-agent pipeline for one question. Idempotent on
/// (run id, question id): a replay that finds a persisted result re-checks
/// the fan-in and returns without touching the gateway.
pub(crate) async fn run_question(
    state: &EngineState,
    script_id: &str,
    question_id: &str,
    run_id: &str,
    attempt: u32,
    trace_id: &str,
) -> Result<(), EngineError> {
    if state.store().find_result_by_run(run_id, question_id).await?.is_some() {
        tracing::info!(script_id, question_id, run_id, trace_id, "idempotent replay, result exists");
        return complete_sibling(state, script_id, run_id, question_id, trace_id).await;
    }

    let Some(script) = state.store().get_script(script_id).await? else {
        tracing::error!(script_id, trace_id, "script not found for question evaluation");
        return Ok(());
    };
    if script.current_run_id != run_id {
        tracing::info!(script_id, question_id, run_id, trace_id, "superseded run, discarding task");
        return Ok(());
    }

    let Some(exam) = state.store().get_exam(&script.exam_id).await? else {
        tracing::error!(script_id, exam_id = %script.exam_id, trace_id, "exam missing");
        return Ok(());
    };
    let Some(question) = exam.question(question_id) else {
        tracing::error!(script_id, question_id, trace_id, "question missing from exam");
        return Ok(());
    };
    let Some(answer) = script.answers.iter().find(|a| a.question_id == question_id) else {
        tracing::error!(script_id, question_id, trace_id, "answer missing from script");
        return Ok(());
    };

    let pipeline = EvaluationPipeline::new(
        state.gateway().clone(),
        state.store().clone(),
        state.settings().evaluation().scoring_concurrency,
        state.settings().evaluation().token_budget,
    );

    match pipeline
        .run(script_id, run_id, question, &answer.text, exam.marks_granularity)
        .await
    {
        Ok(evaluation) => {
            let result = assemble_result(script_id, question_id, run_id, evaluation);
            let inserted = state.store().insert_result(result).await?;
            if !inserted {
                tracing::info!(script_id, question_id, run_id, trace_id, "orphaned result discarded");
                return Ok(());
            }
            metrics::counter!(EVALUATIONS_TOTAL, "status" => "complete").increment(1);
            tracing::info!(script_id, question_id, run_id, trace_id, "question evaluated");
            complete_sibling(state, script_id, run_id, question_id, trace_id).await
        }
        Err(EngineError::RunSuperseded(_)) => {
            tracing::info!(script_id, question_id, run_id, trace_id, "run superseded mid-pipeline");
            Ok(())
        }
        Err(err) if err.is_retryable() => {
            let max_attempts = state.settings().evaluation().max_task_attempts;
            if attempt + 1 < max_attempts {
                tracing::warn!(
                    script_id,
                    question_id,
                    attempt,
                    error = %err,
                    "evaluation retry with backoff"
                );
                tokio::time::sleep(retry_backoff(attempt)).await;
                return tasks::enqueue(state, TaskMessage::EvaluateQuestion {
                    script_id: script_id.to_string(),
                    question_id: question_id.to_string(),
                    run_id: run_id.to_string(),
                    attempt: attempt + 1,
                    trace_id: trace_id.to_string(),
                })
                .await;
            }
            fail_question(state, script_id, question_id, run_id, question.max_marks, &err, trace_id)
                .await
        }
        Err(err) => {
            // LLM_MALFORMED and invariant violations are fatal for this
            // question alone; sibling questions are unaffected.
            fail_question(state, script_id, question_id, run_id, question.max_marks, &err, trace_id)
                .await
        }
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(250) * 2_u32.saturating_pow(attempt)
}

fn assemble_result(
    script_id: &str,
    question_id: &str,
    run_id: &str,
    evaluation: QuestionEvaluation,
) -> EvaluationResult {
    EvaluationResult {
        id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        script_id: script_id.to_string(),
        question_id: question_id.to_string(),
        evaluation_version: EVALUATION_VERSION.to_string(),
        grounded_rubric: Some(evaluation.grounded_rubric),
        criterion_scores: evaluation.criterion_scores,
        consistency_audit: Some(evaluation.consistency_audit),
        feedback: Some(evaluation.feedback),
        explainability: Some(evaluation.explainability),
        total_score: evaluation.total_score,
        max_possible_score: evaluation.max_possible_score,
        percentage_score: evaluation.percentage_score,
        review_recommendation: Some(evaluation.review_recommendation),
        reviewer_override: None,
        status: EvaluationStatus::Complete,
        failure_reason: None,
        latency_ms: evaluation.latency_ms,
        tokens_used: evaluation.tokens_used,
        created_at: OffsetDateTime::now_utc(),
    }
}

async fn fail_question(
    state: &EngineState,
    script_id: &str,
    question_id: &str,
    run_id: &str,
    max_marks: f64,
    err: &EngineError,
    trace_id: &str,
) -> Result<(), EngineError> {
    tracing::error!(script_id, question_id, run_id, trace_id, error = %err, "question failed");
    metrics::counter!(EVALUATIONS_TOTAL, "status" => "failed").increment(1);

    let result = EvaluationResult {
        id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        script_id: script_id.to_string(),
        question_id: question_id.to_string(),
        evaluation_version: EVALUATION_VERSION.to_string(),
        grounded_rubric: None,
        criterion_scores: vec![],
        consistency_audit: None,
        feedback: None,
        explainability: None,
        total_score: 0.0,
        max_possible_score: max_marks,
        percentage_score: 0.0,
        review_recommendation: None,
        reviewer_override: None,
        status: EvaluationStatus::Failed,
        failure_reason: Some(err.to_string()),
        latency_ms: 0,
        tokens_used: TokenUsage::default(),
        created_at: OffsetDateTime::now_utc(),
    };

    if !state.store().insert_result(result).await? {
        return Ok(());
    }
    complete_sibling(state, script_id, run_id, question_id, trace_id).await
}

async fn complete_sibling(
    state: &EngineState,
    script_id: &str,
    run_id: &str,
    question_id: &str,
    trace_id: &str,
) -> Result<(), EngineError> {
    let fired =
        state.store().fanin_complete(&fanin_key(script_id, run_id), question_id).await?;
    if fired {
        tracing::info!(script_id, run_id, trace_id, "all questions terminal, finalizing script");
        finalize_script(state, script_id, run_id).await?;
    }
    Ok(())
}

/// Fan-in continuation: every evaluable question has a terminal result.
/// A script with any failed question (or any unanswerable one) is FLAGGED;
/// otherwise it is EVALUATED.
async fn finalize_script(
    state: &EngineState,
    script_id: &str,
    run_id: &str,
) -> Result<(), EngineError> {
    let Some(script) = state.store().get_script(script_id).await? else {
        return Ok(());
    };
    if script.current_run_id != run_id {
        return Ok(());
    }

    let results = state.store().list_results_for_run(script_id, run_id).await?;
    let any_failed = results.iter().any(|result| result.status == EvaluationStatus::Failed);
    let needs_flag = any_failed || script.has_flagged_answers();

    if needs_flag {
        state.store().set_script_status(script_id, ScriptStatus::Flagged).await?;
        let reason = if any_failed {
            "QUESTION_FAILED: one or more questions could not be evaluated"
        } else {
            "one or more answers could not be segmented"
        };
        state
            .store()
            .mark_upload_terminal(&script.upload_id, UploadStatus::Flagged, reason)
            .await?;
    } else {
        state.store().set_script_status(script_id, ScriptStatus::Complete).await?;
        state
            .store()
            .advance_upload_status(&script.upload_id, UploadStatus::Evaluated)
            .await?;
    }

    tracing::info!(script_id, run_id, flagged = needs_flag, "script finalized");
    Ok(())
}
