use std::collections::BTreeSet;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::domain::models::{Script, ScriptAnswer};
use crate::domain::types::{ScriptStatus, UploadStatus};
use crate::services::segmenter::Segmenter;
use crate::tasks::{self, TaskMessage};

/// Turn aggregated OCR text into the logical Script and kick off evaluation.
/// A contract-violating segmentation flags the script; transport failures
/// retry the task up to the configured attempt bound.
pub(crate) async fn run(
    state: &EngineState,
    upload_id: &str,
    forced: bool,
    attempt: u32,
    trace_id: &str,
) -> Result<(), EngineError> {
    let Some(upload) = state.store().get_upload(upload_id).await? else {
        tracing::error!(upload_id, trace_id, "upload not found for segmentation");
        return Ok(());
    };

    if upload.upload_status.is_absorbing() {
        return Ok(());
    }
    if !forced
        && upload.script_id.is_some()
        && upload.upload_status.rank() >= UploadStatus::Segmented.rank()
    {
        tracing::info!(upload_id, trace_id, "segment replay, script already exists");
        return Ok(());
    }

    let Some(exam) = state.store().get_exam(&upload.exam_id).await? else {
        state
            .store()
            .mark_upload_terminal(
                upload_id,
                UploadStatus::Failed,
                &format!("EXAM_NOT_FOUND: {}", upload.exam_id),
            )
            .await?;
        return Ok(());
    };

    let pages = state.store().list_ocr_pages(upload_id).await?;
    if pages.is_empty() {
        state
            .store()
            .mark_upload_terminal(upload_id, UploadStatus::Failed, "no OCR pages to segment")
            .await?;
        return Ok(());
    }

    let segmenter = Segmenter::new(state.gateway().clone());
    let output = match segmenter.segment(&exam, &pages).await {
        Ok(output) => output,
        Err(EngineError::SegmentationFailed(reason)) => {
            state
                .store()
                .mark_upload_terminal(
                    upload_id,
                    UploadStatus::Flagged,
                    &format!("SEGMENTATION_FAILED: {reason}"),
                )
                .await?;
            return Ok(());
        }
        Err(err) if err.is_retryable() => {
            let max_attempts = state.settings().evaluation().max_task_attempts;
            if attempt + 1 < max_attempts {
                tracing::warn!(upload_id, trace_id, attempt, error = %err, "segmentation retry");
                return tasks::enqueue(state, TaskMessage::Segment {
                    upload_id: upload_id.to_string(),
                    forced,
                    attempt: attempt + 1,
                    trace_id: trace_id.to_string(),
                })
                .await;
            }
            state
                .store()
                .mark_upload_terminal(upload_id, UploadStatus::Failed, &err.to_string())
                .await?;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    // Answers land in declared question order regardless of how the model
    // emitted them; a missing answer is flagged, not dropped.
    let answers: Vec<ScriptAnswer> = exam
        .questions
        .iter()
        .map(|question| {
            let segmented = output
                .answers
                .iter()
                .find(|answer| answer.question_id == question.question_id);
            let text = segmented.and_then(|answer| answer.answer_text.clone());
            ScriptAnswer {
                question_id: question.question_id.clone(),
                is_flagged: text.is_none(),
                text: text.unwrap_or_default(),
            }
        })
        .collect();

    let avg_confidence =
        pages.iter().map(|page| page.confidence).sum::<f64>() / pages.len() as f64;
    let quality_flags: BTreeSet<_> =
        pages.iter().flat_map(|page| page.quality_flags.iter().copied()).collect();

    let script_id = Uuid::new_v4().to_string();
    let run_id = Uuid::new_v4().to_string();
    let script = Script {
        id: script_id.clone(),
        upload_id: upload_id.to_string(),
        exam_id: exam.id.clone(),
        student_meta: upload.student_meta.clone(),
        answers,
        ocr_confidence_average: avg_confidence,
        ocr_quality_flags: quality_flags.into_iter().collect(),
        segmentation_confidence: output.segmentation_confidence,
        current_run_id: run_id.clone(),
        status: ScriptStatus::Pending,
        created_at: OffsetDateTime::now_utc(),
    };

    // Re-segmentation replaces the previous logical view entirely.
    if forced {
        if let Some(old_script_id) = &upload.script_id {
            state.store().delete_script(old_script_id).await?;
        }
    }

    state.store().insert_script(script).await?;
    state.store().set_upload_script(upload_id, &script_id).await?;
    state.store().advance_upload_status(upload_id, UploadStatus::Segmented).await?;

    tracing::info!(upload_id, script_id = %script_id, trace_id, "script segmented");

    tasks::enqueue(state, TaskMessage::EvaluateScript {
        script_id,
        run_id,
        trace_id: trace_id.to_string(),
    })
    .await
}
