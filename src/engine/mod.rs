use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::core::metrics::{OVERRIDES_TOTAL, UPLOADS_TOTAL};
use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::domain::models::{
    percentage_of, EvaluationResult, Exam, ReviewerOverride, UploadedScript,
};
use crate::domain::types::{EvaluationStatus, ScriptStatus, StudentMeta, UploadStatus};
use crate::tasks::{self, TaskMessage};

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// The operations the core exposes to its collaborators: submission, status
/// reads, control (re-segment / re-evaluate), and reviewer override. All
/// processing happens asynchronously through the task graph; callers observe
/// progress and failure only through entity state.
pub struct Engine {
    state: EngineState,
}

impl Engine {
    pub fn new(state: EngineState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Register an exam after checking mark conservation.
    pub async fn create_exam(&self, exam: Exam) -> Result<(), EngineError> {
        exam.validate_marks().map_err(EngineError::Validation)?;
        self.state.store().insert_exam(exam).await
    }

    /// Accept an uploaded script, persist its bytes, and enqueue ingestion.
    /// Rejections (`UNSUPPORTED_MIME`, `FILE_TOO_LARGE`, `EXAM_NOT_FOUND`)
    /// are synchronous and leave no task side effects.
    pub async fn submit_upload(
        &self,
        exam_id: &str,
        student_meta: StudentMeta,
        file_bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
    ) -> Result<String, EngineError> {
        let upload_settings = self.state.settings().upload();
        if !upload_settings.allowed_mime_types.iter().any(|mime| mime == mime_type) {
            return Err(EngineError::UnsupportedMime(mime_type.to_string()));
        }
        let limit = upload_settings.max_upload_bytes();
        if file_bytes.len() as u64 > limit {
            return Err(EngineError::FileTooLarge { size: file_bytes.len() as u64, limit });
        }
        if self.state.store().get_exam(exam_id).await?.is_none() {
            return Err(EngineError::ExamNotFound(exam_id.to_string()));
        }

        let upload_id = Uuid::new_v4().to_string();
        let file_key = format!("uploads/{upload_id}/original");
        let file_hash = hex::encode(Sha256::digest(&file_bytes));
        let file_size_bytes = file_bytes.len() as u64;

        self.state.storage().put(&file_key, file_bytes, mime_type).await?;

        let now = OffsetDateTime::now_utc();
        self.state
            .store()
            .insert_upload(UploadedScript {
                id: upload_id.clone(),
                exam_id: exam_id.to_string(),
                student_meta,
                file_key,
                original_filename: filename.to_string(),
                mime_type: mime_type.to_string(),
                file_size_bytes,
                file_hash,
                page_count: None,
                upload_status: UploadStatus::Uploaded,
                failure_reason: None,
                script_id: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let trace_id = new_trace_id();
        tracing::info!(upload_id = %upload_id, exam_id, trace_id = %trace_id, "upload accepted");
        metrics::counter!(UPLOADS_TOTAL).increment(1);

        tasks::enqueue(&self.state, TaskMessage::Ingest {
            upload_id: upload_id.clone(),
            trace_id,
        })
        .await?;

        Ok(upload_id)
    }

    pub async fn get_upload(&self, upload_id: &str) -> Result<UploadedScript, EngineError> {
        self.state
            .store()
            .get_upload(upload_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("upload", upload_id.to_string()))
    }

    /// Results of the script's current run, ordered by question id.
    pub async fn get_script_evaluations(
        &self,
        script_id: &str,
    ) -> Result<Vec<EvaluationResult>, EngineError> {
        let script = self
            .state
            .store()
            .get_script(script_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("script", script_id.to_string()))?;
        self.state.store().list_results_for_run(script_id, &script.current_run_id).await
    }

    pub async fn get_result(&self, result_id: &str) -> Result<EvaluationResult, EngineError> {
        self.state
            .store()
            .get_result(result_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("result", result_id.to_string()))
    }

    /// Re-run segmentation (and everything downstream) for an upload whose
    /// OCR already completed. The previous script and its results are
    /// replaced.
    pub async fn re_segment(&self, upload_id: &str) -> Result<(), EngineError> {
        let upload = self.get_upload(upload_id).await?;
        if upload.upload_status.rank() < UploadStatus::OcrComplete.rank() {
            return Err(EngineError::Validation(format!(
                "upload {upload_id} has no completed OCR to re-segment"
            )));
        }

        let trace_id = new_trace_id();
        tracing::info!(upload_id, trace_id = %trace_id, "re-segmentation requested");
        tasks::enqueue(&self.state, TaskMessage::Segment {
            upload_id: upload_id.to_string(),
            forced: true,
            attempt: 0,
            trace_id,
        })
        .await
    }

    /// Start a fresh evaluation run for a script. The new run id supersedes
    /// any in-flight run; orphaned completions are discarded on write.
    pub async fn re_evaluate(&self, script_id: &str) -> Result<String, EngineError> {
        if self.state.store().get_script(script_id).await?.is_none() {
            return Err(EngineError::NotFound("script", script_id.to_string()));
        }

        let run_id = Uuid::new_v4().to_string();
        self.state
            .store()
            .set_script_run(script_id, &run_id, ScriptStatus::Evaluating)
            .await?;

        let trace_id = new_trace_id();
        tracing::info!(script_id, run_id = %run_id, trace_id = %trace_id, "re-evaluation requested");
        tasks::enqueue(&self.state, TaskMessage::EvaluateScript {
            script_id: script_id.to_string(),
            run_id: run_id.clone(),
            trace_id,
        })
        .await?;

        Ok(run_id)
    }

    /// Reviewer override: the total becomes the override score and the
    /// percentage is recomputed from it, while every sub-agent output stays
    /// bytewise untouched.
    pub async fn override_result(
        &self,
        result_id: &str,
        score: f64,
        note: &str,
        reviewer_id: &str,
    ) -> Result<EvaluationResult, EngineError> {
        let result = self.get_result(result_id).await?;
        if !matches!(result.status, EvaluationStatus::Complete | EvaluationStatus::Overridden) {
            return Err(EngineError::Validation(format!(
                "result {result_id} is not complete and cannot be overridden"
            )));
        }
        // The reviewer's judgement is authoritative; only a negative score is
        // structurally invalid.
        if score < 0.0 {
            return Err(EngineError::Validation(format!("override score {score} below zero")));
        }

        let reviewer_override = ReviewerOverride {
            reviewer_id: reviewer_id.to_string(),
            override_score: score,
            note: note.to_string(),
            at: OffsetDateTime::now_utc(),
        };
        let percentage = percentage_of(score, result.max_possible_score);

        let updated = self
            .state
            .store()
            .apply_override(result_id, reviewer_override, score, percentage)
            .await?;

        tracing::info!(result_id, reviewer_id, score, "reviewer override applied");
        metrics::counter!(OVERRIDES_TOTAL).increment(1);
        Ok(updated)
    }
}
