mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::domain::error::EngineError;
use crate::domain::models::{
    EvaluationResult, Exam, OcrPageResult, ReviewerOverride, Script, UploadedScript,
};
use crate::domain::types::{ScriptStatus, UploadStatus};

/// Persistence port for all pipeline entities. The engine reaches shared
/// state only through this trait; every status transition is a conditional
/// update so replayed tasks observe "already done" instead of clobbering.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn insert_exam(&self, exam: Exam) -> Result<(), EngineError>;
    async fn get_exam(&self, exam_id: &str) -> Result<Option<Exam>, EngineError>;

    async fn insert_upload(&self, upload: UploadedScript) -> Result<(), EngineError>;
    async fn get_upload(&self, upload_id: &str) -> Result<Option<UploadedScript>, EngineError>;

    /// Compare-and-set status advance. Returns `Ok(true)` when the
    /// transition was applied, `Ok(false)` when the upload is already at or
    /// past `to` (a replay), and an error when the upload does not exist or
    /// the transition would move backwards from a non-terminal state.
    async fn advance_upload_status(
        &self,
        upload_id: &str,
        to: UploadStatus,
    ) -> Result<bool, EngineError>;

    /// Move the upload to FAILED or FLAGGED with a reason. No-op when the
    /// upload already sits in an absorbing state.
    async fn mark_upload_terminal(
        &self,
        upload_id: &str,
        to: UploadStatus,
        reason: &str,
    ) -> Result<(), EngineError>;

    async fn set_upload_page_count(
        &self,
        upload_id: &str,
        page_count: u32,
    ) -> Result<(), EngineError>;

    async fn set_upload_script(&self, upload_id: &str, script_id: &str)
        -> Result<(), EngineError>;

    /// Persist a page result. Returns `false` when a record for this
    /// (upload id, page number) already exists; the first terminal record
    /// wins and replays are ignored.
    async fn upsert_ocr_page(&self, page: OcrPageResult) -> Result<bool, EngineError>;
    async fn get_ocr_page(
        &self,
        upload_id: &str,
        page_number: u32,
    ) -> Result<Option<OcrPageResult>, EngineError>;
    /// All page results for an upload, sorted by page number.
    async fn list_ocr_pages(&self, upload_id: &str) -> Result<Vec<OcrPageResult>, EngineError>;

    async fn insert_script(&self, script: Script) -> Result<(), EngineError>;
    async fn get_script(&self, script_id: &str) -> Result<Option<Script>, EngineError>;
    async fn set_script_status(
        &self,
        script_id: &str,
        status: ScriptStatus,
    ) -> Result<(), EngineError>;
    /// Supersede the script's current run. In-flight results from older runs
    /// are discarded on write via the run-id check in `insert_result`.
    async fn set_script_run(
        &self,
        script_id: &str,
        run_id: &str,
        status: ScriptStatus,
    ) -> Result<(), EngineError>;
    /// Cascade delete: the script and every evaluation result it owns.
    async fn delete_script(&self, script_id: &str) -> Result<(), EngineError>;

    /// Insert a result iff (a) no result exists for (run id, question id)
    /// and (b) the owning script's current run still matches. Returns
    /// `false` when the write was discarded for either reason.
    async fn insert_result(&self, result: EvaluationResult) -> Result<bool, EngineError>;
    async fn get_result(&self, result_id: &str)
        -> Result<Option<EvaluationResult>, EngineError>;
    async fn find_result_by_run(
        &self,
        run_id: &str,
        question_id: &str,
    ) -> Result<Option<EvaluationResult>, EngineError>;
    async fn list_results_for_run(
        &self,
        script_id: &str,
        run_id: &str,
    ) -> Result<Vec<EvaluationResult>, EngineError>;

    /// Reviewer override: replaces total score, percentage, and status while
    /// leaving every sub-agent field untouched. Returns the updated record.
    async fn apply_override(
        &self,
        result_id: &str,
        reviewer_override: ReviewerOverride,
        total_score: f64,
        percentage_score: f64,
    ) -> Result<EvaluationResult, EngineError>;

    /// Register a fan-in barrier expecting `expected` distinct members.
    async fn fanin_init(&self, key: &str, expected: u32) -> Result<(), EngineError>;

    /// Record one sibling's completion. Returns `true` exactly once, on the
    /// call that sees all expected members complete; duplicate deliveries of
    /// the same member never fire the continuation twice.
    async fn fanin_complete(&self, key: &str, member: &str) -> Result<bool, EngineError>;
}
