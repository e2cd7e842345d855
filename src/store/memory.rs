use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::error::EngineError;
use crate::domain::models::{
    EvaluationResult, Exam, OcrPageResult, ReviewerOverride, Script, UploadedScript,
};
use crate::domain::types::{EvaluationStatus, ScriptStatus, UploadStatus};
use crate::store::StateStore;

#[derive(Default)]
struct FanIn {
    expected: u32,
    members: HashSet<String>,
    fired: bool,
}

#[derive(Default)]
struct Inner {
    exams: HashMap<String, Exam>,
    uploads: HashMap<String, UploadedScript>,
    ocr_pages: HashMap<(String, u32), OcrPageResult>,
    scripts: HashMap<String, Script>,
    results: HashMap<String, EvaluationResult>,
    result_keys: HashMap<(String, String), String>,
    fanins: HashMap<String, FanIn>,
}

/// In-process state store. Backs tests and single-node deployments; the
/// conditional-update semantics match what a database-backed store must
/// provide.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err<T>(_: T) -> EngineError {
    EngineError::Store("state store mutex poisoned".into())
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_exam(&self, exam: Exam) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.exams.insert(exam.id.clone(), exam);
        Ok(())
    }

    async fn get_exam(&self, exam_id: &str) -> Result<Option<Exam>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        Ok(inner.exams.get(exam_id).cloned())
    }

    async fn insert_upload(&self, upload: UploadedScript) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.uploads.insert(upload.id.clone(), upload);
        Ok(())
    }

    async fn get_upload(&self, upload_id: &str) -> Result<Option<UploadedScript>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        Ok(inner.uploads.get(upload_id).cloned())
    }

    async fn advance_upload_status(
        &self,
        upload_id: &str,
        to: UploadStatus,
    ) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::NotFound("upload", upload_id.to_string()))?;

        if upload.upload_status == to || upload.upload_status.rank() > to.rank() {
            return Ok(false);
        }
        if !upload.upload_status.can_advance_to(to) {
            return Ok(false);
        }
        upload.upload_status = to;
        upload.updated_at = time::OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn mark_upload_terminal(
        &self,
        upload_id: &str,
        to: UploadStatus,
        reason: &str,
    ) -> Result<(), EngineError> {
        debug_assert!(to.is_absorbing());
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::NotFound("upload", upload_id.to_string()))?;

        if upload.upload_status.is_absorbing() {
            return Ok(());
        }
        upload.upload_status = to;
        upload.failure_reason = Some(reason.to_string());
        upload.updated_at = time::OffsetDateTime::now_utc();
        Ok(())
    }

    async fn set_upload_page_count(
        &self,
        upload_id: &str,
        page_count: u32,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::NotFound("upload", upload_id.to_string()))?;
        upload.page_count = Some(page_count);
        Ok(())
    }

    async fn set_upload_script(
        &self,
        upload_id: &str,
        script_id: &str,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::NotFound("upload", upload_id.to_string()))?;
        upload.script_id = Some(script_id.to_string());
        Ok(())
    }

    async fn upsert_ocr_page(&self, page: OcrPageResult) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let key = (page.upload_id.clone(), page.page_number);
        if inner.ocr_pages.contains_key(&key) {
            return Ok(false);
        }
        inner.ocr_pages.insert(key, page);
        Ok(true)
    }

    async fn get_ocr_page(
        &self,
        upload_id: &str,
        page_number: u32,
    ) -> Result<Option<OcrPageResult>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        Ok(inner.ocr_pages.get(&(upload_id.to_string(), page_number)).cloned())
    }

    async fn list_ocr_pages(&self, upload_id: &str) -> Result<Vec<OcrPageResult>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        let mut pages: Vec<_> = inner
            .ocr_pages
            .values()
            .filter(|page| page.upload_id == upload_id)
            .cloned()
            .collect();
        pages.sort_by_key(|page| page.page_number);
        Ok(pages)
    }

    async fn insert_script(&self, script: Script) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.scripts.insert(script.id.clone(), script);
        Ok(())
    }

    async fn get_script(&self, script_id: &str) -> Result<Option<Script>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        Ok(inner.scripts.get(script_id).cloned())
    }

    async fn set_script_status(
        &self,
        script_id: &str,
        status: ScriptStatus,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let script = inner
            .scripts
            .get_mut(script_id)
            .ok_or_else(|| EngineError::NotFound("script", script_id.to_string()))?;
        script.status = status;
        Ok(())
    }

    async fn set_script_run(
        &self,
        script_id: &str,
        run_id: &str,
        status: ScriptStatus,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let script = inner
            .scripts
            .get_mut(script_id)
            .ok_or_else(|| EngineError::NotFound("script", script_id.to_string()))?;
        script.current_run_id = run_id.to_string();
        script.status = status;
        Ok(())
    }

    async fn delete_script(&self, script_id: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner.scripts.remove(script_id);
        let owned: Vec<String> = inner
            .results
            .values()
            .filter(|result| result.script_id == script_id)
            .map(|result| result.id.clone())
            .collect();
        for result_id in owned {
            if let Some(result) = inner.results.remove(&result_id) {
                inner.result_keys.remove(&(result.run_id, result.question_id));
            }
        }
        Ok(())
    }

    async fn insert_result(&self, result: EvaluationResult) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;

        let key = (result.run_id.clone(), result.question_id.clone());
        if inner.result_keys.contains_key(&key) {
            return Ok(false);
        }

        // Orphaned completion from a superseded run: discard on write.
        match inner.scripts.get(&result.script_id) {
            Some(script) if script.current_run_id == result.run_id => {}
            Some(_) => return Ok(false),
            None => return Err(EngineError::NotFound("script", result.script_id.clone())),
        }

        inner.result_keys.insert(key, result.id.clone());
        inner.results.insert(result.id.clone(), result);
        Ok(true)
    }

    async fn get_result(
        &self,
        result_id: &str,
    ) -> Result<Option<EvaluationResult>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        Ok(inner.results.get(result_id).cloned())
    }

    async fn find_result_by_run(
        &self,
        run_id: &str,
        question_id: &str,
    ) -> Result<Option<EvaluationResult>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        let id = inner.result_keys.get(&(run_id.to_string(), question_id.to_string()));
        Ok(id.and_then(|id| inner.results.get(id)).cloned())
    }

    async fn list_results_for_run(
        &self,
        script_id: &str,
        run_id: &str,
    ) -> Result<Vec<EvaluationResult>, EngineError> {
        let inner = self.inner.lock().map_err(lock_err)?;
        let mut results: Vec<_> = inner
            .results
            .values()
            .filter(|result| result.script_id == script_id && result.run_id == run_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        Ok(results)
    }

    async fn apply_override(
        &self,
        result_id: &str,
        reviewer_override: ReviewerOverride,
        total_score: f64,
        percentage_score: f64,
    ) -> Result<EvaluationResult, EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let result = inner
            .results
            .get_mut(result_id)
            .ok_or_else(|| EngineError::NotFound("result", result_id.to_string()))?;

        result.reviewer_override = Some(reviewer_override);
        result.total_score = total_score;
        result.percentage_score = percentage_score;
        result.status = EvaluationStatus::Overridden;
        Ok(result.clone())
    }

    async fn fanin_init(&self, key: &str, expected: u32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        inner
            .fanins
            .entry(key.to_string())
            .or_insert_with(|| FanIn { expected, members: HashSet::new(), fired: false })
            .expected = expected;
        Ok(())
    }

    async fn fanin_complete(&self, key: &str, member: &str) -> Result<bool, EngineError> {
        let mut inner = self.inner.lock().map_err(lock_err)?;
        let fanin = inner
            .fanins
            .get_mut(key)
            .ok_or_else(|| EngineError::Store(format!("fan-in {key} not initialised")))?;

        fanin.members.insert(member.to_string());
        if !fanin.fired && fanin.members.len() as u32 >= fanin.expected {
            fanin.fired = true;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn status_advance_is_conditional() {
        let store = MemoryStore::new();
        let upload = test_support::sample_upload("u1", "exam-1");
        store.insert_upload(upload).await.unwrap();

        assert!(store.advance_upload_status("u1", UploadStatus::Processing).await.unwrap());
        // Replay of the same transition is a no-op success.
        assert!(!store.advance_upload_status("u1", UploadStatus::Processing).await.unwrap());
        // Backwards transition is refused.
        assert!(store.advance_upload_status("u1", UploadStatus::OcrComplete).await.unwrap());
        assert!(!store.advance_upload_status("u1", UploadStatus::Processing).await.unwrap());

        let upload = store.get_upload("u1").await.unwrap().unwrap();
        assert_eq!(upload.upload_status, UploadStatus::OcrComplete);
    }

    #[tokio::test]
    async fn terminal_states_absorb_further_transitions() {
        let store = MemoryStore::new();
        store.insert_upload(test_support::sample_upload("u1", "exam-1")).await.unwrap();

        store.mark_upload_terminal("u1", UploadStatus::Flagged, "segmentation failed").await.unwrap();
        store.mark_upload_terminal("u1", UploadStatus::Failed, "late failure").await.unwrap();
        assert!(!store.advance_upload_status("u1", UploadStatus::Evaluated).await.unwrap());

        let upload = store.get_upload("u1").await.unwrap().unwrap();
        assert_eq!(upload.upload_status, UploadStatus::Flagged);
        assert_eq!(upload.failure_reason.as_deref(), Some("segmentation failed"));
    }

    #[tokio::test]
    async fn ocr_pages_keep_first_terminal_record() {
        let store = MemoryStore::new();
        let page = test_support::sample_ocr_page("u1", 1, "first pass");
        assert!(store.upsert_ocr_page(page).await.unwrap());

        let replay = test_support::sample_ocr_page("u1", 1, "second pass");
        assert!(!store.upsert_ocr_page(replay).await.unwrap());

        let stored = store.get_ocr_page("u1", 1).await.unwrap().unwrap();
        assert_eq!(stored.extracted_text, "first pass");
    }

    #[tokio::test]
    async fn fanin_fires_exactly_once_under_duplicate_deliveries() {
        let store = MemoryStore::new();
        store.fanin_init("ocr:u1", 3).await.unwrap();

        assert!(!store.fanin_complete("ocr:u1", "1").await.unwrap());
        assert!(!store.fanin_complete("ocr:u1", "2").await.unwrap());
        // Duplicate delivery of an already-registered sibling.
        assert!(!store.fanin_complete("ocr:u1", "2").await.unwrap());
        assert!(store.fanin_complete("ocr:u1", "3").await.unwrap());
        // Late duplicates after firing never re-fire.
        assert!(!store.fanin_complete("ocr:u1", "3").await.unwrap());
        assert!(!store.fanin_complete("ocr:u1", "1").await.unwrap());
    }

    #[tokio::test]
    async fn results_from_superseded_runs_are_discarded() {
        let store = MemoryStore::new();
        let script = test_support::sample_script("s1", "u1", "exam-1", "run-1");
        store.insert_script(script).await.unwrap();

        let stale = test_support::sample_result("r-old", "s1", "q1", "run-0");
        assert!(!store.insert_result(stale).await.unwrap());

        let current = test_support::sample_result("r-new", "s1", "q1", "run-1");
        assert!(store.insert_result(current).await.unwrap());

        // Replay under the same idempotency key is discarded.
        let replay = test_support::sample_result("r-dup", "s1", "q1", "run-1");
        assert!(!store.insert_result(replay).await.unwrap());
    }

    #[tokio::test]
    async fn delete_script_cascades_to_results() {
        let store = MemoryStore::new();
        store
            .insert_script(test_support::sample_script("s1", "u1", "exam-1", "run-1"))
            .await
            .unwrap();
        store.insert_result(test_support::sample_result("r1", "s1", "q1", "run-1")).await.unwrap();

        store.delete_script("s1").await.unwrap();
        assert!(store.get_script("s1").await.unwrap().is_none());
        assert!(store.get_result("r1").await.unwrap().is_none());
        assert!(store.find_result_by_run("run-1", "q1").await.unwrap().is_none());
    }
}
