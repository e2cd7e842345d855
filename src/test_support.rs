use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::core::config::Settings;
use crate::core::state::EngineState;
use crate::domain::error::EngineError;
use crate::domain::models::{
    Exam, ExamQuestion, EvaluationResult, OcrPageResult, RubricCriterionDef, Script, ScriptAnswer,
    UploadedScript,
};
use crate::domain::types::{
    EvaluationStatus, QualityFlag, ScriptStatus, StudentMeta, TokenUsage, UploadStatus,
};
use crate::engine::Engine;
use crate::llm::{ChatApi, ChatError, ChatRequest, ChatResponse, LlmGateway};
use crate::queue::MemoryQueue;
use crate::services::rasterizer::{PageImage, PageRasterizer};
use crate::storage::MemoryStorage;
use crate::store::MemoryStore;

pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|err| err.into_inner())
}

pub(crate) fn set_test_env() {
    dotenvy::dotenv().ok();

    std::env::set_var("SCRIPTMARK_ENV", "test");
    std::env::set_var("SCRIPTMARK_STRICT_CONFIG", "0");
    std::env::remove_var("LLM_API_KEY");
    std::env::remove_var("OCR_MAX_PAGES");
    std::env::remove_var("EVAL_TOKEN_BUDGET");
    std::env::remove_var("EVAL_SCORING_CONCURRENCY");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::set_var("WORKER_POLL_INTERVAL", "1");
}

// ── Mock chat transport ──────────────────────────────────────────

type ScriptEntry = (Result<String, String>, u64, u64);
type Responder = dyn Fn(&ChatRequest) -> Result<String, String> + Send + Sync;

struct MockInner {
    script: Mutex<VecDeque<ScriptEntry>>,
    responder: Option<Box<Responder>>,
    calls: AtomicU64,
    prompts: Mutex<Vec<String>>,
}

/// Scripted stand-in for the chat provider. `scripted` feeds responses in
/// call order; `with_responder` answers by inspecting the request, which
/// keeps concurrent fan-out deterministic. `Err` entries simulate transport
/// failures.
pub(crate) struct MockChat {
    inner: Arc<MockInner>,
}

impl MockChat {
    pub(crate) fn scripted(responses: Vec<Result<String, String>>) -> Self {
        Self::scripted_with_usage(responses.into_iter().map(|r| (r, 10, 5)).collect())
    }

    pub(crate) fn scripted_with_usage(entries: Vec<ScriptEntry>) -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Mutex::new(entries.into_iter().collect()),
                responder: None,
                calls: AtomicU64::new(0),
                prompts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn with_responder(
        responder: impl Fn(&ChatRequest) -> Result<String, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(MockInner {
                script: Mutex::new(VecDeque::new()),
                responder: Some(Box::new(responder)),
                calls: AtomicU64::new(0),
                prompts: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn call_counter(&self) -> CallCounter {
        CallCounter { inner: self.inner.clone() }
    }

    pub(crate) fn prompt_log(&self) -> PromptLog {
        PromptLog { inner: self.inner.clone() }
    }
}

#[derive(Clone)]
pub(crate) struct CallCounter {
    inner: Arc<MockInner>,
}

impl CallCounter {
    pub(crate) fn count(&self) -> u64 {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub(crate) struct PromptLog {
    inner: Arc<MockInner>,
}

impl PromptLog {
    pub(crate) fn nth(&self, index: usize) -> String {
        self.inner.prompts.lock().expect("prompt log").get(index).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ChatApi for MockChat {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.prompts.lock().expect("prompt log").push(request.user_prompt.clone());

        let (result, prompt_tokens, completion_tokens) = match &self.inner.responder {
            Some(responder) => (responder(&request), 10, 5),
            None => {
                let mut script = self.inner.script.lock().expect("mock script");
                script.pop_front().expect("MockChat script exhausted")
            }
        };

        match result {
            Ok(content) => Ok(ChatResponse {
                content,
                prompt_tokens,
                completion_tokens,
                model: "mock-model".into(),
            }),
            Err(message) => Err(ChatError::Transport(message)),
        }
    }
}

// ── Entity builders ──────────────────────────────────────────────

pub(crate) fn sample_student() -> StudentMeta {
    StudentMeta { name: "A. Student".into(), roll_no: "2021-CS-042".into(), email: None }
}

pub(crate) fn sample_upload(id: &str, exam_id: &str) -> UploadedScript {
    UploadedScript {
        id: id.to_string(),
        exam_id: exam_id.to_string(),
        student_meta: sample_student(),
        file_key: format!("uploads/{id}/original"),
        original_filename: "script.pdf".into(),
        mime_type: "application/pdf".into(),
        file_size_bytes: 1024,
        file_hash: "deadbeef".into(),
        page_count: None,
        upload_status: UploadStatus::Uploaded,
        failure_reason: None,
        script_id: None,
        created_at: OffsetDateTime::now_utc(),
        updated_at: OffsetDateTime::now_utc(),
    }
}

pub(crate) fn sample_ocr_page(upload_id: &str, page_number: u32, text: &str) -> OcrPageResult {
    OcrPageResult {
        upload_id: upload_id.to_string(),
        page_number,
        extracted_text: text.to_string(),
        confidence: 0.9,
        quality_flags: Vec::<QualityFlag>::new(),
        provider: "vision_llm".into(),
        processing_ms: 120,
    }
}

/// Two questions, two criteria each, 10 marks per question, 20 total.
pub(crate) fn sample_exam(id: &str) -> Exam {
    Exam {
        id: id.to_string(),
        title: "Object-Oriented Programming Mid-Term".into(),
        subject: "Computer Science".into(),
        questions: vec![
            ExamQuestion {
                question_id: "q1".into(),
                question_text: "Explain polymorphism with an example.".into(),
                max_marks: 10.0,
                rubric: vec![
                    RubricCriterionDef {
                        criterion_id: "q1c1".into(),
                        description: "Defines polymorphism correctly".into(),
                        max_marks: 6.0,
                    },
                    RubricCriterionDef {
                        criterion_id: "q1c2".into(),
                        description: "Provides a concrete example".into(),
                        max_marks: 4.0,
                    },
                ],
            },
            ExamQuestion {
                question_id: "q2".into(),
                question_text: "Describe how a hash table works.".into(),
                max_marks: 10.0,
                rubric: vec![
                    RubricCriterionDef {
                        criterion_id: "q2c1".into(),
                        description: "Explains hashing and buckets".into(),
                        max_marks: 5.0,
                    },
                    RubricCriterionDef {
                        criterion_id: "q2c2".into(),
                        description: "Discusses collision handling".into(),
                        max_marks: 5.0,
                    },
                ],
            },
        ],
        total_marks: 20.0,
        marks_granularity: 0.25,
    }
}

pub(crate) fn sample_script(id: &str, upload_id: &str, exam_id: &str, run_id: &str) -> Script {
    Script {
        id: id.to_string(),
        upload_id: upload_id.to_string(),
        exam_id: exam_id.to_string(),
        student_meta: sample_student(),
        answers: vec![
            ScriptAnswer {
                question_id: "q1".into(),
                text: "Polymorphism means many forms. A Dog overriding speak() is an example."
                    .into(),
                is_flagged: false,
            },
            ScriptAnswer {
                question_id: "q2".into(),
                text: "A hash table maps keys to buckets using a hash function. Collisions are \
                       handled by chaining."
                    .into(),
                is_flagged: false,
            },
        ],
        ocr_confidence_average: 0.9,
        ocr_quality_flags: vec![],
        segmentation_confidence: 0.9,
        current_run_id: run_id.to_string(),
        status: ScriptStatus::Evaluating,
        created_at: OffsetDateTime::now_utc(),
    }
}

pub(crate) fn sample_result(
    id: &str,
    script_id: &str,
    question_id: &str,
    run_id: &str,
) -> EvaluationResult {
    EvaluationResult {
        id: id.to_string(),
        run_id: run_id.to_string(),
        script_id: script_id.to_string(),
        question_id: question_id.to_string(),
        evaluation_version: crate::domain::EVALUATION_VERSION.to_string(),
        grounded_rubric: None,
        criterion_scores: vec![],
        consistency_audit: None,
        feedback: None,
        explainability: None,
        total_score: 7.0,
        max_possible_score: 10.0,
        percentage_score: 70.0,
        review_recommendation: None,
        reviewer_override: None,
        status: EvaluationStatus::Complete,
        failure_reason: None,
        latency_ms: 500,
        tokens_used: TokenUsage::default(),
        created_at: OffsetDateTime::now_utc(),
    }
}

// ── Full-pipeline harness ────────────────────────────────────────

/// Deterministic stand-in for the PDF rasterizer: emits `pages` pages whose
/// bytes carry a `page-N` marker the mock responder can read back.
pub(crate) struct StubRasterizer {
    pub pages: u32,
}

impl PageRasterizer for StubRasterizer {
    fn rasterize(&self, _bytes: &[u8], _dpi: u32) -> Result<Vec<PageImage>, EngineError> {
        Ok((1..=self.pages)
            .map(|page_number| PageImage {
                page_number,
                png_bytes: format!("page-{page_number}").into_bytes(),
                mime_type: "image/png",
            })
            .collect())
    }
}

pub(crate) struct TestHarness {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub calls: CallCounter,
    _guard: MutexGuard<'static, ()>,
}

impl TestHarness {
    pub(crate) fn state(&self) -> &EngineState {
        self.engine.state()
    }
}

/// Engine over in-memory infrastructure with a responder-driven mock
/// gateway; [`sample_exam`] `exam-1` is pre-registered.
pub(crate) async fn harness_with_responder(
    responder: impl Fn(&ChatRequest) -> Result<String, String> + Send + Sync + 'static,
) -> TestHarness {
    harness_with_responder_and_pages(responder, 2).await
}

pub(crate) async fn harness_with_responder_and_pages(
    responder: impl Fn(&ChatRequest) -> Result<String, String> + Send + Sync + 'static,
    pages: u32,
) -> TestHarness {
    let guard = env_lock();
    set_test_env();

    let settings = Settings::load().expect("settings");
    let mock = MockChat::with_responder(responder);
    let calls = mock.call_counter();
    let gateway = Arc::new(LlmGateway::from_settings(&settings, Arc::new(mock)));

    let store = Arc::new(MemoryStore::new());
    let state = EngineState::new(
        settings,
        store.clone(),
        Arc::new(MemoryQueue::new()),
        Arc::new(MemoryStorage::new()),
        gateway,
        Arc::new(StubRasterizer { pages }),
    );

    let engine = Engine::new(state);
    engine.create_exam(sample_exam("exam-1")).await.expect("exam");

    TestHarness { engine, store, calls, _guard: guard }
}

pub(crate) const PAGE_1_TEXT: &str =
    "Q1. Polymorphism means many forms. A Dog overriding speak() is an example.";
pub(crate) const PAGE_2_TEXT: &str =
    "Q2. A hash table maps keys to buckets using a hash function. Collisions are handled by \
     chaining.";

pub(crate) fn ocr_page_json(text: &str, confidence: f64) -> String {
    serde_json::json!({
        "extractedText": text,
        "confidence": confidence,
        "qualityFlags": []
    })
    .to_string()
}

pub(crate) fn segmentation_json() -> String {
    serde_json::json!({
        "answers": [
            {
                "questionId": "q1",
                "answerText": "Polymorphism means many forms. A Dog overriding speak() is an example."
            },
            {
                "questionId": "q2",
                "answerText": "A hash table maps keys to buckets using a hash function. Collisions are handled by chaining."
            }
        ],
        "unmappedText": "",
        "segmentationConfidence": 0.93,
        "notes": null
    })
    .to_string()
}

/// Plays the whole S1 graph: page OCR (keyed off the page-marker bytes in
/// the vision request), segmentation, then the five-agent pipeline per
/// question.
pub(crate) fn full_flow_responder(request: &ChatRequest) -> Result<String, String> {
    if let Some(image) = &request.image {
        let marker = String::from_utf8_lossy(&image.bytes);
        let text = if marker.contains("page-1") { PAGE_1_TEXT } else { PAGE_2_TEXT };
        return Ok(ocr_page_json(text, 0.9));
    }
    if request.user_prompt.contains("Segment the transcript") {
        return Ok(segmentation_json());
    }
    happy_pipeline_responder(request)
}

// ── Canned agent responses for the evaluation pipeline ───────────

/// Responder that plays a clean five-agent run for [`sample_exam`] and the
/// answers in [`sample_script`]. Scores: q1 = 5+3, q2 = 4+4; no adjustments.
pub(crate) fn happy_pipeline_responder(request: &ChatRequest) -> Result<String, String> {
    let prompt = &request.user_prompt;

    if prompt.contains("Parse and ground each criterion") {
        let (c1, c2, m1, m2) = if prompt.contains("q1c1") {
            ("q1c1", "q1c2", 6.0, 4.0)
        } else {
            ("q2c1", "q2c2", 5.0, 5.0)
        };
        return Ok(grounding_json(c1, c2, m1, m2, false));
    }

    if prompt.contains("Score the answer against THIS criterion only") {
        for (id, max, awarded, quote) in [
            ("q1c1", 6.0, 5.0, "Polymorphism means many forms."),
            ("q1c2", 4.0, 3.0, "A Dog overriding speak() is an example."),
            ("q2c1", 5.0, 4.0, "maps keys to buckets using a hash function"),
            ("q2c2", 5.0, 4.0, "Collisions are handled by chaining."),
        ] {
            if prompt.contains(&format!("\"criterionId\": \"{id}\"")) {
                return Ok(score_json(id, awarded, max, quote, 0.92));
            }
        }
        return Err("no scripted score for criterion".into());
    }

    if prompt.contains("Perform your consistency audit") {
        let (finals, total) = if prompt.contains("q1c1") {
            (vec![("q1c1", 5.0), ("q1c2", 3.0)], 8.0)
        } else {
            (vec![("q2c1", 4.0), ("q2c2", 4.0)], 8.0)
        };
        return Ok(audit_json("CONSISTENT", &[], &finals, total));
    }

    if prompt.contains("Generate pedagogically sound feedback") {
        return Ok(feedback_json(if prompt.contains("q1c") { "q1c2" } else { "q2c2" }));
    }

    if prompt.contains("Produce the complete audit trail") {
        return Ok(explainability_json(0.95));
    }

    Err(format!("unrecognised prompt: {}", prompt.chars().take(80).collect::<String>()))
}

pub(crate) fn grounding_json(
    c1: &str,
    c2: &str,
    max1: f64,
    max2: f64,
    ambiguous: bool,
) -> String {
    serde_json::json!({
        "totalMarks": max1 + max2,
        "criteria": [
            {
                "criterionId": c1,
                "description": "first criterion",
                "maxMarks": max1,
                "requiredEvidencePoints": ["states the core definition"],
                "isAmbiguous": ambiguous,
                "ambiguityNote": if ambiguous { Some("vague wording") } else { None }
            },
            {
                "criterionId": c2,
                "description": "second criterion",
                "maxMarks": max2,
                "requiredEvidencePoints": ["gives a worked example"],
                "isAmbiguous": false,
                "ambiguityNote": null
            }
        ],
        "groundingConfidence": 0.9
    })
    .to_string()
}

pub(crate) fn score_json(id: &str, awarded: f64, max: f64, quote: &str, confidence: f64) -> String {
    serde_json::json!({
        "criterionId": id,
        "marksAwarded": awarded,
        "maxMarks": max,
        "justificationQuote": quote,
        "justificationReason": "evidence matches the criterion",
        "confidenceScore": confidence
    })
    .to_string()
}

pub(crate) fn audit_json(
    assessment: &str,
    adjustments: &[(&str, f64, f64)],
    finals: &[(&str, f64)],
    total: f64,
) -> String {
    serde_json::json!({
        "overallAssessment": assessment,
        "adjustments": adjustments.iter().map(|(id, from, to)| serde_json::json!({
            "criterionId": id,
            "originalScore": from,
            "recommendedScore": to,
            "reason": "justification stronger than the awarded score"
        })).collect::<Vec<_>>(),
        "finalScores": finals.iter().map(|(id, score)| serde_json::json!({
            "criterionId": id,
            "finalScore": score
        })).collect::<Vec<_>>(),
        "totalScore": total,
        "auditNotes": "reviewed all criteria"
    })
    .to_string()
}

pub(crate) fn feedback_json(improvement_criterion: &str) -> String {
    serde_json::json!({
        "summary": "A solid answer with room for more depth.",
        "strengths": ["Correctly stated the core definition"],
        "improvements": [{
            "criterionId": improvement_criterion,
            "gap": "The example lacks detail",
            "suggestion": "Work through one concrete example end to end"
        }],
        "studyRecommendations": ["Review method dispatch"],
        "encouragementNote": "Your grasp of the fundamentals is clear."
    })
    .to_string()
}

pub(crate) fn explainability_json(agreement: f64) -> String {
    serde_json::json!({
        "chainOfReasoning": "The rubric was unambiguous. Each criterion was scored on quoted \
                             evidence. The audit confirmed the scores. The total is the sum of \
                             the audited finals.",
        "uncertaintyAreas": [],
        "reviewRecommendation": "AUTO_APPROVED",
        "reviewReason": "all agents agreed",
        "agentAgreementScore": agreement
    })
    .to_string()
}
