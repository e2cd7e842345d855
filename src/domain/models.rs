use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::evaluation::{
    ConsistencyAudit, CriterionScore, ExplainabilityResult, GroundedRubric, StudentFeedback,
};
use crate::domain::types::{
    EvaluationStatus, QualityFlag, ReviewRecommendation, ScriptStatus, StudentMeta, TokenUsage,
    UploadStatus,
};

/// The ingest record for one uploaded answer script, tracked from raw bytes
/// through OCR, segmentation, and evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedScript {
    pub id: String,
    pub exam_id: String,
    pub student_meta: StudentMeta,
    pub file_key: String,
    pub original_filename: String,
    pub mime_type: String,
    pub file_size_bytes: u64,
    pub file_hash: String,
    pub page_count: Option<u32>,
    pub upload_status: UploadStatus,
    pub failure_reason: Option<String>,
    /// Set once segmentation has produced the logical script view.
    pub script_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Per-page OCR output. Exactly one terminal record exists per
/// (upload id, page number).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrPageResult {
    pub upload_id: String,
    /// 1-based.
    pub page_number: u32,
    pub extracted_text: String,
    pub confidence: f64,
    pub quality_flags: Vec<QualityFlag>,
    pub provider: String,
    pub processing_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptAnswer {
    pub question_id: String,
    pub text: String,
    /// True when the segmenter could not locate any answer text.
    pub is_flagged: bool,
}

/// The post-segmentation logical view of an uploaded script: an ordered list
/// of (question id, answer text) entries plus OCR aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    pub upload_id: String,
    pub exam_id: String,
    pub student_meta: StudentMeta,
    pub answers: Vec<ScriptAnswer>,
    pub ocr_confidence_average: f64,
    pub ocr_quality_flags: Vec<QualityFlag>,
    pub segmentation_confidence: f64,
    /// The run id of the evaluation currently in flight (or last completed).
    /// Results written under any other run id are orphans and are discarded.
    pub current_run_id: String,
    pub status: ScriptStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Script {
    /// Questions that will actually be evaluated: non-flagged entries with
    /// non-blank answer text. Empty answers are short-circuited here rather
    /// than sent to the scoring agents.
    pub fn evaluable_answers(&self) -> impl Iterator<Item = &ScriptAnswer> {
        self.answers.iter().filter(|a| !a.is_flagged && !a.text.trim().is_empty())
    }

    pub fn has_flagged_answers(&self) -> bool {
        self.answers.iter().any(|a| a.is_flagged)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RubricCriterionDef {
    pub criterion_id: String,
    pub description: String,
    pub max_marks: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamQuestion {
    pub question_id: String,
    pub question_text: String,
    pub max_marks: f64,
    pub rubric: Vec<RubricCriterionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exam {
    pub id: String,
    pub title: String,
    pub subject: String,
    pub questions: Vec<ExamQuestion>,
    pub total_marks: f64,
    /// Smallest awardable mark step. 0.25 unless the exam overrides it.
    #[serde(default = "default_marks_granularity")]
    pub marks_granularity: f64,
}

fn default_marks_granularity() -> f64 {
    0.25
}

impl Exam {
    pub fn question(&self, question_id: &str) -> Option<&ExamQuestion> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }

    /// Mark-conservation check: per question the criterion maxima must sum to
    /// the question maximum, and the question maxima must sum to the exam
    /// total.
    pub fn validate_marks(&self) -> Result<(), String> {
        let mut questions_total = 0.0;
        for question in &self.questions {
            let criteria_total: f64 = question.rubric.iter().map(|c| c.max_marks).sum();
            if (criteria_total - question.max_marks).abs() > 1e-6 {
                return Err(format!(
                    "question {}: criteria sum {} != max marks {}",
                    question.question_id, criteria_total, question.max_marks
                ));
            }
            questions_total += question.max_marks;
        }
        if (questions_total - self.total_marks).abs() > 1e-6 {
            return Err(format!(
                "exam {}: question sum {} != total marks {}",
                self.id, questions_total, self.total_marks
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerOverride {
    pub reviewer_id: String,
    pub override_score: f64,
    pub note: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// The assembled per-question evaluation record: all five agent outputs plus
/// scoring aggregates and run accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub id: String,
    pub run_id: String,
    pub script_id: String,
    pub question_id: String,
    pub evaluation_version: String,
    pub grounded_rubric: Option<GroundedRubric>,
    pub criterion_scores: Vec<CriterionScore>,
    pub consistency_audit: Option<ConsistencyAudit>,
    pub feedback: Option<StudentFeedback>,
    pub explainability: Option<ExplainabilityResult>,
    pub total_score: f64,
    pub max_possible_score: f64,
    pub percentage_score: f64,
    pub review_recommendation: Option<ReviewRecommendation>,
    pub reviewer_override: Option<ReviewerOverride>,
    pub status: EvaluationStatus,
    pub failure_reason: Option<String>,
    pub latency_ms: u64,
    pub tokens_used: TokenUsage,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// percentage = round(100 * total / max, 1)
pub fn percentage_of(total: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    (total / max * 1000.0).round() / 10.0
}
