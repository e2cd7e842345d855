use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::domain::error::EngineError;
use crate::domain::evaluation::quote_is_grounded;
use crate::domain::models::{Exam, OcrPageResult};
use crate::llm::{CompletionOpts, LlmGateway};

const SYSTEM_PROMPT: &str = r#"# ROLE
You are AnswerMapper-1, a document segmentation specialist inside an automated
academic assessment pipeline. You take raw, noisy OCR text from a student's
handwritten answer script and map each portion to its exam question.

# CONTEXT
The OCR text may contain misspellings, merged words, broken lines, page
headers, and other handwriting-recognition artifacts. Students answer out of
order, skip questions, continue answers across pages, and mark answers with
variants like "Q1", "Ans 1", "1)", "1.". Be tolerant of OCR damage in these
markers ("Ql" for "Q1").

# STRICT RULES
1. Verbatim extraction only. Copy the answer text exactly as it appears in the
   OCR transcript — no corrections, no paraphrase, no cleanup.
2. Use ONLY the supplied questionIds.
3. Every questionId must appear exactly once in your output. A question with
   no identifiable answer gets answerText null — never omit it.
4. Text you cannot attribute to any question goes to unmappedText, not into a
   guess.
5. Ignore page markers, roll numbers, and obvious header/footer noise.
6. segmentationConfidence: 0.9-1.0 clear markers; 0.7-0.89 some uncertain
   boundaries; 0.5-0.69 significant ambiguity; below 0.5 unreliable.
7. Output ONLY valid JSON. No markdown, no commentary.

# OUTPUT SCHEMA (strict)
{
  "answers": [
    {"questionId": "<exact questionId>", "answerText": "<verbatim OCR text or null>"}
  ],
  "unmappedText": "<OCR text that maps to no question>",
  "segmentationConfidence": <float 0.0-1.0>,
  "notes": "<boundary ambiguities, noise, missing answers — or null>"
}"#;

const SCHEMA_SILHOUETTE: &str = r#"{"answers": [{"questionId": "<string>", "answerText": "<string|null>"}], "unmappedText": "<string>", "segmentationConfidence": <float>, "notes": "<string|null>"}"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmentedAnswer {
    pub question_id: String,
    pub answer_text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmenterOutput {
    pub answers: Vec<SegmentedAnswer>,
    #[serde(default)]
    pub unmapped_text: String,
    pub segmentation_confidence: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Maps aggregated OCR text onto the declared question set. One repair
/// attempt on contract violation; persistent violation is terminal for the
/// script (`SEGMENTATION_FAILED`).
pub(crate) struct Segmenter {
    gateway: Arc<LlmGateway>,
}

impl Segmenter {
    pub(crate) fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    pub(crate) async fn segment(
        &self,
        exam: &Exam,
        pages: &[OcrPageResult],
    ) -> Result<SegmenterOutput, EngineError> {
        let transcript = page_transcript(pages);
        let questions: Vec<_> = exam
            .questions
            .iter()
            .map(|question| {
                json!({
                    "questionId": question.question_id,
                    "questionText": question.question_text,
                    "maxMarks": question.max_marks,
                })
            })
            .collect();
        let questions_block = serde_json::to_string_pretty(&questions).unwrap_or_default();

        let user_prompt = format!(
            "## Exam Questions\nEach answer in your output must reference one of these \
             questionIds exactly.\n```json\n{questions_block}\n```\n\n\
             ## Raw OCR Transcript\nUnprocessed OCR output, with page markers.\n\
             ```\n{transcript}\n```\n\n\
             Segment the transcript and return your JSON output now."
        );

        let expected_ids: Vec<&str> =
            exam.questions.iter().map(|q| q.question_id.as_str()).collect();
        let validate = |value: &Value| validate_segmentation(value, &expected_ids, &transcript);

        let (value, telemetry) = self
            .gateway
            .complete_structured(
                SYSTEM_PROMPT,
                &user_prompt,
                SCHEMA_SILHOUETTE,
                CompletionOpts { repair_attempts: Some(1), ..Default::default() },
                &validate,
            )
            .await
            .map_err(|err| match err {
                EngineError::LlmMalformed(message) => EngineError::SegmentationFailed(message),
                other => other,
            })?;

        let output: SegmenterOutput = serde_json::from_value(value)
            .map_err(|err| EngineError::SegmentationFailed(err.to_string()))?;

        tracing::info!(
            exam_id = %exam.id,
            confidence = output.segmentation_confidence,
            repairs = telemetry.repair_count,
            "segmentation complete"
        );

        Ok(output)
    }
}

/// Concatenated page texts with markers, sorted by page number upstream.
pub(crate) fn page_transcript(pages: &[OcrPageResult]) -> String {
    pages
        .iter()
        .map(|page| format!("--- Page {} ---\n{}", page.page_number, page.extracted_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn validate_segmentation(
    value: &Value,
    expected_ids: &[&str],
    transcript: &str,
) -> Result<(), String> {
    let output: SegmenterOutput =
        serde_json::from_value(value.clone()).map_err(|err| format!("schema mismatch: {err}"))?;

    if !(0.0..=1.0).contains(&output.segmentation_confidence) {
        return Err(format!(
            "segmentationConfidence {} outside [0, 1]",
            output.segmentation_confidence
        ));
    }

    let expected: HashSet<&str> = expected_ids.iter().copied().collect();
    let mut seen = HashSet::new();
    for answer in &output.answers {
        if !expected.contains(answer.question_id.as_str()) {
            return Err(format!("unknown questionId {}", answer.question_id));
        }
        if !seen.insert(answer.question_id.clone()) {
            return Err(format!("questionId {} appears more than once", answer.question_id));
        }
        if let Some(text) = &answer.answer_text {
            if !text.trim().is_empty() && !quote_is_grounded(text, transcript) {
                return Err(format!(
                    "answer for {} is not verbatim OCR text",
                    answer.question_id
                ));
            }
        }
    }
    for id in expected_ids {
        if !seen.contains(*id) {
            return Err(format!("questionId {id} missing from output"));
        }
    }
    Ok(())
}
