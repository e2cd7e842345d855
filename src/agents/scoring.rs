use serde_json::json;

use crate::agents::runtime::Agent;
use crate::domain::evaluation::{is_on_granularity, quote_is_grounded, CriterionScore, GroundedCriterion};

const SYSTEM_PROMPT: &str = r#"# ROLE
You are Examiner-1, an impartial and rigorous academic examiner. You evaluate a
student's answer against exactly ONE rubric criterion at a time, inside an
automated assessment pipeline where accuracy and fairness are paramount.

# STRICT RULES
1. One criterion at a time. Ignore aspects of the answer not relevant to THIS
   criterion.
2. Evidence-based scoring only. Every mark must be backed by a specific quote
   from the student's answer. No evidence means 0 for that evidence point;
   partial evidence earns partial credit; full evidence earns full credit.
3. justificationQuote must be a verbatim substring of the student's answer —
   not a paraphrase. Copy it exactly, including spelling errors and OCR
   artifacts. Never quote the rubric.
4. Partial credit is required. Award proportional marks on a 0.25 step.
5. Zero means zero: no relevant content, no sympathy marks.
6. marksAwarded must never exceed maxMarks.
7. OCR tolerance: do not penalize spelling damage that is clearly an OCR
   artifact; DO penalize genuine conceptual errors.
8. confidenceScore: 0.9-1.0 clear evidence or clear absence; 0.7-0.89 some
   interpretation; 0.5-0.69 ambiguous; below 0.5 very uncertain.
9. Do not award marks for attempting the question, or for length.
10. Output ONLY valid JSON. No markdown, no commentary.

# OUTPUT SCHEMA (strict)
{
  "criterionId": "<exact criterionId from input>",
  "marksAwarded": <float, 0 to maxMarks, 0.25 step>,
  "maxMarks": <float, echo the input maxMarks>,
  "justificationQuote": "<verbatim quote from the student's answer>",
  "justificationReason": "<1-3 sentence explanation>",
  "confidenceScore": <float 0.0-1.0>
}"#;

const SCHEMA_SILHOUETTE: &str = r#"{"criterionId": "<string>", "marksAwarded": <float>, "maxMarks": <float>, "justificationQuote": "<string>", "justificationReason": "<string>", "confidenceScore": <float>}"#;

/// Scores one criterion in isolation. Invoked once per criterion; the
/// invocations are independent and run concurrently under the fan-out cap.
pub(crate) struct ScoringAgent<'a> {
    pub question_text: &'a str,
    pub answer_text: &'a str,
    pub criterion: &'a GroundedCriterion,
    pub marks_granularity: f64,
}

impl Agent for ScoringAgent<'_> {
    type Output = CriterionScore;

    const NAME: &'static str = "scoring";

    fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    fn user_prompt(&self) -> String {
        let criterion_block = serde_json::to_string_pretty(&json!({
            "criterionId": self.criterion.criterion_id,
            "description": self.criterion.description,
            "maxMarks": self.criterion.max_marks,
            "requiredEvidencePoints": self.criterion.required_evidence_points,
        }))
        .unwrap_or_default();

        format!(
            "## Question\n{}\n\n\
             ## Student's Answer\n(OCR-extracted text — may contain minor artifacts)\n\
             ```\n{}\n```\n\n\
             ## Rubric Criterion to Evaluate\nScore the answer against THIS criterion only.\n\
             ```json\n{}\n```\n\n\
             Evaluate and return your JSON score now.",
            self.question_text, self.answer_text, criterion_block
        )
    }

    fn schema_silhouette(&self) -> &'static str {
        SCHEMA_SILHOUETTE
    }

    fn validate(&self, output: &CriterionScore) -> Result<(), String> {
        if output.criterion_id != self.criterion.criterion_id {
            return Err(format!(
                "criterionId {} does not echo input {}",
                output.criterion_id, self.criterion.criterion_id
            ));
        }
        if output.marks_awarded < 0.0 || output.marks_awarded > self.criterion.max_marks {
            return Err(format!(
                "marksAwarded {} outside [0, {}]",
                output.marks_awarded, self.criterion.max_marks
            ));
        }
        if !is_on_granularity(output.marks_awarded, self.marks_granularity) {
            return Err(format!(
                "marksAwarded {} is not a multiple of {}",
                output.marks_awarded, self.marks_granularity
            ));
        }
        if !(0.0..=1.0).contains(&output.confidence_score) {
            return Err(format!("confidenceScore {} outside [0, 1]", output.confidence_score));
        }
        if !quote_is_grounded(&output.justification_quote, self.answer_text) {
            return Err("justificationQuote is not a substring of the student's answer".into());
        }
        Ok(())
    }
}
