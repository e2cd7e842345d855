use serde_json::json;

use crate::agents::runtime::Agent;
use crate::domain::evaluation::GroundedRubric;
use crate::domain::models::ExamQuestion;

const SYSTEM_PROMPT: &str = r#"# ROLE
You are RubricAnalyst-1, a senior academic rubric specialist inside an automated
assessment pipeline. You analyze a scoring rubric BEFORE any student answer is
evaluated, turning examiner-authored rubric text into a precise specification
that downstream scoring agents follow.

# STRICT RULES
1. Parse ONLY what the rubric explicitly states. Do not infer or add criteria.
2. For each criterion, decompose the description into discrete, verifiable
   evidence points a student must demonstrate to earn marks. Aim for 2-5 per
   criterion.
3. The sum of all criteria maxMarks must equal totalMarks. If the input
   mismatches, the per-criterion marks are authoritative.
4. A criterion is ambiguous when it uses vague language ("appropriate",
   "good understanding"), overlaps another criterion, or gives a wide mark
   range with no intermediate guidance. Set isAmbiguous true and explain in
   ambiguityNote.
5. You must NOT consider any student answer. This is pure rubric analysis.
6. groundingConfidence: 0.9-1.0 all criteria clear; 0.7-0.89 minor ambiguity;
   0.5-0.69 significant ambiguity; below 0.5 the rubric is too vague for
   automated scoring.
7. Output ONLY valid JSON. No markdown, no commentary.

# OUTPUT SCHEMA (strict)
{
  "totalMarks": <float>,
  "criteria": [
    {
      "criterionId": "<exact criterionId from input>",
      "description": "<the full criterion description>",
      "maxMarks": <float>,
      "requiredEvidencePoints": ["<specific evidence point>", "..."],
      "isAmbiguous": <boolean>,
      "ambiguityNote": "<what is unclear, or null>"
    }
  ],
  "groundingConfidence": <float 0.0-1.0>
}"#;

const SCHEMA_SILHOUETTE: &str = r#"{"totalMarks": <float>, "criteria": [{"criterionId": "<string>", "description": "<string>", "maxMarks": <float>, "requiredEvidencePoints": ["<string>"], "isAmbiguous": <bool>, "ambiguityNote": "<string|null>"}], "groundingConfidence": <float>}"#;

/// The only agent that sees the raw rubric; everything downstream receives
/// the grounded form it produces.
pub(crate) struct RubricGroundingAgent<'a> {
    pub question: &'a ExamQuestion,
}

impl Agent for RubricGroundingAgent<'_> {
    type Output = GroundedRubric;

    const NAME: &'static str = "rubric_grounding";

    fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    fn user_prompt(&self) -> String {
        let criteria: Vec<_> = self
            .question
            .rubric
            .iter()
            .map(|criterion| {
                json!({
                    "criterionId": criterion.criterion_id,
                    "description": criterion.description,
                    "maxMarks": criterion.max_marks,
                })
            })
            .collect();
        let criteria_block = serde_json::to_string_pretty(&criteria).unwrap_or_default();

        format!(
            "## Exam Question\nUse the question to understand each criterion's context, \
             but do NOT evaluate any answer.\n{}\n\n\
             ## Rubric Criteria (max marks {})\nParse and ground each criterion below.\n\
             ```json\n{}\n```\n\n\
             Analyze the rubric and return your grounded JSON output now.",
            self.question.question_text, self.question.max_marks, criteria_block
        )
    }

    fn schema_silhouette(&self) -> &'static str {
        SCHEMA_SILHOUETTE
    }

    fn validate(&self, output: &GroundedRubric) -> Result<(), String> {
        if output.criteria.len() != self.question.rubric.len() {
            return Err(format!(
                "expected {} criteria, got {}",
                self.question.rubric.len(),
                output.criteria.len()
            ));
        }
        for criterion in &self.question.rubric {
            let grounded = output
                .criteria
                .iter()
                .find(|g| g.criterion_id == criterion.criterion_id)
                .ok_or_else(|| format!("criterion {} missing from output", criterion.criterion_id))?;
            if (grounded.max_marks - criterion.max_marks).abs() > 1e-6 {
                return Err(format!(
                    "criterion {} maxMarks {} does not echo input {}",
                    criterion.criterion_id, grounded.max_marks, criterion.max_marks
                ));
            }
        }
        if !(0.0..=1.0).contains(&output.grounding_confidence) {
            return Err(format!(
                "groundingConfidence {} outside [0, 1]",
                output.grounding_confidence
            ));
        }
        Ok(())
    }
}
