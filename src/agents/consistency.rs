use crate::agents::runtime::Agent;
use crate::domain::evaluation::{ConsistencyAudit, CriterionScore, GroundedRubric};

const SYSTEM_PROMPT: &str = r#"# ROLE
You are ChiefExaminer-1, a senior quality assurance examiner with authority to
override scores assigned by junior examiners. You are the final scoring
checkpoint. Your role is adversarial: actively look for errors, biases, and
inconsistencies across the full set of criterion scores for one answer.

# CONSISTENCY CHECKS
1. Cross-criterion coherence: one criterion's justification contradicting
   another criterion's score.
2. Score-justification alignment: a high score with a weak justification, or a
   low score with strong quoted evidence.
3. Quote verification: justification quotes must come from the student answer,
   not the rubric.
4. Generosity/harshness bias: systematic over- or under-scoring that does not
   match the justification narratives.
5. Double-counting: the same evidence credited to multiple criteria.

# ADJUSTMENT RULES
- Only recommend adjustments with clear justification; document the specific
  reason for every adjustment.
- Never adjust above maxMarks or below 0.
- With no adjustments, return an empty adjustments array.

# OVERALL ASSESSMENT
- CONSISTENT: all scores align, no contradictions.
- MINOR_ISSUES: 1-2 small discrepancies, adjustments at most 10% of total.
- SIGNIFICANT_ISSUES: major contradictions or multiple criteria adjusted.

# STRICT RULES
1. finalScores MUST include ALL criteria, adjusted or not. Unadjusted criteria
   keep their original marksAwarded.
2. totalScore MUST equal the sum of finalScore values.
3. Output ONLY valid JSON. No markdown, no commentary.

# OUTPUT SCHEMA (strict)
{
  "overallAssessment": "CONSISTENT" | "MINOR_ISSUES" | "SIGNIFICANT_ISSUES",
  "adjustments": [
    {"criterionId": "<id>", "originalScore": <float>, "recommendedScore": <float>, "reason": "<evidence-based reason>"}
  ],
  "finalScores": [{"criterionId": "<id>", "finalScore": <float>}],
  "totalScore": <float>,
  "auditNotes": "<summary of findings>"
}"#;

const SCHEMA_SILHOUETTE: &str = r#"{"overallAssessment": "CONSISTENT|MINOR_ISSUES|SIGNIFICANT_ISSUES", "adjustments": [{"criterionId": "<string>", "originalScore": <float>, "recommendedScore": <float>, "reason": "<string>"}], "finalScores": [{"criterionId": "<string>", "finalScore": <float>}], "totalScore": <float>, "auditNotes": "<string>"}"#;

/// Audits the whole score set for one answer. The final scores it emits are
/// canonical; the caller recomputes the total from them.
pub(crate) struct ConsistencyAgent<'a> {
    pub question_text: &'a str,
    pub answer_text: &'a str,
    pub rubric: &'a GroundedRubric,
    pub scores: &'a [CriterionScore],
}

impl Agent for ConsistencyAgent<'_> {
    type Output = ConsistencyAudit;

    const NAME: &'static str = "consistency";

    fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    fn user_prompt(&self) -> String {
        let rubric_block = serde_json::to_string_pretty(self.rubric).unwrap_or_default();
        let scores_block = serde_json::to_string_pretty(self.scores).unwrap_or_default();
        format!(
            "## Question\n{}\n\n\
             ## Student's Answer\n```\n{}\n```\n\n\
             ## Grounded Rubric\n```json\n{}\n```\n\n\
             ## Criterion Scores from Junior Examiner\n\
             Review each score, its justification quote, and reason.\n\
             ```json\n{}\n```\n\n\
             Perform your consistency audit and return your JSON output now.",
            self.question_text, self.answer_text, rubric_block, scores_block
        )
    }

    fn schema_silhouette(&self) -> &'static str {
        SCHEMA_SILHOUETTE
    }

    fn validate(&self, output: &ConsistencyAudit) -> Result<(), String> {
        if output.final_scores.len() != self.rubric.criteria.len() {
            return Err(format!(
                "finalScores must cover all {} criteria, got {}",
                self.rubric.criteria.len(),
                output.final_scores.len()
            ));
        }
        for criterion in &self.rubric.criteria {
            let final_score = output
                .final_score_for(&criterion.criterion_id)
                .ok_or_else(|| format!("criterion {} missing from finalScores", criterion.criterion_id))?;
            if final_score < 0.0 || final_score > criterion.max_marks {
                return Err(format!(
                    "finalScore {} for {} outside [0, {}]",
                    final_score, criterion.criterion_id, criterion.max_marks
                ));
            }
        }
        for adjustment in &output.adjustments {
            if !self.rubric.criteria.iter().any(|c| c.criterion_id == adjustment.criterion_id) {
                return Err(format!(
                    "adjustment references unknown criterion {}",
                    adjustment.criterion_id
                ));
            }
        }
        Ok(())
    }
}
