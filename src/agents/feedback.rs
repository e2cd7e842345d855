use crate::agents::runtime::Agent;
use crate::domain::evaluation::{ConsistencyAudit, GroundedRubric, StudentFeedback};

const SYSTEM_PROMPT: &str = r#"# ROLE
You are Coach-1, an expert academic coach writing formative feedback inside an
automated assessment pipeline. Your feedback is the primary channel between the
system and the student: honest about real gaps, never discouraging.

# PEDAGOGICAL PRINCIPLES
1. Start with strengths, and be specific — not "good job" but what exactly was
   done well, tied to evidence from the answer.
2. Name the exact concept or reasoning step that was missing; vague "needs
   improvement" feedback is useless.
3. Suggestions must be actionable: name the topic, exercise, or technique to
   practice.
4. Match tone to performance: 80%+ congratulatory; 50-79% encouraging; 25-49%
   supportive with a structured study plan; below 25% compassionate, focused on
   foundations.
5. Never condescend.

# STRICT RULES
1. Strengths must correspond to marks actually earned — never fabricate one
   for a criterion that scored 0.
2. Every criterion where marks were lost gets an improvements entry, each with
   the criterionId it addresses.
3. Study recommendations must name concrete topics or exercises.
4. Summary is 2-3 sentences maximum.
5. No PII: address the student as "you", never by name or roll number.
6. Output ONLY valid JSON. No markdown, no commentary.

# OUTPUT SCHEMA (strict)
{
  "summary": "<2-3 sentence overall summary>",
  "strengths": ["<specific, evidence-based strength>"],
  "improvements": [
    {"criterionId": "<id where marks were lost>", "gap": "<what was missing>", "suggestion": "<actionable advice>"}
  ],
  "studyRecommendations": ["<specific topic or resource>"],
  "encouragementNote": "<1 genuine, specific closing sentence>"
}"#;

const SCHEMA_SILHOUETTE: &str = r#"{"summary": "<string>", "strengths": ["<string>"], "improvements": [{"criterionId": "<string>", "gap": "<string>", "suggestion": "<string>"}], "studyRecommendations": ["<string>"], "encouragementNote": "<string>"}"#;

/// Generates student-facing feedback from the audited scores.
pub(crate) struct FeedbackAgent<'a> {
    pub question_text: &'a str,
    pub answer_text: &'a str,
    pub rubric: &'a GroundedRubric,
    pub audit: &'a ConsistencyAudit,
    pub max_score: f64,
}

impl Agent for FeedbackAgent<'_> {
    type Output = StudentFeedback;

    const NAME: &'static str = "feedback";

    fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    fn user_prompt(&self) -> String {
        let scores_block = serde_json::to_string_pretty(&self.audit.final_scores).unwrap_or_default();
        let pct = crate::domain::models::percentage_of(self.audit.total_score, self.max_score);
        format!(
            "## Exam Question\n{}\n\n\
             ## Student's Answer\n```\n{}\n```\n\n\
             ## Scoring Results: {}/{} ({}%)\n```json\n{}\n```\n\n\
             Generate pedagogically sound feedback and return your JSON output now.",
            self.question_text,
            self.answer_text,
            self.audit.total_score,
            self.max_score,
            pct,
            scores_block
        )
    }

    fn schema_silhouette(&self) -> &'static str {
        SCHEMA_SILHOUETTE
    }

    fn validate(&self, output: &StudentFeedback) -> Result<(), String> {
        for improvement in &output.improvements {
            if !self
                .rubric
                .criteria
                .iter()
                .any(|criterion| criterion.criterion_id == improvement.criterion_id)
            {
                return Err(format!(
                    "improvement references unknown criterion {}",
                    improvement.criterion_id
                ));
            }
        }
        Ok(())
    }
}
