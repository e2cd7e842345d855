use crate::agents::runtime::Agent;
use crate::domain::evaluation::{
    ConsistencyAudit, CriterionScore, ExplainabilityResult, GroundedRubric, StudentFeedback,
};
use crate::domain::types::{ConsistencyAssessment, ReviewRecommendation};

const SYSTEM_PROMPT: &str = r#"# ROLE
You are Auditor-1, the transparency and compliance officer of an automated
academic assessment pipeline. You produce the audit trail that reviewers and
appeal committees use to verify a scoring decision. Your output must let a
reviewer who has never seen the answer judge whether the score is fair.

# WHAT YOU PRODUCE
1. chainOfReasoning: a structured narrative (3-6 paragraphs) covering how the
   rubric was interpreted, how each criterion was scored and on what evidence,
   what the consistency audit adjusted and why, and how the final total was
   computed. Every criterion must be mentioned.
2. uncertaintyAreas: specific places the automated assessment may be
   unreliable — low confidence scores, ambiguous criteria, OCR damage,
   adjustments that were made.
3. reviewRecommendation and reviewReason: whether a human should check this
   evaluation and the specific trigger. The pipeline recomputes the
   recommendation deterministically; state the trigger you see.
4. agentAgreementScore: how well the pipeline agents agreed, 1.0 meaning no
   adjustments and high confidence throughout.

# STRICT RULES
1. Be objective: report what the agents decided, not your opinion.
2. Reference actual scores, confidence values, and adjustment reasons.
3. Output ONLY valid JSON. No markdown, no commentary.

# OUTPUT SCHEMA (strict)
{
  "chainOfReasoning": "<multi-paragraph narrative>",
  "uncertaintyAreas": ["<specific uncertainty>"],
  "reviewRecommendation": "AUTO_APPROVED" | "NEEDS_REVIEW" | "MUST_REVIEW",
  "reviewReason": "<specific trigger>",
  "agentAgreementScore": <float 0.0-1.0>
}"#;

const SCHEMA_SILHOUETTE: &str = r#"{"chainOfReasoning": "<string>", "uncertaintyAreas": ["<string>"], "reviewRecommendation": "AUTO_APPROVED|NEEDS_REVIEW|MUST_REVIEW", "reviewReason": "<string>", "agentAgreementScore": <float>}"#;

/// Synthesizes the audit trail from every preceding agent output.
pub(crate) struct ExplainabilityAgent<'a> {
    pub question_text: &'a str,
    pub answer_text: &'a str,
    pub rubric: &'a GroundedRubric,
    pub initial_scores: &'a [CriterionScore],
    pub audit: &'a ConsistencyAudit,
    pub feedback: &'a StudentFeedback,
    pub total_score: f64,
    pub max_score: f64,
}

impl Agent for ExplainabilityAgent<'_> {
    type Output = ExplainabilityResult;

    const NAME: &'static str = "explainability";

    fn system_prompt(&self) -> &'static str {
        SYSTEM_PROMPT
    }

    fn user_prompt(&self) -> String {
        let pct = crate::domain::models::percentage_of(self.total_score, self.max_score);
        format!(
            "## Question\n{}\n\n\
             ## Student's Answer\n```\n{}\n```\n\n\
             ## Grounded Rubric\n```json\n{}\n```\n\n\
             ## Criterion Scores (initial)\n```json\n{}\n```\n\n\
             ## Consistency Audit\n```json\n{}\n```\n\n\
             ## Feedback\n```json\n{}\n```\n\n\
             ## Final Score: {}/{} ({}%)\n\n\
             Produce the complete audit trail and return your JSON output now.",
            self.question_text,
            self.answer_text,
            serde_json::to_string_pretty(self.rubric).unwrap_or_default(),
            serde_json::to_string_pretty(self.initial_scores).unwrap_or_default(),
            serde_json::to_string_pretty(self.audit).unwrap_or_default(),
            serde_json::to_string_pretty(self.feedback).unwrap_or_default(),
            self.total_score,
            self.max_score,
            pct
        )
    }

    fn schema_silhouette(&self) -> &'static str {
        SCHEMA_SILHOUETTE
    }

    fn validate(&self, output: &ExplainabilityResult) -> Result<(), String> {
        if !(0.0..=1.0).contains(&output.agent_agreement_score) {
            return Err(format!(
                "agentAgreementScore {} outside [0, 1]",
                output.agent_agreement_score
            ));
        }
        Ok(())
    }
}

/// Agreement between the scoring agents and the audit: 1 minus the mean
/// absolute deviation between initial and final scores relative to each
/// criterion's maximum, clamped to [0, 1].
pub(crate) fn agreement_score(initial: &[CriterionScore], audit: &ConsistencyAudit) -> f64 {
    let mut deviations = Vec::with_capacity(initial.len());
    for score in initial {
        if score.max_marks <= 0.0 {
            continue;
        }
        let Some(final_score) = audit.final_score_for(&score.criterion_id) else {
            continue;
        };
        deviations.push((final_score - score.marks_awarded).abs() / score.max_marks);
    }
    if deviations.is_empty() {
        return 1.0;
    }
    let mean = deviations.iter().sum::<f64>() / deviations.len() as f64;
    (1.0 - mean).clamp(0.0, 1.0)
}

/// Deterministic review-recommendation decision table; first match wins.
pub(crate) fn decide_review(
    assessment: ConsistencyAssessment,
    any_ambiguous_criterion: bool,
    min_criterion_confidence: f64,
    agreement: f64,
) -> ReviewRecommendation {
    if assessment == ConsistencyAssessment::SignificantIssues
        || any_ambiguous_criterion
        || agreement < 0.6
    {
        return ReviewRecommendation::MustReview;
    }
    if assessment == ConsistencyAssessment::MinorIssues
        || min_criterion_confidence < 0.7
        || agreement < 0.85
    {
        return ReviewRecommendation::NeedsReview;
    }
    ReviewRecommendation::AutoApproved
}

pub(crate) fn review_trigger_reason(
    assessment: ConsistencyAssessment,
    any_ambiguous_criterion: bool,
    min_criterion_confidence: f64,
    agreement: f64,
    decision: ReviewRecommendation,
) -> String {
    match decision {
        ReviewRecommendation::MustReview => {
            if assessment == ConsistencyAssessment::SignificantIssues {
                "consistency audit reported significant issues".into()
            } else if any_ambiguous_criterion {
                "at least one rubric criterion was flagged ambiguous".into()
            } else {
                format!("agent agreement {agreement:.2} below 0.60")
            }
        }
        ReviewRecommendation::NeedsReview => {
            if assessment == ConsistencyAssessment::MinorIssues {
                "consistency audit reported minor issues".into()
            } else if min_criterion_confidence < 0.7 {
                format!("lowest criterion confidence {min_criterion_confidence:.2} below 0.70")
            } else {
                format!("agent agreement {agreement:.2} below 0.85")
            }
        }
        ReviewRecommendation::AutoApproved => {
            "all agents consistent and confident; no review trigger fired".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::evaluation::FinalCriterionScore;

    fn initial(scores: &[(&str, f64, f64)]) -> Vec<CriterionScore> {
        scores
            .iter()
            .map(|(id, awarded, max)| CriterionScore {
                criterion_id: id.to_string(),
                marks_awarded: *awarded,
                max_marks: *max,
                justification_quote: String::new(),
                justification_reason: String::new(),
                confidence_score: 0.9,
            })
            .collect()
    }

    fn audit_with(finals: &[(&str, f64)]) -> ConsistencyAudit {
        ConsistencyAudit {
            overall_assessment: ConsistencyAssessment::Consistent,
            adjustments: vec![],
            final_scores: finals
                .iter()
                .map(|(id, score)| FinalCriterionScore {
                    criterion_id: id.to_string(),
                    final_score: *score,
                })
                .collect(),
            total_score: finals.iter().map(|(_, s)| s).sum(),
            audit_notes: String::new(),
        }
    }

    #[test]
    fn agreement_is_one_when_audit_changes_nothing() {
        let initial = initial(&[("c1", 4.0, 6.0), ("c2", 3.0, 4.0)]);
        let audit = audit_with(&[("c1", 4.0), ("c2", 3.0)]);
        assert_eq!(agreement_score(&initial, &audit), 1.0);
    }

    #[test]
    fn agreement_drops_with_adjustments() {
        let initial = initial(&[("c1", 4.0, 4.0), ("c2", 2.0, 4.0)]);
        let audit = audit_with(&[("c1", 4.0), ("c2", 4.0)]);
        // c2 moved by 2 of 4: mean deviation (0 + 0.5) / 2 = 0.25.
        assert!((agreement_score(&initial, &audit) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn agreement_with_no_scorable_criteria_defaults_to_one() {
        let audit = audit_with(&[]);
        assert_eq!(agreement_score(&[], &audit), 1.0);
    }

    // The decision table of the review recommendation, row by row.
    #[test]
    fn significant_issues_force_must_review() {
        assert_eq!(
            decide_review(ConsistencyAssessment::SignificantIssues, false, 0.95, 0.99),
            ReviewRecommendation::MustReview
        );
    }

    #[test]
    fn ambiguous_criteria_force_must_review() {
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, true, 0.95, 0.99),
            ReviewRecommendation::MustReview
        );
    }

    #[test]
    fn low_agreement_forces_must_review() {
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, false, 0.95, 0.59),
            ReviewRecommendation::MustReview
        );
    }

    #[test]
    fn minor_issues_need_review() {
        assert_eq!(
            decide_review(ConsistencyAssessment::MinorIssues, false, 0.95, 0.99),
            ReviewRecommendation::NeedsReview
        );
    }

    #[test]
    fn low_confidence_needs_review() {
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, false, 0.65, 0.99),
            ReviewRecommendation::NeedsReview
        );
    }

    #[test]
    fn middling_agreement_needs_review() {
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, false, 0.95, 0.80),
            ReviewRecommendation::NeedsReview
        );
    }

    #[test]
    fn clean_run_is_auto_approved() {
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, false, 0.9, 0.95),
            ReviewRecommendation::AutoApproved
        );
    }

    #[test]
    fn first_matching_row_wins() {
        // Significant issues dominate even with minor-issue triggers present.
        assert_eq!(
            decide_review(ConsistencyAssessment::SignificantIssues, false, 0.5, 0.7),
            ReviewRecommendation::MustReview
        );
    }

    #[test]
    fn boundary_values_fall_through() {
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, false, 0.7, 0.85),
            ReviewRecommendation::AutoApproved
        );
        assert_eq!(
            decide_review(ConsistencyAssessment::Consistent, false, 0.7, 0.6),
            ReviewRecommendation::NeedsReview
        );
    }
}
