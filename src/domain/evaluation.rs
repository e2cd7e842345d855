use serde::{Deserialize, Serialize};

use crate::domain::types::{ConsistencyAssessment, ReviewRecommendation};

/// Maximum length of a justification quote as stored for display.
pub(crate) const QUOTE_DISPLAY_LIMIT: usize = 250;

// ── Rubric grounding ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundedCriterion {
    pub criterion_id: String,
    pub description: String,
    pub max_marks: f64,
    pub required_evidence_points: Vec<String>,
    #[serde(default)]
    pub is_ambiguous: bool,
    #[serde(default)]
    pub ambiguity_note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundedRubric {
    pub total_marks: f64,
    pub criteria: Vec<GroundedCriterion>,
    pub grounding_confidence: f64,
}

impl GroundedRubric {
    pub fn has_ambiguous_criteria(&self) -> bool {
        self.criteria.iter().any(|c| c.is_ambiguous)
    }
}

// ── Scoring ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriterionScore {
    pub criterion_id: String,
    pub marks_awarded: f64,
    pub max_marks: f64,
    pub justification_quote: String,
    pub justification_reason: String,
    pub confidence_score: f64,
}

impl CriterionScore {
    /// Truncate the quote to its display budget, at a char boundary.
    pub(crate) fn truncate_quote(&mut self) {
        if self.justification_quote.chars().count() > QUOTE_DISPLAY_LIMIT {
            self.justification_quote =
                self.justification_quote.chars().take(QUOTE_DISPLAY_LIMIT).collect();
        }
    }
}

// ── Consistency audit ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreAdjustment {
    pub criterion_id: String,
    pub original_score: f64,
    pub recommended_score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalCriterionScore {
    pub criterion_id: String,
    pub final_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyAudit {
    pub overall_assessment: ConsistencyAssessment,
    #[serde(default)]
    pub adjustments: Vec<ScoreAdjustment>,
    pub final_scores: Vec<FinalCriterionScore>,
    pub total_score: f64,
    #[serde(default)]
    pub audit_notes: String,
}

impl ConsistencyAudit {
    /// The model routinely miscomputes sums; the final scores are canonical
    /// and the total is always rewritten from them.
    pub fn reconcile_total(&mut self) {
        let computed: f64 = self.final_scores.iter().map(|fs| fs.final_score).sum();
        self.total_score = (computed * 10_000.0).round() / 10_000.0;
    }

    pub fn final_score_for(&self, criterion_id: &str) -> Option<f64> {
        self.final_scores
            .iter()
            .find(|fs| fs.criterion_id == criterion_id)
            .map(|fs| fs.final_score)
    }
}

// ── Feedback ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementItem {
    pub criterion_id: String,
    pub gap: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentFeedback {
    pub summary: String,
    pub strengths: Vec<String>,
    pub improvements: Vec<ImprovementItem>,
    pub study_recommendations: Vec<String>,
    pub encouragement_note: String,
}

// ── Explainability ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainabilityResult {
    pub chain_of_reasoning: String,
    pub uncertainty_areas: Vec<String>,
    pub review_recommendation: ReviewRecommendation,
    pub review_reason: String,
    pub agent_agreement_score: f64,
}

// ── Validation helpers ───────────────────────────────────────────

/// Whether `value` lands on the configured mark step, within float tolerance.
pub fn is_on_granularity(value: f64, granularity: f64) -> bool {
    if granularity <= 0.0 {
        return true;
    }
    let steps = value / granularity;
    (steps - steps.round()).abs() < 1e-6
}

/// Collapse all whitespace runs to single spaces for quote comparison.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether `quote` appears verbatim in `answer`, modulo whitespace.
pub fn quote_is_grounded(quote: &str, answer: &str) -> bool {
    let quote = normalize_whitespace(quote);
    if quote.is_empty() {
        return true;
    }
    normalize_whitespace(answer).contains(&quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_accepts_quarter_steps() {
        assert!(is_on_granularity(0.0, 0.25));
        assert!(is_on_granularity(1.75, 0.25));
        assert!(is_on_granularity(6.5, 0.25));
        assert!(!is_on_granularity(1.1, 0.25));
        assert!(!is_on_granularity(0.33, 0.25));
    }

    #[test]
    fn granularity_respects_per_exam_step() {
        assert!(is_on_granularity(1.5, 0.5));
        assert!(!is_on_granularity(1.75, 0.5));
    }

    #[test]
    fn quote_grounding_tolerates_whitespace() {
        let answer = "Polymorphism lets  objects\ntake many forms.";
        assert!(quote_is_grounded("objects take many forms", answer));
        assert!(quote_is_grounded("", answer));
        assert!(!quote_is_grounded("objects never change", answer));
    }

    #[test]
    fn audit_total_is_recomputed_from_final_scores() {
        let mut audit = ConsistencyAudit {
            overall_assessment: ConsistencyAssessment::MinorIssues,
            adjustments: vec![],
            final_scores: vec![
                FinalCriterionScore { criterion_id: "c1".into(), final_score: 4.25 },
                FinalCriterionScore { criterion_id: "c2".into(), final_score: 3.0 },
            ],
            total_score: 99.0,
            audit_notes: String::new(),
        };
        audit.reconcile_total();
        assert_eq!(audit.total_score, 7.25);
    }

    #[test]
    fn quote_truncation_respects_display_limit() {
        let mut score = CriterionScore {
            criterion_id: "c1".into(),
            marks_awarded: 1.0,
            max_marks: 2.0,
            justification_quote: "x".repeat(400),
            justification_reason: "reason".into(),
            confidence_score: 0.9,
        };
        score.truncate_quote();
        assert_eq!(score.justification_quote.chars().count(), QUOTE_DISPLAY_LIMIT);
    }
}
