use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::agents::{
    agreement_score, decide_review, review_trigger_reason, run_agent, AgentOutcome,
    ConsistencyAgent, ExplainabilityAgent, FeedbackAgent, RubricGroundingAgent, ScoringAgent,
};
use crate::domain::error::EngineError;
use crate::domain::evaluation::{
    ConsistencyAudit, CriterionScore, ExplainabilityResult, GroundedRubric, StudentFeedback,
};
use crate::domain::models::{percentage_of, ExamQuestion};
use crate::domain::types::{ReviewRecommendation, TokenUsage};
use crate::llm::LlmGateway;
use crate::store::StateStore;

/// Everything the five agents produced for one (question, answer) pair.
pub(crate) struct QuestionEvaluation {
    pub grounded_rubric: GroundedRubric,
    pub criterion_scores: Vec<CriterionScore>,
    pub consistency_audit: ConsistencyAudit,
    pub feedback: StudentFeedback,
    pub explainability: ExplainabilityResult,
    pub total_score: f64,
    pub max_possible_score: f64,
    pub percentage_score: f64,
    pub review_recommendation: ReviewRecommendation,
    pub latency_ms: u64,
    pub tokens_used: TokenUsage,
}

/// The five-agent sequence for a single question, with a bounded parallel
/// fan-out at the scoring step. Agents run strictly in order; scoring for
/// every criterion completes before the consistency call.
pub(crate) struct EvaluationPipeline {
    gateway: Arc<LlmGateway>,
    store: Arc<dyn StateStore>,
    scoring_concurrency: usize,
    token_budget: u64,
}

impl EvaluationPipeline {
    pub(crate) fn new(
        gateway: Arc<LlmGateway>,
        store: Arc<dyn StateStore>,
        scoring_concurrency: usize,
        token_budget: u64,
    ) -> Self {
        Self { gateway, store, scoring_concurrency: scoring_concurrency.max(1), token_budget }
    }

    pub(crate) async fn run(
        &self,
        script_id: &str,
        run_id: &str,
        question: &ExamQuestion,
        answer_text: &str,
        marks_granularity: f64,
    ) -> Result<QuestionEvaluation, EngineError> {
        let timer = Instant::now();
        let mut tokens = TokenUsage::default();

        // ── Agent 1: rubric grounding ────────────────────────────
        let grounding =
            run_agent(&*self.gateway, &RubricGroundingAgent { question }).await?;
        self.charge(&mut tokens, &grounding)?;
        let grounded_rubric = grounding.output;

        self.ensure_run_current(script_id, run_id).await?;

        // ── Agent 2: scoring, once per criterion ─────────────────
        let mut criterion_scores = self
            .score_criteria(question, answer_text, &grounded_rubric, marks_granularity)
            .await?;
        for outcome_tokens in criterion_scores.iter().map(|(_, t)| *t) {
            self.charge_raw(&mut tokens, outcome_tokens)?;
        }
        let mut criterion_scores: Vec<CriterionScore> =
            criterion_scores.drain(..).map(|(score, _)| score).collect();

        self.ensure_run_current(script_id, run_id).await?;

        // ── Agent 3: consistency audit ───────────────────────────
        let audit_outcome = run_agent(&*self.gateway, &ConsistencyAgent {
            question_text: &question.question_text,
            answer_text,
            rubric: &grounded_rubric,
            scores: &criterion_scores,
        })
        .await?;
        self.charge(&mut tokens, &audit_outcome)?;

        let mut consistency_audit = audit_outcome.output;
        consistency_audit.reconcile_total();

        // The audit's final scores are canonical; fold them back into the
        // criterion breakdown. The pre-audit values survive in the
        // adjustments list and in the agreement computation below.
        let initial_scores = criterion_scores.clone();
        for score in &mut criterion_scores {
            if let Some(final_score) = consistency_audit.final_score_for(&score.criterion_id) {
                score.marks_awarded = final_score;
            }
        }

        let total_score = consistency_audit.total_score;
        let max_possible_score = question.max_marks;

        self.ensure_run_current(script_id, run_id).await?;

        // ── Agent 4: feedback ────────────────────────────────────
        let feedback_outcome = run_agent(&*self.gateway, &FeedbackAgent {
            question_text: &question.question_text,
            answer_text,
            rubric: &grounded_rubric,
            audit: &consistency_audit,
            max_score: max_possible_score,
        })
        .await?;
        self.charge(&mut tokens, &feedback_outcome)?;
        let feedback = feedback_outcome.output;

        self.ensure_run_current(script_id, run_id).await?;

        // ── Agent 5: explainability ──────────────────────────────
        let explain_outcome = run_agent(&*self.gateway, &ExplainabilityAgent {
            question_text: &question.question_text,
            answer_text,
            rubric: &grounded_rubric,
            initial_scores: &initial_scores,
            audit: &consistency_audit,
            feedback: &feedback,
            total_score,
            max_score: max_possible_score,
        })
        .await?;
        self.charge(&mut tokens, &explain_outcome)?;
        let mut explainability = explain_outcome.output;

        // The narrative comes from the model; the recommendation and
        // agreement score are recomputed so the decision table holds exactly.
        let agreement = agreement_score(&initial_scores, &consistency_audit);
        let min_confidence = criterion_scores
            .iter()
            .map(|score| score.confidence_score)
            .fold(1.0_f64, f64::min);
        let any_ambiguous = grounded_rubric.has_ambiguous_criteria();
        let decision = decide_review(
            consistency_audit.overall_assessment,
            any_ambiguous,
            min_confidence,
            agreement,
        );
        if decision != explainability.review_recommendation {
            explainability.review_reason = review_trigger_reason(
                consistency_audit.overall_assessment,
                any_ambiguous,
                min_confidence,
                agreement,
                decision,
            );
        }
        explainability.review_recommendation = decision;
        explainability.agent_agreement_score = agreement;

        for score in &mut criterion_scores {
            score.truncate_quote();
        }

        Ok(QuestionEvaluation {
            grounded_rubric,
            criterion_scores,
            consistency_audit,
            feedback,
            review_recommendation: explainability.review_recommendation,
            explainability,
            total_score,
            max_possible_score,
            percentage_score: percentage_of(total_score, max_possible_score),
            latency_ms: timer.elapsed().as_millis() as u64,
            tokens_used: tokens,
        })
    }

    /// Fan out one scoring call per criterion under the concurrency cap,
    /// returning scores in rubric order.
    async fn score_criteria(
        &self,
        question: &ExamQuestion,
        answer_text: &str,
        grounded_rubric: &GroundedRubric,
        marks_granularity: f64,
    ) -> Result<Vec<(CriterionScore, (u64, u64))>, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.scoring_concurrency));
        let mut join_set = JoinSet::new();

        for (index, criterion) in grounded_rubric.criteria.iter().enumerate() {
            let gateway = self.gateway.clone();
            let semaphore = semaphore.clone();
            let criterion = criterion.clone();
            let question_text = question.question_text.clone();
            let answer = answer_text.to_string();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Queue("scoring semaphore closed".into()))?;
                let agent = ScoringAgent {
                    question_text: &question_text,
                    answer_text: &answer,
                    criterion: &criterion,
                    marks_granularity,
                };
                let outcome = run_agent(&*gateway, &agent).await?;
                Ok::<_, EngineError>((
                    index,
                    outcome.output,
                    (outcome.telemetry.prompt_tokens, outcome.telemetry.completion_tokens),
                ))
            });
        }

        let mut slots: Vec<Option<(CriterionScore, (u64, u64))>> =
            (0..grounded_rubric.criteria.len()).map(|_| None).collect();

        while let Some(joined) = join_set.join_next().await {
            let task_result =
                joined.map_err(|err| EngineError::Queue(format!("scoring task failed: {err}")))?;
            match task_result {
                Ok((index, score, usage)) => slots[index] = Some((score, usage)),
                Err(err) => {
                    // First failure aborts the remaining siblings.
                    join_set.abort_all();
                    return Err(err);
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }

    async fn ensure_run_current(&self, script_id: &str, run_id: &str) -> Result<(), EngineError> {
        let script = self
            .store
            .get_script(script_id)
            .await?
            .ok_or_else(|| EngineError::NotFound("script", script_id.to_string()))?;
        if script.current_run_id != run_id {
            return Err(EngineError::RunSuperseded(run_id.to_string()));
        }
        Ok(())
    }

    fn charge<T>(
        &self,
        tokens: &mut TokenUsage,
        outcome: &AgentOutcome<T>,
    ) -> Result<(), EngineError> {
        self.charge_raw(
            tokens,
            (outcome.telemetry.prompt_tokens, outcome.telemetry.completion_tokens),
        )
    }

    fn charge_raw(
        &self,
        tokens: &mut TokenUsage,
        (prompt, completion): (u64, u64),
    ) -> Result<(), EngineError> {
        tokens.add(prompt, completion);
        if self.token_budget > 0 && tokens.total > self.token_budget {
            return Err(EngineError::BudgetExhausted {
                spent: tokens.total,
                budget: self.token_budget,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Settings;
    use crate::domain::types::ConsistencyAssessment;
    use crate::store::MemoryStore;
    use crate::test_support::{self, MockChat};

    struct Fixture {
        pipeline: EvaluationPipeline,
        store: Arc<MemoryStore>,
    }

    async fn fixture(mock: MockChat, token_budget: u64) -> Fixture {
        let _guard = test_support::env_lock();
        test_support::set_test_env();
        let settings = Settings::load().expect("settings");

        let store = Arc::new(MemoryStore::new());
        store
            .insert_script(test_support::sample_script("s1", "u1", "exam-1", "run-1"))
            .await
            .unwrap();

        let gateway = Arc::new(crate::llm::LlmGateway::from_settings(&settings, Arc::new(mock)));
        let pipeline = EvaluationPipeline::new(
            gateway,
            store.clone(),
            settings.evaluation().scoring_concurrency,
            token_budget,
        );
        Fixture { pipeline, store }
    }

    fn q1_answer() -> String {
        test_support::sample_script("s1", "u1", "exam-1", "run-1").answers[0].text.clone()
    }

    #[tokio::test]
    async fn clean_run_produces_auto_approved_result() {
        let mock = MockChat::with_responder(test_support::happy_pipeline_responder);
        let fx = fixture(mock, 0).await;
        let exam = test_support::sample_exam("exam-1");

        let evaluation = fx
            .pipeline
            .run("s1", "run-1", &exam.questions[0], &q1_answer(), 0.25)
            .await
            .unwrap();

        assert_eq!(evaluation.total_score, 8.0);
        assert_eq!(evaluation.max_possible_score, 10.0);
        assert_eq!(evaluation.percentage_score, 80.0);
        assert_eq!(evaluation.review_recommendation, ReviewRecommendation::AutoApproved);
        assert_eq!(evaluation.explainability.agent_agreement_score, 1.0);
        assert_eq!(evaluation.criterion_scores.len(), 2);
        assert!(evaluation.tokens_used.total > 0);
    }

    #[tokio::test]
    async fn audit_adjustment_overrides_scoring_and_flags_review() {
        // Scoring awards q1c1=5, q1c2=1; the audit lifts q1c2 to 3 with
        // MINOR_ISSUES and a deliberately wrong totalScore.
        let mock = MockChat::with_responder(|request| {
            let prompt = &request.user_prompt;
            if prompt.contains("Parse and ground each criterion") {
                return Ok(test_support::grounding_json("q1c1", "q1c2", 6.0, 4.0, false));
            }
            if prompt.contains("Score the answer against THIS criterion only") {
                if prompt.contains("\"criterionId\": \"q1c1\"") {
                    return Ok(test_support::score_json(
                        "q1c1",
                        5.0,
                        6.0,
                        "Polymorphism means many forms.",
                        0.9,
                    ));
                }
                return Ok(test_support::score_json(
                    "q1c2",
                    1.0,
                    4.0,
                    "A Dog overriding speak() is an example.",
                    0.9,
                ));
            }
            if prompt.contains("Perform your consistency audit") {
                return Ok(test_support::audit_json(
                    "MINOR_ISSUES",
                    &[("q1c2", 1.0, 3.0)],
                    &[("q1c1", 5.0), ("q1c2", 3.0)],
                    42.0,
                ));
            }
            if prompt.contains("Generate pedagogically sound feedback") {
                return Ok(test_support::feedback_json("q1c2"));
            }
            if prompt.contains("Produce the complete audit trail") {
                return Ok(test_support::explainability_json(0.99));
            }
            Err("unexpected prompt".into())
        });
        let fx = fixture(mock, 0).await;
        let exam = test_support::sample_exam("exam-1");

        let evaluation = fx
            .pipeline
            .run("s1", "run-1", &exam.questions[0], &q1_answer(), 0.25)
            .await
            .unwrap();

        // Total recomputed from final scores, not trusted from the model.
        assert_eq!(evaluation.total_score, 8.0);
        assert_eq!(
            evaluation.consistency_audit.overall_assessment,
            ConsistencyAssessment::MinorIssues
        );
        // Criterion breakdown folds in the audited final.
        let c2 = evaluation
            .criterion_scores
            .iter()
            .find(|score| score.criterion_id == "q1c2")
            .unwrap();
        assert_eq!(c2.marks_awarded, 3.0);
        // The adjustment moved a score, so agreement drops below 1.
        assert!(evaluation.explainability.agent_agreement_score < 1.0);
        assert_eq!(evaluation.review_recommendation, ReviewRecommendation::NeedsReview);
    }

    #[tokio::test]
    async fn ambiguous_rubric_forces_must_review() {
        let mock = MockChat::with_responder(|request| {
            let prompt = &request.user_prompt;
            if prompt.contains("Parse and ground each criterion") {
                return Ok(test_support::grounding_json("q1c1", "q1c2", 6.0, 4.0, true));
            }
            test_support::happy_pipeline_responder(request)
        });
        let fx = fixture(mock, 0).await;
        let exam = test_support::sample_exam("exam-1");

        let evaluation = fx
            .pipeline
            .run("s1", "run-1", &exam.questions[0], &q1_answer(), 0.25)
            .await
            .unwrap();

        assert_eq!(evaluation.review_recommendation, ReviewRecommendation::MustReview);
        assert!(evaluation.explainability.review_reason.contains("ambiguous"));
    }

    #[tokio::test]
    async fn token_budget_stops_the_pipeline() {
        let mock = MockChat::with_responder(test_support::happy_pipeline_responder);
        // Grounding alone charges 15 tokens; the budget dies at the fan-out.
        let fx = fixture(mock, 20).await;
        let exam = test_support::sample_exam("exam-1");

        let result =
            fx.pipeline.run("s1", "run-1", &exam.questions[0], &q1_answer(), 0.25).await;
        assert!(matches!(result, Err(EngineError::BudgetExhausted { .. })));
    }

    #[tokio::test]
    async fn superseded_run_is_abandoned_between_agents() {
        let mock = MockChat::with_responder(test_support::happy_pipeline_responder);
        let fx = fixture(mock, 0).await;
        let exam = test_support::sample_exam("exam-1");

        // A re-evaluation supersedes run-1 before the pipeline starts.
        fx.store
            .set_script_run("s1", "run-2", crate::domain::types::ScriptStatus::Evaluating)
            .await
            .unwrap();

        let result =
            fx.pipeline.run("s1", "run-1", &exam.questions[0], &q1_answer(), 0.25).await;
        assert!(matches!(result, Err(EngineError::RunSuperseded(_))));
    }

    #[tokio::test]
    async fn persistent_malformed_scoring_fails_the_question() {
        let mock = MockChat::with_responder(|request| {
            let prompt = &request.user_prompt;
            if prompt.contains("Parse and ground each criterion") {
                return Ok(test_support::grounding_json("q1c1", "q1c2", 6.0, 4.0, false));
            }
            if prompt.contains("Score the answer against THIS criterion only") {
                // Quote never grounded in the answer: repair cannot save it.
                return Ok(test_support::score_json(
                    "q1c1",
                    5.0,
                    6.0,
                    "words the student never wrote",
                    0.9,
                ));
            }
            Err("unexpected prompt".into())
        });
        let fx = fixture(mock, 0).await;
        let exam = test_support::sample_exam("exam-1");

        let result =
            fx.pipeline.run("s1", "run-1", &exam.questions[0], &q1_answer(), 0.25).await;
        assert!(matches!(result, Err(EngineError::LlmMalformed(_))));
    }

    #[tokio::test]
    async fn long_quotes_are_truncated_for_display() {
        let long_fragment = "many forms ".repeat(40);
        let answer = format!("Polymorphism means {long_fragment}and that is the point.");
        let answer_for_responder = answer.clone();

        let mock = MockChat::with_responder(move |request| {
            let prompt = &request.user_prompt;
            if prompt.contains("Parse and ground each criterion") {
                return Ok(test_support::grounding_json("q1c1", "q1c2", 6.0, 4.0, false));
            }
            if prompt.contains("Score the answer against THIS criterion only") {
                let id = if prompt.contains("\"criterionId\": \"q1c1\"") { "q1c1" } else { "q1c2" };
                let max = if id == "q1c1" { 6.0 } else { 4.0 };
                return Ok(test_support::score_json(
                    id,
                    1.0,
                    max,
                    answer_for_responder.trim(),
                    0.9,
                ));
            }
            if prompt.contains("Perform your consistency audit") {
                return Ok(test_support::audit_json(
                    "CONSISTENT",
                    &[],
                    &[("q1c1", 1.0), ("q1c2", 1.0)],
                    2.0,
                ));
            }
            if prompt.contains("Generate pedagogically sound feedback") {
                return Ok(test_support::feedback_json("q1c1"));
            }
            if prompt.contains("Produce the complete audit trail") {
                return Ok(test_support::explainability_json(1.0));
            }
            Err("unexpected prompt".into())
        });
        let fx = fixture(mock, 0).await;
        let exam = test_support::sample_exam("exam-1");

        let evaluation =
            fx.pipeline.run("s1", "run-1", &exam.questions[0], &answer, 0.25).await.unwrap();
        for score in &evaluation.criterion_scores {
            assert!(score.justification_quote.chars().count() <= 250);
        }
    }
}
