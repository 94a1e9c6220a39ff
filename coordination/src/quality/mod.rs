//! Quality scoring for chapter drafts
//!
//! A draft is scored by combining one evaluator verdict (per-category rubric
//! scores and a plot-advancement count) with local heuristics. The weighted
//! rubric mean gives the 0–100 aggregate; any hard failure forces a fail no
//! matter how high the aggregate is.
//!
//! Scoring is a pure function of (draft, verdict, context). Making the
//! evaluation call, and metering it, is the caller's job; a failed call or
//! an unparseable verdict surfaces as [`ScorerError`], which is distinct from
//! a low score.

pub mod heuristics;
pub mod rubric;
pub mod verdict;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use heuristics::{hard_failures, HardFailure, HeuristicConfig, EM_DASH};
pub use rubric::{CategoryScores, RubricCategory, RubricConfig, RubricWeights};
pub use verdict::{parse_verdict, EvaluatorVerdict};

use crate::provider::ProviderError;
use crate::state::count_words;

/// Evaluation could not produce a verdict
#[derive(Debug, Clone, Error)]
pub enum ScorerError {
    #[error("Evaluation call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Unparseable evaluator verdict: {0}")]
    InvalidVerdict(String),
}

impl ScorerError {
    /// Whether retrying cannot help (bad credentials and the like)
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_fatal())
    }
}

/// Per-draft scoring inputs
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringContext {
    pub target_words: u32,
    pub threshold: u8,
    pub weights: RubricWeights,
}

/// Scored draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub scores: CategoryScores,
    /// Weighted rubric mean on a 0–100 scale.
    pub aggregate: f64,
    pub hard_failures: Vec<HardFailure>,
    /// Categories scoring below the threshold (on the 0–100 scale).
    pub failing_categories: Vec<RubricCategory>,
    pub plot_advancements: u32,
    pub word_count: u32,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl AssessmentResult {
    pub fn passes(&self, threshold: u8) -> bool {
        self.hard_failures.is_empty() && self.aggregate >= threshold as f64
    }

    /// Human-readable reasons for a failed gate.
    pub fn failure_reasons(&self, threshold: u8) -> Vec<String> {
        let mut reasons: Vec<String> = self.hard_failures.iter().map(|f| f.to_string()).collect();
        if self.aggregate < threshold as f64 {
            reasons.push(format!(
                "aggregate {:.1} below threshold {threshold}",
                self.aggregate
            ));
        }
        for category in &self.failing_categories {
            reasons.push(format!(
                "{category} scored {:.1}/10",
                self.scores.get(*category)
            ));
        }
        reasons
    }
}

/// Rubric plus heuristics
#[derive(Debug, Clone, Default)]
pub struct QualityScorer {
    heuristics: HeuristicConfig,
}

impl QualityScorer {
    pub fn new(heuristics: HeuristicConfig) -> Self {
        Self { heuristics }
    }

    pub fn heuristics(&self) -> &HeuristicConfig {
        &self.heuristics
    }

    /// Parse the evaluator's raw output and score the draft.
    pub fn assess(
        &self,
        draft: &str,
        evaluator_output: &str,
        ctx: &ScoringContext,
    ) -> Result<AssessmentResult, ScorerError> {
        let verdict = parse_verdict(evaluator_output)?;
        Ok(self.score(draft, &verdict, ctx))
    }

    /// Score a draft against an already-parsed verdict.
    pub fn score(
        &self,
        draft: &str,
        verdict: &EvaluatorVerdict,
        ctx: &ScoringContext,
    ) -> AssessmentResult {
        let scores = verdict.scores.clamped();
        let aggregate = scores.aggregate(&ctx.weights);
        let hard_failures = hard_failures(
            draft,
            ctx.target_words,
            Some(verdict.plot_advancements),
            &self.heuristics,
        );
        let failing_categories = RubricCategory::all()
            .iter()
            .copied()
            .filter(|c| scores.get(*c) * 10.0 < ctx.threshold as f64)
            .collect();

        let result = AssessmentResult {
            scores,
            aggregate,
            hard_failures,
            failing_categories,
            plot_advancements: verdict.plot_advancements,
            word_count: count_words(draft),
            notes: verdict.notes.clone(),
        };
        debug!(
            aggregate = result.aggregate,
            hard_failures = result.hard_failures.len(),
            passes = result.passes(ctx.threshold),
            "Draft scored"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(threshold: u8) -> ScoringContext {
        ScoringContext {
            target_words: 100,
            threshold,
            weights: RubricWeights::default(),
        }
    }

    fn draft(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    fn verdict(score: f64, plot: u32) -> EvaluatorVerdict {
        EvaluatorVerdict {
            scores: CategoryScores::uniform(score),
            plot_advancements: plot,
            notes: vec![],
        }
    }

    #[test]
    fn test_passing_draft() {
        let result = QualityScorer::default().score(&draft(100), &verdict(8.5, 2), &ctx(80));
        assert!((result.aggregate - 85.0).abs() < 1e-9);
        assert!(result.passes(80));
        assert!(result.failing_categories.is_empty());
        assert!(result.failure_reasons(80).is_empty());
    }

    #[test]
    fn test_low_score_fails_and_names_categories() {
        let mut v = verdict(8.0, 2);
        v.scores.engagement = 4.0;
        let result = QualityScorer::default().score(&draft(100), &v, &ctx(80));
        assert!(!result.passes(80));
        assert_eq!(result.failing_categories, vec![RubricCategory::Engagement]);
        assert_eq!(result.failure_reasons(80).len(), 2);
    }

    #[test]
    fn test_hard_failure_overrides_high_score() {
        let result = QualityScorer::default().score(&draft(100), &verdict(10.0, 0), &ctx(80));
        assert_eq!(result.aggregate, 100.0);
        assert!(!result.passes(80));
        assert_eq!(result.hard_failures, vec![HardFailure::NoPlotAdvancement]);
    }

    #[test]
    fn test_word_count_hard_failure() {
        let result = QualityScorer::default().score(&draft(40), &verdict(9.0, 2), &ctx(80));
        assert!(!result.passes(80));
        assert_eq!(result.word_count, 40);
    }

    #[test]
    fn test_assess_unparseable_is_error_not_low_score() {
        let err = QualityScorer::default()
            .assess(&draft(100), "Great chapter, 9/10", &ctx(80))
            .unwrap_err();
        assert!(matches!(err, ScorerError::InvalidVerdict(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_assess_parses_and_scores() {
        let output = r#"{"scores": {"prose": 7, "character": 7, "structure": 7,
            "engagement": 7, "technical_accuracy": 7}, "plot_advancements": 3}"#;
        let result = QualityScorer::default()
            .assess(&draft(100), output, &ctx(70))
            .unwrap();
        assert!((result.aggregate - 70.0).abs() < 1e-9);
        assert!(result.passes(70));
        assert!(!result.passes(71));
    }

    #[test]
    fn test_fatal_provider_error() {
        let err: ScorerError = ProviderError::Unauthorized("401".into()).into();
        assert!(err.is_fatal());
    }
}
