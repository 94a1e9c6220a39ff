//! Cost model: token estimation and credit pricing for completion calls.
//!
//! The same functions price the up-front book estimate, the per-call
//! reservation, and the metered commit, so quoted and charged amounts come
//! from one formula.

use serde::{Deserialize, Serialize};

use crate::provider::{CallKind, TokenUsage};

/// Trait for estimating token counts from text.
pub trait TokenEstimator {
    /// Estimate the number of tokens in the given text.
    fn estimate(&self, text: &str) -> u32;

    /// Estimate tokens for a text of known word count.
    fn estimate_words(&self, words: u32) -> u32;

    /// Estimator name for logging.
    fn name(&self) -> &str;
}

/// Simple word-count based estimator (words × factor).
///
/// Uses the approximation that ~1.3 tokens per word for English text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordCountEstimator {
    /// Tokens per word multiplier.
    pub factor: f64,
}

impl Default for WordCountEstimator {
    fn default() -> Self {
        Self { factor: 1.3 }
    }
}

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, text: &str) -> u32 {
        self.estimate_words(text.split_whitespace().count() as u32)
    }

    fn estimate_words(&self, words: u32) -> u32 {
        (words as f64 * self.factor).ceil() as u32
    }

    fn name(&self) -> &str {
        "word_count"
    }
}

/// Credit rates per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            input_per_1k: 1.0,
            output_per_1k: 3.0,
        }
    }
}

/// Per-call pricing shared by estimates, reservations and commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub rates: CostRates,
    /// Tokens of instructions and project context sent with every call.
    pub context_overhead_tokens: u32,
    /// Expected blueprint length returned by a planning call.
    pub blueprint_tokens: u32,
    /// Expected verdict length returned by an evaluation call.
    pub verdict_tokens: u32,
    /// Headroom on generated chapter length (1.1 = 10% over target).
    pub output_margin: f64,
    pub estimator: WordCountEstimator,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            rates: CostRates::default(),
            context_overhead_tokens: 800,
            blueprint_tokens: 600,
            verdict_tokens: 400,
            output_margin: 1.1,
            estimator: WordCountEstimator::default(),
        }
    }
}

/// Result of the estimate API
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookEstimate {
    pub estimated_credits: u64,
    pub credits_per_chapter: u64,
    /// Refinement passes per chapter the estimate budgets for.
    pub expected_refinements: f64,
}

impl CostModel {
    /// Expected token usage of one call for a chapter of `target_words`.
    pub fn estimate_usage(&self, kind: CallKind, target_words: u32) -> TokenUsage {
        let chapter_tokens = self.estimator.estimate_words(target_words);
        let generated = (chapter_tokens as f64 * self.output_margin).ceil() as u32;
        let overhead = self.context_overhead_tokens;
        match kind {
            CallKind::Planning => TokenUsage::new(overhead, self.blueprint_tokens),
            CallKind::Drafting => TokenUsage::new(overhead + self.blueprint_tokens, generated),
            CallKind::Refining => TokenUsage::new(overhead + chapter_tokens, generated),
            CallKind::Evaluation => TokenUsage::new(overhead + chapter_tokens, self.verdict_tokens),
        }
    }

    /// Credits charged for a given usage. Every call costs at least 1.
    pub fn cost_of(&self, usage: TokenUsage) -> u64 {
        let credits = usage.prompt_tokens as f64 / 1000.0 * self.rates.input_per_1k
            + usage.completion_tokens as f64 / 1000.0 * self.rates.output_per_1k;
        (credits.ceil() as u64).max(1)
    }

    /// Reservation amount for one call.
    pub fn estimate_call(&self, kind: CallKind, target_words: u32) -> u64 {
        self.cost_of(self.estimate_usage(kind, target_words))
    }

    /// Refinement passes a chapter is expected to need at a threshold.
    ///
    /// Thresholds at or below 60 are assumed to pass first time; at 100 the
    /// whole retry budget is expected to be spent.
    pub fn expected_refinements(&self, quality_threshold: u8, max_retries: u32) -> f64 {
        let pressure = ((quality_threshold as f64 - 60.0) / 40.0).clamp(0.0, 1.0);
        max_retries as f64 * pressure
    }

    /// Up-front estimate for generating `target_chapters` chapters.
    pub fn estimate_book(
        &self,
        target_chapters: u32,
        words_per_chapter: u32,
        quality_threshold: u8,
        max_retries: u32,
    ) -> BookEstimate {
        let first_pass = self.estimate_call(CallKind::Planning, words_per_chapter)
            + self.estimate_call(CallKind::Drafting, words_per_chapter)
            + self.estimate_call(CallKind::Evaluation, words_per_chapter);
        let refinement_pass = self.estimate_call(CallKind::Refining, words_per_chapter)
            + self.estimate_call(CallKind::Evaluation, words_per_chapter);
        let expected_refinements = self.expected_refinements(quality_threshold, max_retries);

        let credits_per_chapter =
            first_pass + (refinement_pass as f64 * expected_refinements).ceil() as u64;

        BookEstimate {
            estimated_credits: credits_per_chapter * target_chapters as u64,
            credits_per_chapter,
            expected_refinements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_count_estimator() {
        let est = WordCountEstimator::default();
        assert_eq!(est.estimate("one two three"), 4); // ceil(3.9)
        assert_eq!(est.estimate_words(1000), 1300);
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.name(), "word_count");
    }

    #[test]
    fn test_partial_overlay_keeps_default_estimator() {
        let model: CostModel =
            serde_json::from_str(r#"{"rates":{"input_per_1k":2.0,"output_per_1k":4.0}}"#).unwrap();
        assert_eq!(model.estimator, WordCountEstimator::default());
        assert_ne!(model, CostModel::default());
        assert_eq!(
            CostModel { rates: CostRates::default(), ..model },
            CostModel::default()
        );
    }

    #[test]
    fn test_cost_has_floor_of_one_credit() {
        let model = CostModel::default();
        assert_eq!(model.cost_of(TokenUsage::new(0, 0)), 1);
        assert_eq!(model.cost_of(TokenUsage::new(10, 10)), 1);
    }

    #[test]
    fn test_cost_rounds_up() {
        let model = CostModel::default();
        // 1000 in @1.0 + 1000 out @3.0 = 4.0
        assert_eq!(model.cost_of(TokenUsage::new(1000, 1000)), 4);
        // 1500 in @1.0 + 1000 out @3.0 = 4.5 -> 5
        assert_eq!(model.cost_of(TokenUsage::new(1500, 1000)), 5);
    }

    #[test]
    fn test_drafting_costs_more_than_planning() {
        let model = CostModel::default();
        let plan = model.estimate_call(CallKind::Planning, 3000);
        let draft = model.estimate_call(CallKind::Drafting, 3000);
        assert!(draft > plan);
        let usage = model.estimate_usage(CallKind::Drafting, 3000);
        assert_eq!(usage.completion_tokens, 4290); // 3900 * 1.1
    }

    #[test]
    fn test_expected_refinements_scale_with_threshold() {
        let model = CostModel::default();
        assert_eq!(model.expected_refinements(50, 3), 0.0);
        assert_eq!(model.expected_refinements(80, 3), 1.5);
        assert_eq!(model.expected_refinements(100, 3), 3.0);
    }

    #[test]
    fn test_book_estimate_matches_per_call_prices() {
        let model = CostModel::default();
        let estimate = model.estimate_book(10, 2000, 60, 3);
        let expected_chapter = model.estimate_call(CallKind::Planning, 2000)
            + model.estimate_call(CallKind::Drafting, 2000)
            + model.estimate_call(CallKind::Evaluation, 2000);
        assert_eq!(estimate.credits_per_chapter, expected_chapter);
        assert_eq!(estimate.estimated_credits, expected_chapter * 10);
    }

    #[test]
    fn test_higher_threshold_costs_more() {
        let model = CostModel::default();
        let lenient = model.estimate_book(5, 2000, 60, 3);
        let strict = model.estimate_book(5, 2000, 90, 3);
        assert!(strict.estimated_credits > lenient.estimated_credits);
    }
}
