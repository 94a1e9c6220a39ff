//! Rubric categories and weighting

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One rubric dimension, scored 0–10 by the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RubricCategory {
    Prose,
    Character,
    Structure,
    Engagement,
    TechnicalAccuracy,
}

impl RubricCategory {
    pub fn all() -> &'static [RubricCategory] {
        &[
            Self::Prose,
            Self::Character,
            Self::Structure,
            Self::Engagement,
            Self::TechnicalAccuracy,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prose => "prose",
            Self::Character => "character",
            Self::Structure => "structure",
            Self::Engagement => "engagement",
            Self::TechnicalAccuracy => "technical_accuracy",
        }
    }
}

impl std::fmt::Display for RubricCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category scores on a 0–10 scale
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryScores {
    pub prose: f64,
    pub character: f64,
    pub structure: f64,
    pub engagement: f64,
    pub technical_accuracy: f64,
}

impl CategoryScores {
    /// Same score in every category
    pub fn uniform(score: f64) -> Self {
        Self {
            prose: score,
            character: score,
            structure: score,
            engagement: score,
            technical_accuracy: score,
        }
    }

    pub fn get(&self, category: RubricCategory) -> f64 {
        match category {
            RubricCategory::Prose => self.prose,
            RubricCategory::Character => self.character,
            RubricCategory::Structure => self.structure,
            RubricCategory::Engagement => self.engagement,
            RubricCategory::TechnicalAccuracy => self.technical_accuracy,
        }
    }

    /// Clamp every category into 0–10. Non-finite values become 0.
    pub fn clamped(self) -> Self {
        let c = |v: f64| if v.is_finite() { v.clamp(0.0, 10.0) } else { 0.0 };
        Self {
            prose: c(self.prose),
            character: c(self.character),
            structure: c(self.structure),
            engagement: c(self.engagement),
            technical_accuracy: c(self.technical_accuracy),
        }
    }

    /// Weighted mean scaled to 0–100, rounded to two decimals.
    pub fn aggregate(&self, weights: &RubricWeights) -> f64 {
        let weights = weights.normalized();
        let mean: f64 = RubricCategory::all()
            .iter()
            .map(|c| self.get(*c) * weights.get(*c))
            .sum();
        ((mean * 1000.0).round() / 100.0).clamp(0.0, 100.0)
    }
}

/// Relative category weights. Normalized before use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RubricWeights {
    pub prose: f64,
    pub character: f64,
    pub structure: f64,
    pub engagement: f64,
    pub technical_accuracy: f64,
}

impl Default for RubricWeights {
    fn default() -> Self {
        Self {
            prose: 0.2,
            character: 0.2,
            structure: 0.2,
            engagement: 0.2,
            technical_accuracy: 0.2,
        }
    }
}

impl RubricWeights {
    pub fn get(&self, category: RubricCategory) -> f64 {
        match category {
            RubricCategory::Prose => self.prose,
            RubricCategory::Character => self.character,
            RubricCategory::Structure => self.structure,
            RubricCategory::Engagement => self.engagement,
            RubricCategory::TechnicalAccuracy => self.technical_accuracy,
        }
    }

    fn total(&self) -> f64 {
        RubricCategory::all().iter().map(|c| self.get(*c)).sum()
    }

    /// Weights rescaled to sum to 1. Degenerate weights fall back to equal.
    pub fn normalized(&self) -> Self {
        let total = self.total();
        let any_negative = RubricCategory::all().iter().any(|c| self.get(*c) < 0.0);
        if !total.is_finite() || total <= 0.0 || any_negative {
            return Self::default();
        }
        Self {
            prose: self.prose / total,
            character: self.character / total,
            structure: self.structure / total,
            engagement: self.engagement / total,
            technical_accuracy: self.technical_accuracy / total,
        }
    }

    /// Whether these weights can be used as-is.
    pub fn is_valid(&self) -> bool {
        let total = self.total();
        total.is_finite()
            && total > 0.0
            && RubricCategory::all().iter().all(|c| self.get(*c) >= 0.0)
    }
}

/// Default weights plus per-genre overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RubricConfig {
    pub default: RubricWeights,
    /// Keyed by lowercase genre name.
    pub genres: HashMap<String, RubricWeights>,
}

impl RubricConfig {
    /// Weights for a genre, falling back to the default.
    pub fn weights_for(&self, genre: &str) -> RubricWeights {
        self.genres
            .get(&genre.trim().to_lowercase())
            .copied()
            .unwrap_or(self.default)
    }
}
