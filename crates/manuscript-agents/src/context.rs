//! Generation context: the immutable per-job bundle every stage reads.
//!
//! Built once when a job starts and shared by `Arc`; nothing in the
//! pipeline mutates it.

use std::sync::Arc;

use coordination::quality::{RubricWeights, ScoringContext};
use coordination::state::{JobSettings, Project, ProjectId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GeneratorConfig;

/// Why a project cannot be generated from
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("project premise is empty")]
    EmptyPremise,

    #[error("target words per chapter must be positive")]
    ZeroTargetWords,

    #[error("quality threshold {0} is outside 0-100")]
    ThresholdOutOfRange(u8),

    #[error("target chapter count must be positive")]
    ZeroChapters,

    #[error("chapter numbers start at 1, got {0}")]
    ChapterOutOfRange(u32),
}

/// Shared handle to a context
pub type SharedContext = Arc<GenerationContext>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub title: String,
    pub genre: String,
    pub premise: String,
    pub book_bible: String,
    pub style_guide: String,
    pub banned_chars: Vec<char>,
    pub weights: RubricWeights,
    pub target_chapters: u32,
    pub target_words: u32,
    pub quality_threshold: u8,
    pub min_freshness: f64,
    pub max_retries: u32,
}

impl GenerationContext {
    /// Validate `settings` against `project` and freeze the result.
    pub fn build(
        project: &Project,
        settings: &JobSettings,
        user_id: &str,
        config: &GeneratorConfig,
    ) -> Result<Self, ContextError> {
        if project.premise.trim().is_empty() {
            return Err(ContextError::EmptyPremise);
        }
        if settings.words_per_chapter == 0 {
            return Err(ContextError::ZeroTargetWords);
        }
        if settings.quality_threshold > 100 {
            return Err(ContextError::ThresholdOutOfRange(settings.quality_threshold));
        }
        if settings.target_chapters == 0 {
            return Err(ContextError::ZeroChapters);
        }

        Ok(Self {
            project_id: project.id.clone(),
            user_id: user_id.to_string(),
            title: project.title.clone(),
            genre: project.genre.clone(),
            premise: project.premise.clone(),
            book_bible: project.book_bible.clone(),
            style_guide: project.style_guide.clone(),
            banned_chars: config.heuristics.banned_chars.clone(),
            weights: config.rubric.weights_for(&project.genre).normalized(),
            target_chapters: settings.target_chapters,
            target_words: settings.words_per_chapter,
            quality_threshold: settings.quality_threshold,
            min_freshness: config.freshness.min_score,
            max_retries: config.pipeline.max_retries,
        })
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(self)
    }

    /// Inputs the quality scorer needs for one draft.
    pub fn scoring(&self) -> ScoringContext {
        ScoringContext {
            target_words: self.target_words,
            threshold: self.quality_threshold,
            weights: self.weights,
        }
    }
}
