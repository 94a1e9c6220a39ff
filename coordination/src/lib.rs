//! Coordination library for quality-gated chapter generation
//!
//! This library provides the deterministic, shared pieces the generation
//! agents are built on:
//! - Data model and the `DocumentStore` collaborator (`state`)
//! - Rubric scoring and hard-failure heuristics (`quality`)
//! - Cross-chapter repetition tracking (`freshness`)
//! - Reservation/commit/rollback credit accounting and the cost model (`ledger`)
//! - Progress broadcast with bounded replay (`events`)
//! - The `CompletionProvider` trait and an OpenAI-compatible client (`provider`)
//! - Transient-error retry and provider health (`resilience`)
//!
//! # Features
//!
//! - `heavy-state`: RocksDB-backed `DocumentStore` (`state::RocksStore`)

#![allow(clippy::uninlined_format_args)]

pub mod events;
pub mod freshness;
pub mod ledger;
pub mod provider;
pub mod quality;
pub mod resilience;
pub mod state;

// Re-export key state types
pub use state::{
    Chapter, ChapterOutcome, ChapterResult, ChapterStage, DocumentStore, GenerationJob,
    JobSettings, JobStatus, JobType, MemoryStore, Project, SharedDocumentStore, StoreError,
};

// Re-export quality types
pub use quality::{
    AssessmentResult, CategoryScores, HardFailure, HeuristicConfig, QualityScorer,
    RubricCategory, RubricConfig, RubricWeights, ScorerError, ScoringContext,
};

// Re-export freshness types
pub use freshness::{FlaggedSpan, FreshnessConfig, FreshnessReport, PatternEntry, PatternTracker};

// Re-export ledger types
pub use ledger::{
    Balance, BookEstimate, ChargeTag, CostModel, CreditLedger, CreditTransaction, LedgerError,
    Settlement, SharedLedger, TransactionKind,
};

// Re-export event types
pub use events::{ProgressBus, ProgressEvent, ProgressStage, SharedProgressBus};

// Re-export provider types
pub use provider::{
    CallKind, Completion, CompletionProvider, CompletionRequest, OpenAiCompatProvider,
    ProviderConfig, ProviderError, SharedProvider, TokenUsage,
};

// Re-export resilience types
pub use resilience::{retry_transient, HealthLevel, ProviderHealth, RetryPolicy};
