//! Error taxonomy for the pipeline and the job orchestrator.
//!
//! Every failure is classified so callers decide what to do without string
//! matching:
//!
//! | Class     | Meaning                                   | Effect on a job             |
//! |-----------|-------------------------------------------|-----------------------------|
//! | Transient | provider failure other than credentials   | chapter `Exhausted`         |
//! | Quality   | gate not met within the refinement budget | chapter `needs_review`      |
//! | Resource  | balance too low for the next call         | job `failed` or `paused`    |
//! | Fatal     | credentials, bad context, broken store    | job `failed`, chapter rolled back |
//! | Conflict  | project already has an active job         | start rejected              |

use std::fmt;

use coordination::freshness::FreshnessError;
use coordination::ledger::LedgerError;
use coordination::provider::ProviderError;
use coordination::state::{
    ChapterOutcome, IllegalJobTransition, JobId, JobStatus, ProjectId, StoreError,
};
use thiserror::Error;

use crate::config::ConfigError;
use crate::context::ContextError;
use crate::state_machine::IllegalTransition;

/// Classification used by the orchestrator to decide a job's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Quality,
    Resource,
    Fatal,
    Conflict,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Quality => write!(f, "quality"),
            Self::Resource => write!(f, "resource"),
            Self::Fatal => write!(f, "fatal"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// Errors that abort a chapter run before it reaches a terminal state.
///
/// Transient exhaustion and quality exhaustion are *not* errors here; they
/// end the run as `Exhausted` and come back as a normal outcome.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A reservation was refused. Calls that already succeeded in this
    /// chapter were committed; `credits_charged` is that amount.
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits {
        required: u64,
        available: u64,
        credits_charged: u64,
    },

    /// Provider failure. Only credential errors stop a job; the rest end
    /// the chapter as exhausted.
    #[error("Provider failure: {0}")]
    Provider(ProviderError),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pattern tracker error: {0}")]
    Freshness(#[from] FreshnessError),

    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

impl From<LedgerError> for PipelineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => Self::InsufficientCredits {
                required,
                available,
                credits_charged: 0,
            },
            other => Self::Ledger(other),
        }
    }
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InsufficientCredits { .. } => ErrorClass::Resource,
            Self::Provider(e) if e.is_fatal() => ErrorClass::Fatal,
            Self::Provider(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Credits committed for this chapter before the error.
    pub fn credits_charged(&self) -> u64 {
        match self {
            Self::InsufficientCredits {
                credits_charged, ..
            } => *credits_charged,
            _ => 0,
        }
    }
}

/// Errors surfaced by the job control and single-chapter APIs.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Project {project_id} already has active job {job_id}")]
    Conflict { project_id: ProjectId, job_id: JobId },

    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job {job_id} is {status}; cannot {action}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Invalid generation context: {0}")]
    InvalidContext(#[from] ContextError),

    #[error(transparent)]
    InvalidTransition(#[from] IllegalJobTransition),

    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: u64, available: u64 },

    #[error("Chapter generation failed: {0}")]
    Pipeline(PipelineError),

    /// A chapter did not pass and the job is configured to stop on failure.
    #[error("Chapter {chapter} ended {outcome}; job stopped")]
    ChapterFailed { chapter: u32, outcome: ChapterOutcome },

    #[error("Job task aborted: {0}")]
    TaskAborted(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ledger error: {0}")]
    Ledger(LedgerError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<PipelineError> for OrchestrationError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InsufficientCredits {
                required,
                available,
                ..
            } => Self::InsufficientCredits {
                required,
                available,
            },
            other => Self::Pipeline(other),
        }
    }
}

impl From<LedgerError> for OrchestrationError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => Self::InsufficientCredits {
                required,
                available,
            },
            other => Self::Ledger(other),
        }
    }
}

impl OrchestrationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } | Self::InvalidState { .. } | Self::InvalidTransition(_) => {
                ErrorClass::Conflict
            }
            Self::InsufficientCredits { .. } => ErrorClass::Resource,
            Self::ChapterFailed { .. } => ErrorClass::Quality,
            Self::Pipeline(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }

    /// Machine-readable error code for API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "JOB_CONFLICT",
            Self::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::InvalidState { .. } | Self::InvalidTransition(_) => "INVALID_JOB_STATE",
            Self::InvalidContext(_) => "INVALID_CONTEXT",
            Self::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            Self::Pipeline(_) => "GENERATION_FAILED",
            Self::ChapterFailed { .. } => "CHAPTER_FAILED",
            Self::TaskAborted(_) => "INTERNAL",
            Self::Store(_) => "STORE_UNAVAILABLE",
            Self::Ledger(e) => e.code(),
            Self::Config(_) => "INVALID_CONFIG",
        }
    }
}
