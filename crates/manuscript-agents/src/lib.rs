//! Quality-gated manuscript generation
//!
//! Turns a project (premise, book bible, style guide) into chapters through a
//! plan → draft → assess → refine loop, metering every provider call against
//! the user's credit balance:
//! - Per-chapter state machine (`state_machine`)
//! - Prompt templates and blueprint parsing (`prompts`)
//! - The chapter pipeline and its gate (`pipeline`)
//! - Job control: start, pause, resume, cancel, single-chapter generation
//!   (`orchestrator`)
//! - Frozen per-job inputs (`context`), configuration (`config`) and the
//!   error taxonomy (`errors`)

pub mod config;
pub mod context;
pub mod errors;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod state_machine;

pub use config::{ConfigError, GeneratorConfig, LedgerConfig, PipelineConfig};
pub use context::{ContextError, GenerationContext, SharedContext};
pub use errors::{ErrorClass, OrchestrationError, PipelineError};
pub use orchestrator::{GeneratedChapter, JobExit, JobOrchestrator};
pub use pipeline::{ChapterPipeline, ChapterRun, ExhaustReason, PipelineOutcome, ProgressReporter};
pub use state_machine::{ChapterState, ChapterStateMachine, IllegalTransition, TransitionRecord};
