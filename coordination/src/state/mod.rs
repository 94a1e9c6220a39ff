//! Persistent state for manuscript generation
//!
//! This module provides the document-store collaborator used by the
//! generation pipeline and the orchestrator:
//! - Projects with their generation settings
//! - Chapters keyed by (project, chapter number)
//! - Generation jobs and their per-chapter results
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local maps, used by the CLI and tests
//! - `RocksStore` (feature `heavy-state`): column families `projects`,
//!   `chapters`, `jobs` in a single RocksDB instance
//!
//! # Usage
//!
//! ```ignore
//! use coordination::state::{DocumentStore, MemoryStore, Project};
//!
//! let store = MemoryStore::new().shared();
//! let project = Project::new("user-1", "The Salt Road", "fantasy", "A courier...");
//! store.put_project(&project)?;
//! ```

#[cfg(feature = "heavy-state")]
pub mod rocks;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "heavy-state")]
pub use rocks::RocksStore;
pub use store::{DocumentStore, MemoryStore, SharedDocumentStore, StoreError, StoreResult};
pub use types::{
    count_words, Chapter, ChapterId, ChapterOutcome, ChapterResult, ChapterStage, GenerationJob,
    IllegalJobTransition, JobId, JobSettings, JobStatus, JobType, Project, ProjectId, UserId,
};
