//! Document store abstraction and the in-memory implementation
//!
//! The store is a narrow get/put/query surface over projects, chapters and
//! jobs. It offers no transactions; callers that need check-then-write
//! atomicity (the single-active-job rule) serialize on their own lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::types::*;

/// Error type for document store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

/// Result type for document store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a document store
pub type SharedDocumentStore = Arc<dyn DocumentStore>;

/// Persistence collaborator for projects, chapters and generation jobs.
pub trait DocumentStore: Send + Sync {
    fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>>;

    fn put_project(&self, project: &Project) -> StoreResult<()>;

    fn get_chapter(&self, project_id: &str, chapter_number: u32) -> StoreResult<Option<Chapter>>;

    /// Insert or replace the chapter keyed by (project, chapter number).
    fn put_chapter(&self, chapter: &Chapter) -> StoreResult<()>;

    /// All chapters of a project, ordered by chapter number.
    fn list_chapters(&self, project_id: &str) -> StoreResult<Vec<Chapter>>;

    fn get_job(&self, job_id: &str) -> StoreResult<Option<GenerationJob>>;

    fn put_job(&self, job: &GenerationJob) -> StoreResult<()>;

    /// All jobs of a project, newest first.
    fn list_jobs(&self, project_id: &str) -> StoreResult<Vec<GenerationJob>>;

    /// Active (non-terminal) jobs of a project.
    fn active_jobs(&self, project_id: &str) -> StoreResult<Vec<GenerationJob>> {
        Ok(self
            .list_jobs(project_id)?
            .into_iter()
            .filter(|j| j.status.is_active())
            .collect())
    }
}

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    chapters: HashMap<ProjectId, BTreeMap<u32, Chapter>>,
    jobs: HashMap<JobId, GenerationJob>,
}

/// Process-local store used by the CLI and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedDocumentStore {
        Arc::new(self)
    }
}

impl DocumentStore for MemoryStore {
    fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.projects.get(project_id).cloned())
    }

    fn put_project(&self, project: &Project) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        tables.projects.insert(project.id.clone(), project.clone());
        Ok(())
    }

    fn get_chapter(&self, project_id: &str, chapter_number: u32) -> StoreResult<Option<Chapter>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables
            .chapters
            .get(project_id)
            .and_then(|chapters| chapters.get(&chapter_number))
            .cloned())
    }

    fn put_chapter(&self, chapter: &Chapter) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        tables
            .chapters
            .entry(chapter.project_id.clone())
            .or_default()
            .insert(chapter.chapter_number, chapter.clone());
        Ok(())
    }

    fn list_chapters(&self, project_id: &str) -> StoreResult<Vec<Chapter>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables
            .chapters
            .get(project_id)
            .map(|chapters| chapters.values().cloned().collect())
            .unwrap_or_default())
    }

    fn get_job(&self, job_id: &str) -> StoreResult<Option<GenerationJob>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.jobs.get(job_id).cloned())
    }

    fn put_job(&self, job: &GenerationJob) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn list_jobs(&self, project_id: &str) -> StoreResult<Vec<GenerationJob>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut jobs: Vec<GenerationJob> = tables
            .jobs
            .values()
            .filter(|j| j.project_id == project_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}
