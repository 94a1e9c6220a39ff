//! RocksDB-backed document store
//!
//! Uses column families for logical data separation. Values are stored as
//! JSON so records stay inspectable with `ldb`.

use std::path::PathBuf;
use std::sync::RwLock;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, ALL_CFS};
use super::store::{DocumentStore, StoreError, StoreResult};
use super::types::*;

/// Persistent document store
pub struct RocksStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl RocksStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;

        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Decode every value whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut values = Vec::new();
        for item in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
            let (key, bytes) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            values.push(value);
        }
        Ok(values)
    }
}

impl DocumentStore for RocksStore {
    fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        self.get(schema::CF_PROJECTS, &schema::keys::project(project_id))
    }

    fn put_project(&self, project: &Project) -> StoreResult<()> {
        self.put(
            schema::CF_PROJECTS,
            &schema::keys::project(&project.id),
            project,
        )
    }

    fn get_chapter(&self, project_id: &str, chapter_number: u32) -> StoreResult<Option<Chapter>> {
        self.get(
            schema::CF_CHAPTERS,
            &schema::keys::chapter(project_id, chapter_number),
        )
    }

    fn put_chapter(&self, chapter: &Chapter) -> StoreResult<()> {
        let key = schema::keys::chapter(&chapter.project_id, chapter.chapter_number);
        self.put(schema::CF_CHAPTERS, &key, chapter)
    }

    fn list_chapters(&self, project_id: &str) -> StoreResult<Vec<Chapter>> {
        self.scan(schema::CF_CHAPTERS, &schema::keys::chapter_prefix(project_id))
    }

    fn get_job(&self, job_id: &str) -> StoreResult<Option<GenerationJob>> {
        self.get(schema::CF_JOBS, &schema::keys::job(job_id))
    }

    fn put_job(&self, job: &GenerationJob) -> StoreResult<()> {
        self.put(schema::CF_JOBS, &schema::keys::job(&job.id), job)
    }

    fn list_jobs(&self, project_id: &str) -> StoreResult<Vec<GenerationJob>> {
        // Jobs are keyed by id only; a secondary index is not worth it at
        // the job counts a single project accumulates.
        let mut jobs: Vec<GenerationJob> = self
            .scan::<GenerationJob>(schema::CF_JOBS, "job:")?
            .into_iter()
            .filter(|j| j.project_id == project_id)
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rocks_store_persists_chapters_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let project = Project::new("u1", "T", "thriller", "premise");
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.put_project(&project).unwrap();
            let mut chapter = Chapter::new(&project.id, 2);
            chapter.set_content("persisted text");
            store.put_chapter(&chapter).unwrap();
            store.put_chapter(&Chapter::new(&project.id, 1)).unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get_project(&project.id).unwrap(), Some(project.clone()));
        let chapters = store.list_chapters(&project.id).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].chapter_number, 1);
        assert_eq!(chapters[1].content, "persisted text");
    }

    #[test]
    fn test_rocks_store_lists_jobs_per_project() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let settings = JobSettings {
            target_chapters: 1,
            words_per_chapter: 100,
            quality_threshold: 70,
        };
        store
            .put_job(&GenerationJob::auto_complete("p1", "u1", settings))
            .unwrap();
        store
            .put_job(&GenerationJob::auto_complete("p2", "u1", settings))
            .unwrap();
        assert_eq!(store.list_jobs("p1").unwrap().len(), 1);
        assert_eq!(store.active_jobs("p2").unwrap().len(), 1);
    }
}
