//! Column family and key layout for the RocksDB document store
//!
//! Chapter keys embed the zero-padded chapter number so a prefix scan over a
//! project returns chapters in order.

/// Column family for projects
pub const CF_PROJECTS: &str = "projects";

/// Column family for chapters
pub const CF_CHAPTERS: &str = "chapters";

/// Column family for generation jobs
pub const CF_JOBS: &str = "jobs";

/// All column family names
pub const ALL_CFS: &[&str] = &[CF_PROJECTS, CF_CHAPTERS, CF_JOBS];

/// Key prefixes for compound keys
pub mod keys {
    /// Create a project key
    pub fn project(project_id: &str) -> String {
        format!("proj:{}", project_id)
    }

    /// Prefix shared by every chapter of a project
    pub fn chapter_prefix(project_id: &str) -> String {
        format!("chap:{}:", project_id)
    }

    /// Create a chapter key (project + chapter number)
    pub fn chapter(project_id: &str, chapter_number: u32) -> String {
        format!("chap:{}:{:06}", project_id, chapter_number)
    }

    /// Create a job key
    pub fn job(job_id: &str) -> String {
        format!("job:{}", job_id)
    }
}
