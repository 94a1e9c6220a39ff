//! Core types for manuscript generation state
//!
//! These types are persisted through a [`DocumentStore`](super::DocumentStore)
//! and represent projects, their chapters, and the generation jobs that
//! produce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for projects
pub type ProjectId = String;

/// Unique identifier for chapters
pub type ChapterId = String;

/// Unique identifier for generation jobs
pub type JobId = String;

/// Opaque authenticated user identifier supplied by the identity provider
pub type UserId = String;

/// Default quality threshold (0-100) for new projects
pub const DEFAULT_QUALITY_THRESHOLD: u8 = 80;

/// Default chapter length for new projects
pub const DEFAULT_WORDS_PER_CHAPTER: u32 = 3_000;

/// Default book length for new projects
pub const DEFAULT_TARGET_CHAPTERS: u32 = 12;

/// A manuscript project owned by a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub title: String,
    /// Genre label; selects per-genre rubric weights when configured.
    pub genre: String,
    pub premise: String,
    /// Canonical facts about the world and cast.
    #[serde(default)]
    pub book_bible: String,
    #[serde(default)]
    pub style_guide: String,
    pub target_chapters: u32,
    pub target_words_per_chapter: u32,
    /// Minimum aggregate score (0-100) a chapter needs to pass the gate.
    pub quality_threshold: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a project with default length and quality settings
    pub fn new(
        owner_id: impl Into<UserId>,
        title: impl Into<String>,
        genre: impl Into<String>,
        premise: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            title: title.into(),
            genre: genre.into(),
            premise: premise.into(),
            book_bible: String::new(),
            style_guide: String::new(),
            target_chapters: DEFAULT_TARGET_CHAPTERS,
            target_words_per_chapter: DEFAULT_WORDS_PER_CHAPTER,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_book_bible(mut self, bible: impl Into<String>) -> Self {
        self.book_bible = bible.into();
        self
    }

    pub fn with_style_guide(mut self, guide: impl Into<String>) -> Self {
        self.style_guide = guide.into();
        self
    }

    /// Apply a settings update. This is the only mutation projects receive.
    pub fn apply_settings(&mut self, settings: &JobSettings) {
        self.target_chapters = settings.target_chapters;
        self.target_words_per_chapter = settings.words_per_chapter;
        self.quality_threshold = settings.quality_threshold;
        self.updated_at = Utc::now();
    }
}

/// Lifecycle stage of a persisted chapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStage {
    /// First draft, or best attempt of a chapter that never passed the gate
    Draft,
    /// Refinement in progress
    Revision,
    /// Passed the quality gate
    Complete,
}

impl std::fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Revision => write!(f, "revision"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// A chapter of a project. `chapter_number` is unique per project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: ChapterId,
    pub project_id: ProjectId,
    pub chapter_number: u32,
    pub content: String,
    pub word_count: u32,
    /// Aggregate score (0-100) of the persisted attempt, if it was scored.
    pub quality_score: Option<f64>,
    pub stage: ChapterStage,
    /// Number of refinement passes spent on this chapter.
    pub retry_count: u32,
    /// Set when the chapter exhausted its budget without passing the gate.
    #[serde(default)]
    pub needs_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    pub fn new(project_id: impl Into<ProjectId>, chapter_number: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            chapter_number,
            content: String::new(),
            word_count: 0,
            quality_score: None,
            stage: ChapterStage::Draft,
            retry_count: 0,
            needs_review: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the chapter text, keeping the word count in sync.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.word_count = count_words(&self.content);
        self.updated_at = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        self.stage == ChapterStage::Complete
    }
}

/// Whitespace-delimited word count used everywhere chapter length matters.
pub fn count_words(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

/// Kind of generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    SingleChapter,
    AutoCompleteBook,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleChapter => write!(f, "single_chapter"),
            Self::AutoCompleteBook => write!(f, "auto_complete_book"),
        }
    }
}

/// Status of a generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Active jobs hold the project's single generation slot.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Legal job status transitions:
/// ```text
/// Pending → Running | Cancelled | Failed
/// Running → Paused | Completed | Failed | Cancelled
/// Paused  → Running | Cancelled
/// ```
fn is_legal_job_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Pending, Failed)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Running)
            | (Paused, Cancelled)
    )
}

/// Error returned when a job status change violates the job state graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal job transition: {from} → {to}")]
pub struct IllegalJobTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Per-chapter result recorded on a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterOutcome {
    /// Passed the quality gate
    Ok,
    /// Exhausted its budget; best attempt kept as a draft
    NeedsReview,
    /// Stopped before producing anything usable
    Failed,
    /// Already complete when the job reached it
    Skipped,
    /// Job was cancelled while this chapter was in progress
    Cancelled,
}

impl std::fmt::Display for ChapterOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::NeedsReview => write!(f, "needs_review"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterResult {
    pub chapter_number: u32,
    pub outcome: ChapterOutcome,
    pub quality_score: Option<f64>,
    /// Drafting plus refinement attempts that produced text.
    pub attempts: u32,
    pub credits_charged: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parameters a job was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    pub target_chapters: u32,
    pub words_per_chapter: u32,
    pub quality_threshold: u8,
}

impl JobSettings {
    pub fn from_project(project: &Project) -> Self {
        Self {
            target_chapters: project.target_chapters,
            words_per_chapter: project.target_words_per_chapter,
            quality_threshold: project.quality_threshold,
        }
    }
}

/// A generation job. The orchestrator is its only writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub settings: JobSettings,
    /// Chapter number of index 0.
    pub first_chapter: u32,
    /// Index (0-based) of the next chapter to process.
    pub current_chapter_index: u32,
    pub total_chapters: u32,
    pub results: Vec<ChapterResult>,
    /// Credits committed across all chapters of this job.
    pub aggregate_cost: u64,
    pub last_message: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// A job generating chapters `1..=settings.target_chapters`.
    pub fn auto_complete(
        project_id: impl Into<ProjectId>,
        user_id: impl Into<UserId>,
        settings: JobSettings,
    ) -> Self {
        Self::new(
            project_id.into(),
            user_id.into(),
            JobType::AutoCompleteBook,
            settings,
            1,
            settings.target_chapters,
        )
    }

    /// A job generating exactly one chapter.
    pub fn single_chapter(
        project_id: impl Into<ProjectId>,
        user_id: impl Into<UserId>,
        settings: JobSettings,
        chapter_number: u32,
    ) -> Self {
        Self::new(
            project_id.into(),
            user_id.into(),
            JobType::SingleChapter,
            settings,
            chapter_number,
            1,
        )
    }

    fn new(
        project_id: ProjectId,
        user_id: UserId,
        job_type: JobType,
        settings: JobSettings,
        first_chapter: u32,
        total_chapters: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id,
            user_id,
            job_type,
            status: JobStatus::Pending,
            settings,
            first_chapter,
            current_chapter_index: 0,
            total_chapters,
            results: Vec::new(),
            aggregate_cost: 0,
            last_message: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Move to a new status, rejecting edges outside the job state graph.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), IllegalJobTransition> {
        if !is_legal_job_transition(self.status, to) {
            return Err(IllegalJobTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Chapter number the job will process next, if any remain.
    pub fn current_chapter(&self) -> Option<u32> {
        (self.current_chapter_index < self.total_chapters)
            .then(|| self.first_chapter + self.current_chapter_index)
    }

    /// Record a finished chapter and advance the cursor.
    pub fn record_result(&mut self, result: ChapterResult) {
        self.aggregate_cost += result.credits_charged;
        self.results.push(result);
        self.current_chapter_index += 1;
        self.updated_at = Utc::now();
    }

    /// Integer percentage of chapters finished.
    pub fn progress_percent(&self) -> u8 {
        if self.total_chapters == 0 {
            return 100;
        }
        let done = (self.current_chapter_index.min(self.total_chapters)) as u64;
        (done * 100 / self.total_chapters as u64) as u8
    }

    /// Whether any chapter of this job already produced charged work.
    pub fn has_prior_progress(&self) -> bool {
        self.results
            .iter()
            .any(|r| matches!(r.outcome, ChapterOutcome::Ok | ChapterOutcome::NeedsReview))
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.last_message = Some(message.into());
        self.updated_at = Utc::now();
    }
}
