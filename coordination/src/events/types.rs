//! Progress event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::JobId;

/// Where a job (or the chapter it is working on) currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    JobStarted,
    Planning,
    Drafting,
    Assessing,
    Refining,
    Integrated,
    Exhausted,
    ChapterSkipped,
    Paused,
    Resumed,
    Cancelled,
    Completed,
    Failed,
}

impl ProgressStage {
    /// Get the stage name as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobStarted => "job_started",
            Self::Planning => "planning",
            Self::Drafting => "drafting",
            Self::Assessing => "assessing",
            Self::Refining => "refining",
            Self::Integrated => "integrated",
            Self::Exhausted => "exhausted",
            Self::ChapterSkipped => "chapter_skipped",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Stages after which the job emits nothing further
    pub fn is_job_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stages that close out a chapter
    pub fn ends_chapter(&self) -> bool {
        matches!(
            self,
            Self::Integrated | Self::Exhausted | Self::ChapterSkipped
        )
    }
}

impl std::fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Chapter the event concerns; `None` for job-level events.
    pub chapter: Option<u32>,
    pub stage: ProgressStage,
    /// Chapters finished × 100 / total, as an integer.
    pub percentage: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        job_id: impl Into<JobId>,
        stage: ProgressStage,
        percentage: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            chapter: None,
            stage,
            percentage,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn for_chapter(mut self, chapter: u32) -> Self {
        self.chapter = Some(chapter);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_serialization() {
        let json = serde_json::to_string(&ProgressStage::ChapterSkipped).unwrap();
        assert_eq!(json, "\"chapter_skipped\"");
        assert_eq!(ProgressStage::JobStarted.to_string(), "job_started");
    }

    #[test]
    fn test_terminal_stages() {
        assert!(ProgressStage::Completed.is_job_terminal());
        assert!(ProgressStage::Cancelled.is_job_terminal());
        assert!(!ProgressStage::Paused.is_job_terminal());
        assert!(ProgressStage::Exhausted.ends_chapter());
        assert!(!ProgressStage::Refining.ends_chapter());
    }

    #[test]
    fn test_event_builder() {
        let event = ProgressEvent::new("job-1", ProgressStage::Drafting, 33, "drafting chapter 2")
            .for_chapter(2);
        assert_eq!(event.chapter, Some(2));
        assert_eq!(event.percentage, 33);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "drafting");
        assert_eq!(json["job_id"], "job-1");
    }
}
