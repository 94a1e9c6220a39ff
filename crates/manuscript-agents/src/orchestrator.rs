//! Job orchestrator: runs single-chapter and auto-complete jobs.
//!
//! A project holds at most one active job. Every job row is written through
//! [`Inner::update_job`], which serializes read-modify-write on one lock, so
//! the control calls (pause, resume, cancel) and the background task never
//! overwrite each other.
//!
//! ```text
//! start ─► Running ─┬─ chapters left ─► pipeline ─► record ─┐
//!            ▲      │                                       │
//!            │      └─ none left ─► Completed                │
//!            │  pause (between chapters) ◄──────────────────┘
//!         resume ◄── Paused ◄── insufficient credits after progress
//! ```
//!
//! Pause takes effect between chapters; cancel between pipeline stages.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use coordination::events::{
    EventBusResult, EventFilter, FilteredReceiver, ProgressBus, ProgressEvent, ProgressStage,
    SharedProgressBus,
};
use coordination::freshness::PatternTracker;
use coordination::ledger::{BookEstimate, SharedLedger};
use coordination::provider::SharedProvider;
use coordination::state::{
    ChapterOutcome, ChapterResult, GenerationJob, JobId, JobSettings, JobStatus, JobType, Project,
    SharedDocumentStore, StoreError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::GeneratorConfig;
use crate::context::{ContextError, GenerationContext, SharedContext};
use crate::errors::{OrchestrationError, PipelineError};
use crate::pipeline::{ChapterPipeline, ChapterRun, PipelineOutcome, ProgressReporter};

/// Signals shared between the control API and one run of a job task.
#[derive(Clone, Default)]
struct RunSignals {
    cancel: CancellationToken,
    pause: CancellationToken,
    /// Cancelled when the task exits, however it exits.
    done: CancellationToken,
}

/// How a job task stopped
#[derive(Debug)]
pub enum JobExit {
    Completed,
    Paused,
    Cancelled,
    Failed(OrchestrationError),
}

/// Returned by [`JobOrchestrator::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedChapter {
    pub job_id: JobId,
    pub chapter_number: u32,
    pub content: String,
    pub quality_score: Option<f64>,
    pub credits_charged: u64,
    pub needs_review: bool,
    pub outcome: ChapterOutcome,
}

enum Admission {
    Started(GenerationJob, SharedContext),
    Rejected(GenerationJob, ContextError),
}

struct Inner {
    store: SharedDocumentStore,
    ledger: SharedLedger,
    bus: SharedProgressBus,
    pipeline: ChapterPipeline,
    config: GeneratorConfig,
    /// Guards every job-row read-modify-write and the active-job check.
    rows: Mutex<()>,
    runs: tokio::sync::Mutex<HashMap<JobId, RunSignals>>,
}

/// Entry point for job control. Cheap to clone.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        provider: SharedProvider,
        store: SharedDocumentStore,
        ledger: SharedLedger,
        config: GeneratorConfig,
    ) -> Result<Self, OrchestrationError> {
        config.validate()?;
        let tracker = Arc::new(PatternTracker::new(config.freshness.clone()));
        let pipeline = ChapterPipeline::new(
            provider,
            Arc::clone(&ledger),
            Arc::clone(&store),
            tracker,
            &config,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                ledger,
                bus: ProgressBus::new().shared(),
                pipeline,
                config,
                rows: Mutex::new(()),
                runs: tokio::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &SharedDocumentStore {
        &self.inner.store
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.inner.ledger
    }

    pub fn bus(&self) -> &SharedProgressBus {
        &self.inner.bus
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.inner.config
    }

    /// Up-front credit estimate for a book with these settings.
    pub fn estimate(&self, settings: &JobSettings) -> BookEstimate {
        self.inner.config.costs.estimate_book(
            settings.target_chapters,
            settings.words_per_chapter,
            settings.quality_threshold,
            self.inner.config.pipeline.max_retries,
        )
    }

    /// Start an auto-complete job for chapters `1..=target_chapters` and
    /// return its id without waiting for it.
    ///
    /// An invalid generation context still creates the job, already
    /// `Failed` with the reason; nothing is charged.
    pub async fn start(
        &self,
        user_id: &str,
        project_id: &str,
        settings: JobSettings,
    ) -> Result<JobId, OrchestrationError> {
        let (job, ctx) = match self.inner.admit(user_id, project_id, settings, None)? {
            Admission::Started(job, ctx) => (job, ctx),
            Admission::Rejected(job, reason) => {
                warn!(job_id = %job.id, project_id, error = %reason, "Job rejected: invalid context");
                self.inner
                    .reporter(&job.id, 0)
                    .emit(ProgressStage::Failed, None, reason.to_string());
                return Ok(job.id);
            }
        };

        info!(
            job_id = %job.id,
            project_id,
            chapters = settings.target_chapters,
            words = settings.words_per_chapter,
            threshold = settings.quality_threshold,
            "Auto-complete job started"
        );
        self.inner.reporter(&job.id, 0).emit(
            ProgressStage::JobStarted,
            None,
            format!("Generating {} chapters", job.total_chapters),
        );
        // Detached: progress is observed through the bus and the job row.
        drop(self.spawn_run(&job.id, ctx).await);
        Ok(job.id)
    }

    /// Generate one chapter and wait for it.
    ///
    /// Regenerating a chapter that is already complete is allowed.
    pub async fn generate(
        &self,
        user_id: &str,
        project_id: &str,
        chapter_number: u32,
        target_words: u32,
    ) -> Result<GeneratedChapter, OrchestrationError> {
        if chapter_number == 0 {
            return Err(ContextError::ChapterOutOfRange(chapter_number).into());
        }
        let project = self.inner.require_project(project_id)?;
        let settings = JobSettings {
            target_chapters: project.target_chapters.max(chapter_number),
            words_per_chapter: target_words,
            quality_threshold: project.quality_threshold,
        };

        let (job, ctx) =
            match self
                .inner
                .admit(user_id, project_id, settings, Some(chapter_number))?
            {
                Admission::Started(job, ctx) => (job, ctx),
                Admission::Rejected(_, reason) => return Err(reason.into()),
            };
        self.inner.reporter(&job.id, 0).emit(
            ProgressStage::JobStarted,
            Some(chapter_number),
            format!("Generating chapter {chapter_number}"),
        );

        let task = self.spawn_run(&job.id, ctx).await;
        match task.await {
            Ok(JobExit::Failed(e)) => return Err(e),
            Ok(_) => {}
            Err(e) => return Err(OrchestrationError::TaskAborted(e.to_string())),
        }

        let job = self.inner.require_job(&job.id)?;
        let Some(result) = job.results.last() else {
            return Err(OrchestrationError::InvalidState {
                job_id: job.id.clone(),
                status: job.status,
                action: "generate",
            });
        };
        let content = self
            .inner
            .store
            .get_chapter(project_id, chapter_number)?
            .map(|c| c.content)
            .unwrap_or_default();

        Ok(GeneratedChapter {
            job_id: job.id.clone(),
            chapter_number,
            content,
            quality_score: result.quality_score,
            credits_charged: job.aggregate_cost,
            needs_review: result.outcome == ChapterOutcome::NeedsReview,
            outcome: result.outcome,
        })
    }

    pub fn status(&self, job_id: &str) -> Result<GenerationJob, OrchestrationError> {
        self.inner.require_job(job_id)
    }

    /// Ask a running job to stop after its current chapter.
    pub async fn pause(&self, job_id: &str) -> Result<GenerationJob, OrchestrationError> {
        let (_, job) = self.inner.update_job(job_id, |job| {
            if job.status != JobStatus::Running {
                return Err(invalid_state(job, "pause"));
            }
            job.transition(JobStatus::Paused)?;
            job.set_message("Paused by user; stopping after the current chapter");
            Ok(())
        })?;

        if let Some(signals) = self.inner.runs.lock().await.get(job_id) {
            signals.pause.cancel();
        }
        info!(job_id, chapter = ?job.current_chapter(), "Job paused");
        self.inner.reporter(job_id, job.progress_percent()).emit(
            ProgressStage::Paused,
            job.current_chapter(),
            "Paused by user",
        );
        Ok(job)
    }

    /// Continue a paused job from its next unfinished chapter.
    pub async fn resume(&self, job_id: &str) -> Result<GenerationJob, OrchestrationError> {
        let job = self.inner.require_job(job_id)?;
        if job.status != JobStatus::Paused {
            return Err(invalid_state(&job, "resume"));
        }

        // A run that is still finishing its chapter must exit first.
        let previous = self
            .inner
            .runs
            .lock()
            .await
            .get(job_id)
            .map(|signals| signals.done.clone());
        if let Some(done) = previous {
            done.cancelled().await;
        }

        let project = self.inner.require_project(&job.project_id)?;
        let ctx = GenerationContext::build(
            &project,
            &job.settings,
            &job.user_id,
            &self.inner.config,
        )?
        .shared();

        let (_, job) = self.inner.update_job(job_id, |job| {
            if job.status != JobStatus::Paused {
                return Err(invalid_state(job, "resume"));
            }
            job.transition(JobStatus::Running)?;
            job.set_message("Resumed");
            Ok(())
        })?;

        info!(job_id, chapter = ?job.current_chapter(), "Job resumed");
        self.inner.reporter(job_id, job.progress_percent()).emit(
            ProgressStage::Resumed,
            job.current_chapter(),
            "Resumed",
        );
        drop(self.spawn_run(job_id, ctx).await);
        Ok(job)
    }

    /// Cancel a job. A chapter in flight stops at its next stage boundary
    /// and the calls it already made are committed.
    pub async fn cancel(&self, job_id: &str) -> Result<GenerationJob, OrchestrationError> {
        let (_, job) = self.inner.update_job(job_id, |job| {
            if job.status.is_terminal() {
                return Err(invalid_state(job, "cancel"));
            }
            job.transition(JobStatus::Cancelled)?;
            job.set_message("Cancelled by user");
            Ok(())
        })?;

        if let Some(signals) = self.inner.runs.lock().await.get(job_id) {
            signals.cancel.cancel();
        }
        info!(job_id, "Job cancelled");
        self.inner.reporter(job_id, job.progress_percent()).emit(
            ProgressStage::Cancelled,
            job.current_chapter(),
            "Cancelled by user",
        );
        Ok(job)
    }

    /// Wait until the job's current run (if any) has exited.
    ///
    /// Finished runs are forgotten, so this returns at once for a job with no
    /// live task.
    pub async fn wait(&self, job_id: &str) -> Result<GenerationJob, OrchestrationError> {
        let done = self
            .inner
            .runs
            .lock()
            .await
            .get(job_id)
            .map(|signals| signals.done.clone());
        if let Some(done) = done {
            done.cancelled().await;
        }
        self.inner.require_job(job_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.bus.subscribe()
    }

    pub fn subscribe_job(&self, job_id: &str) -> FilteredReceiver {
        self.inner.bus.subscribe_filtered(EventFilter::new().job(job_id))
    }

    /// Buffered events of a job, oldest first.
    pub fn replay(&self, job_id: &str) -> EventBusResult<Vec<ProgressEvent>> {
        self.inner.bus.replay(job_id)
    }

    /// Periodically roll back reservations that outlived the TTL.
    pub fn spawn_sweeper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.inner.ledger);
        let ttl = self.inner.config.ledger.reservation_ttl();
        let period = self.inner.config.ledger.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = ledger.sweep_expired(Utc::now(), ttl) {
                            warn!(error = %e, "Reservation sweep failed");
                        }
                    }
                }
            }
            debug!("Reservation sweeper stopped");
        })
    }

    /// Register fresh signals for `job_id` and spawn its task.
    async fn spawn_run(&self, job_id: &str, ctx: SharedContext) -> JoinHandle<JobExit> {
        let signals = RunSignals::default();
        let mut runs = self.inner.runs.lock().await;
        let task = tokio::spawn(Arc::clone(&self.inner).run_job(
            job_id.to_string(),
            ctx,
            signals.clone(),
        ));
        runs.insert(job_id.to_string(), signals);
        task
    }
}

fn invalid_state(job: &GenerationJob, action: &'static str) -> OrchestrationError {
    OrchestrationError::InvalidState {
        job_id: job.id.clone(),
        status: job.status,
        action,
    }
}

fn chapter_result(run: &ChapterRun) -> ChapterResult {
    let (outcome, message) = match &run.outcome {
        PipelineOutcome::Integrated => (ChapterOutcome::Ok, None),
        PipelineOutcome::Exhausted(reason) if run.assessment.is_some() => {
            (ChapterOutcome::NeedsReview, Some(reason.to_string()))
        }
        PipelineOutcome::Exhausted(reason) => (ChapterOutcome::Failed, Some(reason.to_string())),
        PipelineOutcome::Cancelled => (ChapterOutcome::Cancelled, None),
    };
    ChapterResult {
        chapter_number: run.chapter_number,
        outcome,
        quality_score: run.quality_score(),
        attempts: run.attempts,
        credits_charged: run.credits_charged,
        message,
    }
}

fn exit_for(status: JobStatus) -> JobExit {
    match status {
        JobStatus::Paused => JobExit::Paused,
        JobStatus::Completed => JobExit::Completed,
        _ => JobExit::Cancelled,
    }
}

impl Inner {
    fn lock_rows(&self) -> Result<MutexGuard<'_, ()>, OrchestrationError> {
        self.rows
            .lock()
            .map_err(|_| OrchestrationError::Store(StoreError::LockPoisoned))
    }

    fn require_job(&self, job_id: &str) -> Result<GenerationJob, OrchestrationError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| OrchestrationError::JobNotFound(job_id.to_string()))
    }

    fn require_project(&self, project_id: &str) -> Result<Project, OrchestrationError> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| OrchestrationError::ProjectNotFound(project_id.to_string()))
    }

    fn reporter(&self, job_id: &str, percentage: u8) -> ProgressReporter {
        ProgressReporter::new(Arc::clone(&self.bus), job_id, percentage)
    }

    /// Apply `f` to the stored job and write it back. Nothing is written
    /// when `f` fails.
    fn update_job<T>(
        &self,
        job_id: &str,
        f: impl FnOnce(&mut GenerationJob) -> Result<T, OrchestrationError>,
    ) -> Result<(T, GenerationJob), OrchestrationError> {
        let _rows = self.lock_rows()?;
        let mut job = self.require_job(job_id)?;
        let out = f(&mut job)?;
        self.store.put_job(&job)?;
        Ok((out, job))
    }

    /// Check the single-active-job rule and persist a new job.
    fn admit(
        &self,
        user_id: &str,
        project_id: &str,
        settings: JobSettings,
        chapter: Option<u32>,
    ) -> Result<Admission, OrchestrationError> {
        let _rows = self.lock_rows()?;
        let mut project = self.require_project(project_id)?;
        if let Some(active) = self.store.active_jobs(project_id)?.into_iter().next() {
            warn!(project_id, active_job = %active.id, "Start rejected: project busy");
            return Err(OrchestrationError::Conflict {
                project_id: project_id.to_string(),
                job_id: active.id,
            });
        }

        let mut job = match chapter {
            Some(n) => GenerationJob::single_chapter(project_id, user_id, settings, n),
            None => GenerationJob::auto_complete(project_id, user_id, settings),
        };

        match GenerationContext::build(&project, &settings, user_id, &self.config) {
            Ok(ctx) => {
                if job.job_type == JobType::AutoCompleteBook {
                    project.apply_settings(&settings);
                    self.store.put_project(&project)?;
                }
                job.transition(JobStatus::Running)?;
                job.set_message("Started");
                self.store.put_job(&job)?;
                Ok(Admission::Started(job, ctx.shared()))
            }
            Err(reason) => {
                job.transition(JobStatus::Failed)?;
                job.failure_reason = Some(reason.to_string());
                self.store.put_job(&job)?;
                Ok(Admission::Rejected(job, reason))
            }
        }
    }

    async fn run_job(
        self: Arc<Self>,
        job_id: JobId,
        ctx: SharedContext,
        signals: RunSignals,
    ) -> JobExit {
        let done = signals.done.clone().drop_guard();
        let exit = match self.drive_job(&job_id, &ctx, &signals).await {
            Ok(exit) => exit,
            Err(e) => {
                error!(job_id = %job_id, class = %e.class(), error = %e, "Job failed");
                self.fail_job(&job_id, &e.to_string());
                JobExit::Failed(e)
            }
        };
        drop(done);
        // Forget every run that has exited, this one included.
        self.runs.lock().await.retain(|_, s| !s.done.is_cancelled());
        debug!(job_id = %job_id, exit = ?exit, "Job task exited");
        exit
    }

    async fn drive_job(
        &self,
        job_id: &str,
        ctx: &GenerationContext,
        signals: &RunSignals,
    ) -> Result<JobExit, OrchestrationError> {
        let chapters = self.store.list_chapters(&ctx.project_id)?;
        let hydrated = self
            .pipeline
            .tracker()
            .hydrate(&ctx.project_id, &chapters)
            .map_err(PipelineError::from)?;
        debug!(job_id, entries = hydrated, "Pattern tracker hydrated");

        loop {
            if signals.cancel.is_cancelled() {
                return Ok(JobExit::Cancelled);
            }
            if signals.pause.is_cancelled() {
                return Ok(JobExit::Paused);
            }
            let job = self.require_job(job_id)?;
            match job.status {
                JobStatus::Running => {}
                JobStatus::Paused | JobStatus::Cancelled => return Ok(exit_for(job.status)),
                _ => return Err(invalid_state(&job, "run")),
            }
            let Some(chapter) = job.current_chapter() else {
                return self.complete_job(job_id);
            };
            let progress = self.reporter(job_id, job.progress_percent());

            if job.job_type == JobType::AutoCompleteBook {
                let existing = self
                    .store
                    .get_chapter(&ctx.project_id, chapter)?
                    .filter(|c| c.is_complete());
                if let Some(existing) = existing {
                    let job = self.record_chapter(
                        job_id,
                        ChapterResult {
                            chapter_number: chapter,
                            outcome: ChapterOutcome::Skipped,
                            quality_score: existing.quality_score,
                            attempts: 0,
                            credits_charged: 0,
                            message: Some("already complete".into()),
                        },
                    )?;
                    info!(job_id, chapter, "Chapter already complete; skipped");
                    progress.at(job.progress_percent()).emit(
                        ProgressStage::ChapterSkipped,
                        Some(chapter),
                        format!("Chapter {chapter} already complete"),
                    );
                    continue;
                }
            }

            let run = match self
                .pipeline
                .run(ctx, chapter, &signals.cancel, &progress)
                .await
            {
                Ok(run) => run,
                Err(PipelineError::InsufficientCredits {
                    required,
                    available,
                    credits_charged,
                }) => {
                    return self.out_of_credits(
                        job_id,
                        chapter,
                        OrchestrationError::InsufficientCredits {
                            required,
                            available,
                        },
                        credits_charged,
                    );
                }
                Err(e) => return Err(e.into()),
            };

            let result = chapter_result(&run);
            let outcome = result.outcome;
            let job = self.record_chapter(job_id, result)?;
            let progress = progress.at(job.progress_percent());
            match &run.outcome {
                PipelineOutcome::Integrated => progress.emit(
                    ProgressStage::Integrated,
                    Some(chapter),
                    format!(
                        "Chapter {chapter} integrated with score {:.1}",
                        run.quality_score().unwrap_or_default()
                    ),
                ),
                PipelineOutcome::Exhausted(reason) => progress.emit(
                    ProgressStage::Exhausted,
                    Some(chapter),
                    format!("Chapter {chapter} kept for review: {reason}"),
                ),
                PipelineOutcome::Cancelled => return Ok(JobExit::Cancelled),
            }

            if self.config.pipeline.stop_on_failure
                && outcome != ChapterOutcome::Ok
                && job.current_chapter().is_some()
            {
                let err = OrchestrationError::ChapterFailed { chapter, outcome };
                warn!(job_id, chapter, outcome = %outcome, "Stopping job on chapter failure");
                self.fail_job(job_id, &err.to_string());
                return Ok(JobExit::Failed(err));
            }
        }
    }

    fn record_chapter(
        &self,
        job_id: &str,
        result: ChapterResult,
    ) -> Result<GenerationJob, OrchestrationError> {
        let message = format!("Chapter {} {}", result.chapter_number, result.outcome);
        self.update_job(job_id, |job| {
            job.record_result(result);
            job.set_message(message);
            Ok(())
        })
        .map(|(_, job)| job)
    }

    fn complete_job(&self, job_id: &str) -> Result<JobExit, OrchestrationError> {
        let (completed, job) = self.update_job(job_id, |job| {
            if job.status != JobStatus::Running {
                return Ok(false);
            }
            job.transition(JobStatus::Completed)?;
            let review = job
                .results
                .iter()
                .filter(|r| r.outcome != ChapterOutcome::Ok && r.outcome != ChapterOutcome::Skipped)
                .count();
            job.set_message(format!(
                "{} chapters processed, {review} need review",
                job.results.len()
            ));
            Ok(true)
        })?;

        if completed {
            info!(
                job_id,
                chapters = job.results.len(),
                credits = job.aggregate_cost,
                "Job completed"
            );
            self.reporter(job_id, job.progress_percent()).emit(
                ProgressStage::Completed,
                None,
                job.last_message.clone().unwrap_or_default(),
            );
        }
        Ok(exit_for(job.status))
    }

    /// A chapter could not be paid for. Without earlier progress the job
    /// fails; otherwise it pauses and `resume` re-runs the same chapter.
    fn out_of_credits(
        &self,
        job_id: &str,
        chapter: u32,
        err: OrchestrationError,
        credits_charged: u64,
    ) -> Result<JobExit, OrchestrationError> {
        let reason = err.to_string();
        let (moved, job) = self.update_job(job_id, |job| {
            job.aggregate_cost += credits_charged;
            if job.status != JobStatus::Running {
                return Ok(None);
            }
            if job.has_prior_progress() {
                job.transition(JobStatus::Paused)?;
                job.set_message(format!("Paused at chapter {chapter}: {reason}"));
            } else {
                job.transition(JobStatus::Failed)?;
                job.failure_reason = Some(reason.clone());
            }
            Ok(Some(job.status))
        })?;

        let progress = self.reporter(job_id, job.progress_percent());
        match moved {
            Some(JobStatus::Paused) => {
                warn!(job_id, chapter, error = %reason, "Job paused: insufficient credits");
                progress.emit(
                    ProgressStage::Paused,
                    Some(chapter),
                    format!("Paused at chapter {chapter}: {reason}"),
                );
                Ok(JobExit::Paused)
            }
            Some(_) => {
                warn!(job_id, chapter, error = %reason, "Job failed: insufficient credits");
                progress.emit(ProgressStage::Failed, Some(chapter), reason);
                Ok(JobExit::Failed(err))
            }
            None => Ok(exit_for(job.status)),
        }
    }

    /// Mark a running job failed. Best effort: the caller is already on an
    /// error path.
    fn fail_job(&self, job_id: &str, reason: &str) {
        let result = self.update_job(job_id, |job| {
            if job.status != JobStatus::Running {
                return Ok(false);
            }
            job.transition(JobStatus::Failed)?;
            job.failure_reason = Some(reason.to_string());
            Ok(true)
        });
        match result {
            Ok((true, job)) => self.reporter(job_id, job.progress_percent()).emit(
                ProgressStage::Failed,
                job.current_chapter(),
                reason,
            ),
            Ok((false, _)) => {}
            Err(e) => error!(job_id, error = %e, "Failed to record job failure"),
        }
    }
}
