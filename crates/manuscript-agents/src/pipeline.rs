//! Generation pipeline: drives one chapter from blueprint to a gate decision.
//!
//! ```text
//! Planning ─► Drafting ─► Assessing ─┬─ gate passed ──────────► Integrated
//!                             ▲      └─ gate failed ─► Refining ─┐
//!                             └──────────────────────────────────┘
//!            (retry budget, transient failure or deadline) ─► Exhausted
//!            (cancel token, checked between stages) ─────────► Cancelled
//! ```
//!
//! Every provider call is reserved before it is sent. Failed calls and
//! unusable verdicts are rolled back at once; everything that succeeded is
//! committed as one batch when the chapter reaches a terminal state, so a
//! chapter appears exactly once in the user's ledger.

use std::sync::Arc;
use std::time::Duration;

use coordination::events::{ProgressEvent, ProgressStage, SharedProgressBus};
use coordination::freshness::{FreshnessReport, PatternTracker};
use coordination::ledger::{
    ChargeTag, CostModel, CreditLedger, ReservationId, Settlement, SharedLedger,
};
use coordination::provider::{
    CallKind, Completion, CompletionRequest, ProviderError, SharedProvider, TokenUsage,
};
use coordination::quality::{AssessmentResult, QualityScorer};
use coordination::resilience::{retry_transient, HealthLevel, ProviderHealth, RetryPolicy};
use coordination::state::{Chapter, ChapterStage, JobId, SharedDocumentStore};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{GeneratorConfig, PipelineConfig};
use crate::context::GenerationContext;
use crate::errors::{ErrorClass, PipelineError};
use crate::prompts::{self, ChapterPlan};
use crate::state_machine::{ChapterState, ChapterStateMachine, TransitionRecord};

/// Why a chapter stopped without passing the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExhaustReason {
    /// Every refinement pass was spent.
    RetriesExhausted,
    /// A provider call kept failing transiently.
    TransientFailure(String),
    /// The provider refused or garbled a call (bad request, unparseable body).
    ProviderRejected(String),
    /// No usable evaluator verdict could be obtained.
    ScorerUnavailable(String),
    /// The chapter's soft deadline passed.
    DeadlineExceeded,
}

impl ExhaustReason {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RetriesExhausted => ErrorClass::Quality,
            _ => ErrorClass::Transient,
        }
    }
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted => write!(f, "refinement budget exhausted"),
            Self::TransientFailure(e) => write!(f, "provider kept failing: {e}"),
            Self::ProviderRejected(e) => write!(f, "provider rejected the call: {e}"),
            Self::ScorerUnavailable(e) => write!(f, "scorer unavailable: {e}"),
            Self::DeadlineExceeded => write!(f, "chapter deadline exceeded"),
        }
    }
}

/// How a chapter run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Integrated,
    Exhausted(ExhaustReason),
    Cancelled,
}

/// Result of one chapter run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterRun {
    pub chapter_number: u32,
    pub chapter_id: String,
    pub outcome: PipelineOutcome,
    /// Text that was persisted: the passing attempt, or the best one.
    pub content: Option<String>,
    /// Assessment of the persisted attempt.
    pub assessment: Option<AssessmentResult>,
    pub freshness: Option<FreshnessReport>,
    /// Drafting plus refinement calls that produced text.
    pub attempts: u32,
    pub credits_charged: u64,
    pub transitions: Vec<TransitionRecord>,
}

impl ChapterRun {
    pub fn quality_score(&self) -> Option<f64> {
        self.assessment.as_ref().map(|a| a.aggregate)
    }

    pub fn needs_review(&self) -> bool {
        matches!(self.outcome, PipelineOutcome::Exhausted(_))
    }
}

/// Publishes stage events for one job at a fixed job percentage.
#[derive(Clone)]
pub struct ProgressReporter {
    bus: SharedProgressBus,
    job_id: JobId,
    percentage: u8,
}

impl ProgressReporter {
    pub fn new(bus: SharedProgressBus, job_id: impl Into<JobId>, percentage: u8) -> Self {
        Self {
            bus,
            job_id: job_id.into(),
            percentage,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn percentage(&self) -> u8 {
        self.percentage
    }

    pub fn at(&self, percentage: u8) -> Self {
        Self {
            percentage,
            ..self.clone()
        }
    }

    pub fn emit(&self, stage: ProgressStage, chapter: Option<u32>, message: impl Into<String>) {
        let mut event = ProgressEvent::new(self.job_id.clone(), stage, self.percentage, message);
        if let Some(n) = chapter {
            event = event.for_chapter(n);
        }
        if let Err(e) = self.bus.publish(event) {
            warn!(job_id = %self.job_id, stage = %stage, error = %e, "Failed to publish progress");
        }
    }
}

/// Reservations of one chapter, settled together.
struct ChapterMeter<'a> {
    ledger: &'a CreditLedger,
    costs: &'a CostModel,
    user_id: &'a str,
    tag: ChargeTag,
    settlements: Vec<Settlement>,
}

impl<'a> ChapterMeter<'a> {
    fn new(ledger: &'a CreditLedger, costs: &'a CostModel, user_id: &'a str, tag: ChargeTag) -> Self {
        Self {
            ledger,
            costs,
            user_id,
            tag,
            settlements: Vec::new(),
        }
    }

    fn reserve(&self, kind: CallKind, target_words: u32) -> Result<ReservationId, PipelineError> {
        let estimate = self.costs.estimate_call(kind, target_words);
        Ok(self
            .ledger
            .reserve(self.user_id, estimate, self.tag.clone().with_call(kind))?)
    }

    fn settle(&mut self, id: &str, usage: TokenUsage) -> u64 {
        let cost = self.costs.cost_of(usage);
        self.settlements.push(Settlement::new(id, cost));
        cost
    }

    fn release(&self, id: &str) {
        if let Err(e) = self.ledger.rollback(id) {
            warn!(reservation_id = id, error = %e, "Failed to roll back reservation");
        }
    }

    /// Drop a settled call from the batch and roll it back.
    fn void(&mut self, id: &str) {
        self.settlements.retain(|s| s.reservation_id != id);
        self.release(id);
    }

    /// Roll back every settled call. Returns how many were dropped.
    fn void_all(&mut self) -> usize {
        let settlements = std::mem::take(&mut self.settlements);
        for s in &settlements {
            self.release(&s.reservation_id);
        }
        settlements.len()
    }

    fn metered(&self) -> u64 {
        self.settlements.iter().map(|s| s.actual_cost).sum()
    }

    /// Commit every settled call as one entry. Returns the amount charged.
    fn commit(&mut self) -> Result<u64, PipelineError> {
        if self.settlements.is_empty() {
            return Ok(0);
        }
        let tx = self.ledger.commit_batch(&self.settlements, self.tag.clone())?;
        self.settlements.clear();
        Ok(tx.amount)
    }
}

/// A successful, metered call
struct MeteredCall {
    completion: Completion,
    reservation_id: ReservationId,
}

/// A scored attempt
struct Attempt {
    number: u32,
    text: String,
    assessment: AssessmentResult,
    freshness: FreshnessReport,
}

impl Attempt {
    fn failure_reasons(&self, ctx: &GenerationContext) -> Vec<String> {
        let mut reasons = self.assessment.failure_reasons(ctx.quality_threshold);
        if !self.freshness.passes(ctx.min_freshness) {
            reasons.push(format!(
                "freshness {:.1} below {:.1} ({} repeated spans)",
                self.freshness.score,
                ctx.min_freshness,
                self.freshness.flagged.len()
            ));
        }
        reasons
    }
}

enum Evaluation {
    Scored(AssessmentResult),
    Unavailable(String),
}

enum Finish {
    Integrated(Attempt),
    Exhausted(ExhaustReason),
    Cancelled,
}

struct RunState<'a> {
    sm: ChapterStateMachine,
    meter: ChapterMeter<'a>,
    record: Chapter,
    /// Highest-scoring attempt so far; ties keep the earlier one.
    best: Option<Attempt>,
    /// Latest text, scored or not.
    latest: Option<String>,
    attempts: u32,
    deadline: Instant,
}

impl RunState<'_> {
    fn keep_best(&mut self, attempt: Attempt) {
        let replace = self
            .best
            .as_ref()
            .map_or(true, |b| attempt.assessment.aggregate > b.assessment.aggregate);
        if replace {
            self.best = Some(attempt);
        } else {
            debug!(
                chapter = self.sm.chapter(),
                attempt = attempt.number,
                aggregate = attempt.assessment.aggregate,
                "Attempt did not beat the best so far"
            );
        }
    }
}

/// Per-chapter pipeline. Stateless between runs; share it behind an `Arc`.
pub struct ChapterPipeline {
    provider: SharedProvider,
    ledger: SharedLedger,
    store: SharedDocumentStore,
    tracker: Arc<PatternTracker>,
    scorer: QualityScorer,
    costs: CostModel,
    retry: RetryPolicy,
    health: ProviderHealth,
    config: PipelineConfig,
    call_timeout: Duration,
}

impl ChapterPipeline {
    pub fn new(
        provider: SharedProvider,
        ledger: SharedLedger,
        store: SharedDocumentStore,
        tracker: Arc<PatternTracker>,
        config: &GeneratorConfig,
    ) -> Self {
        Self {
            health: ProviderHealth::new(provider.name()),
            scorer: QualityScorer::new(config.heuristics.clone()),
            costs: config.costs.clone(),
            retry: config.retry.clone(),
            config: config.pipeline.clone(),
            call_timeout: config.provider.timeout,
            provider,
            ledger,
            store,
            tracker,
        }
    }

    pub fn health(&self) -> &ProviderHealth {
        &self.health
    }

    pub fn tracker(&self) -> &Arc<PatternTracker> {
        &self.tracker
    }

    /// Credits the first pass of a chapter (plan, draft, one evaluation) is
    /// expected to cost. A chapter does not start below this balance.
    pub fn first_pass_estimate(&self, target_words: u32) -> u64 {
        [CallKind::Planning, CallKind::Drafting, CallKind::Evaluation]
            .iter()
            .map(|kind| self.costs.estimate_call(*kind, target_words))
            .sum()
    }

    /// Generate chapter `chapter_number` and persist the result.
    ///
    /// Quality exhaustion and non-credential provider failures come back as
    /// `Ok` with an `Exhausted` outcome. `Err` means the chapter could not be
    /// run at all. When the balance ran out, calls that already succeeded are
    /// committed and reported in the error; a fatal error (credentials,
    /// store) rolls them back.
    pub async fn run(
        &self,
        ctx: &GenerationContext,
        chapter_number: u32,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<ChapterRun, PipelineError> {
        let required = self.first_pass_estimate(ctx.target_words);
        let available = self.ledger.balance(&ctx.user_id)?.available;
        if available < required {
            warn!(
                job_id = progress.job_id(),
                chapter = chapter_number,
                required,
                available,
                "Chapter not started: insufficient credits"
            );
            return Err(PipelineError::InsufficientCredits {
                required,
                available,
                credits_charged: 0,
            });
        }

        let record = self
            .store
            .get_chapter(&ctx.project_id, chapter_number)?
            .unwrap_or_else(|| Chapter::new(ctx.project_id.clone(), chapter_number));
        let tag = ChargeTag::chapter(Some(progress.job_id().to_string()), record.id.clone());

        let mut state = RunState {
            sm: ChapterStateMachine::new(chapter_number),
            meter: ChapterMeter::new(&self.ledger, &self.costs, &ctx.user_id, tag),
            record,
            best: None,
            latest: None,
            attempts: 0,
            deadline: Instant::now() + self.config.chapter_deadline(),
        };

        info!(
            job_id = progress.job_id(),
            project_id = %ctx.project_id,
            chapter = chapter_number,
            target_words = ctx.target_words,
            threshold = ctx.quality_threshold,
            "Chapter run started"
        );

        let finish = match self.drive(ctx, &mut state, cancel, progress).await {
            Ok(finish) => finish,
            Err(PipelineError::Provider(e)) if e.is_transient() => {
                Finish::Exhausted(ExhaustReason::TransientFailure(e.to_string()))
            }
            Err(PipelineError::Provider(e)) if !e.is_fatal() => {
                warn!(chapter = chapter_number, error = %e, "Provider rejected a call; chapter exhausted");
                Finish::Exhausted(ExhaustReason::ProviderRejected(e.to_string()))
            }
            Err(e) => return Err(self.abort(&mut state, e)),
        };
        self.finish(ctx, state, finish, progress)
    }

    async fn drive(
        &self,
        ctx: &GenerationContext,
        state: &mut RunState<'_>,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<Finish, PipelineError> {
        let chapter = state.sm.chapter();

        // ── Planning ──
        if let Some(finish) = self.checkpoint(state, cancel) {
            return Ok(finish);
        }
        progress.emit(
            ProgressStage::Planning,
            Some(chapter),
            format!("Planning chapter {chapter}"),
        );
        let previous_tail = self.previous_tail(ctx, chapter)?;
        let planned = self
            .invoke(
                &mut state.meter,
                prompts::planning_request(ctx, chapter, previous_tail.as_deref()),
                ctx.target_words,
            )
            .await?;
        let plan = ChapterPlan::from_planner_output(&planned.completion.text);
        if !plan.is_structured() {
            warn!(
                chapter,
                "Blueprint unparseable or lists too few plot advancements; drafting from raw plan"
            );
        }

        // ── Drafting ──
        if let Some(finish) = self.checkpoint(state, cancel) {
            return Ok(finish);
        }
        state.sm.advance(ChapterState::Drafting, None)?;
        progress.emit(
            ProgressStage::Drafting,
            Some(chapter),
            format!("Drafting chapter {chapter}"),
        );
        let drafted = self
            .invoke(
                &mut state.meter,
                prompts::draft_request(ctx, chapter, &plan),
                ctx.target_words,
            )
            .await?;
        let mut current = drafted.completion.text;
        state.attempts += 1;
        self.save_progress(state, &current, ChapterStage::Draft)?;

        loop {
            // ── Assessing ──
            if let Some(finish) = self.checkpoint(state, cancel) {
                return Ok(finish);
            }
            state.sm.advance(ChapterState::Assessing, None)?;
            progress.emit(
                ProgressStage::Assessing,
                Some(chapter),
                format!("Assessing chapter {chapter}, attempt {}", state.attempts),
            );

            let (evaluation, freshness) = tokio::join!(
                self.evaluate(ctx, &mut state.meter, chapter, &plan, &current, state.deadline),
                async { self.tracker.check_freshness(&current, &ctx.project_id, chapter) }
            );
            let freshness = freshness?;
            let assessment = match evaluation? {
                Evaluation::Scored(assessment) => assessment,
                Evaluation::Unavailable(reason) => {
                    return Ok(Finish::Exhausted(ExhaustReason::ScorerUnavailable(reason)));
                }
            };

            let passed = assessment.passes(ctx.quality_threshold)
                && freshness.passes(ctx.min_freshness);
            info!(
                job_id = progress.job_id(),
                chapter,
                attempt = state.attempts,
                aggregate = assessment.aggregate,
                freshness = freshness.score,
                hard_failures = assessment.hard_failures.len(),
                passed,
                "Gate decision"
            );

            let attempt = Attempt {
                number: state.attempts,
                text: current,
                assessment,
                freshness,
            };
            if passed {
                return Ok(Finish::Integrated(attempt));
            }
            let reasons = attempt.failure_reasons(ctx).join("; ");
            state.keep_best(attempt);

            if state.sm.retry() >= ctx.max_retries {
                return Ok(Finish::Exhausted(ExhaustReason::RetriesExhausted));
            }

            // ── Refining ──
            if let Some(finish) = self.checkpoint(state, cancel) {
                return Ok(finish);
            }
            let Some(best) = state.best.as_ref() else {
                return Ok(Finish::Exhausted(ExhaustReason::RetriesExhausted));
            };
            let request = prompts::refine_request(
                ctx,
                chapter,
                &plan,
                &best.text,
                &best.assessment,
                &best.freshness,
            );
            state.sm.advance(ChapterState::Refining, Some(&reasons))?;
            progress.emit(
                ProgressStage::Refining,
                Some(chapter),
                format!(
                    "Refining chapter {chapter} ({}/{}): {reasons}",
                    state.sm.retry(),
                    ctx.max_retries
                ),
            );
            let refined = self
                .invoke(&mut state.meter, request, ctx.target_words)
                .await?;
            current = refined.completion.text;
            state.attempts += 1;
            self.save_progress(state, &current, ChapterStage::Revision)?;
        }
    }

    /// Evaluate one attempt, retrying the evaluation (never the draft) when
    /// the call fails or the verdict cannot be parsed. Failed evaluations are
    /// not charged. No new attempt starts after `deadline`.
    async fn evaluate(
        &self,
        ctx: &GenerationContext,
        meter: &mut ChapterMeter<'_>,
        chapter: u32,
        plan: &ChapterPlan,
        draft: &str,
        deadline: Instant,
    ) -> Result<Evaluation, PipelineError> {
        let scoring = ctx.scoring();
        let attempts = self.config.max_evaluation_attempts.max(1);
        let mut last_error = String::from("no evaluation attempted");

        for attempt in 1..=attempts {
            if attempt > 1 && Instant::now() >= deadline {
                warn!(chapter, attempt, "Chapter deadline passed; no further evaluation");
                last_error = format!("{last_error}; chapter deadline exceeded");
                break;
            }
            let request = prompts::evaluation_request(ctx, chapter, plan, draft);
            let call = match self.invoke(meter, request, ctx.target_words).await {
                Ok(call) => call,
                Err(PipelineError::Provider(e)) if !e.is_fatal() => {
                    warn!(chapter, attempt, error = %e, "Evaluation call failed; not charged");
                    last_error = e.to_string();
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.scorer.assess(draft, &call.completion.text, &scoring) {
                Ok(assessment) => return Ok(Evaluation::Scored(assessment)),
                Err(e) => {
                    meter.void(&call.reservation_id);
                    warn!(chapter, attempt, error = %e, "Evaluator verdict unusable; not charged");
                    last_error = e.to_string();
                }
            }
        }
        Ok(Evaluation::Unavailable(last_error))
    }

    /// Reserve, call with transient retries under the hard timeout, then
    /// settle or roll back.
    async fn invoke(
        &self,
        meter: &mut ChapterMeter<'_>,
        request: CompletionRequest,
        target_words: u32,
    ) -> Result<MeteredCall, PipelineError> {
        let reservation_id = meter.reserve(request.kind, target_words)?;
        let label = request.kind.to_string();
        let provider = &self.provider;
        let timeout = self.call_timeout;
        let request = &request;

        let result = retry_transient(&self.retry, Some(&self.health), &label, move |attempt| async move {
            debug!(call = %request.kind, attempt, "Calling provider");
            match tokio::time::timeout(timeout, provider.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(timeout)),
            }
        })
        .await;

        match result {
            Ok(completion) => {
                let cost = meter.settle(&reservation_id, completion.usage);
                debug!(
                    call = %request.kind,
                    prompt_tokens = completion.usage.prompt_tokens,
                    completion_tokens = completion.usage.completion_tokens,
                    cost,
                    "Call metered"
                );
                Ok(MeteredCall {
                    completion,
                    reservation_id,
                })
            }
            Err(e) => {
                meter.release(&reservation_id);
                let level = self.health.level();
                if level != HealthLevel::Healthy {
                    warn!(provider = self.provider.name(), level = ?level, error = %e, "Provider health degraded");
                }
                Err(PipelineError::Provider(e))
            }
        }
    }

    fn checkpoint(&self, state: &RunState<'_>, cancel: &CancellationToken) -> Option<Finish> {
        if cancel.is_cancelled() {
            return Some(Finish::Cancelled);
        }
        if Instant::now() >= state.deadline {
            return Some(Finish::Exhausted(ExhaustReason::DeadlineExceeded));
        }
        None
    }

    fn previous_tail(
        &self,
        ctx: &GenerationContext,
        chapter: u32,
    ) -> Result<Option<String>, PipelineError> {
        if chapter <= 1 {
            return Ok(None);
        }
        Ok(self
            .store
            .get_chapter(&ctx.project_id, chapter - 1)?
            .filter(|c| !c.content.trim().is_empty())
            .map(|c| prompts::tail_words(&c.content, prompts::CONTINUITY_TAIL_WORDS)))
    }

    fn save_progress(
        &self,
        state: &mut RunState<'_>,
        text: &str,
        stage: ChapterStage,
    ) -> Result<(), PipelineError> {
        state.latest = Some(text.to_string());
        state.record.set_content(text);
        state.record.stage = stage;
        state.record.retry_count = state.sm.retry();
        state.record.quality_score = None;
        state.record.needs_review = false;
        self.store.put_chapter(&state.record)?;
        Ok(())
    }

    /// Settle or roll back what succeeded and surface a run-stopping error.
    ///
    /// Fatal errors charge nothing. Running out of credits commits the calls
    /// that succeeded and reports the amount in the error.
    fn abort(&self, state: &mut RunState<'_>, err: PipelineError) -> PipelineError {
        if err.class() == ErrorClass::Fatal {
            let voided = state.meter.void_all();
            warn!(
                chapter = state.sm.chapter(),
                class = %err.class(),
                voided,
                error = %err,
                "Chapter run aborted; calls rolled back"
            );
            return err;
        }
        let metered = state.meter.metered();
        let charged = match state.meter.commit() {
            Ok(amount) => amount,
            Err(e) => {
                warn!(chapter = state.sm.chapter(), metered, error = %e, "Failed to commit calls of aborted chapter");
                0
            }
        };
        warn!(
            chapter = state.sm.chapter(),
            class = %err.class(),
            charged,
            error = %err,
            "Chapter run aborted"
        );
        match err {
            PipelineError::InsufficientCredits {
                required,
                available,
                ..
            } => PipelineError::InsufficientCredits {
                required,
                available,
                credits_charged: charged,
            },
            other => other,
        }
    }

    fn finish(
        &self,
        ctx: &GenerationContext,
        mut state: RunState<'_>,
        finish: Finish,
        progress: &ProgressReporter,
    ) -> Result<ChapterRun, PipelineError> {
        let chapter = state.sm.chapter();
        let (outcome, content, assessment, freshness) = match finish {
            Finish::Integrated(attempt) => {
                state.sm.advance(ChapterState::Integrated, Some("gate passed"))?;
                state.record.set_content(attempt.text.clone());
                state.record.stage = ChapterStage::Complete;
                state.record.quality_score = Some(attempt.assessment.aggregate);
                state.record.retry_count = state.sm.retry();
                state.record.needs_review = false;
                self.store.put_chapter(&state.record)?;
                self.tracker
                    .record(&ctx.project_id, chapter, &attempt.text)?;
                (
                    PipelineOutcome::Integrated,
                    Some(attempt.text),
                    Some(attempt.assessment),
                    Some(attempt.freshness),
                )
            }
            Finish::Exhausted(reason) => {
                state.sm.exhaust(&reason.to_string())?;
                let kept = match state.best.take() {
                    Some(best) => {
                        state.record.set_content(best.text.clone());
                        state.record.quality_score = Some(best.assessment.aggregate);
                        (Some(best.text), Some(best.assessment), Some(best.freshness))
                    }
                    None => (state.latest.take(), None, None),
                };
                if kept.0.is_some() {
                    state.record.stage = ChapterStage::Draft;
                    state.record.retry_count = state.sm.retry();
                    state.record.needs_review = true;
                    self.store.put_chapter(&state.record)?;
                }
                (PipelineOutcome::Exhausted(reason), kept.0, kept.1, kept.2)
            }
            Finish::Cancelled => {
                state.sm.cancel()?;
                let best = state.best.take();
                let content = best
                    .as_ref()
                    .map(|b| b.text.clone())
                    .or_else(|| state.latest.take());
                let (assessment, freshness) = match best {
                    Some(b) => (Some(b.assessment), Some(b.freshness)),
                    None => (None, None),
                };
                (PipelineOutcome::Cancelled, content, assessment, freshness)
            }
        };

        let credits_charged = state.meter.commit()?;
        info!(
            job_id = progress.job_id(),
            credits = credits_charged,
            "{}",
            state.sm.summary()
        );

        Ok(ChapterRun {
            chapter_number: chapter,
            chapter_id: state.record.id,
            outcome,
            content,
            assessment,
            freshness,
            attempts: state.attempts,
            credits_charged,
            transitions: state.sm.into_transitions(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coordination::events::ProgressBus;
    use coordination::provider::CompletionProvider;
    use coordination::state::{JobSettings, MemoryStore, Project};

    /// Answers every call after `delay`, one credit each.
    struct SlowProvider {
        delay: Duration,
    }

    #[async_trait]
    impl CompletionProvider for SlowProvider {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
            tokio::time::sleep(self.delay).await;
            let text = match request.kind {
                CallKind::Planning => r#"{"plot_advancements":["a","b"]}"#.to_string(),
                _ => "word ".repeat(100),
            };
            Ok(Completion {
                text,
                usage: TokenUsage::new(1000, 0),
                model: "slow".into(),
            })
        }
    }

    struct Fixture {
        pipeline: ChapterPipeline,
        ctx: GenerationContext,
        ledger: SharedLedger,
        store: SharedDocumentStore,
    }

    fn fixture(config: &GeneratorConfig, delay: Duration) -> Fixture {
        let store = MemoryStore::new().shared();
        let ledger = CreditLedger::new().shared();
        ledger.deposit("u1", 1000).unwrap();
        let project = Project::new("u1", "Tidewater", "fantasy", "A lighthouse keeper's ledger.");
        store.put_project(&project).unwrap();
        let settings = JobSettings {
            target_chapters: 2,
            words_per_chapter: 100,
            quality_threshold: 80,
        };
        let ctx = GenerationContext::build(&project, &settings, "u1", config).unwrap();
        let tracker = Arc::new(PatternTracker::new(config.freshness.clone()));
        let pipeline = ChapterPipeline::new(
            Arc::new(SlowProvider { delay }),
            Arc::clone(&ledger),
            Arc::clone(&store),
            tracker,
            config,
        );
        Fixture {
            pipeline,
            ctx,
            ledger,
            store,
        }
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(ProgressBus::new().shared(), "job-1", 0)
    }

    #[test]
    fn test_first_pass_estimate() {
        let f = fixture(&GeneratorConfig::default(), Duration::ZERO);
        // planning 3 + drafting 2 + evaluation 3 at 100 words
        assert_eq!(f.pipeline.first_pass_estimate(100), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_checked_between_stages() {
        let mut config = GeneratorConfig::default();
        config.pipeline.chapter_deadline_secs = 5;
        config.provider.timeout = Duration::from_secs(60);
        let f = fixture(&config, Duration::from_secs(3));

        let run = f
            .pipeline
            .run(&f.ctx, 1, &CancellationToken::new(), &reporter())
            .await
            .unwrap();

        assert_eq!(
            run.outcome,
            PipelineOutcome::Exhausted(ExhaustReason::DeadlineExceeded)
        );
        assert!(run.assessment.is_none());
        assert_eq!(run.attempts, 1);
        assert_eq!(run.credits_charged, 2);
        assert_eq!(
            run.transitions.last().map(|t| t.to),
            Some(ChapterState::Exhausted)
        );

        let chapter = f.store.get_chapter(&f.ctx.project_id, 1).unwrap().unwrap();
        assert!(chapter.needs_review);
        assert_eq!(chapter.stage, ChapterStage::Draft);
        assert_eq!(f.ledger.balance("u1").unwrap().committed, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_makes_no_calls() {
        let f = fixture(&GeneratorConfig::default(), Duration::ZERO);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = f.pipeline.run(&f.ctx, 1, &cancel, &reporter()).await.unwrap();

        assert_eq!(run.outcome, PipelineOutcome::Cancelled);
        assert_eq!(run.credits_charged, 0);
        assert!(run.content.is_none());
        assert_eq!(f.ledger.transactions("u1").unwrap().len(), 1);
    }

    #[test]
    fn test_exhaust_reason_wire_format() {
        let value = serde_json::to_value(ExhaustReason::ScorerUnavailable("no json".into())).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"reason": "scorer_unavailable", "detail": "no json"})
        );
        assert_eq!(ExhaustReason::RetriesExhausted.class(), ErrorClass::Quality);
        assert_eq!(
            ExhaustReason::DeadlineExceeded.class(),
            ErrorClass::Transient
        );
    }
}
