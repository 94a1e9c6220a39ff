//! Shared fixtures: a scripted completion provider, a mockall provider and
//! an orchestrator wired to in-memory collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coordination::ledger::{CreditLedger, SharedLedger, TransactionKind};
use coordination::provider::{
    CallKind, Completion, CompletionProvider, CompletionRequest, ProviderError, SharedProvider,
    TokenUsage,
};
use coordination::resilience::RetryPolicy;
use coordination::state::{JobSettings, MemoryStore, Project, SharedDocumentStore};
use manuscript_agents::{GeneratorConfig, JobOrchestrator};
use mockall::mock;
use tokio::sync::{Notify, Semaphore};

pub const USER: &str = "writer-1";
pub const WORDS: u32 = 100;

/// Metered cost of each call the scripted provider answers.
pub fn cost_of(kind: CallKind) -> u64 {
    match kind {
        CallKind::Planning => 2,
        CallKind::Drafting => 3,
        CallKind::Refining => 3,
        CallKind::Evaluation => 1,
    }
}

/// Usage that prices at exactly `credits` under the default cost model.
fn usage_for(credits: u64) -> TokenUsage {
    TokenUsage::new((credits * 1000) as u32, 0)
}

pub const BLUEPRINT: &str = r#"{
  "scene_goals": ["Reach the ferry before dawn"],
  "plot_advancements": ["The map is stolen", "Ilse learns who drew it"],
  "character_constraints": ["Ilse never lies outright"]
}"#;

/// Evaluator verdict with every category at `score`.
pub fn verdict(score: f64) -> String {
    format!(
        r#"{{"scores":{{"prose":{score},"character":{score},"structure":{score},"engagement":{score},"technical_accuracy":{score}}},"plot_advancements":2,"notes":[]}}"#
    )
}

/// Draft text of exactly `words` words whose tokens are unique to `seed`.
pub fn prose(seed: usize, words: u32) -> String {
    let mut out = String::new();
    for i in 0..words {
        if i > 0 {
            out.push_str(if i % 50 == 0 { "\n\n" } else { " " });
        }
        out.push_str(&format!("d{seed}w{i}"));
        if i % 10 == 9 {
            out.push('.');
        }
    }
    out
}

/// Holds the first call of one kind until released.
pub struct Gate {
    pub arrived: Notify,
    release: Semaphore,
}

impl Gate {
    pub fn open(&self) {
        self.release.add_permits(1);
    }
}

#[derive(Default)]
struct Script {
    evaluations: VecDeque<Result<String, ProviderError>>,
    failures: HashMap<CallKind, VecDeque<ProviderError>>,
    scheduled: HashMap<(CallKind, usize), ProviderError>,
    holds: HashMap<CallKind, Arc<Gate>>,
    requests: Vec<CompletionRequest>,
    texts: Vec<String>,
}

/// Provider answering by call kind. Evaluations follow the queued
/// verdicts and pass at 9.0 once the queue is empty.
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<Script>,
    words: u32,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            words: WORDS,
            ..Self::default()
        }
    }

    pub fn with_scores(self, scores: &[f64]) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            script
                .evaluations
                .extend(scores.iter().map(|s| Ok(verdict(*s))));
        }
        self
    }

    pub fn push_evaluation(&self, reply: Result<String, ProviderError>) {
        self.script.lock().unwrap().evaluations.push_back(reply);
    }

    /// Fail the next `times` calls of `kind` with `err`.
    pub fn fail(&self, kind: CallKind, err: ProviderError, times: usize) {
        let mut script = self.script.lock().unwrap();
        let queue = script.failures.entry(kind).or_default();
        queue.extend(std::iter::repeat(err).take(times));
    }

    /// Fail only the `nth` call of `kind` (1-based) with `err`.
    pub fn fail_at(&self, kind: CallKind, nth: usize, err: ProviderError) {
        self.script
            .lock()
            .unwrap()
            .scheduled
            .insert((kind, nth), err);
    }

    pub fn hold(&self, kind: CallKind) -> Arc<Gate> {
        let gate = Arc::new(Gate {
            arrived: Notify::new(),
            release: Semaphore::new(0),
        });
        self.script
            .lock()
            .unwrap()
            .holds
            .insert(kind, Arc::clone(&gate));
        gate
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    pub fn kinds(&self) -> Vec<CallKind> {
        self.requests().iter().map(|r| r.kind).collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }

    /// Every draft or revision handed out, in order.
    pub fn texts(&self) -> Vec<String> {
        self.script.lock().unwrap().texts.clone()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let gate = {
            let mut script = self.script.lock().unwrap();
            script.requests.push(request.clone());
            script.holds.remove(&request.kind)
        };
        if let Some(gate) = gate {
            gate.arrived.notify_one();
            let _permit = gate.release.acquire().await.unwrap();
        }

        let mut script = self.script.lock().unwrap();
        let nth = script
            .requests
            .iter()
            .filter(|r| r.kind == request.kind)
            .count();
        if let Some(err) = script.scheduled.remove(&(request.kind, nth)) {
            return Err(err);
        }
        if let Some(err) = script
            .failures
            .get_mut(&request.kind)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let text = match request.kind {
            CallKind::Planning => BLUEPRINT.to_string(),
            CallKind::Drafting | CallKind::Refining => {
                let text = prose(script.texts.len(), self.words);
                script.texts.push(text.clone());
                text
            }
            CallKind::Evaluation => script
                .evaluations
                .pop_front()
                .unwrap_or_else(|| Ok(verdict(9.0)))?,
        };
        Ok(Completion {
            text,
            usage: usage_for(cost_of(request.kind)),
            model: "scripted".into(),
        })
    }
}

mock! {
    pub Provider {}

    #[async_trait]
    impl CompletionProvider for Provider {
        fn name(&self) -> &'static str;
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
    }
}

/// Fast retries, three refinement passes.
pub fn test_config() -> GeneratorConfig {
    let mut config = GeneratorConfig::default();
    config.pipeline.max_retries = 3;
    config.pipeline.chapter_deadline_secs = 300;
    config.pipeline.max_evaluation_attempts = 3;
    config.pipeline.stop_on_failure = false;
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 10,
        factor: 2.0,
        max_delay_ms: 50,
    };
    config
}

pub fn settings(chapters: u32) -> JobSettings {
    JobSettings {
        target_chapters: chapters,
        words_per_chapter: WORDS,
        quality_threshold: 80,
    }
}

pub struct Harness {
    pub orchestrator: JobOrchestrator,
    pub store: SharedDocumentStore,
    pub ledger: SharedLedger,
    pub project: Project,
}

impl Harness {
    pub fn new(provider: SharedProvider, deposit: u64) -> Self {
        Self::with_config(provider, deposit, test_config())
    }

    pub fn with_config(provider: SharedProvider, deposit: u64, config: GeneratorConfig) -> Self {
        let store = MemoryStore::new().shared();
        let ledger = CreditLedger::new().shared();
        if deposit > 0 {
            ledger.deposit(USER, deposit).unwrap();
        }
        let mut project = Project::new(
            USER,
            "The Salt Road",
            "fantasy",
            "A courier carries a map nobody can read.",
        )
        .with_style_guide("Close third person, past tense.");
        project.quality_threshold = 80;
        project.target_words_per_chapter = WORDS;
        store.put_project(&project).unwrap();

        let orchestrator = JobOrchestrator::new(
            provider,
            Arc::clone(&store),
            Arc::clone(&ledger),
            config,
        )
        .unwrap();
        Self {
            orchestrator,
            store,
            ledger,
            project,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project.id
    }

    pub fn commits(&self) -> Vec<u64> {
        self.ledger
            .transactions(USER)
            .unwrap()
            .into_iter()
            .filter(|tx| tx.kind == TransactionKind::Commit)
            .map(|tx| tx.amount)
            .collect()
    }

    pub fn rollbacks(&self) -> usize {
        self.ledger
            .transactions(USER)
            .unwrap()
            .into_iter()
            .filter(|tx| tx.kind == TransactionKind::Rollback)
            .count()
    }
}
