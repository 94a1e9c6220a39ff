use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use coordination::freshness::FreshnessConfig;
use coordination::ledger::CostModel;
use coordination::provider::ProviderConfig;
use coordination::quality::{HeuristicConfig, RubricConfig};
use coordination::resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Per-chapter pipeline budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Refinement passes after the first draft.
    pub max_retries: u32,
    /// Soft deadline per chapter, checked between stages.
    pub chapter_deadline_secs: u64,
    /// Evaluation attempts per assessment before the scorer counts as unavailable.
    pub max_evaluation_attempts: u32,
    /// Abort the job on the first chapter that does not pass.
    pub stop_on_failure: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            chapter_deadline_secs: 300,
            max_evaluation_attempts: 3,
            stop_on_failure: false,
        }
    }
}

impl PipelineConfig {
    pub fn chapter_deadline(&self) -> Duration {
        Duration::from_secs(self.chapter_deadline_secs)
    }
}

/// Reservation housekeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Open reservations older than this are rolled back by the sweeper.
    pub reservation_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

impl LedgerConfig {
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Top-level generator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub provider: ProviderConfig,
    pub pipeline: PipelineConfig,
    pub freshness: FreshnessConfig,
    pub costs: CostModel,
    pub retry: RetryPolicy,
    pub rubric: RubricConfig,
    pub heuristics: HeuristicConfig,
    pub ledger: LedgerConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        let provider_defaults = ProviderConfig::default();
        let pipeline_defaults = PipelineConfig::default();
        Self {
            provider: ProviderConfig {
                base_url: std::env::var("MANUSCRIPT_PROVIDER_URL")
                    .unwrap_or(provider_defaults.base_url),
                api_key: std::env::var("MANUSCRIPT_PROVIDER_API_KEY").ok(),
                model: std::env::var("MANUSCRIPT_PROVIDER_MODEL")
                    .unwrap_or(provider_defaults.model),
                timeout: env_parse("MANUSCRIPT_PROVIDER_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(provider_defaults.timeout),
            },
            pipeline: PipelineConfig {
                max_retries: env_parse("MANUSCRIPT_MAX_RETRIES")
                    .unwrap_or(pipeline_defaults.max_retries),
                chapter_deadline_secs: env_parse("MANUSCRIPT_CHAPTER_DEADLINE_SECS")
                    .unwrap_or(pipeline_defaults.chapter_deadline_secs),
                ..pipeline_defaults
            },
            freshness: FreshnessConfig::default(),
            costs: CostModel::default(),
            retry: RetryPolicy::default(),
            rubric: RubricConfig::default(),
            heuristics: HeuristicConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// `[provider]` table. Fields left out keep the environment defaults.
#[derive(Debug, Default, Deserialize)]
struct ProviderOverlay {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

/// `[pipeline]` table. Fields left out keep the environment defaults.
#[derive(Debug, Default, Deserialize)]
struct PipelineOverlay {
    max_retries: Option<u32>,
    chapter_deadline_secs: Option<u64>,
    max_evaluation_attempts: Option<u32>,
    stop_on_failure: Option<bool>,
}

/// On-disk layout. Tables other than `provider`/`pipeline` replace the
/// defaults wholesale (their own fields default individually).
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    provider: ProviderOverlay,
    #[serde(default)]
    pipeline: PipelineOverlay,
    freshness: Option<FreshnessConfig>,
    costs: Option<CostModel>,
    retry: Option<RetryPolicy>,
    rubric: Option<RubricConfig>,
    heuristics: Option<HeuristicConfig>,
    ledger: Option<LedgerConfig>,
}

impl GeneratorConfig {
    /// Environment defaults overlaid with a TOML file, then validated.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to load config file {}", path.display()))?;
        Ok(config)
    }

    /// Environment defaults overlaid with TOML text, then validated.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(raw).context("Invalid TOML")?;
        let mut config = Self::default();
        config.apply(file);
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, file: FileConfig) {
        let FileConfig {
            provider,
            pipeline,
            freshness,
            costs,
            retry,
            rubric,
            heuristics,
            ledger,
        } = file;

        if let Some(url) = provider.base_url {
            self.provider.base_url = url;
        }
        if provider.api_key.is_some() {
            self.provider.api_key = provider.api_key;
        }
        if let Some(model) = provider.model {
            self.provider.model = model;
        }
        if let Some(secs) = provider.timeout_secs {
            self.provider.timeout = Duration::from_secs(secs);
        }

        if let Some(v) = pipeline.max_retries {
            self.pipeline.max_retries = v;
        }
        if let Some(v) = pipeline.chapter_deadline_secs {
            self.pipeline.chapter_deadline_secs = v;
        }
        if let Some(v) = pipeline.max_evaluation_attempts {
            self.pipeline.max_evaluation_attempts = v;
        }
        if let Some(v) = pipeline.stop_on_failure {
            self.pipeline.stop_on_failure = v;
        }

        if let Some(v) = freshness {
            self.freshness = v;
        }
        if let Some(v) = costs {
            self.costs = v;
        }
        if let Some(v) = retry {
            self.retry = v;
        }
        if let Some(mut v) = rubric {
            // Genre lookups are lowercase
            v.genres = v
                .genres
                .into_iter()
                .map(|(genre, weights)| (genre.trim().to_lowercase(), weights))
                .collect();
            self.rubric = v;
        }
        if let Some(v) = heuristics {
            self.heuristics = v;
        }
        if let Some(v) = ledger {
            self.ledger = v;
        }
    }

    /// Reject values no run could succeed with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.timeout.is_zero() {
            return Err(ConfigError::invalid("provider.timeout_secs", "must be positive"));
        }
        if self.pipeline.chapter_deadline_secs == 0 {
            return Err(ConfigError::invalid(
                "pipeline.chapter_deadline_secs",
                "must be positive",
            ));
        }
        if self.pipeline.max_evaluation_attempts == 0 {
            return Err(ConfigError::invalid(
                "pipeline.max_evaluation_attempts",
                "must be at least 1",
            ));
        }
        let f = &self.freshness;
        if !(0.0..=1.0).contains(&f.similarity_threshold) || f.similarity_threshold == 0.0 {
            return Err(ConfigError::invalid(
                "freshness.similarity_threshold",
                format!("{} not in (0, 1]", f.similarity_threshold),
            ));
        }
        if !(0.0..=10.0).contains(&f.min_score) {
            return Err(ConfigError::invalid(
                "freshness.min_score",
                format!("{} not in [0, 10]", f.min_score),
            ));
        }
        if !(0.0..1.0).contains(&f.sentence_overlap) {
            return Err(ConfigError::invalid(
                "freshness.sentence_overlap",
                format!("{} not in [0, 1)", f.sentence_overlap),
            ));
        }
        if f.lookback_chapters == 0 {
            return Err(ConfigError::invalid(
                "freshness.lookback_chapters",
                "must be at least 1",
            ));
        }
        if f.extract.shingle_size < 2 {
            return Err(ConfigError::invalid(
                "freshness.shingle_size",
                "must be at least 2",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.factor.is_nan() || self.retry.factor < 1.0 {
            return Err(ConfigError::invalid("retry.factor", "must be >= 1.0"));
        }
        if !self.rubric.default.is_valid() {
            return Err(ConfigError::invalid(
                "rubric.default",
                "weights must be non-negative with a positive sum",
            ));
        }
        if let Some((genre, _)) = self.rubric.genres.iter().find(|(_, w)| !w.is_valid()) {
            return Err(ConfigError::invalid(
                "rubric.genres",
                format!("weights for {genre} must be non-negative with a positive sum"),
            ));
        }
        if !(0.0..1.0).contains(&self.heuristics.max_word_deviation)
            || self.heuristics.max_word_deviation == 0.0
        {
            return Err(ConfigError::invalid(
                "heuristics.max_word_deviation",
                format!("{} not in (0, 1)", self.heuristics.max_word_deviation),
            ));
        }
        let rates = &self.costs.rates;
        if rates.input_per_1k < 0.0 || rates.output_per_1k < 0.0 {
            return Err(ConfigError::invalid("costs.rates", "must be non-negative"));
        }
        if self.ledger.reservation_ttl_secs == 0 || self.ledger.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("ledger", "intervals must be positive"));
        }
        // A chapter commits once at its end; the sweep must not expire its
        // reservations first. The last call may start just before the deadline.
        let longest_chapter =
            self.pipeline.chapter_deadline() + self.retry.worst_case(self.provider.timeout);
        if longest_chapter.as_secs() >= self.ledger.reservation_ttl_secs {
            return Err(ConfigError::invalid(
                "ledger.reservation_ttl_secs",
                format!(
                    "{}s does not outlast a chapter ({}s deadline plus {}s for one retried call)",
                    self.ledger.reservation_ttl_secs,
                    self.pipeline.chapter_deadline_secs,
                    self.retry.worst_case(self.provider.timeout).as_secs()
                ),
            ));
        }
        Ok(())
    }
}
