//! Cross-chapter repetition tracking
//!
//! Each project owns an append-only catalog of [`PatternEntry`]s taken from
//! its accepted chapters. A new draft for chapter `k` is checked only against
//! entries from accepted chapters numbered below `k`:
//!
//! - a sentence counts as repeated when more than `sentence_overlap` of its
//!   shingles match, on exact hash, a shingle of any earlier accepted chapter;
//! - metaphors and paragraph openings match on Jaccard similarity against the
//!   last `lookback_chapters` accepted chapters.
//!
//! The report's score is 10 for an entirely fresh draft and falls with the
//! share of repeated units (sentences, metaphors, openings). A shared name or
//! stock phrase inside otherwise new sentences does not count; a verbatim
//! copy of an accepted chapter scores 0.

pub mod fingerprint;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use fingerprint::{
    extract, hash_tokens, jaccard, normalize_tokens, ExtractConfig, Fingerprint, FingerprintKind,
};

use crate::state::{Chapter, ProjectId};

/// Default minimum freshness for the quality gate
pub const DEFAULT_MIN_FRESHNESS: f64 = 7.0;

#[derive(Debug, Error)]
pub enum FreshnessError {
    #[error("Pattern catalog lock poisoned")]
    LockPoisoned,
}

pub type FreshnessResult<T> = Result<T, FreshnessError>;

/// Tracker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreshnessConfig {
    #[serde(flatten)]
    pub extract: ExtractConfig,
    /// Jaccard similarity at or above which metaphors/openings count as reused.
    pub similarity_threshold: f64,
    /// How many of the most recent accepted chapters fuzzy matching looks at.
    pub lookback_chapters: usize,
    /// Gate minimum on the 0–10 scale.
    pub min_score: f64,
    /// Share of a sentence's shingles that must repeat for the sentence to count.
    pub sentence_overlap: f64,
    /// Repeated-share multiplier; 2.0 means half the units repeated scores 0.
    pub penalty_scale: f64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            extract: ExtractConfig::default(),
            similarity_threshold: 0.8,
            lookback_chapters: 5,
            min_score: DEFAULT_MIN_FRESHNESS,
            sentence_overlap: 0.5,
            penalty_scale: 2.0,
        }
    }
}

/// One recorded fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub project_id: ProjectId,
    pub fingerprint: Fingerprint,
    pub source_chapter: u32,
    pub kind: FingerprintKind,
}

/// A reused span in a draft
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedSpan {
    pub kind: FingerprintKind,
    pub text: String,
    pub source_chapter: u32,
    /// Jaccard similarity for metaphors and openings; share of matched
    /// shingles for sentences.
    pub similarity: f64,
}

/// Result of a freshness check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessReport {
    /// 0–10, higher is fresher.
    pub score: f64,
    pub flagged: Vec<FlaggedSpan>,
    /// Sentences, metaphors and openings checked.
    pub fingerprints_checked: usize,
    /// How many of those were repeats.
    pub fingerprints_repeated: usize,
}

impl FreshnessReport {
    pub fn passes(&self, min_score: f64) -> bool {
        self.score >= min_score
    }

    /// Share of checked fingerprints that were repeats.
    pub fn repeated_ratio(&self) -> f64 {
        if self.fingerprints_checked == 0 {
            0.0
        } else {
            self.fingerprints_repeated as f64 / self.fingerprints_checked as f64
        }
    }
}

/// Shingle matches within one sentence of a draft
struct SentenceTally<'a> {
    span: &'a str,
    windows: usize,
    matched: usize,
    /// Earliest accepted chapter any matched shingle came from.
    source: Option<u32>,
}

/// Per-project arena
#[derive(Debug, Default)]
struct ProjectCatalog {
    entries: Vec<PatternEntry>,
    /// Shingle hash -> chapters it appeared in
    shingle_index: HashMap<u64, BTreeSet<u32>>,
    /// Accepted chapter -> indices into `entries` of its fuzzy fingerprints
    fuzzy_by_chapter: BTreeMap<u32, Vec<usize>>,
}

impl ProjectCatalog {
    fn is_recorded(&self, chapter: u32) -> bool {
        self.fuzzy_by_chapter.contains_key(&chapter)
    }

    fn earliest_shingle_source(&self, hash: u64, before: u32) -> Option<u32> {
        self.shingle_index
            .get(&hash)
            .and_then(|chapters| chapters.range(..before).next().copied())
    }

    /// Fuzzy entries from the most recent `lookback` accepted chapters below `before`
    fn lookback_entries(&self, before: u32, lookback: usize) -> Vec<&PatternEntry> {
        self.fuzzy_by_chapter
            .range(..before)
            .rev()
            .take(lookback)
            .flat_map(|(_, idxs)| idxs.iter().map(|i| &self.entries[*i]))
            .collect()
    }
}

/// Project-scoped pattern catalogs
#[derive(Debug, Default)]
pub struct PatternTracker {
    config: FreshnessConfig,
    catalogs: RwLock<HashMap<ProjectId, ProjectCatalog>>,
}

impl PatternTracker {
    pub fn new(config: FreshnessConfig) -> Self {
        Self {
            config,
            catalogs: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FreshnessConfig {
        &self.config
    }

    /// Score a draft for chapter `chapter_number` against earlier accepted chapters.
    pub fn check_freshness(
        &self,
        draft: &str,
        project_id: &str,
        chapter_number: u32,
    ) -> FreshnessResult<FreshnessReport> {
        let fingerprints = extract(draft, &self.config.extract);
        let catalogs = self.catalogs.read().map_err(|_| FreshnessError::LockPoisoned)?;
        let catalog = catalogs.get(project_id);

        let recent = catalog
            .map(|c| c.lookback_entries(chapter_number, self.config.lookback_chapters))
            .unwrap_or_default();
        let mut sentences: BTreeMap<usize, SentenceTally<'_>> = BTreeMap::new();
        let mut fuzzy_checked = 0usize;
        let mut repeated = 0usize;
        let mut flagged = Vec::new();

        for fp in &fingerprints {
            match fp.kind {
                FingerprintKind::Shingle => {
                    let tally = sentences.entry(fp.unit).or_insert_with(|| SentenceTally {
                        span: &fp.span,
                        windows: 0,
                        matched: 0,
                        source: None,
                    });
                    tally.windows += 1;
                    if let Some(source) =
                        catalog.and_then(|c| c.earliest_shingle_source(fp.hash, chapter_number))
                    {
                        tally.matched += 1;
                        tally.source = Some(tally.source.map_or(source, |s| s.min(source)));
                    }
                }
                FingerprintKind::Metaphor | FingerprintKind::Opening => {
                    fuzzy_checked += 1;
                    let best = recent
                        .iter()
                        .filter(|e| e.kind == fp.kind)
                        .map(|e| (jaccard(&fp.tokens, &e.fingerprint.tokens), e.source_chapter))
                        .filter(|(sim, _)| *sim >= self.config.similarity_threshold)
                        .max_by(|a, b| a.0.total_cmp(&b.0));
                    if let Some((similarity, source_chapter)) = best {
                        repeated += 1;
                        flagged.push(FlaggedSpan {
                            kind: fp.kind,
                            text: fp.span.clone(),
                            source_chapter,
                            similarity,
                        });
                    }
                }
            }
        }

        for tally in sentences.values() {
            let Some(source_chapter) = tally.source else {
                continue;
            };
            let overlap = tally.matched as f64 / tally.windows as f64;
            if overlap > self.config.sentence_overlap {
                repeated += 1;
                flagged.push(FlaggedSpan {
                    kind: FingerprintKind::Shingle,
                    text: tally.span.to_string(),
                    source_chapter,
                    similarity: overlap,
                });
            }
        }

        let checked = sentences.len() + fuzzy_checked;
        let ratio = if checked == 0 {
            0.0
        } else {
            repeated as f64 / checked as f64
        };
        let penalty = (ratio * self.config.penalty_scale).min(1.0);
        let score = ((10.0 * (1.0 - penalty)) * 100.0).round() / 100.0;

        debug!(
            project_id,
            chapter = chapter_number,
            checked,
            repeated,
            score,
            "Freshness checked"
        );

        Ok(FreshnessReport {
            score,
            flagged,
            fingerprints_checked: checked,
            fingerprints_repeated: repeated,
        })
    }

    /// Append an accepted chapter's fingerprints. Re-recording a chapter is a no-op.
    ///
    /// Returns the number of entries appended.
    pub fn record(&self, project_id: &str, chapter_number: u32, text: &str) -> FreshnessResult<usize> {
        let fingerprints = extract(text, &self.config.extract);
        let mut catalogs = self.catalogs.write().map_err(|_| FreshnessError::LockPoisoned)?;
        let catalog = catalogs.entry(project_id.to_string()).or_default();

        if catalog.is_recorded(chapter_number) {
            debug!(project_id, chapter = chapter_number, "Chapter already recorded");
            return Ok(0);
        }

        let mut fuzzy = Vec::new();
        let count = fingerprints.len();
        for fp in fingerprints {
            let kind = fp.kind;
            if kind == FingerprintKind::Shingle {
                catalog
                    .shingle_index
                    .entry(fp.hash)
                    .or_default()
                    .insert(chapter_number);
            } else {
                fuzzy.push(catalog.entries.len());
            }
            catalog.entries.push(PatternEntry {
                project_id: project_id.to_string(),
                fingerprint: fp,
                source_chapter: chapter_number,
                kind,
            });
        }
        catalog.fuzzy_by_chapter.insert(chapter_number, fuzzy);

        info!(project_id, chapter = chapter_number, entries = count, "Pattern entries recorded");
        Ok(count)
    }

    /// Record every complete chapter, e.g. when resuming a project.
    pub fn hydrate(&self, project_id: &str, chapters: &[Chapter]) -> FreshnessResult<usize> {
        let mut total = 0;
        for chapter in chapters.iter().filter(|c| c.is_complete()) {
            total += self.record(project_id, chapter.chapter_number, &chapter.content)?;
        }
        Ok(total)
    }

    /// Recorded entries for a project, in append order
    pub fn entries(&self, project_id: &str) -> FreshnessResult<Vec<PatternEntry>> {
        let catalogs = self.catalogs.read().map_err(|_| FreshnessError::LockPoisoned)?;
        Ok(catalogs
            .get(project_id)
            .map(|c| c.entries.clone())
            .unwrap_or_default())
    }

    /// Chapters whose fingerprints have been recorded
    pub fn accepted_chapters(&self, project_id: &str) -> FreshnessResult<Vec<u32>> {
        let catalogs = self.catalogs.read().map_err(|_| FreshnessError::LockPoisoned)?;
        Ok(catalogs
            .get(project_id)
            .map(|c| c.fuzzy_by_chapter.keys().copied().collect())
            .unwrap_or_default())
    }
}
