//! Fingerprint extraction
//!
//! Three kinds of fingerprint are taken from a chapter:
//!
//! - **Shingle**: hash of a word n-gram within one sentence. Matched exactly.
//! - **Metaphor**: token set of a simile-bearing phrase ("like a ...",
//!   "as if ...", "as cold as ..."). Matched by Jaccard similarity.
//! - **Opening**: token set of the first words of a paragraph. Matched by
//!   Jaccard similarity.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static SENTENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^.!?\n]+[.!?]*").unwrap());
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}']+").unwrap());
static METAPHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:like|as if|as though|as \w+ as)\s+[^,.;:!?\n]{3,80}").unwrap()
});
static PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Sentences shorter than this produce no shingle at all.
const MIN_SHINGLE_TOKENS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintKind {
    Shingle,
    Metaphor,
    Opening,
}

impl std::fmt::Display for FingerprintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shingle => write!(f, "shingle"),
            Self::Metaphor => write!(f, "metaphor"),
            Self::Opening => write!(f, "opening"),
        }
    }
}

/// Normalized signature of a reusable span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub kind: FingerprintKind,
    /// blake3-derived hash of the normalized tokens.
    pub hash: u64,
    /// Normalized token set, used for similarity matching. Empty for shingles.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tokens: BTreeSet<String>,
    /// Index of the sentence (shingles) or paragraph (openings) it came from.
    pub unit: usize,
    /// Original text of the span.
    pub span: String,
}

/// Extraction parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub shingle_size: usize,
    pub opening_tokens: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            shingle_size: 5,
            opening_tokens: 6,
        }
    }
}

/// Lowercased word tokens
pub fn normalize_tokens(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Stable 64-bit hash of a token sequence
pub fn hash_tokens<S: AsRef<str>>(tokens: &[S]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    for (i, t) in tokens.iter().enumerate() {
        if i > 0 {
            hasher.update(b" ");
        }
        hasher.update(t.as_ref().as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Jaccard similarity of two token sets. Two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Word n-gram shingles, one set per sentence.
pub fn shingles(text: &str, size: usize) -> Vec<Fingerprint> {
    let size = size.max(1);
    let mut out = Vec::new();
    for (unit, sentence) in SENTENCE_RE.find_iter(text).enumerate() {
        let tokens = normalize_tokens(sentence.as_str());
        if tokens.len() < MIN_SHINGLE_TOKENS {
            continue;
        }
        let span = sentence.as_str().trim().to_string();
        if tokens.len() < size {
            out.push(Fingerprint {
                kind: FingerprintKind::Shingle,
                hash: hash_tokens(&tokens),
                tokens: BTreeSet::new(),
                unit,
                span,
            });
            continue;
        }
        for window in tokens.windows(size) {
            out.push(Fingerprint {
                kind: FingerprintKind::Shingle,
                hash: hash_tokens(window),
                tokens: BTreeSet::new(),
                unit,
                span: span.clone(),
            });
        }
    }
    out
}

/// Simile-bearing phrases
pub fn metaphors(text: &str) -> Vec<Fingerprint> {
    METAPHOR_RE
        .find_iter(text)
        .enumerate()
        .filter_map(|(unit, m)| {
            let tokens = normalize_tokens(m.as_str());
            if tokens.len() < MIN_SHINGLE_TOKENS {
                return None;
            }
            Some(Fingerprint {
                kind: FingerprintKind::Metaphor,
                hash: hash_tokens(&tokens),
                tokens: tokens.into_iter().collect(),
                unit,
                span: m.as_str().trim().to_string(),
            })
        })
        .collect()
}

/// Paragraph-opening templates
pub fn openings(text: &str, opening_tokens: usize) -> Vec<Fingerprint> {
    PARAGRAPH_RE
        .split(text)
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .filter_map(|(unit, paragraph)| {
            let tokens: Vec<String> = normalize_tokens(paragraph)
                .into_iter()
                .take(opening_tokens.max(1))
                .collect();
            if tokens.len() < MIN_SHINGLE_TOKENS {
                return None;
            }
            let span = paragraph
                .split_whitespace()
                .take(opening_tokens.max(1))
                .collect::<Vec<_>>()
                .join(" ");
            Some(Fingerprint {
                kind: FingerprintKind::Opening,
                hash: hash_tokens(&tokens),
                tokens: tokens.into_iter().collect(),
                unit,
                span,
            })
        })
        .collect()
}

/// All fingerprints of a text
pub fn extract(text: &str, config: &ExtractConfig) -> Vec<Fingerprint> {
    let mut out = shingles(text, config.shingle_size);
    out.extend(metaphors(text));
    out.extend(openings(text, config.opening_tokens));
    out
}
