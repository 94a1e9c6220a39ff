//! Local checks that run without the evaluator

use serde::{Deserialize, Serialize};

use crate::state::count_words;

/// Em dash, banned by default.
pub const EM_DASH: char = '\u{2014}';

/// Thresholds for the local checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    /// Largest allowed |actual - target| / target.
    pub max_word_deviation: f64,
    pub banned_chars: Vec<char>,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            max_word_deviation: 0.30,
            banned_chars: vec![EM_DASH],
        }
    }
}

/// A condition that fails the gate regardless of the weighted score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HardFailure {
    WordCountOutOfRange {
        actual: u32,
        target: u32,
        deviation: f64,
    },
    NoPlotAdvancement,
    BannedCharacter {
        ch: char,
        occurrences: usize,
    },
}

impl std::fmt::Display for HardFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WordCountOutOfRange {
                actual,
                target,
                deviation,
            } => write!(
                f,
                "word count {actual} is {:.0}% off the {target}-word target",
                deviation * 100.0
            ),
            Self::NoPlotAdvancement => write!(f, "no plot advancement"),
            Self::BannedCharacter { ch, occurrences } => {
                write!(f, "banned character {ch:?} used {occurrences} time(s)")
            }
        }
    }
}

/// Relative deviation of `actual` from `target`. A zero target counts any
/// text as fully off.
pub fn word_deviation(actual: u32, target: u32) -> f64 {
    if target == 0 {
        return if actual == 0 { 0.0 } else { 1.0 };
    }
    (actual as f64 - target as f64).abs() / target as f64
}

/// Occurrences of each banned character present in the text
pub fn scan_banned(text: &str, banned: &[char]) -> Vec<(char, usize)> {
    banned
        .iter()
        .filter_map(|&ch| {
            let n = text.chars().filter(|c| *c == ch).count();
            (n > 0).then_some((ch, n))
        })
        .collect()
}

/// Run the local hard-failure checks over a draft.
///
/// `plot_advancements` is the evaluator's count; `None` skips that check.
pub fn hard_failures(
    text: &str,
    target_words: u32,
    plot_advancements: Option<u32>,
    config: &HeuristicConfig,
) -> Vec<HardFailure> {
    let mut failures = Vec::new();

    let actual = count_words(text);
    let deviation = word_deviation(actual, target_words);
    if deviation > config.max_word_deviation {
        failures.push(HardFailure::WordCountOutOfRange {
            actual,
            target: target_words,
            deviation,
        });
    }

    if plot_advancements == Some(0) {
        failures.push(HardFailure::NoPlotAdvancement);
    }

    for (ch, occurrences) in scan_banned(text, &config.banned_chars) {
        failures.push(HardFailure::BannedCharacter { ch, occurrences });
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        vec!["word"; n].join(" ")
    }

    #[test]
    fn test_word_deviation() {
        assert_eq!(word_deviation(100, 100), 0.0);
        assert!((word_deviation(70, 100) - 0.3).abs() < 1e-9);
        assert!((word_deviation(150, 100) - 0.5).abs() < 1e-9);
        assert_eq!(word_deviation(0, 0), 0.0);
        assert_eq!(word_deviation(5, 0), 1.0);
    }

    #[test]
    fn test_thirty_percent_is_allowed() {
        let config = HeuristicConfig::default();
        assert!(hard_failures(&words(70), 100, Some(2), &config).is_empty());
        assert!(hard_failures(&words(130), 100, Some(2), &config).is_empty());

        let failures = hard_failures(&words(69), 100, Some(2), &config);
        assert!(matches!(
            failures.as_slice(),
            [HardFailure::WordCountOutOfRange { actual: 69, .. }]
        ));
    }

    #[test]
    fn test_em_dash_banned_by_default() {
        let text = format!("{} she paused\u{2014}then ran", words(96));
        let failures = hard_failures(&text, 100, Some(1), &HeuristicConfig::default());
        assert_eq!(
            failures,
            vec![HardFailure::BannedCharacter {
                ch: EM_DASH,
                occurrences: 1
            }]
        );
    }

    #[test]
    fn test_zero_plot_advancement() {
        let failures = hard_failures(&words(100), 100, Some(0), &HeuristicConfig::default());
        assert_eq!(failures, vec![HardFailure::NoPlotAdvancement]);
        assert!(hard_failures(&words(100), 100, None, &HeuristicConfig::default()).is_empty());
    }

    #[test]
    fn test_custom_banned_list() {
        let config = HeuristicConfig {
            banned_chars: vec!['#', '*'],
            ..Default::default()
        };
        let hits = scan_banned("a ** b # c \u{2014}", &config.banned_chars);
        assert_eq!(hits, vec![('#', 1), ('*', 2)]);
    }

    #[test]
    fn test_display() {
        let f = HardFailure::WordCountOutOfRange {
            actual: 50,
            target: 100,
            deviation: 0.5,
        };
        assert_eq!(f.to_string(), "word count 50 is 50% off the 100-word target");
    }
}
