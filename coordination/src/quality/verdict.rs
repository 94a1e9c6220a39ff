//! Evaluator verdict parsing
//!
//! The evaluation call is asked for a single JSON object:
//!
//! ```json
//! {
//!   "scores": {"prose": 8, "character": 7, "structure": 8,
//!              "engagement": 9, "technical_accuracy": 8},
//!   "plot_advancements": 2,
//!   "notes": ["the reveal lands too early"]
//! }
//! ```
//!
//! Models often wrap it in prose or code fences, so the first balanced
//! `{...}` block is extracted before deserializing.

use serde::{Deserialize, Serialize};

use super::rubric::CategoryScores;
use super::ScorerError;

/// Structured evaluator output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorVerdict {
    pub scores: CategoryScores,
    pub plot_advancements: u32,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Slice out the first balanced JSON object in `text`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse the evaluator's raw response into a verdict.
pub fn parse_verdict(text: &str) -> Result<EvaluatorVerdict, ScorerError> {
    let json = extract_json_object(text)
        .ok_or_else(|| ScorerError::InvalidVerdict("no JSON object in evaluator output".into()))?;
    let mut verdict: EvaluatorVerdict = serde_json::from_str(json)
        .map_err(|e| ScorerError::InvalidVerdict(e.to_string()))?;
    verdict.scores = verdict.scores.clamped();
    Ok(verdict)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERDICT: &str = r#"{"scores": {"prose": 8, "character": 7.5, "structure": 8,
        "engagement": 9, "technical_accuracy": 8}, "plot_advancements": 2}"#;

    #[test]
    fn test_parse_plain_verdict() {
        let verdict = parse_verdict(VERDICT).unwrap();
        assert_eq!(verdict.scores.character, 7.5);
        assert_eq!(verdict.plot_advancements, 2);
        assert!(verdict.notes.is_empty());
    }

    #[test]
    fn test_parse_fenced_verdict() {
        let wrapped = format!("Here is my assessment:\n```json\n{VERDICT}\n```\nThanks!");
        assert!(parse_verdict(&wrapped).is_ok());
    }

    #[test]
    fn test_braces_inside_strings() {
        let text = r#"{"scores": {"prose": 5, "character": 5, "structure": 5,
            "engagement": 5, "technical_accuracy": 5}, "plot_advancements": 1,
            "notes": ["uses {curly} braces \" and quotes"]} trailing {junk}"#;
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.notes[0], "uses {curly} braces \" and quotes");
    }

    #[test]
    fn test_out_of_range_scores_are_clamped() {
        let text = r#"{"scores": {"prose": 12, "character": 7, "structure": 8,
            "engagement": 9, "technical_accuracy": -1}, "plot_advancements": 2}"#;
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.scores.prose, 10.0);
        assert_eq!(verdict.scores.technical_accuracy, 0.0);
    }

    #[test]
    fn test_unparseable_verdicts() {
        assert!(matches!(
            parse_verdict("I liked it a lot."),
            Err(ScorerError::InvalidVerdict(_))
        ));
        assert!(parse_verdict("{\"scores\": {\"prose\": 8}").is_err());
        // Missing category
        assert!(parse_verdict(r#"{"scores": {"prose": 8}, "plot_advancements": 1}"#).is_err());
    }

    #[test]
    fn test_extract_unbalanced() {
        assert_eq!(extract_json_object("{ \"a\": 1 "), None);
        assert_eq!(extract_json_object("x {\"a\": {}} y"), Some("{\"a\": {}}"));
    }
}
