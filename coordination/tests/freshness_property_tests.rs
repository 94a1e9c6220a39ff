//! Freshness property tests: repetition detection across a growing project.
//!
//! Tests verify:
//! - A verbatim copy of any accepted chapter fails the freshness gate
//! - Copying an early chapter is caught even beyond the fuzzy lookback
//! - Unrelated chapters pass
//! - Partial reuse lowers the score proportionally

use coordination::freshness::{FreshnessConfig, PatternTracker, DEFAULT_MIN_FRESHNESS};

const SUBJECTS: &[&str] = &[
    "the harbor master", "a tired courier", "the youngest sister", "an old cartographer",
    "the night nurse", "a traveling tinker", "the village priest", "a retired soldier",
];
const VERBS: &[&str] = &[
    "counted", "repaired", "buried", "painted", "carried", "questioned", "followed", "sold",
];
const OBJECTS: &[&str] = &[
    "broken lanterns", "salt-stained letters", "forgotten debts", "silver buttons",
    "stolen maps", "wet firewood", "river stones", "borrowed horses",
];
const PLACES: &[&str] = &[
    "behind the chapel", "near the north gate", "under the bridge", "inside the mill",
    "along the cliffs", "at the market square", "past the orchard", "beside the well",
];

/// Chapter text that shares vocabulary with its siblings but no sentences.
fn chapter_text(n: usize) -> String {
    let mut paragraphs = Vec::new();
    for p in 0..3 {
        let mut sentences = Vec::new();
        for s in 0..4 {
            let k = n * 12 + p * 4 + s;
            sentences.push(format!(
                "On day {k} {} {} {} {}.",
                SUBJECTS[k % SUBJECTS.len()],
                VERBS[(k / 2) % VERBS.len()],
                OBJECTS[(k / 3) % OBJECTS.len()],
                PLACES[(k / 5) % PLACES.len()],
            ));
        }
        paragraphs.push(sentences.join(" "));
    }
    paragraphs.join("\n\n")
}

#[test]
fn prop_verbatim_copy_of_any_accepted_chapter_fails() {
    let tracker = PatternTracker::default();
    for n in 1..=8u32 {
        tracker.record("book", n, &chapter_text(n as usize)).unwrap();
    }

    for source in 1..=8u32 {
        let report = tracker
            .check_freshness(&chapter_text(source as usize), "book", 9)
            .unwrap();
        assert!(
            report.score < DEFAULT_MIN_FRESHNESS,
            "copy of chapter {source} scored {}",
            report.score
        );
        assert!(report.flagged.iter().any(|f| f.source_chapter == source));
    }
}

#[test]
fn prop_copy_beyond_lookback_is_still_caught() {
    let tracker = PatternTracker::new(FreshnessConfig {
        lookback_chapters: 2,
        ..Default::default()
    });
    for n in 1..=10u32 {
        tracker.record("book", n, &chapter_text(n as usize)).unwrap();
    }
    let report = tracker.check_freshness(&chapter_text(1), "book", 11).unwrap();
    assert!(report.score < DEFAULT_MIN_FRESHNESS);
}

#[test]
fn prop_new_chapters_pass() {
    let tracker = PatternTracker::default();
    for n in 1..=5u32 {
        let text = chapter_text(n as usize);
        let report = tracker.check_freshness(&text, "book", n).unwrap();
        assert!(
            report.passes(DEFAULT_MIN_FRESHNESS),
            "chapter {n} scored {}",
            report.score
        );
        tracker.record("book", n, &text).unwrap();
    }
}

#[test]
fn prop_partial_reuse_scores_between_extremes() {
    let tracker = PatternTracker::default();
    tracker.record("book", 1, &chapter_text(1)).unwrap();

    let fresh = chapter_text(2);
    let copied = chapter_text(1);
    let fresh_paragraphs: Vec<&str> = fresh.split("\n\n").collect();
    let copied_paragraphs: Vec<&str> = copied.split("\n\n").collect();
    let mixed = format!(
        "{}\n\n{}\n\n{}",
        fresh_paragraphs[0], fresh_paragraphs[1], copied_paragraphs[2]
    );

    let full_copy = tracker.check_freshness(&copied, "book", 2).unwrap().score;
    let partial = tracker.check_freshness(&mixed, "book", 2).unwrap().score;
    let none = tracker.check_freshness(&fresh, "book", 2).unwrap().score;

    assert!(full_copy < partial, "{full_copy} !< {partial}");
    assert!(partial < none, "{partial} !< {none}");
}
