//! Chapter State Machine: explicit pipeline stages and legal transition guards.
//!
//! Every chapter run starts at `Planning` and ends at `Integrated`,
//! `Exhausted` or `Cancelled`. The pipeline calls `advance()` between stages;
//! each call validates the edge and appends it to the transition log, so a
//! finished run can be reported stage by stage.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Stages of a single chapter run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterState {
    /// Producing the blueprint.
    Planning,
    /// Writing the first draft from the blueprint.
    Drafting,
    /// Scoring the current attempt and checking freshness.
    Assessing,
    /// Revising the best attempt against its failure reasons.
    Refining,
    /// Gate passed and chapter persisted; terminal state.
    Integrated,
    /// Budget, retries or deadline used up; terminal state.
    Exhausted,
    /// Job cancelled mid-chapter; terminal state.
    Cancelled,
}

impl ChapterState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Integrated | Self::Exhausted | Self::Cancelled)
    }
}

impl fmt::Display for ChapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "Planning"),
            Self::Drafting => write!(f, "Drafting"),
            Self::Assessing => write!(f, "Assessing"),
            Self::Refining => write!(f, "Refining"),
            Self::Integrated => write!(f, "Integrated"),
            Self::Exhausted => write!(f, "Exhausted"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Legal transitions between chapter states.
///
/// ```text
/// Planning  → Drafting
/// Drafting  → Assessing
/// Assessing → Integrated | Refining
/// Refining  → Assessing
/// (any non-terminal) → Exhausted | Cancelled
/// ```
fn is_legal_transition(from: ChapterState, to: ChapterState) -> bool {
    use ChapterState::*;

    if matches!(to, Exhausted | Cancelled) && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Planning, Drafting)
            | (Drafting, Assessing)
            | (Assessing, Integrated)
            | (Assessing, Refining)
            | (Refining, Assessing)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: ChapterState,
    pub to: ChapterState,
    /// Refinement passes spent when the transition happened.
    pub retry: u32,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal chapter transition: {from} → {to}")]
pub struct IllegalTransition {
    pub from: ChapterState,
    pub to: ChapterState,
}

/// Per-chapter state machine with a transition log.
pub struct ChapterStateMachine {
    chapter: u32,
    current: ChapterState,
    retry: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl ChapterStateMachine {
    /// Start a run for `chapter` at `Planning`.
    pub fn new(chapter: u32) -> Self {
        Self {
            chapter,
            current: ChapterState::Planning,
            retry: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn chapter(&self) -> u32 {
        self.chapter
    }

    pub fn current(&self) -> ChapterState {
        self.current
    }

    /// Refinement passes entered so far.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    /// Move to `to`, rejecting edges outside the chapter state graph.
    ///
    /// Entering `Refining` counts one refinement pass.
    pub fn advance(&mut self, to: ChapterState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }
        if to == ChapterState::Refining {
            self.retry += 1;
        }

        tracing::debug!(
            chapter = self.chapter,
            from = %self.current,
            to = %to,
            retry = self.retry,
            "Chapter transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            retry: self.retry,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    /// Transition to `Exhausted` from any non-terminal state.
    pub fn exhaust(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(ChapterState::Exhausted, Some(reason))
    }

    /// Transition to `Cancelled` from any non-terminal state.
    pub fn cancel(&mut self) -> Result<(), IllegalTransition> {
        self.advance(ChapterState::Cancelled, Some("job cancelled"))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Consume the machine, keeping only its log.
    pub fn into_transitions(self) -> Vec<TransitionRecord> {
        self.transitions
    }

    /// One-line history, e.g. for the chapter's closing log line.
    pub fn summary(&self) -> String {
        let path: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "chapter {}: {} → {} ({}ms, {} transitions, {} refinements)",
            self.chapter,
            ChapterState::Planning,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
            self.retry,
        );
        if !path.is_empty() {
            out.push_str(&format!(" [{}]", path.join(" → ")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_assessing() -> ChapterStateMachine {
        let mut sm = ChapterStateMachine::new(1);
        sm.advance(ChapterState::Drafting, None).unwrap();
        sm.advance(ChapterState::Assessing, None).unwrap();
        sm
    }

    #[test]
    fn test_initial_state() {
        let sm = ChapterStateMachine::new(4);
        assert_eq!(sm.current(), ChapterState::Planning);
        assert_eq!(sm.chapter(), 4);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_first_pass_integration() {
        let mut sm = to_assessing();
        sm.advance(ChapterState::Integrated, Some("gate passed")).unwrap();
        assert!(sm.is_terminal());
        assert_eq!(sm.retry(), 0);
        assert_eq!(sm.transitions().len(), 3);
    }

    #[test]
    fn test_refinement_loop_counts_retries() {
        let mut sm = to_assessing();
        for _ in 0..3 {
            sm.advance(ChapterState::Refining, Some("prose below threshold"))
                .unwrap();
            sm.advance(ChapterState::Assessing, None).unwrap();
        }
        assert_eq!(sm.retry(), 3);
        sm.exhaust("retry budget spent").unwrap();
        assert_eq!(sm.current(), ChapterState::Exhausted);
        assert_eq!(sm.transitions().last().unwrap().retry, 3);
    }

    #[test]
    fn test_cancel_and_exhaust_from_any_live_state() {
        for state in [
            ChapterState::Planning,
            ChapterState::Drafting,
            ChapterState::Assessing,
            ChapterState::Refining,
        ] {
            assert!(is_legal_transition(state, ChapterState::Cancelled));
            assert!(is_legal_transition(state, ChapterState::Exhausted));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut sm = to_assessing();
        sm.advance(ChapterState::Integrated, None).unwrap();
        let err = sm.cancel().unwrap_err();
        assert_eq!(err.from, ChapterState::Integrated);
        assert_eq!(err.to, ChapterState::Cancelled);
        assert!(sm.exhaust("late").is_err());
    }

    #[test]
    fn test_illegal_skip_transitions() {
        let mut sm = ChapterStateMachine::new(1);
        assert!(sm.advance(ChapterState::Assessing, None).is_err());
        assert!(sm.advance(ChapterState::Integrated, None).is_err());
        sm.advance(ChapterState::Drafting, None).unwrap();
        assert!(sm.advance(ChapterState::Refining, None).is_err());
    }

    #[test]
    fn test_transition_record_serde() {
        let mut sm = to_assessing();
        sm.advance(ChapterState::Refining, Some("engagement 6.0/10"))
            .unwrap();
        let json = serde_json::to_string(sm.transitions().last().unwrap()).unwrap();
        let restored: TransitionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.from, ChapterState::Assessing);
        assert_eq!(restored.to, ChapterState::Refining);
        assert_eq!(restored.retry, 1);
        assert_eq!(restored.reason.as_deref(), Some("engagement 6.0/10"));
        assert!(json.contains("\"refining\""));
    }

    #[test]
    fn test_summary() {
        let mut sm = to_assessing();
        sm.exhaust("deadline").unwrap();
        let summary = sm.summary();
        assert!(summary.contains("Exhausted"));
        assert!(summary.contains("3 transitions"));
    }
}
