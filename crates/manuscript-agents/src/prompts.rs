//! Prompt text and request builders for each pipeline call.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes,
//! so a logged call can be traced back to the wording that produced it.

use coordination::freshness::FreshnessReport;
use coordination::provider::{CallKind, CompletionRequest};
use coordination::quality::verdict::extract_json_object;
use coordination::quality::{AssessmentResult, RubricCategory};
use serde::{Deserialize, Serialize};

use crate::context::GenerationContext;

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Words of the previous chapter's ending included for continuity.
pub const CONTINUITY_TAIL_WORDS: usize = 200;

/// Minimum plot advancements a usable blueprint must list.
pub const MIN_PLOT_ADVANCEMENTS: usize = 2;

/// Planner preamble. Produces a JSON blueprint, never prose.
pub const PLANNER_PREAMBLE: &str = "\
You are the story planner for a novel being written one chapter at a time. \
You do not write prose. You produce a blueprint for the next chapter.

## Output
Respond with a single JSON object and nothing else:
{\"scene_goals\": [\"...\"], \"plot_advancements\": [\"...\"], \"character_constraints\": [\"...\"]}

## Rules
- List at least two concrete plot advancements: events after which the story \
  is in a different state than before.
- Scene goals describe what each scene must accomplish, in order.
- Character constraints restate facts from the book bible that this chapter must respect.
- Stay consistent with the premise and with how the previous chapter ended.";

/// Writer preamble for first drafts.
pub const WRITER_PREAMBLE: &str = "\
You are a novelist writing one chapter of a book from a blueprint. \
Write the full chapter text only: no title, no notes, no commentary.

## Rules
- Hit every plot advancement in the blueprint, in order.
- Respect the style guide and every character constraint.
- Stay within ten percent of the requested length.
- Vary sentence openings and imagery; avoid stock phrases and recycled metaphors.
- Never use the characters listed as banned.";

/// Editor preamble for targeted revisions.
pub const EDITOR_PREAMBLE: &str = "\
You are a line editor revising a chapter draft. You receive the draft, the \
categories that failed review, and passages that repeat earlier chapters. \
Return the complete revised chapter text only.

## Rules
- Fix only what the review names. Keep everything that already works.
- Rewrite every flagged repeated passage with new wording and new imagery.
- Keep all plot advancements of the blueprint.
- Stay within ten percent of the requested length.
- Never use the characters listed as banned.";

/// Evaluator preamble. Produces a JSON verdict.
pub const EVALUATOR_PREAMBLE: &str = "\
You are a harsh fiction editor scoring a chapter draft. Most published \
chapters score between 5 and 8. Reserve 9 and above for exceptional work.

## Output
Respond with a single JSON object and nothing else:
{\"scores\": {\"prose\": 0-10, \"character\": 0-10, \"structure\": 0-10, \
\"engagement\": 0-10, \"technical_accuracy\": 0-10}, \
\"plot_advancements\": <number of distinct plot advancements that actually happen>, \
\"notes\": [\"short, specific problems\"]}

## Categories
- prose: sentence quality, rhythm, word choice, cliche density.
- character: consistent voices and motivations, constraints respected.
- structure: scene order, pacing, the chapter has a shape.
- engagement: tension and momentum, a reason to keep reading.
- technical_accuracy: continuity with the book bible and earlier chapters.";

/// Chapter plan produced by the planning call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    #[serde(default)]
    pub scene_goals: Vec<String>,
    #[serde(default)]
    pub plot_advancements: Vec<String>,
    #[serde(default)]
    pub character_constraints: Vec<String>,
}

impl Blueprint {
    /// Parse the planner's output. `None` when there is no JSON object or
    /// it lists fewer than [`MIN_PLOT_ADVANCEMENTS`] advancements.
    pub fn parse(text: &str) -> Option<Self> {
        let blueprint: Self = serde_json::from_str(extract_json_object(text)?).ok()?;
        let advancements = blueprint
            .plot_advancements
            .iter()
            .filter(|a| !a.trim().is_empty())
            .count();
        (advancements >= MIN_PLOT_ADVANCEMENTS).then_some(blueprint)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (title, items) in [
            ("Scene goals", &self.scene_goals),
            ("Plot advancements", &self.plot_advancements),
            ("Character constraints", &self.character_constraints),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("### {title}\n"));
            for (i, item) in items.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, item.trim()));
            }
            out.push('\n');
        }
        out
    }
}

/// What drafting and revision are steered by.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterPlan {
    Structured(Blueprint),
    /// Planner output that did not parse, used verbatim.
    Freeform(String),
}

impl ChapterPlan {
    pub fn from_planner_output(text: &str) -> Self {
        match Blueprint::parse(text) {
            Some(blueprint) => Self::Structured(blueprint),
            None => Self::Freeform(text.trim().to_string()),
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }

    pub fn render(&self) -> String {
        match self {
            Self::Structured(blueprint) => blueprint.render(),
            Self::Freeform(text) => format!("{text}\n"),
        }
    }
}

/// Drafts are given room for the target plus margin.
pub fn chapter_max_tokens(target_words: u32) -> u32 {
    (target_words.saturating_mul(2)).clamp(512, 32_000)
}

/// The last `words` words of `text`.
pub fn tail_words(text: &str, words: usize) -> String {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    tokens[tokens.len().saturating_sub(words)..].join(" ")
}

fn project_section(ctx: &GenerationContext) -> String {
    let mut out = format!(
        "## Book\nTitle: {}\nGenre: {}\nPremise: {}\n",
        ctx.title, ctx.genre, ctx.premise
    );
    if !ctx.book_bible.trim().is_empty() {
        out.push_str(&format!("\n## Book bible\n{}\n", ctx.book_bible.trim()));
    }
    if !ctx.style_guide.trim().is_empty() {
        out.push_str(&format!("\n## Style guide\n{}\n", ctx.style_guide.trim()));
    }
    if !ctx.banned_chars.is_empty() {
        let banned: Vec<String> = ctx
            .banned_chars
            .iter()
            .map(|c| format!("'{c}' (U+{:04X})", *c as u32))
            .collect();
        out.push_str(&format!("\nBanned characters: {}\n", banned.join(", ")));
    }
    out
}

fn length_line(ctx: &GenerationContext) -> String {
    format!("Target length: about {} words.\n", ctx.target_words)
}

/// Planning call for `chapter`.
pub fn planning_request(
    ctx: &GenerationContext,
    chapter: u32,
    previous_tail: Option<&str>,
) -> CompletionRequest {
    let mut prompt = project_section(ctx);
    prompt.push_str(&format!(
        "\n## Task\nPlan chapter {chapter} of {}.\n{}",
        ctx.target_chapters,
        length_line(ctx)
    ));
    match previous_tail {
        Some(tail) if !tail.trim().is_empty() => {
            prompt.push_str(&format!("\n## How chapter {} ended\n{tail}\n", chapter - 1));
        }
        _ if chapter == 1 => prompt.push_str("\nThis is the opening chapter.\n"),
        _ => {}
    }
    CompletionRequest::new(CallKind::Planning, PLANNER_PREAMBLE, prompt).with_max_tokens(1024)
}

/// First-draft call for `chapter`.
pub fn draft_request(ctx: &GenerationContext, chapter: u32, plan: &ChapterPlan) -> CompletionRequest {
    let mut prompt = project_section(ctx);
    prompt.push_str(&format!(
        "\n## Blueprint for chapter {chapter}\n{}\n## Task\nWrite chapter {chapter}.\n{}",
        plan.render(),
        length_line(ctx)
    ));
    CompletionRequest::new(CallKind::Drafting, WRITER_PREAMBLE, prompt)
        .with_max_tokens(chapter_max_tokens(ctx.target_words))
}

/// Evaluation call for one attempt.
pub fn evaluation_request(
    ctx: &GenerationContext,
    chapter: u32,
    plan: &ChapterPlan,
    draft: &str,
) -> CompletionRequest {
    let mut prompt = project_section(ctx);
    prompt.push_str(&format!(
        "\n## Blueprint for chapter {chapter}\n{}\n## Draft of chapter {chapter}\n{draft}\n\n\
         ## Task\nScore this draft.\n",
        plan.render()
    ));
    CompletionRequest::new(CallKind::Evaluation, EVALUATOR_PREAMBLE, prompt).with_max_tokens(800)
}

/// Revision call. Names only the failing categories, the hard failures and
/// the flagged repeated spans.
pub fn refine_request(
    ctx: &GenerationContext,
    chapter: u32,
    plan: &ChapterPlan,
    draft: &str,
    assessment: &AssessmentResult,
    freshness: &FreshnessReport,
) -> CompletionRequest {
    let mut prompt = project_section(ctx);
    prompt.push_str(&format!(
        "\n## Blueprint for chapter {chapter}\n{}\n## Current draft\n{draft}\n\n## Fix these\n",
        plan.render()
    ));

    for failure in &assessment.hard_failures {
        prompt.push_str(&format!("- {failure}\n"));
    }
    for category in &assessment.failing_categories {
        prompt.push_str(&format!(
            "- {}: scored {:.1}/10. {}\n",
            category,
            assessment.scores.get(*category),
            category_hint(*category)
        ));
    }
    for note in &assessment.notes {
        prompt.push_str(&format!("- Reviewer note: {note}\n"));
    }
    if !freshness.flagged.is_empty() {
        prompt.push_str("\n## Repeated from earlier chapters (rewrite each)\n");
        for span in &freshness.flagged {
            prompt.push_str(&format!(
                "- \"{}\" (chapter {})\n",
                span.text, span.source_chapter
            ));
        }
    }
    prompt.push_str(&format!("\n## Task\nRevise chapter {chapter}.\n{}", length_line(ctx)));

    CompletionRequest::new(CallKind::Refining, EDITOR_PREAMBLE, prompt)
        .with_max_tokens(chapter_max_tokens(ctx.target_words))
}

fn category_hint(category: RubricCategory) -> &'static str {
    match category {
        RubricCategory::Prose => "Tighten sentences and replace stock phrasing.",
        RubricCategory::Character => "Make motivations and voices consistent.",
        RubricCategory::Structure => "Fix scene order and pacing.",
        RubricCategory::Engagement => "Raise tension; end scenes on movement.",
        RubricCategory::TechnicalAccuracy => "Correct continuity against the book bible.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::freshness::{FingerprintKind, FlaggedSpan};
    use coordination::quality::{CategoryScores, HardFailure};

    fn ctx() -> GenerationContext {
        GenerationContext {
            project_id: "p1".into(),
            user_id: "u1".into(),
            title: "The Salt Road".into(),
            genre: "fantasy".into(),
            premise: "A courier carries a map nobody can read.".into(),
            book_bible: "Mara is left-handed.".into(),
            style_guide: String::new(),
            banned_chars: vec![coordination::quality::EM_DASH],
            weights: Default::default(),
            target_chapters: 12,
            target_words: 1500,
            quality_threshold: 80,
            min_freshness: 7.0,
            max_retries: 3,
        }
    }

    #[test]
    fn test_blueprint_parse() {
        let text = r#"Sure! {"scene_goals": ["arrive"], "plot_advancements": ["Mara loses the map", "the guild learns her name"]}"#;
        let blueprint = Blueprint::parse(text).unwrap();
        assert_eq!(blueprint.plot_advancements.len(), 2);
        assert!(blueprint.character_constraints.is_empty());
    }

    #[test]
    fn test_blueprint_needs_two_advancements() {
        assert!(Blueprint::parse(r#"{"plot_advancements": ["one", "  "]}"#).is_none());
        assert!(Blueprint::parse("Chapter 3: Mara arrives at the harbor.").is_none());

        let plan = ChapterPlan::from_planner_output("Chapter 3: Mara arrives at the harbor.");
        assert!(!plan.is_structured());
        assert!(plan.render().contains("Mara arrives"));
    }

    #[test]
    fn test_planning_request_includes_continuity() {
        let req = planning_request(&ctx(), 4, Some("She closed the door."));
        assert_eq!(req.kind, CallKind::Planning);
        assert!(req.prompt.contains("Plan chapter 4 of 12"));
        assert!(req.prompt.contains("How chapter 3 ended"));
        assert!(req.prompt.contains("Mara is left-handed"));
        assert!(req.prompt.contains("U+2014"));

        let first = planning_request(&ctx(), 1, None);
        assert!(first.prompt.contains("opening chapter"));
    }

    #[test]
    fn test_refine_request_names_only_failures() {
        let mut scores = CategoryScores::uniform(8.5);
        scores.engagement = 6.0;
        let assessment = AssessmentResult {
            scores,
            aggregate: 80.0,
            hard_failures: vec![HardFailure::NoPlotAdvancement],
            failing_categories: vec![RubricCategory::Engagement],
            plot_advancements: 0,
            word_count: 1500,
            notes: vec![],
        };
        let freshness = FreshnessReport {
            score: 6.0,
            flagged: vec![FlaggedSpan {
                kind: FingerprintKind::Metaphor,
                text: "like a blade of winter light".into(),
                source_chapter: 2,
                similarity: 0.9,
            }],
            fingerprints_checked: 10,
            fingerprints_repeated: 2,
        };
        let plan = ChapterPlan::Freeform("Mara reaches the harbor.".into());
        let req = refine_request(&ctx(), 3, &plan, "draft text", &assessment, &freshness);

        assert_eq!(req.kind, CallKind::Refining);
        assert!(req.prompt.contains("engagement: scored 6.0/10"));
        assert!(!req.prompt.contains("prose: scored"));
        assert!(req.prompt.contains("like a blade of winter light"));
        assert!(req.prompt.contains("(chapter 2)"));
    }

    #[test]
    fn test_tail_words() {
        assert_eq!(tail_words("a b c d e", 2), "d e");
        assert_eq!(tail_words("a b", 5), "a b");
    }

    #[test]
    fn test_draft_budget() {
        assert_eq!(chapter_max_tokens(100), 512);
        assert_eq!(chapter_max_tokens(3000), 6000);
        assert_eq!(chapter_max_tokens(50_000), 32_000);
    }
}
