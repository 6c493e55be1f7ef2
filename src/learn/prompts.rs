//! Instructions for the learn pipeline's tasks.
//!
//! Input file paths are appended by the task executor; these texts never
//! contain session content.

/// Reply that means "nothing worth a follow-on plan".
pub const NO_PLAN_SENTINEL: &str = "NO_PLAN";

/// One analysis task runs per chunk.
pub const ANALYZE_INSTRUCTIONS: &str = r#"You are reviewing one chunk of an agent session log recorded while a plan was written or implemented.

The file starts with a header line `{"chunk":i,"of":n,"kind":...,"session_id":...}`. `kind` is
`planning` when the session produced the plan and `execution` when it implemented it.

Report, as short markdown bullet lists:

## Friction
- Commands or tools that failed, and what finally worked
- Places where the agent searched repeatedly for the same thing

## Knowledge
- Facts about the codebase the agent had to discover that should have been documented

## Errors
- Every error message worth remembering, quoted verbatim

Only report what the chunk shows. Write "none" under a heading with nothing to report."#;

/// The single synthesis task reads every analysis that succeeded.
pub const SYNTHESIZE_INSTRUCTIONS: &str = r#"You are combining analyses of the agent sessions behind one plan.

Each input file is the analysis of one session chunk. Some analyses may be missing because their
task failed; work with what is there.

Merge duplicate findings, drop anything mentioned only in passing, and rank what remains by how
much time it cost. Output a markdown document with the sections `## Friction`, `## Knowledge` and
`## Errors`."#;

/// Turns the synthesis into a follow-on plan, or the sentinel.
pub const EXTRACT_PLAN_INSTRUCTIONS: &str = r#"You are deciding whether a documentation follow-up is needed.

The input is a synthesis of lessons from the sessions behind one plan. If it contains knowledge
that future sessions would need and that the repository does not document, write a plan to
document it:

# <short imperative title>

<what to document and where, as a numbered list of steps>

If nothing is worth documenting, reply with exactly NO_PLAN and nothing else."#;

/// Title of a produced plan: its first `# ` heading, if any.
pub fn plan_title(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
        .filter(|title| !title.is_empty())
}

/// Whether the extraction declined to produce a plan.
pub fn is_no_plan(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed == NO_PLAN_SENTINEL || trimmed.trim_matches('`').trim() == NO_PLAN_SENTINEL
}
