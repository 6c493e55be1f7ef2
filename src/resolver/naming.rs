//! Branch naming grammar.
//!
//! `<prefix><id>-<slug>[-<secondary-id>][-<MM-DD-HHMM>]`, for example
//! `P42-fix-login-redirect-01-15-1430`. The id segment is matched exactly:
//! `P420-x` never resolves to plan 42.

use crate::plan::PlanId;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Upper bound on the length of a generated branch name.
pub const MAX_BRANCH_LEN: usize = 63;
/// Default upper bound on the slug segment.
pub const DEFAULT_MAX_SLUG_LEN: usize = 31;
/// `chrono` format of the timestamp segment.
pub const TIMESTAMP_FORMAT: &str = "%m-%d-%H%M";

static TAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<slug>.*?)(?:-(?P<secondary>\d+))?(?:-(?P<ts>\d{2}-\d{2}-\d{4}))?$").unwrap()
});

/// A parsed branch name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchName {
    pub id: PlanId,
    pub slug: String,
    pub secondary_id: Option<String>,
    pub timestamp: Option<String>,
}

/// Convert a title into a lowercase, hyphen-separated ASCII slug of at most
/// `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.truncate(max_len);
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "plan".to_string()
    } else {
        slug
    }
}

/// Build a branch name for `id`. The slug is shortened so the whole name
/// stays within [`MAX_BRANCH_LEN`].
pub fn generate_branch_name(
    prefix: &str,
    id: PlanId,
    title: &str,
    secondary_id: Option<&str>,
    timestamp: Option<DateTime<Utc>>,
    max_slug_len: usize,
) -> String {
    let head = format!("{}{}-", prefix, id);
    let mut tail = String::new();
    if let Some(secondary) = secondary_id {
        tail.push('-');
        tail.push_str(secondary);
    }
    if let Some(ts) = timestamp {
        tail.push('-');
        tail.push_str(&ts.format(TIMESTAMP_FORMAT).to_string());
    }

    let room = MAX_BRANCH_LEN.saturating_sub(head.len() + tail.len()).max(1);
    let slug = slugify(title, max_slug_len.min(room));
    format!("{}{}{}", head, slug, tail)
}

/// Extract the plan id from a branch name. Pure; no network access.
pub fn parse_plan_id(prefix: &str, branch: &str) -> Option<PlanId> {
    split_id(prefix, branch).map(|(id, _)| id)
}

/// Parse every segment of a branch name.
pub fn parse_branch_name(prefix: &str, branch: &str) -> Option<BranchName> {
    let (id, rest) = split_id(prefix, branch)?;
    let caps = TAIL_REGEX.captures(rest)?;
    Some(BranchName {
        id,
        slug: caps.name("slug").map_or("", |m| m.as_str()).to_string(),
        secondary_id: caps.name("secondary").map(|m| m.as_str().to_string()),
        timestamp: caps.name("ts").map(|m| m.as_str().to_string()),
    })
}

/// True when `branch` follows the grammar and names exactly `id`.
pub fn branch_matches_id(prefix: &str, branch: &str, id: PlanId) -> bool {
    parse_plan_id(prefix, branch) == Some(id)
}

/// Split `<prefix><digits>[-rest]` into the id and the text after the dash.
fn split_id<'b>(prefix: &str, branch: &'b str) -> Option<(PlanId, &'b str)> {
    let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
    let after_prefix = branch.strip_prefix(prefix)?;
    let digits_len = after_prefix
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits_len == 0 {
        return None;
    }
    let digits = &after_prefix[..digits_len];
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    let id: u64 = digits.parse().ok()?;

    let rest = &after_prefix[digits_len..];
    match rest.strip_prefix('-') {
        Some(tail) => Some((PlanId(id), tail)),
        None if rest.is_empty() => Some((PlanId(id), "")),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-15T14:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Fix Login Redirect!", 40), "fix-login-redirect");
        assert_eq!(slugify("  --Weird__spacing--  ", 40), "weird-spacing");
        assert_eq!(slugify("Ünïcode only ✓", 40), "n-code-only");
        assert_eq!(slugify("!!!", 40), "plan");
        assert_eq!(slugify("abcdef ghij", 7), "abcdef");
    }

    #[test]
    fn test_generate_branch_name() {
        let name = generate_branch_name("P", PlanId(42), "Fix login redirect", None, Some(ts()), 31);
        assert_eq!(name, "P42-fix-login-redirect-01-15-1430");
    }

    #[test]
    fn test_generate_branch_name_with_secondary() {
        let name = generate_branch_name("P", PlanId(42), "Fix", Some("7"), Some(ts()), 31);
        assert_eq!(name, "P42-fix-7-01-15-1430");
    }

    #[test]
    fn test_generated_name_is_bounded() {
        let title = "a very long title that keeps going and going well beyond any limit we set";
        let name = generate_branch_name("plan-", PlanId(123456), title, Some("98765"), Some(ts()), 200);
        assert!(name.len() <= MAX_BRANCH_LEN, "{} is {} chars", name, name.len());
        assert_eq!(parse_plan_id("plan-", &name), Some(PlanId(123456)));
    }

    #[test]
    fn test_resolve_exact_id() {
        assert_eq!(parse_plan_id("P", "P42-foo-01-01-0000"), Some(PlanId(42)));
        assert!(branch_matches_id("P", "P42-foo-01-01-0000", PlanId(42)));
        assert!(!branch_matches_id("P", "P42-foo-01-01-0000", PlanId(7)));
    }

    #[test]
    fn test_no_prefix_or_substring_matching() {
        assert!(!branch_matches_id("P", "P420-foo", PlanId(42)));
        assert!(!branch_matches_id("P", "P4-foo", PlanId(42)));
        assert_eq!(parse_plan_id("P", "xP42-foo"), None);
        assert_eq!(parse_plan_id("P", "p42-foo"), None);
        assert_eq!(parse_plan_id("P", "P42foo"), None);
        assert_eq!(parse_plan_id("P", "P042-foo"), None);
        assert_eq!(parse_plan_id("P", "feature/P42-foo"), None);
        assert_eq!(parse_plan_id("P", "main"), None);
    }

    #[test]
    fn test_bare_id_branch() {
        assert_eq!(parse_plan_id("P", "P42"), Some(PlanId(42)));
        assert_eq!(parse_plan_id("P", "refs/heads/P42-x"), Some(PlanId(42)));
    }

    #[test]
    fn test_parse_branch_name_segments() {
        let parsed = parse_branch_name("P", "P42-fix-login-7-01-15-1430").unwrap();
        assert_eq!(parsed.id, PlanId(42));
        assert_eq!(parsed.slug, "fix-login");
        assert_eq!(parsed.secondary_id.as_deref(), Some("7"));
        assert_eq!(parsed.timestamp.as_deref(), Some("01-15-1430"));

        let parsed = parse_branch_name("P", "P42-fix-login").unwrap();
        assert_eq!(parsed.slug, "fix-login");
        assert!(parsed.secondary_id.is_none());
        assert!(parsed.timestamp.is_none());
    }

    #[test]
    fn test_generate_then_parse() {
        let name = generate_branch_name("P", PlanId(9), "Add retries", None, Some(ts()), 31);
        let parsed = parse_branch_name("P", &name).unwrap();
        assert_eq!(parsed.id, PlanId(9));
        assert_eq!(parsed.slug, "add-retries");
        assert_eq!(parsed.timestamp.as_deref(), Some("01-15-1430"));
    }
}
