//! Deterministic reduction of a session log.
//!
//! Same input and config always give byte-identical output: records are
//! re-serialized with sorted keys and every rule below is a pure function of
//! the record and of the records before it.

use super::PreprocessConfig;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Record kinds that never carry useful content.
pub const NOISE_KINDS: &[&str] = &[
    "summary",
    "file-history-snapshot",
    "progress",
    "system",
    "queue-operation",
];

/// Volatile fields stripped from records and their `message` object.
pub const TELEMETRY_FIELDS: &[&str] = &[
    "uuid",
    "parentUuid",
    "timestamp",
    "requestId",
    "costUSD",
    "durationMs",
    "usage",
    "cwd",
    "version",
    "gitBranch",
    "userType",
    "isSidechain",
    "sessionId",
];

static ERROR_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(errors?|exceptions?|traceback|panic(ked)?|fatal|fail(ed|ure)?)\b").unwrap()
});

/// True when `line` looks like part of a failure report.
pub fn is_error_line(line: &str) -> bool {
    ERROR_SIGNATURE.is_match(line)
}

/// True when any string inside `value` contains an error signature.
pub fn contains_error_signature(value: &Value) -> bool {
    match value {
        Value::String(s) => s.lines().any(is_error_line),
        Value::Array(items) => items.iter().any(contains_error_signature),
        Value::Object(map) => map.values().any(contains_error_signature),
        _ => false,
    }
}

/// Counters describing what stage 1 removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stage1Stats {
    pub input_records: usize,
    pub unparseable: usize,
    pub noise_dropped: usize,
    pub duplicates_dropped: usize,
    pub params_truncated: usize,
    pub lines_pruned: usize,
}

/// Run stage 1 over raw JSONL text.
pub fn reduce(input: &str, config: &PreprocessConfig) -> (Vec<Value>, Stage1Stats) {
    let mut stats = Stage1Stats::default();
    let mut seen: HashSet<[u8; 32]> = HashSet::new();
    let mut records = Vec::new();

    for (lineno, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        stats.input_records += 1;
        let mut record: Value = match serde_json::from_str(line) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                stats.unparseable += 1;
                continue;
            }
        };

        let kind = record_kind(&record).to_string();
        if NOISE_KINDS.contains(&kind.as_str()) {
            stats.noise_dropped += 1;
            continue;
        }

        strip_telemetry(&mut record);
        if !dedup(&mut record, &kind, &mut seen) {
            stats.duplicates_dropped += 1;
            continue;
        }
        stats.params_truncated += truncate_params(&mut record, config.max_param_chars);
        stats.lines_pruned += prune_results(&mut record, config.result_line_budget);

        debug!(line = lineno + 1, kind = %kind, "Kept record");
        records.push(record);
    }

    if stats.unparseable > 0 {
        warn!(count = stats.unparseable, "Skipped unparseable session lines");
    }
    (records, stats)
}

/// The record's `type`, or `""`.
pub fn record_kind(record: &Value) -> &str {
    record.get("type").and_then(Value::as_str).unwrap_or("")
}

fn strip_telemetry(record: &mut Value) {
    let strip = |map: &mut Map<String, Value>| {
        for field in TELEMETRY_FIELDS {
            map.remove(*field);
        }
    };
    if let Value::Object(map) = record {
        strip(map);
        if let Some(Value::Object(message)) = map.get_mut("message") {
            strip(message);
        }
    }
}

fn content_hash(tag: &str, value: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update([0u8]);
    hasher.update(value.to_string().as_bytes());
    hasher.finalize().into()
}

/// Content blocks of a record: `message.content` or `content` when it is an
/// array.
fn blocks_mut(record: &mut Value) -> Option<&mut Vec<Value>> {
    let has_message_blocks = record
        .get("message")
        .and_then(|m| m.get("content"))
        .is_some_and(Value::is_array);
    let target = if has_message_blocks {
        record.get_mut("message")?.get_mut("content")?
    } else {
        record.get_mut("content")?
    };
    target.as_array_mut()
}

/// Drop blocks already seen in this session. Returns false when nothing of
/// the record is left.
fn dedup(record: &mut Value, kind: &str, seen: &mut HashSet<[u8; 32]>) -> bool {
    if let Some(blocks) = blocks_mut(record)
        && !blocks.is_empty()
    {
        blocks.retain(|block| seen.insert(content_hash(kind, block)));
        return !blocks.is_empty();
    }
    seen.insert(content_hash(kind, record))
}

/// Parameter objects: top-level `input`, plus `input` of `tool_use` blocks.
fn for_each_input(record: &mut Value, mut f: impl FnMut(&mut Value)) {
    if let Some(input) = record.get_mut("input") {
        f(input);
    }
    if let Some(blocks) = blocks_mut(record) {
        for block in blocks.iter_mut() {
            if record_kind(block) == "tool_use"
                && let Some(input) = block.get_mut("input")
            {
                f(input);
            }
        }
    }
}

fn truncate_params(record: &mut Value, max_chars: usize) -> usize {
    let mut count = 0;
    for_each_input(record, |input| count += truncate_strings(input, max_chars));
    count
}

fn truncate_strings(value: &mut Value, max_chars: usize) -> usize {
    match value {
        Value::String(s) => match truncate_value(s, max_chars) {
            Some(short) => {
                *s = short;
                1
            }
            None => 0,
        },
        Value::Array(items) => items.iter_mut().map(|v| truncate_strings(v, max_chars)).sum(),
        Value::Object(map) => map.values_mut().map(|v| truncate_strings(v, max_chars)).sum(),
        _ => 0,
    }
}

fn is_path_like(s: &str) -> bool {
    s.contains('/') && !s.chars().any(char::is_whitespace)
}

/// Shorten `s` to about `max_chars`, or `None` when it already fits.
///
/// Paths keep their first component and as many trailing components as fit,
/// so the file name survives. Other text keeps a head and a tail.
pub fn truncate_value(s: &str, max_chars: usize) -> Option<String> {
    let len = s.chars().count();
    if len <= max_chars {
        return None;
    }
    if is_path_like(s) {
        let parts: Vec<&str> = s.split('/').collect();
        let head = parts[0];
        let mut tail: Vec<&str> = Vec::new();
        let mut used = head.chars().count() + 4;
        for part in parts[1..].iter().rev() {
            let cost = part.chars().count() + 1;
            if !tail.is_empty() && used + cost > max_chars {
                break;
            }
            used += cost;
            tail.push(part);
        }
        tail.reverse();
        return Some(format!("{}/.../{}", head, tail.join("/")));
    }

    let keep = max_chars.max(2);
    if keep >= len {
        return None;
    }
    let head_len = keep / 2;
    let tail_len = keep - head_len;
    let head: String = s.chars().take(head_len).collect();
    let tail: String = s.chars().skip(len - tail_len).collect();
    Some(format!("{}...[{} chars]...{}", head, len - keep, tail))
}

/// Result payloads: top-level `content` of `tool_result` records and
/// `content` of `tool_result` blocks.
fn prune_results(record: &mut Value, budget: usize) -> usize {
    let mut pruned = 0;
    if record_kind(record) == "tool_result"
        && let Some(content) = record.get_mut("content")
    {
        pruned += prune_value(content, budget);
    }
    if let Some(blocks) = blocks_mut(record) {
        for block in blocks.iter_mut() {
            if record_kind(block) == "tool_result"
                && let Some(content) = block.get_mut("content")
            {
                pruned += prune_value(content, budget);
            }
        }
    }
    pruned
}

fn prune_value(value: &mut Value, budget: usize) -> usize {
    match value {
        Value::String(s) => {
            let (text, pruned) = prune_lines(s, budget);
            *s = text;
            pruned
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| match item.get_mut("text") {
                Some(text) => prune_value(text, budget),
                None => 0,
            })
            .sum(),
        _ => 0,
    }
}

/// Keep the first and last lines of `text` within `budget`, plus every
/// error line in between regardless of budget. Gaps become a marker line.
/// Returns the new text and the number of lines removed.
pub fn prune_lines(text: &str, budget: usize) -> (String, usize) {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= budget {
        return (text.to_string(), 0);
    }
    let head = budget / 2;
    let tail_start = lines.len() - (budget - head);

    let mut out: Vec<String> = Vec::new();
    let mut gap = 0usize;
    let mut pruned = 0usize;
    for (i, line) in lines.iter().enumerate() {
        if i < head || i >= tail_start || is_error_line(line) {
            if gap > 0 {
                out.push(format!("... [{} lines pruned] ...", gap));
                gap = 0;
            }
            out.push((*line).to_string());
        } else {
            gap += 1;
            pruned += 1;
        }
    }
    if gap > 0 {
        out.push(format!("... [{} lines pruned] ...", gap));
    }
    (out.join("\n"), pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> PreprocessConfig {
        PreprocessConfig {
            max_param_chars: 40,
            result_line_budget: 6,
            ..Default::default()
        }
    }

    fn jsonl(records: &[Value]) -> String {
        records
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_drops_noise_and_telemetry() {
        let input = jsonl(&[
            json!({"type": "summary", "summary": "x"}),
            json!({"type": "progress", "pct": 10}),
            json!({"type": "user", "uuid": "u1", "timestamp": "t", "message": {"content": "hello", "usage": {}}}),
        ]);
        let (records, stats) = reduce(&input, &config());
        assert_eq!(records, vec![json!({"type": "user", "message": {"content": "hello"}})]);
        assert_eq!(stats.noise_dropped, 2);
    }

    #[test]
    fn test_unparseable_lines_are_skipped() {
        let input = "not json\n[1,2]\n{\"type\":\"user\",\"content\":\"hi\"}\n";
        let (records, stats) = reduce(input, &config());
        assert_eq!(records.len(), 1);
        assert_eq!(stats.unparseable, 2);
        assert_eq!(stats.input_records, 3);
    }

    #[test]
    fn test_duplicate_records_removed() {
        let input = jsonl(&[
            json!({"type": "tool_result", "content": "same", "uuid": "a"}),
            json!({"type": "tool_result", "content": "same", "uuid": "b"}),
            json!({"type": "user", "content": "same"}),
        ]);
        let (records, stats) = reduce(&input, &config());
        assert_eq!(records.len(), 2);
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[test]
    fn test_duplicate_blocks_removed_from_message() {
        let block = json!({"type": "text", "text": "repeated analysis"});
        let input = jsonl(&[
            json!({"type": "assistant", "message": {"content": [block.clone()]}}),
            json!({"type": "assistant", "message": {"content": [block.clone(), {"type": "text", "text": "new"}]}}),
            json!({"type": "assistant", "message": {"content": [block]}}),
        ]);
        let (records, stats) = reduce(&input, &config());
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["message"]["content"], json!([{"type": "text", "text": "new"}]));
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[test]
    fn test_truncate_path_keeps_file_name() {
        let path = "/home/dev/projects/planwright/src/session/deeply/nested/module/stage1.rs";
        let short = truncate_value(path, 40).unwrap();
        assert!(short.starts_with("/.../"), "{}", short);
        assert!(short.ends_with("module/stage1.rs"), "{}", short);
        assert!(short.chars().count() <= 40 + 5);
    }

    #[test]
    fn test_truncate_text_keeps_head_and_tail() {
        let text = format!("BEGIN {} END", "x".repeat(100));
        let short = truncate_value(&text, 20).unwrap();
        assert!(short.starts_with("BEGIN"));
        assert!(short.ends_with("END"));
        assert!(short.contains("chars]"));
        assert_eq!(truncate_value("short", 20), None);
    }

    #[test]
    fn test_truncate_with_zero_budget() {
        assert_eq!(truncate_value("a", 0), None);
        assert_eq!(truncate_value("ab", 0), None);
        let short = truncate_value("abcdef", 0).unwrap();
        assert_eq!(short, "a...[4 chars]...f");
        let path = truncate_value("a/b", 0).unwrap();
        assert!(path.ends_with("/b"), "{}", path);
    }

    #[test]
    fn test_tool_use_params_truncated() {
        let long = "y".repeat(200);
        let input = jsonl(&[json!({
            "type": "assistant",
            "message": {"content": [{"type": "tool_use", "name": "Write", "input": {"content": long}}]}
        })]);
        let (records, stats) = reduce(&input, &config());
        assert_eq!(stats.params_truncated, 1);
        let written = records[0]["message"]["content"][0]["input"]["content"]
            .as_str()
            .unwrap();
        assert!(written.len() < 100);
    }

    #[test]
    fn test_prune_lines_keeps_error_lines_beyond_budget() {
        let mut lines: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
        lines[20] = "error[E0308]: mismatched types".to_string();
        lines[30] = "thread 'main' panicked at src/lib.rs".to_string();
        let (text, pruned) = prune_lines(&lines.join("\n"), 6);

        assert!(text.contains("error[E0308]"));
        assert!(text.contains("panicked"));
        assert!(text.starts_with("line 0\nline 1\nline 2\n"));
        assert!(text.ends_with("line 47\nline 48\nline 49"));
        assert_eq!(pruned, 42);
    }

    #[test]
    fn test_prune_within_budget_is_untouched() {
        let (text, pruned) = prune_lines("a\nb", 6);
        assert_eq!(text, "a\nb");
        assert_eq!(pruned, 0);
    }

    #[test]
    fn test_tool_result_pruned() {
        let body: Vec<String> = (0..20).map(|i| format!("ok {}", i)).collect();
        let input = jsonl(&[json!({"type": "tool_result", "content": body.join("\n")})]);
        let (records, stats) = reduce(&input, &config());
        assert_eq!(stats.lines_pruned, 14);
        assert!(records[0]["content"].as_str().unwrap().contains("[14 lines pruned]"));
    }

    #[test]
    fn test_stage1_is_deterministic() {
        let input = jsonl(&[
            json!({"type": "user", "b": 1, "a": 2, "content": "x"}),
            json!({"type": "tool_result", "content": "failed: boom\nmore"}),
        ]);
        let first: Vec<String> = reduce(&input, &config()).0.iter().map(Value::to_string).collect();
        let second: Vec<String> = reduce(&input, &config()).0.iter().map(Value::to_string).collect();
        assert_eq!(first, second);
        assert!(first[0].starts_with(r#"{"a":2,"b":1"#));
    }

    #[test]
    fn test_error_signature() {
        assert!(is_error_line("Error: file not found"));
        assert!(is_error_line("test result: FAILED. 1 failed"));
        assert!(is_error_line("Traceback (most recent call last):"));
        assert!(!is_error_line("all good"));
        assert!(!is_error_line("terrorism"));
        assert!(contains_error_signature(&json!({"content": [{"text": "fatal: not a git repository"}]})));
    }
}
