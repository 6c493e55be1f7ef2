//! Splitting reduced records into size-bounded chunks.

use super::SessionKind;
use crate::util::file_safe;
use serde::Serialize;
use serde_json::Value;

/// Characters per token used for budget estimates.
pub const CHARS_PER_TOKEN: usize = 4;

/// A self-describing slice of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub total: usize,
    pub kind: SessionKind,
    pub session_id: String,
    /// Compact JSON, one record per line.
    pub lines: Vec<String>,
}

#[derive(Serialize)]
struct ChunkHeader<'a> {
    chunk: usize,
    of: usize,
    kind: SessionKind,
    session_id: &'a str,
}

impl Chunk {
    /// `{kind}-{session}-partNN.jsonl`, with the session id reduced to
    /// filename-safe characters.
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}-part{:02}.jsonl",
            self.kind.as_str(),
            file_safe(&self.session_id),
            self.index
        )
    }

    /// Header line followed by the records.
    pub fn render(&self) -> String {
        let header = ChunkHeader {
            chunk: self.index,
            of: self.total,
            kind: self.kind,
            session_id: &self.session_id,
        };
        let mut out = serde_json::to_string(&header).unwrap_or_default();
        out.push('\n');
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    pub fn estimated_tokens(&self) -> usize {
        self.lines.iter().map(|l| l.len() + 1).sum::<usize>().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Pack `records` greedily into chunks of at most `token_budget` tokens.
/// Records are never split; one larger than the budget gets a chunk to
/// itself.
pub fn chunk_records(
    records: &[Value],
    token_budget: usize,
    kind: SessionKind,
    session_id: &str,
) -> Vec<Chunk> {
    let char_budget = token_budget.saturating_mul(CHARS_PER_TOKEN).max(1);
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut used = 0usize;

    for record in records {
        let line = record.to_string();
        let cost = line.len() + 1;
        if !current.is_empty() && used + cost > char_budget {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cost;
        current.push(line);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let total = groups.len();
    groups
        .into_iter()
        .enumerate()
        .map(|(i, lines)| Chunk {
            index: i + 1,
            total,
            kind,
            session_id: session_id.to_string(),
            lines,
        })
        .collect()
}
