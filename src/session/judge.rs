//! Optional stage 2: a generative judge for the noise stage 1 cannot decide.
//!
//! The judge only ever sees records without error signatures, and every
//! failure mode (transport error, unparseable reply, wrong verdict count)
//! keeps the records.

use super::stage1::contains_error_signature;
use crate::remote::TextGenerator;
use crate::util::extract_json_object;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// What the judge thinks of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Keep,
    Drop,
    #[serde(other)]
    Unsure,
}

#[async_trait]
pub trait NoiseJudge: Send + Sync {
    /// One verdict per candidate, in order.
    async fn judge(&self, candidates: &[&Value]) -> anyhow::Result<Vec<Verdict>>;
}

/// Asks a [`TextGenerator`] for verdicts as `{"verdicts": ["keep", ...]}`.
pub struct GeneratorJudge {
    generator: Arc<dyn TextGenerator>,
}

impl GeneratorJudge {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    fn prompt(candidates: &[&Value]) -> String {
        let mut prompt = String::from(
            "You are filtering an agent session log before analysis. For each numbered \
             record, answer \"drop\" only if it is pure noise or repeats earlier content, \
             \"keep\" otherwise. When unsure answer \"keep\". Reply with JSON only: \
             {\"verdicts\": [\"keep\" | \"drop\", ...]} with exactly one entry per record.\n\n",
        );
        for (i, record) in candidates.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i, record));
        }
        prompt
    }
}

#[derive(Deserialize)]
struct VerdictReply {
    verdicts: Vec<Verdict>,
}

#[async_trait]
impl NoiseJudge for GeneratorJudge {
    async fn judge(&self, candidates: &[&Value]) -> anyhow::Result<Vec<Verdict>> {
        let reply = self.generator.generate(&Self::prompt(candidates)).await?;
        let json = extract_json_object(&reply)
            .ok_or_else(|| anyhow::anyhow!("judge reply contained no JSON object"))?;
        let parsed: VerdictReply = serde_json::from_str(json)?;
        Ok(parsed.verdicts)
    }
}

/// Apply the judge to `records`. Returns the survivors and how many were
/// dropped.
pub async fn apply(judge: &dyn NoiseJudge, records: Vec<Value>) -> (Vec<Value>, usize) {
    let candidate_idx: Vec<usize> = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !contains_error_signature(r))
        .map(|(i, _)| i)
        .collect();
    if candidate_idx.is_empty() {
        return (records, 0);
    }

    let candidates: Vec<&Value> = candidate_idx.iter().map(|&i| &records[i]).collect();
    let verdicts = match judge.judge(&candidates).await {
        Ok(v) if v.len() == candidates.len() => v,
        Ok(v) => {
            warn!(expected = candidates.len(), got = v.len(), "Judge verdict count mismatch, keeping all records");
            return (records, 0);
        }
        Err(e) => {
            warn!(error = %e, "Noise judge failed, keeping all records");
            return (records, 0);
        }
    };

    let mut drop = vec![false; records.len()];
    for (&i, verdict) in candidate_idx.iter().zip(&verdicts) {
        drop[i] = *verdict == Verdict::Drop;
    }
    let dropped = drop.iter().filter(|d| **d).count();
    debug!(candidates = candidates.len(), dropped, "Stage 2 applied");

    let kept = records
        .into_iter()
        .zip(drop)
        .filter_map(|(record, drop)| (!drop).then_some(record))
        .collect();
    (kept, dropped)
}
