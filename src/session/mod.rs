//! Session preprocessing.
//!
//! Agent session logs are large, repetitive and full of telemetry. Before the
//! learn pipeline can read them they are reduced in two stages:
//!
//! 1. [`stage1`]: deterministic. Drops noise kinds, strips telemetry,
//!    removes duplicate content, truncates long parameters and prunes long
//!    results while always keeping error lines.
//! 2. [`judge`]: optional. A generative judge may drop further records, but
//!    never one carrying an error signature.
//!
//! The survivors are split into [`Chunk`]s under a token budget. Local and
//! remote sessions go through the same path.

pub mod chunk;
pub mod discovery;
pub mod judge;
pub mod stage1;

pub use chunk::{CHARS_PER_TOKEN, Chunk, chunk_records};
pub use discovery::discover_sessions;
pub use judge::{GeneratorJudge, NoiseJudge, Verdict};
pub use stage1::Stage1Stats;

use crate::errors::PreprocessError;
use crate::plan::PlanId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Where a session log came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Local,
    Remote,
}

/// Planning sessions produced the plan; execution sessions implemented it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Planning,
    Execution,
}

impl SessionKind {
    /// Tag a session by comparing its id with the planning session id.
    pub fn classify(session_id: &str, planning_session_id: Option<&str>) -> Self {
        if planning_session_id == Some(session_id) {
            Self::Planning
        } else {
            Self::Execution
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Execution => "execution",
        }
    }
}

/// A discovered session log. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub source_type: SourceType,
    pub origin_path: PathBuf,
    pub owning_plan_id: Option<PlanId>,
}

impl SessionRecord {
    /// A record for the log at `path`, identified by its file stem.
    pub fn from_path(path: &Path, source_type: SourceType, owning_plan_id: Option<PlanId>) -> Option<Self> {
        let id = path.file_stem()?.to_str()?.to_string();
        Some(Self {
            id,
            source_type,
            origin_path: path.to_path_buf(),
            owning_plan_id,
        })
    }
}

/// Preprocessing knobs. Mirrors the `[preprocess]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_max_param_chars")]
    pub max_param_chars: usize,
    #[serde(default = "default_result_line_budget")]
    pub result_line_budget: usize,
    #[serde(default)]
    pub stage2: bool,
}

fn default_token_budget() -> usize {
    20_000
}

fn default_max_param_chars() -> usize {
    200
}

fn default_result_line_budget() -> usize {
    40
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            max_param_chars: default_max_param_chars(),
            result_line_budget: default_result_line_budget(),
            stage2: false,
        }
    }
}

/// Full preprocessing counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreprocessStats {
    #[serde(flatten)]
    pub stage1: Stage1Stats,
    pub stage2_dropped: usize,
    pub output_records: usize,
}

/// One session, reduced and chunked.
#[derive(Debug, Clone)]
pub struct PreprocessedSession {
    pub session_id: String,
    pub kind: SessionKind,
    pub chunks: Vec<Chunk>,
    pub stats: PreprocessStats,
}

impl PreprocessedSession {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Write every chunk into `dir`, returning the written paths in chunk
    /// order.
    pub async fn write_chunks(&self, dir: &Path) -> Result<Vec<PathBuf>, PreprocessError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| PreprocessError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        let mut paths = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            let path = dir.join(chunk.file_name());
            let mut file = match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(PreprocessError::ChunkExists { path });
                }
                Err(source) => return Err(PreprocessError::Write { path, source }),
            };
            let written = match file.write_all(chunk.render().as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            written.map_err(|source| PreprocessError::Write {
                path: path.clone(),
                source,
            })?;
            paths.push(path);
        }
        Ok(paths)
    }
}

pub struct Preprocessor {
    config: PreprocessConfig,
    judge: Option<Arc<dyn NoiseJudge>>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config, judge: None }
    }

    /// Enable stage 2. Ignored unless `config.stage2` is set.
    pub fn with_judge(mut self, judge: Arc<dyn NoiseJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Reduce already-loaded JSONL text.
    pub async fn preprocess_text(
        &self,
        session_id: &str,
        text: &str,
        planning_session_id: Option<&str>,
    ) -> PreprocessedSession {
        let kind = SessionKind::classify(session_id, planning_session_id);
        let (mut records, stage1) = stage1::reduce(text, &self.config);

        let mut stage2_dropped = 0;
        if self.config.stage2
            && let Some(judge) = &self.judge
        {
            let (kept, dropped) = judge::apply(judge.as_ref(), records).await;
            records = kept;
            stage2_dropped = dropped;
        }

        let chunks = chunk_records(&records, self.config.token_budget, kind, session_id);
        let stats = PreprocessStats {
            stage1,
            stage2_dropped,
            output_records: records.len(),
        };
        info!(
            session_id,
            kind = kind.as_str(),
            input = stats.stage1.input_records,
            output = stats.output_records,
            chunks = chunks.len(),
            "Preprocessed session"
        );
        PreprocessedSession {
            session_id: session_id.to_string(),
            kind,
            chunks,
            stats,
        }
    }

    /// Read and reduce one session log.
    pub async fn preprocess(
        &self,
        session: &SessionRecord,
        planning_session_id: Option<&str>,
    ) -> Result<PreprocessedSession, PreprocessError> {
        let text = tokio::fs::read_to_string(&session.origin_path)
            .await
            .map_err(|source| PreprocessError::Read {
                path: session.origin_path.clone(),
                source,
            })?;
        Ok(self
            .preprocess_text(&session.id, &text, planning_session_id)
            .await)
    }
}
