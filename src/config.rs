//! Configuration read from `.planwright/planwright.toml`.
//!
//! Layered: file, then environment, then command-line overrides applied by
//! the binary. Every section and field has a default, so an absent file is
//! the same as an empty one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [backend]
//! provider = "issue"          # or "draft_pr"
//! repo = "owner/repo"
//! trunk = "main"
//! plan_label = "plan"
//! learn_label = "learn-plan"
//!
//! [branches]
//! prefix = "P"
//! max_slug_len = 30
//!
//! [lifecycle]
//! no_changes_label = "no-changes"
//! implement_workflow = "implement-plan.yml"
//!
//! [preprocess]
//! token_budget = 20000
//! max_param_chars = 200
//! result_line_budget = 40
//! stage2 = false
//!
//! [pipeline]
//! scratch_root = "/tmp/planwright-runs"
//! task_timeout_secs = 900
//! max_parallel = 4
//! generator_cmd = "claude"
//! generator_args = ["-p"]
//!
//! [logging]
//! level = "warn"
//! json = false
//! file = ".planwright/logs/planwright.log"
//! ```

use crate::lifecycle::LifecycleConfig;
use crate::logging::LoggingConfig;
use crate::pipeline::PipelineConfig;
use crate::plan::BackendProvider;
use crate::resolver::DEFAULT_MAX_SLUG_LEN;
use crate::session::PreprocessConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".planwright";
pub const CONFIG_FILE: &str = "planwright.toml";

pub const ENV_REPO: &str = "PLANWRIGHT_REPO";
pub const ENV_PROVIDER: &str = "PLANWRIGHT_PROVIDER";
pub const ENV_TRUNK: &str = "PLANWRIGHT_TRUNK";

/// Where plans live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub provider: BackendProvider,
    /// `owner/repo`. When unset the binary derives it from the git remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default = "default_trunk")]
    pub trunk: String,
    #[serde(default = "default_plan_label")]
    pub plan_label: String,
    #[serde(default = "default_learn_label")]
    pub learn_label: String,
}

fn default_trunk() -> String {
    "main".to_string()
}

fn default_plan_label() -> String {
    "plan".to_string()
}

fn default_learn_label() -> String {
    "learn-plan".to_string()
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            provider: BackendProvider::default(),
            repo: None,
            trunk: default_trunk(),
            plan_label: default_plan_label(),
            learn_label: default_learn_label(),
        }
    }
}

/// Branch naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchesSection {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_max_slug_len")]
    pub max_slug_len: usize,
}

fn default_prefix() -> String {
    "P".to_string()
}

fn default_max_slug_len() -> usize {
    DEFAULT_MAX_SLUG_LEN
}

impl Default for BranchesSection {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_slug_len: default_max_slug_len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSection {
    #[serde(default = "default_no_changes_label")]
    pub no_changes_label: String,
    /// Workflow file triggered by dispatch.
    #[serde(default = "default_implement_workflow")]
    pub implement_workflow: String,
}

fn default_no_changes_label() -> String {
    "no-changes".to_string()
}

fn default_implement_workflow() -> String {
    "implement-plan.yml".to_string()
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            no_changes_label: default_no_changes_label(),
            implement_workflow: default_implement_workflow(),
        }
    }
}

/// Pipeline runs and the generator CLI their tasks call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Defaults to `planwright-runs` under the system temp dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_root: Option<PathBuf>,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_generator_cmd")]
    pub generator_cmd: String,
    #[serde(default = "default_generator_args")]
    pub generator_args: Vec<String>,
}

fn default_task_timeout_secs() -> u64 {
    900
}

fn default_max_parallel() -> usize {
    4
}

fn default_generator_cmd() -> String {
    "claude".to_string()
}

fn default_generator_args() -> Vec<String> {
    vec!["-p".to_string()]
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            scratch_root: None,
            task_timeout_secs: default_task_timeout_secs(),
            max_parallel: default_max_parallel(),
            generator_cmd: default_generator_cmd(),
            generator_args: default_generator_args(),
        }
    }
}

/// The complete planwright.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanwrightToml {
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub branches: BranchesSection,
    #[serde(default)]
    pub lifecycle: LifecycleSection,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PlanwrightToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse planwright.toml")
    }

    /// Load `<config_dir>/planwright.toml`, or defaults when it is absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize planwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Overlay environment values read through `lookup`. Returns warnings for
    /// values that could not be applied.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Vec<String> {
        let mut warnings = Vec::new();
        let read = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(repo) = read(ENV_REPO) {
            self.backend.repo = Some(repo);
        }
        if let Some(trunk) = read(ENV_TRUNK) {
            self.backend.trunk = trunk;
        }
        if let Some(provider) = read(ENV_PROVIDER) {
            match provider.parse() {
                Ok(provider) => self.backend.provider = provider,
                Err(e) => warnings.push(format!("Ignoring {}: {}", ENV_PROVIDER, e)),
            }
        }
        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(ref repo) = self.backend.repo {
            let parts: Vec<&str> = repo.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                warnings.push(format!("Invalid repo '{}': expected 'owner/repo'", repo));
            }
        }
        if self.backend.trunk.trim().is_empty() {
            warnings.push("backend.trunk is empty; branches will have no base".to_string());
        }
        if self.backend.plan_label == self.backend.learn_label {
            warnings.push(format!(
                "plan_label and learn_label are both '{}'; learn plans cannot be told apart",
                self.backend.plan_label
            ));
        }

        let prefix = &self.branches.prefix;
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
            warnings.push(format!(
                "Invalid branch prefix '{}': use ASCII letters only so branch ids parse back",
                prefix
            ));
        }
        if self.branches.max_slug_len == 0 {
            warnings.push("branches.max_slug_len is 0; branch names will carry no title".to_string());
        }

        if self.preprocess.token_budget == 0 {
            warnings.push("preprocess.token_budget is 0; every record becomes its own chunk".to_string());
        }
        if self.preprocess.max_param_chars == 0 {
            warnings.push("preprocess.max_param_chars is 0; long parameters keep only two characters".to_string());
        }
        if self.pipeline.max_parallel == 0 {
            warnings.push("pipeline.max_parallel is 0; tasks will run one at a time".to_string());
        }
        if self.pipeline.task_timeout_secs == 0 {
            warnings.push("pipeline.task_timeout_secs is 0; every task will time out".to_string());
        }
        if self.pipeline.generator_cmd.trim().is_empty() {
            warnings.push("pipeline.generator_cmd is empty".to_string());
        }
        warnings
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            branch_prefix: self.branches.prefix.clone(),
            max_slug_len: self.branches.max_slug_len,
            trunk: self.backend.trunk.clone(),
            plan_label: self.backend.plan_label.clone(),
            learn_label: self.backend.learn_label.clone(),
            no_changes_label: self.lifecycle.no_changes_label.clone(),
            implement_workflow: self.lifecycle.implement_workflow.clone(),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            scratch_root: self.pipeline.scratch_root.clone().unwrap_or(defaults.scratch_root),
            max_parallel: self.pipeline.max_parallel.max(1),
            task_timeout: Duration::from_secs(self.pipeline.task_timeout_secs),
        }
    }
}

/// Configuration for one project directory: the parsed file plus the
/// process environment.
#[derive(Debug, Clone)]
pub struct PlanwrightConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: PlanwrightToml,
    /// Problems found while loading, for the binary to report.
    pub warnings: Vec<String>,
}

impl PlanwrightConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        Self::with_env(project_dir, |name| std::env::var(name).ok())
    }

    pub fn with_env(project_dir: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = PlanwrightToml::load_or_default(&config_dir)?;
        let mut warnings = toml.apply_env(lookup);
        warnings.extend(toml.validate());
        Ok(Self {
            project_dir,
            config_dir,
            toml,
            warnings,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    /// Logging settings with the log file anchored at the project directory.
    pub fn logging(&self) -> LoggingConfig {
        let mut logging = self.toml.logging.clone();
        logging.file = logging.file.map(|f| self.resolve(&f));
        logging
    }
}
