use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use planwright::config::PlanwrightConfig;
use planwright::errors::{
    LearnError, LifecycleError, PipelineError, PlanError, PreprocessError, RemoteError, UserFacingError, VcsError,
};
use planwright::plan::PlanId;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;

mod cmd;

#[derive(Parser)]
#[command(name = "planwright")]
#[command(version, about = "Plan lifecycle tracking and session learning")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the plan id encoded in a branch name
    ResolveBranch {
        branch: String,

        /// Print every parsed component as JSON
        #[arg(long)]
        json: bool,

        /// Also load the plan from the backend
        #[arg(long)]
        lookup: bool,
    },
    /// Read plan metadata
    Metadata {
        #[command(subcommand)]
        command: MetadataCommands,
    },
    /// Mine session logs into a follow-on plan
    Learn {
        #[command(subcommand)]
        command: LearnCommands,
    },
    /// Reduce one session log into chunk files
    Preprocess {
        session: PathBuf,

        /// Directory to write chunks into
        #[arg(long)]
        out: PathBuf,

        /// Id of the session that wrote the plan
        #[arg(long)]
        planning_session: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum MetadataCommands {
    /// Print one plan header field
    Get {
        id: PlanId,
        field: String,

        /// Print the value as JSON even when it is a string
        #[arg(long)]
        json: bool,
    },
    /// Decode a metadata block from a local file
    Decode {
        file: PathBuf,

        /// Block key (defaults to plan-header)
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum LearnCommands {
    /// Run the learn pipeline for a plan
    Run {
        plan_id: PlanId,

        /// Session log to learn from (repeatable)
        #[arg(long = "session")]
        sessions: Vec<PathBuf>,

        /// Directory to search for *.jsonl session logs
        #[arg(long)]
        sessions_dir: Option<PathBuf>,

        /// Id of the session that wrote the plan
        #[arg(long)]
        planning_session: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default planwright.toml file
    Init,
}

/// Map an error to what the user sees, preferring the typed errors anywhere
/// in the chain.
fn user_facing(err: &anyhow::Error) -> UserFacingError {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<UserFacingError>() {
            return e.clone();
        }
        if let Some(e) = cause.downcast_ref::<LearnError>() {
            return e.into();
        }
        if let Some(e) = cause.downcast_ref::<LifecycleError>() {
            return e.into();
        }
        if let Some(e) = cause.downcast_ref::<PlanError>() {
            return e.into();
        }
        if let Some(e) = cause.downcast_ref::<PipelineError>() {
            return e.into();
        }
        if let Some(e) = cause.downcast_ref::<PreprocessError>() {
            return e.into();
        }
        if let Some(e) = cause.downcast_ref::<RemoteError>() {
            return e.into();
        }
        if let Some(e) = cause.downcast_ref::<VcsError>() {
            return e.into();
        }
    }
    UserFacingError::new("failed", format!("{:#}", err))
}

async fn run(cli: Cli) -> Result<()> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = PlanwrightConfig::new(project_dir)?;

    let mut logging = config.logging();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    planwright::logging::init(&logging);
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    match cli.command {
        Commands::ResolveBranch { branch, json, lookup } => {
            cmd::cmd_resolve_branch(&config, &branch, json, lookup).await?
        }
        Commands::Metadata { command } => match command {
            MetadataCommands::Get { id, field, json } => cmd::cmd_metadata_get(&config, id, &field, json).await?,
            MetadataCommands::Decode { file, key } => {
                cmd::cmd_metadata_decode(&file, key.as_deref())?
            }
        },
        Commands::Learn { command } => match command {
            LearnCommands::Run {
                plan_id,
                sessions,
                sessions_dir,
                planning_session,
                json,
            } => {
                cmd::cmd_learn_run(
                    &config,
                    plan_id,
                    &sessions,
                    sessions_dir.as_deref(),
                    planning_session,
                    json,
                )
                .await?
            }
        },
        Commands::Preprocess {
            session,
            out,
            planning_session,
        } => {
            cmd::cmd_preprocess(&config, &session, &out, planning_session.as_deref()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command)?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", user_facing(&err));
            ExitCode::FAILURE
        }
    }
}
