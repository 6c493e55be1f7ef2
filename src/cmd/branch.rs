//! `planwright resolve-branch`: map a branch name to its plan.

use anyhow::Result;
use planwright::config::PlanwrightConfig;
use planwright::errors::UserFacingError;
use planwright::resolver::{BranchPlan, parse_branch_name};
use serde_json::json;

use super::services;

fn not_a_plan_branch(branch: &str, prefix: &str) -> anyhow::Error {
    UserFacingError::new(
        "not-a-plan-branch",
        format!("'{}' does not follow the {}<id>-<slug> branch grammar", branch, prefix),
    )
    .into()
}

pub async fn cmd_resolve_branch(config: &PlanwrightConfig, branch: &str, json: bool, lookup: bool) -> Result<()> {
    let prefix = &config.toml.branches.prefix;
    let Some(parsed) = parse_branch_name(prefix, branch) else {
        return Err(not_a_plan_branch(branch, prefix));
    };

    if lookup {
        let lifecycle = services::open_lifecycle(config)?;
        match lifecycle.resolver().get_plan_for_branch(branch).await? {
            BranchPlan::Found(plan) => {
                if json {
                    println!(
                        "{}",
                        json!({
                            "id": plan.id.0,
                            "title": plan.title,
                            "stage": plan.stage.as_str(),
                            "branch_name": plan.branch_name,
                        })
                    );
                } else {
                    println!("{}\t{}\t{}", plan.id, plan.stage.as_str(), plan.title);
                }
                return Ok(());
            }
            BranchPlan::PlanNotFound(id) => {
                return Err(UserFacingError::new(
                    "plan-not-found",
                    format!("branch '{}' names plan {}, which does not exist", branch, id),
                )
                .into());
            }
            BranchPlan::UnrecognizedBranch => return Err(not_a_plan_branch(branch, prefix)),
        }
    }

    if json {
        println!(
            "{}",
            json!({
                "id": parsed.id.0,
                "slug": parsed.slug,
                "secondary_id": parsed.secondary_id,
                "timestamp": parsed.timestamp,
            })
        );
    } else {
        println!("{}", parsed.id);
    }
    Ok(())
}
