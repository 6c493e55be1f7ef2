//! Builds a tier plan from task declarations.
//!
//! Tasks without dependencies form the parallel tier. Every later tier holds
//! exactly one task whose dependencies are the whole tier before it. Anything
//! else is rejected here, before a run starts.

use super::task::{TaskSpec, TierKind};
use crate::errors::PipelineError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

/// Index into the task list.
type TaskIndex = usize;

/// One tier of a validated plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    pub index: usize,
    pub kind: TierKind,
    pub tasks: Vec<TaskSpec>,
}

impl Tier {
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }
}

/// A validated, ordered list of tiers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TierPlan {
    tiers: Vec<Tier>,
}

impl TierPlan {
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.tiers.iter().map(|t| t.tasks.len()).sum()
    }

    pub fn tier_of(&self, task_id: &str) -> Option<&Tier> {
        self.tiers
            .iter()
            .find(|tier| tier.tasks.iter().any(|t| t.id == task_id))
    }
}

pub struct TierPlanBuilder {
    tasks: Vec<TaskSpec>,
}

impl TierPlanBuilder {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Validate the declarations and place every task in a tier.
    pub fn build(self) -> Result<TierPlan, PipelineError> {
        if self.tasks.is_empty() {
            return Ok(TierPlan::default());
        }

        let mut index_map: HashMap<&str, TaskIndex> = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if !is_valid_task_id(&task.id) {
                return Err(PipelineError::InvalidTaskId(task.id.clone()));
            }
            if index_map.insert(task.id.as_str(), i).is_some() {
                return Err(PipelineError::DuplicateTask(task.id.clone()));
            }
        }

        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        for (to, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let from = *index_map.get(dep.as_str()).ok_or_else(|| {
                    PipelineError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                forward_edges[from].push(to);
                reverse_edges[to].push(from);
            }
        }

        let order = self.topological_order(&forward_edges, &reverse_edges)?;

        let mut level = vec![0usize; self.tasks.len()];
        for &i in &order {
            level[i] = reverse_edges[i]
                .iter()
                .map(|&dep| level[dep] + 1)
                .max()
                .unwrap_or(0);
        }
        let depth = level.iter().copied().max().unwrap_or(0) + 1;
        let mut by_level: Vec<Vec<TaskIndex>> = vec![Vec::new(); depth];
        for (i, &l) in level.iter().enumerate() {
            by_level[l].push(i);
        }

        self.validate_parallel_tier(&by_level[0])?;
        for l in 1..depth {
            self.validate_sequential_tier(l, &by_level[l], &by_level[l - 1], &reverse_edges)?;
        }

        let mut tasks: Vec<Option<TaskSpec>> = self.tasks.into_iter().map(Some).collect();
        let tiers = by_level
            .into_iter()
            .enumerate()
            .map(|(index, members)| Tier {
                index,
                kind: if index == 0 {
                    TierKind::Parallel
                } else {
                    TierKind::Sequential
                },
                tasks: members.into_iter().filter_map(|i| tasks[i].take()).collect(),
            })
            .collect();
        Ok(TierPlan { tiers })
    }

    /// Kahn's algorithm. The returned order lists every dependency before its
    /// dependents.
    fn topological_order(
        &self,
        forward_edges: &[Vec<TaskIndex>],
        reverse_edges: &[Vec<TaskIndex>],
    ) -> Result<Vec<TaskIndex>, PipelineError> {
        let mut in_degree: Vec<usize> = reverse_edges.iter().map(Vec::len).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(node) = queue.pop() {
            order.push(node);
            for &dependent in &forward_edges[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if order.len() != self.tasks.len() {
            let involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.tasks[i].id.clone())
                .collect();
            return Err(PipelineError::Cycle(involved));
        }
        Ok(order)
    }

    fn validate_parallel_tier(&self, members: &[TaskIndex]) -> Result<(), PipelineError> {
        let mut claimed: HashMap<&PathBuf, &str> = HashMap::new();
        for &i in members {
            let task = &self.tasks[i];
            for input in &task.inputs {
                if let Some(other) = claimed.insert(input, task.id.as_str()) {
                    return Err(PipelineError::InvalidShape(format!(
                        "parallel tasks '{}' and '{}' share input {}",
                        other,
                        task.id,
                        input.display()
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_sequential_tier(
        &self,
        level: usize,
        members: &[TaskIndex],
        previous: &[TaskIndex],
        reverse_edges: &[Vec<TaskIndex>],
    ) -> Result<(), PipelineError> {
        let [only] = members else {
            let ids: Vec<&str> = members.iter().map(|&i| self.tasks[i].id.as_str()).collect();
            return Err(PipelineError::InvalidShape(format!(
                "tier {} has {} tasks ({}); sequential tiers hold exactly one",
                level,
                ids.len(),
                ids.join(", ")
            )));
        };
        let task = &self.tasks[*only];
        if !task.inputs.is_empty() {
            return Err(PipelineError::InvalidShape(format!(
                "sequential task '{}' declares its own inputs; it may only read the previous tier",
                task.id
            )));
        }

        let deps: BTreeSet<TaskIndex> = reverse_edges[*only].iter().copied().collect();
        let expected: BTreeSet<TaskIndex> = previous.iter().copied().collect();
        if deps != expected {
            let skipped: HashSet<&str> = deps
                .difference(&expected)
                .map(|&i| self.tasks[i].id.as_str())
                .collect();
            let missing: Vec<&str> = expected
                .difference(&deps)
                .map(|&i| self.tasks[i].id.as_str())
                .collect();
            return Err(PipelineError::InvalidShape(format!(
                "sequential task '{}' must depend on exactly the previous tier (skips tiers via {:?}, missing {:?})",
                task.id, skipped, missing
            )));
        }
        Ok(())
    }
}

/// Task ids become file names under the run's `outputs/` directory.
fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty() && !id.contains(['/', '\\']) && !id.contains("..")
}
