//! Dependency graph over a plan's task list.
//!
//! Validates dependency references, detects cycles with a depth-first visit
//! and produces an execution order that respects both dependency edges and
//! priority: tasks are visited most-urgent first and their dependencies are
//! resolved recursively, so an urgent task lands as early as its
//! dependencies allow.

use std::collections::{HashMap, HashSet};

use crate::error::{PivotError, Result};
use crate::model::{Task, TaskStatus};

/// Stateless operations over a slice of tasks.
pub struct TaskGraph;

impl TaskGraph {
    /// Validate a single task against the tasks already in the plan.
    ///
    /// Checks that `id` and `name` are present, the id is unused, and every
    /// dependency refers to an existing task.
    pub fn validate_task(existing: &[Task], task: &Task) -> Result<()> {
        check_identity(task)?;
        if existing.iter().any(|t| t.id == task.id) {
            return Err(PivotError::Validation(format!(
                "duplicate task id {:?}",
                task.id
            )));
        }
        for dep in &task.dependencies {
            if dep == &task.id {
                return Err(PivotError::CircularDependency {
                    task: task.id.clone(),
                });
            }
            if !existing.iter().any(|t| &t.id == dep) {
                return Err(PivotError::Validation(format!(
                    "task {:?} depends on unknown task {:?}",
                    task.id, dep
                )));
            }
        }
        Ok(())
    }

    /// Validate a whole task list: identities, unique ids, known dependencies.
    pub fn validate(tasks: &[Task]) -> Result<()> {
        let mut seen = HashSet::new();
        for task in tasks {
            check_identity(task)?;
            if !seen.insert(task.id.as_str()) {
                return Err(PivotError::Validation(format!(
                    "duplicate task id {:?}",
                    task.id
                )));
            }
        }
        for task in tasks {
            for dep in &task.dependencies {
                if !seen.contains(dep.as_str()) {
                    return Err(PivotError::Validation(format!(
                        "task {:?} depends on unknown task {:?}",
                        task.id, dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Compute an execution order as indices into `tasks`.
    ///
    /// Every task's dependencies appear strictly before it. Ties between
    /// tasks with the same priority keep their input order.
    pub fn order(tasks: &[Task]) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        let mut by_priority: Vec<usize> = (0..tasks.len()).collect();
        by_priority.sort_by_key(|&i| tasks[i].priority);

        let mut visit = Visit {
            tasks,
            index: &index,
            visiting: HashSet::new(),
            visited: HashSet::new(),
            order: Vec::with_capacity(tasks.len()),
        };
        for i in by_priority {
            visit.visit(i)?;
        }
        Ok(visit.order)
    }

    /// Validate, reorder, and mark dependency-free pending tasks ready.
    pub fn resolve(tasks: Vec<Task>) -> Result<Vec<Task>> {
        Self::validate(&tasks)?;
        let mut tasks = Self::reorder(tasks)?;
        for task in &mut tasks {
            if task.status == TaskStatus::Pending && task.dependencies.is_empty() {
                task.status = TaskStatus::Ready;
            }
        }
        Ok(tasks)
    }

    /// Reorder tasks topologically without touching their statuses.
    pub fn reorder(tasks: Vec<Task>) -> Result<Vec<Task>> {
        let order = Self::order(&tasks)?;
        let mut slots: Vec<Option<Task>> = tasks.into_iter().map(Some).collect();
        Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
    }

    /// Check that `tasks` is already in a valid dependency order.
    pub fn is_topological(tasks: &[Task]) -> bool {
        let mut placed = HashSet::new();
        for task in tasks {
            if !task.dependencies.iter().all(|d| placed.contains(d.as_str())) {
                return false;
            }
            placed.insert(task.id.as_str());
        }
        true
    }

    /// Indices of waiting tasks whose dependencies have all completed, in
    /// plan order.
    pub fn ready_frontier(tasks: &[Task]) -> Vec<usize> {
        let completed: HashSet<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect();
        tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status.is_waiting())
            .filter(|(_, t)| t.dependencies.iter().all(|d| completed.contains(d.as_str())))
            .map(|(i, _)| i)
            .collect()
    }

    /// Promote pending tasks whose dependencies have all completed to ready.
    pub fn promote_ready(tasks: &mut [Task]) {
        for i in Self::ready_frontier(tasks) {
            if tasks[i].status == TaskStatus::Pending {
                tasks[i].status = TaskStatus::Ready;
            }
        }
    }

    /// Skip every waiting task with a failed or skipped dependency, until no
    /// more change. Returns the ids that were skipped.
    pub fn apply_cascading_skip(tasks: &mut [Task]) -> Vec<String> {
        let mut skipped = Vec::new();
        loop {
            let unavailable: HashSet<String> = tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Skipped))
                .map(|t| t.id.clone())
                .collect();
            let mut changed = false;
            for task in tasks.iter_mut() {
                if (task.status.is_waiting() || task.status == TaskStatus::Blocked)
                    && task.dependencies.iter().any(|d| unavailable.contains(d))
                {
                    task.status = TaskStatus::Skipped;
                    skipped.push(task.id.clone());
                    changed = true;
                }
            }
            if !changed {
                return skipped;
            }
        }
    }

    /// Ids of all tasks that transitively depend on `id`, in plan order.
    pub fn dependents(tasks: &[Task], id: &str) -> Vec<String> {
        let mut reached: HashSet<&str> = HashSet::from([id]);
        let mut out = Vec::new();
        // Plan order is topological, so one forward pass reaches the closure.
        for task in tasks {
            if task.dependencies.iter().any(|d| reached.contains(d.as_str())) {
                reached.insert(task.id.as_str());
                out.push(task.id.clone());
            }
        }
        out
    }
}

fn check_identity(task: &Task) -> Result<()> {
    if task.id.trim().is_empty() {
        return Err(PivotError::Validation("task id must not be empty".into()));
    }
    if task.name.trim().is_empty() {
        return Err(PivotError::Validation(format!(
            "task {:?} must have a name",
            task.id
        )));
    }
    Ok(())
}

struct Visit<'a> {
    tasks: &'a [Task],
    index: &'a HashMap<&'a str, usize>,
    visiting: HashSet<usize>,
    visited: HashSet<usize>,
    order: Vec<usize>,
}

impl Visit<'_> {
    fn visit(&mut self, i: usize) -> Result<()> {
        if self.visited.contains(&i) {
            return Ok(());
        }
        if !self.visiting.insert(i) {
            return Err(PivotError::CircularDependency {
                task: self.tasks[i].id.clone(),
            });
        }

        let mut deps = Vec::with_capacity(self.tasks[i].dependencies.len());
        for dep in &self.tasks[i].dependencies {
            let Some(&d) = self.index.get(dep.as_str()) else {
                return Err(PivotError::Validation(format!(
                    "task {:?} depends on unknown task {:?}",
                    self.tasks[i].id, dep
                )));
            };
            deps.push(d);
        }
        deps.sort_by_key(|&d| (self.tasks[d].priority, d));
        for d in deps {
            self.visit(d)?;
        }

        self.visiting.remove(&i);
        self.visited.insert(i);
        self.order.push(i);
        Ok(())
    }
}
