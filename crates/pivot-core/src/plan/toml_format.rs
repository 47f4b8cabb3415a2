//! TOML format types for plan definition files.
//!
//! These types map directly to the `plan.toml` on-disk format and are
//! deserialized via `serde` + the `toml` crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{Priority, Task};

use super::parser::PlanParseError;

/// Top-level structure of a `plan.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanToml {
    pub plan: PlanMeta,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

/// Plan-level metadata in `[plan]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMeta {
    /// What the plan is trying to achieve.
    pub goal: String,
    /// Free-form context handed to the plan (`[plan.context]`).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// A single `[[tasks]]` entry in the plan TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    /// Identifier used in `depends_on`. Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// One of critical, high, medium, low, optional.
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimated_ms: u64,
    /// Tag grouping tasks whose estimates move together.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skill: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl TaskToml {
    /// The id other tasks refer to this one by.
    pub fn key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }

    pub fn to_task(&self) -> Result<Task, PlanParseError> {
        let priority: Priority =
            self.priority
                .parse()
                .map_err(|_| PlanParseError::InvalidPriority {
                    task: self.key().to_owned(),
                    value: self.priority.clone(),
                })?;
        let mut task = Task::new(self.key(), self.name.clone())
            .with_description(self.description.clone())
            .with_priority(priority)
            .with_dependencies(self.depends_on.iter().cloned())
            .with_estimate(self.estimated_ms);
        if let Some(component) = &self.component {
            task = task.with_component(component.clone());
        }
        if let Some(skill) = &self.skill {
            task = task.with_skill(skill.clone(), self.parameters.clone());
        } else {
            task.parameters = self.parameters.clone();
        }
        task.goal = self.goal.clone();
        Ok(task)
    }
}

impl PlanToml {
    /// Build engine tasks in file order.
    pub fn into_tasks(&self) -> Result<Vec<Task>, PlanParseError> {
        self.tasks.iter().map(TaskToml::to_task).collect()
    }
}

fn default_priority() -> String {
    "medium".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_plan() {
        let toml_str = r#"
[plan]
goal = "Ship the release"

[[tasks]]
name = "build"
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.plan.goal, "Ship the release");
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].key(), "build");
        assert_eq!(plan.tasks[0].priority, "medium"); // default
        assert!(plan.tasks[0].depends_on.is_empty());
    }

    #[test]
    fn deserialize_full_plan() {
        let toml_str = r#"
[plan]
goal = "Publish docs"

[plan.context]
repo = "docs"
retries = 2

[[tasks]]
id = "gen"
name = "Generate pages"
description = """
Render every page.
- Use the default theme
"""
priority = "high"
estimated_ms = 1500
component = "docs"
skill = "shell"

[tasks.parameters]
command = "make html"

[[tasks]]
name = "upload"
depends_on = ["gen"]
goal = "pages reachable online"
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.plan.context["retries"], 2);
        assert_eq!(plan.tasks[0].key(), "gen");
        assert_eq!(plan.tasks[0].parameters["command"], "make html");
        assert_eq!(plan.tasks[1].depends_on, vec!["gen"]);

        let tasks = plan.into_tasks().unwrap();
        assert_eq!(tasks[0].priority, Priority::High);
        assert_eq!(tasks[0].component(), Some("docs"));
        assert_eq!(tasks[0].skill.as_deref(), Some("shell"));
        assert_eq!(tasks[0].estimated_ms, 1500);
        assert!(tasks[1].dependencies.contains("gen"));
        assert_eq!(tasks[1].goal.as_deref(), Some("pages reachable online"));
    }

    #[test]
    fn bad_priority_is_reported_with_task() {
        let task = TaskToml {
            id: None,
            name: "x".into(),
            description: String::new(),
            priority: "urgent".into(),
            depends_on: vec![],
            estimated_ms: 0,
            component: None,
            goal: None,
            skill: None,
            parameters: Map::new(),
        };
        let err = task.to_task().unwrap_err();
        assert!(matches!(err, PlanParseError::InvalidPriority { ref task, .. } if task == "x"));
    }

    #[test]
    fn roundtrip_serialize_deserialize() {
        let plan = PlanToml {
            plan: PlanMeta {
                goal: "Roundtrip".to_owned(),
                context: Map::new(),
            },
            tasks: vec![TaskToml {
                id: Some("t1".to_owned()),
                name: "First".to_owned(),
                description: "First task".to_owned(),
                priority: "low".to_owned(),
                depends_on: vec![],
                estimated_ms: 10,
                component: Some("core".to_owned()),
                goal: None,
                skill: None,
                parameters: Map::new(),
            }],
        };

        let serialized = toml::to_string(&plan).expect("should serialize");
        let deserialized: PlanToml = toml::from_str(&serialized).expect("should deserialize");
        assert_eq!(plan, deserialized);
    }
}
