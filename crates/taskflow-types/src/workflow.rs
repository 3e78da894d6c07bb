//! Compiled workflow types.
//!
//! A workflow definition is a nested [`Document`]; compiling it yields a
//! flat, index-addressed list of [`WorkflowTask`]s.

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::task::TaskType;

/// A named workflow definition as loaded from a file or a schedule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub config: Document,
    /// IANA time zone name used by schedules and SLAs. Defaults to UTC.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl WorkflowDefinition {
    /// Build a definition, taking the time zone from the config's `timezone` key.
    pub fn new(name: impl Into<String>, config: Document) -> Self {
        let timezone = config
            .get_optional_str("timezone")
            .ok()
            .flatten()
            .map(str::to_string)
            .unwrap_or_else(default_timezone);
        Self {
            name: name.into(),
            config,
            timezone,
        }
    }
}

/// One compiled task. `task_index` equals its position in the compiled list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub name: String,
    pub full_name: String,
    pub task_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_index: Option<usize>,
    #[serde(default)]
    pub upstream_indexes: Vec<usize>,
    pub task_type: TaskType,
    pub config: Document,
}

impl WorkflowTask {
    pub fn is_grouping_only(&self) -> bool {
        self.task_type.is_grouping_only()
    }
}

/// Result of compiling a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub meta: Document,
    pub tasks: Vec<WorkflowTask>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_picks_up_timezone() {
        let config = Document::from_value(json!({"timezone": "Asia/Tokyo", "+a": {"sh>": "true"}})).unwrap();
        let def = WorkflowDefinition::new("etl", config);
        assert_eq!(def.timezone, "Asia/Tokyo");
    }

    #[test]
    fn test_definition_defaults_to_utc() {
        let def = WorkflowDefinition::new("etl", Document::new());
        assert_eq!(def.timezone, "UTC");
    }

    #[test]
    fn test_definition_deserialize_default_timezone() {
        let def: WorkflowDefinition =
            serde_json::from_value(json!({"name": "w", "config": {}})).unwrap();
        assert_eq!(def.timezone, "UTC");
    }
}
