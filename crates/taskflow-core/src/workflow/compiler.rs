//! Workflow compiler: nested config tree -> flat, index-addressed task list.
//!
//! The walk is depth-first and pre-order, so a task's parent and upstreams
//! always have smaller indexes than the task itself. Compilation is a pure
//! function of the input document.

use serde_json::Value;
use taskflow_types::document::Document;
use taskflow_types::error::ConfigError;
use taskflow_types::task::TaskType;
use taskflow_types::workflow::{Workflow, WorkflowTask};

/// Keys a grouping node may carry besides its `+child` entries.
const GROUPING_KEYS: &[&str] = &[
    "timezone",
    "schedule",
    "sla",
    "default",
    "_parallel",
    "parallel",
    "_background",
    "background",
    "_after",
    "after",
    "_error",
    "_check",
    "_retry",
    "_export",
    "_secrets",
    "_disable",
];

/// Look up an option that may be spelled with or without the leading `_`.
fn option<'a>(config: &'a Document, key: &str) -> Option<(&'static str, &'a Value)> {
    let (underscored, plain): (&'static str, &'static str) = match key {
        "type" => ("_type", "type"),
        "parallel" => ("_parallel", "parallel"),
        "after" => ("_after", "after"),
        "background" => ("_background", "background"),
        _ => return None,
    };
    config
        .get(underscored)
        .map(|v| (underscored, v))
        .or_else(|| config.get(plain).map(|v| (plain, v)))
}

fn option_bool(config: &Document, key: &str) -> Result<bool, ConfigError> {
    match option(config, key) {
        Some((k, _)) => config.get_bool_or(k, false),
        None => Ok(false),
    }
}

fn remove_option(config: &mut Document, key: &str) {
    config.remove(&format!("_{key}"));
    config.remove(key);
}

fn is_operator_key(key: &str) -> bool {
    key.ends_with('>')
}

/// Stateless compiler for workflow definitions.
pub struct WorkflowCompiler;

impl WorkflowCompiler {
    /// Compile a workflow. The root task is named `+{name}`.
    pub fn compile(name: &str, config: &Document) -> Result<Workflow, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::invalid("workflow name must not be empty"));
        }
        let meta = config.get_nested_or_empty("meta")?;
        let mut body = config.clone();
        body.remove("meta");
        let tasks = Self::compile_tasks("", &format!("+{name}"), &body)?;
        Ok(Workflow {
            name: name.to_string(),
            meta,
            tasks,
        })
    }

    /// Compile a subtree rooted at `parent_full_name + name`. Used for the
    /// workflow root as well as for generated `^sub` / `^check` / `^error`
    /// fragments.
    pub fn compile_tasks(
        parent_full_name: &str,
        name: &str,
        config: &Document,
    ) -> Result<Vec<WorkflowTask>, ConfigError> {
        let mut ctx = Context::default();
        ctx.collect(None, parent_full_name, name, config, &Document::new())?;
        Ok(ctx.tasks.into_iter().map(TaskBuilder::build).collect())
    }
}

// ---------------------------------------------------------------------------
// Builder state
// ---------------------------------------------------------------------------

struct TaskBuilder {
    index: usize,
    parent: Option<usize>,
    name: String,
    full_name: String,
    task_type: TaskType,
    config: Document,
    upstreams: Vec<usize>,
}

impl TaskBuilder {
    fn build(self) -> WorkflowTask {
        WorkflowTask {
            name: self.name,
            full_name: self.full_name,
            task_index: self.index,
            parent_index: self.parent,
            upstream_indexes: self.upstreams,
            task_type: self.task_type,
            config: self.config,
        }
    }
}

#[derive(Default)]
struct Context {
    tasks: Vec<TaskBuilder>,
}

impl Context {
    fn add_task(
        &mut self,
        parent: Option<usize>,
        name: &str,
        full_name: String,
        task_type: TaskType,
        config: Document,
    ) -> usize {
        let index = self.tasks.len();
        self.tasks.push(TaskBuilder {
            index,
            parent,
            name: name.to_string(),
            full_name,
            task_type,
            config,
            upstreams: Vec::new(),
        });
        index
    }

    fn collect(
        &mut self,
        parent: Option<usize>,
        parent_full_name: &str,
        name: &str,
        original: &Document,
        inherited_defaults: &Document,
    ) -> Result<usize, ConfigError> {
        let full_name = format!("{parent_full_name}{name}");

        let mut config = Document::new();
        let mut subtasks: Vec<(String, Document)> = Vec::new();
        for (key, value) in original.iter() {
            if key.starts_with('+') {
                let child = Document::from_value(value.clone()).map_err(|_| ConfigError::WrongType {
                    key: key.clone(),
                    expected: "an object",
                })?;
                subtasks.push((key.clone(), child));
            } else {
                config.set(key.clone(), value.clone());
            }
        }

        let mut defaults = inherited_defaults.clone();
        defaults.deep_merge(&config.get_nested_or_empty("default")?);

        if config.get_bool_or("_disable", false)? {
            let disabled = Document::new().with("_disable", true);
            return Ok(self.add_task(parent, name, full_name, TaskType::GroupingOnly, disabled));
        }

        let operators = config.keys().filter(|k| is_operator_key(k)).count();
        if option(&config, "type").is_some() || operators > 0 {
            // task node
            if !subtasks.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "A task can't have subtasks: {full_name}"
                )));
            }
            if operators > 1 {
                return Err(ConfigError::invalid(format!(
                    "A task can't have more than one operator: {full_name}"
                )));
            }
            config.remove("default");

            let mut merged = Document::new();
            for (key, value) in defaults.iter() {
                if !is_operator_key(key) && key != "_type" && key != "type" {
                    merged.set(key.clone(), value.clone());
                }
            }
            merged.merge(&config);

            validate_generated_subtasks(&full_name, &merged)?;
            return Ok(self.add_task(parent, name, full_name, TaskType::Action, merged));
        }

        // group node
        let invalid: Vec<String> = config
            .keys()
            .filter(|k| !GROUPING_KEYS.contains(&k.as_str()))
            .map(|k| format!("'{k}'"))
            .collect();
        if !invalid.is_empty() {
            return Err(ConfigError::invalid(format!(
                "{full_name} contains invalid keys: {}",
                invalid.join(", ")
            )));
        }
        let parallel = ParallelControl::parse(&config)?;
        config.remove("default");

        let group = self.add_task(parent, name, full_name.clone(), TaskType::GroupingOnly, config.clone());

        let mut children = Vec::with_capacity(subtasks.len());
        for (child_name, child_config) in &subtasks {
            let index = self.collect(Some(group), &full_name, child_name, child_config, &defaults)?;
            children.push(index);
        }

        if parallel.parallel {
            self.link_parallel(&children, parallel.limit)?;
        } else {
            self.link_sequential(&children)?;
        }

        validate_generated_subtasks(&full_name, &config)?;
        Ok(group)
    }

    /// Siblings run concurrently except for `_after` edges and, with a
    /// limit, chunk-to-chunk edges.
    fn link_parallel(&mut self, children: &[usize], limit: Option<usize>) -> Result<(), ConfigError> {
        let mut seen: Vec<(String, usize)> = Vec::new();
        let chunk_size = limit.unwrap_or(children.len().max(1));
        let mut previous_chunk: Vec<usize> = Vec::new();

        for chunk in children.chunks(chunk_size) {
            for &child in chunk {
                let config = &self.tasks[child].config;
                if option_bool(config, "background")? {
                    return Err(ConfigError::invalid(
                        "Setting \"_background: true\" is invalid when the parent has \"_parallel: true\"",
                    ));
                }
                let after = match option(config, "after") {
                    Some((key, _)) => config.get_string_list_or_empty(key)?,
                    None => Vec::new(),
                };

                let mut upstreams = previous_chunk.clone();
                for up_name in after {
                    let up = seen
                        .iter()
                        .find(|(name, _)| *name == up_name || name.strip_prefix('+') == Some(up_name.as_str()))
                        .map(|(_, index)| *index)
                        .ok_or_else(|| {
                            ConfigError::invalid(format!("Dependency task '{up_name}' does not exist"))
                        })?;
                    if !upstreams.contains(&up) {
                        upstreams.push(up);
                    }
                }

                let task = &mut self.tasks[child];
                remove_option(&mut task.config, "after");
                task.upstreams.extend(upstreams);
                seen.push((task.name.clone(), child));
            }
            if limit.is_some() {
                previous_chunk = chunk.to_vec();
            }
        }
        Ok(())
    }

    /// Each sibling waits for the previous one. Background siblings wait for
    /// nothing, and the next foreground sibling waits for them too.
    fn link_sequential(&mut self, children: &[usize]) -> Result<(), ConfigError> {
        let mut before: Vec<usize> = Vec::new();
        for &child in children {
            let config = &self.tasks[child].config;
            if option(config, "after").is_some() {
                return Err(ConfigError::invalid(
                    "Setting \"_after\" is invalid unless the parent has \"_parallel: true\"",
                ));
            }
            let background = option_bool(config, "background")?;

            let task = &mut self.tasks[child];
            remove_option(&mut task.config, "background");
            if background {
                before.push(child);
            } else {
                task.upstreams.extend(before.iter().copied());
                before.clear();
                before.push(child);
            }
        }
        Ok(())
    }
}

/// `_check` and `_error` subtrees are generated at run time, when reporting a
/// compile error is no longer possible, so they are checked up front.
fn validate_generated_subtasks(full_name: &str, config: &Document) -> Result<(), ConfigError> {
    for (key, name) in [("_check", "^check"), ("_error", "^error")] {
        let fragment = config.get_nested_or_empty(key)?;
        if !fragment.is_empty() {
            WorkflowCompiler::compile_tasks(full_name, name, &fragment)?;
        }
    }
    Ok(())
}

struct ParallelControl {
    parallel: bool,
    limit: Option<usize>,
}

impl ParallelControl {
    fn parse(config: &Document) -> Result<Self, ConfigError> {
        let Some((key, value)) = option(config, "parallel") else {
            return Ok(Self { parallel: false, limit: None });
        };
        match value {
            Value::Bool(_) | Value::String(_) => Ok(Self {
                parallel: config.get_bool_or(key, false)?,
                limit: None,
            }),
            Value::Object(_) => {
                let limit = config.get_nested(key)?.get_i64("limit")?;
                if limit <= 0 {
                    return Err(ConfigError::invalid_value(key, "limit must be a positive integer"));
                }
                Ok(Self {
                    parallel: true,
                    limit: Some(limit as usize),
                })
            }
            other => Err(ConfigError::invalid(format!("Invalid {key} format: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn find<'a>(wf: &'a Workflow, full_name: &str) -> &'a WorkflowTask {
        wf.tasks.iter().find(|t| t.full_name == full_name).unwrap()
    }

    #[test]
    fn test_sequential_chain() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"+a": {"sh>": "a"}, "+b": {"sh>": "b"}, "+c": {"sh>": "c"}})),
        )
        .unwrap();
        assert_eq!(wf.tasks.len(), 4);
        assert_eq!(wf.tasks[0].full_name, "+wf");
        assert!(wf.tasks[0].is_grouping_only());
        assert!(wf.tasks[1].upstream_indexes.is_empty());
        assert_eq!(wf.tasks[2].upstream_indexes, vec![1]);
        assert_eq!(wf.tasks[3].upstream_indexes, vec![2]);
        assert!(wf.tasks.iter().skip(1).all(|t| t.parent_index == Some(0)));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let config = doc(json!({
            "+prepare": {"+x": {"sh>": "x"}, "+y": {"sh>": "y"}},
            "+main": {"_parallel": true, "+p": {"sh>": "p"}, "+q": {"sh>": "q"}},
        }));
        let first = WorkflowCompiler::compile("wf", &config).unwrap();
        let second = WorkflowCompiler::compile("wf", &config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parallel_with_after() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({
                "_parallel": true,
                "+a": {"sh>": "a"},
                "+b": {"sh>": "b", "_after": "+a"},
                "+c": {"sh>": "c"},
            })),
        )
        .unwrap();
        let a = find(&wf, "+wf+a");
        let b = find(&wf, "+wf+b");
        let c = find(&wf, "+wf+c");
        assert_eq!(b.upstream_indexes, vec![a.task_index]);
        assert!(!b.upstream_indexes.contains(&c.task_index));
        assert!(c.upstream_indexes.is_empty());
        assert!(!b.config.has("_after"));
    }

    #[test]
    fn test_plain_key_spellings() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({
                "parallel": true,
                "+a": {"type": "noop"},
                "+b": {"sh>": "b", "after": ["a"]},
            })),
        )
        .unwrap();
        assert_eq!(find(&wf, "+wf+b").upstream_indexes, vec![1]);
        assert_eq!(find(&wf, "+wf+a").task_type, TaskType::Action);
    }

    #[test]
    fn test_parallel_limit_chunks() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({
                "_parallel": {"limit": 2},
                "+a": {"sh>": "a"},
                "+b": {"sh>": "b"},
                "+c": {"sh>": "c"},
                "+d": {"sh>": "d"},
                "+e": {"sh>": "e"},
            })),
        )
        .unwrap();
        assert!(find(&wf, "+wf+a").upstream_indexes.is_empty());
        assert!(find(&wf, "+wf+b").upstream_indexes.is_empty());
        assert_eq!(find(&wf, "+wf+c").upstream_indexes, vec![1, 2]);
        assert_eq!(find(&wf, "+wf+d").upstream_indexes, vec![1, 2]);
        assert_eq!(find(&wf, "+wf+e").upstream_indexes, vec![3, 4]);
    }

    #[test]
    fn test_background_siblings() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({
                "+a": {"sh>": "a"},
                "+bg": {"sh>": "bg", "_background": true},
                "+c": {"sh>": "c"},
            })),
        )
        .unwrap();
        assert!(find(&wf, "+wf+bg").upstream_indexes.is_empty());
        assert_eq!(find(&wf, "+wf+c").upstream_indexes, vec![1, 2]);
    }

    #[test]
    fn test_task_with_subtasks_is_rejected() {
        let err = WorkflowCompiler::compile("wf", &doc(json!({"+a": {"sh>": "a", "+b": {"sh>": "b"}}})))
            .unwrap_err();
        assert!(err.to_string().contains("can't have subtasks"));
    }

    #[test]
    fn test_two_operators_rejected() {
        let err = WorkflowCompiler::compile("wf", &doc(json!({"+a": {"sh>": "a", "echo>": "b"}})))
            .unwrap_err();
        assert!(err.to_string().contains("more than one operator"));
    }

    #[test]
    fn test_after_without_parallel_rejected() {
        let err = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"+a": {"sh>": "a"}, "+b": {"sh>": "b", "_after": "+a"}})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("_after"));
    }

    #[test]
    fn test_unknown_after_reference() {
        let err = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"_parallel": true, "+b": {"sh>": "b", "_after": "+a"}, "+a": {"sh>": "a"}})),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Dependency task '+a' does not exist");
    }

    #[test]
    fn test_background_under_parallel_rejected() {
        let err = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"_parallel": true, "+a": {"sh>": "a", "_background": true}})),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_group_with_invalid_keys() {
        let err = WorkflowCompiler::compile("wf", &doc(json!({"command": "x", "+a": {"sh>": "a"}})))
            .unwrap_err();
        assert!(err.to_string().contains("contains invalid keys: 'command'"));
    }

    #[test]
    fn test_disable_becomes_empty_group() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"+a": {"_disable": true, "+x": {"sh>": "x"}}, "+b": {"sh>": "b"}})),
        )
        .unwrap();
        assert_eq!(wf.tasks.len(), 3);
        let a = find(&wf, "+wf+a");
        assert!(a.is_grouping_only());
        assert_eq!(a.config, doc(json!({"_disable": true})));
    }

    #[test]
    fn test_defaults_are_cumulative_and_overridable() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({
                "default": {"retries": 1, "shell": "bash"},
                "+g": {
                    "default": {"retries": 2},
                    "+a": {"sh>": "a"},
                    "+b": {"sh>": "b", "shell": "zsh"},
                },
            })),
        )
        .unwrap();
        let a = find(&wf, "+wf+g+a");
        assert_eq!(a.config.get_i64("retries").unwrap(), 2);
        assert_eq!(a.config.get_str("shell").unwrap(), "bash");
        let b = find(&wf, "+wf+g+b");
        assert_eq!(b.config.get_str("shell").unwrap(), "zsh");
        assert!(!find(&wf, "+wf").config.has("default"));
    }

    #[test]
    fn test_invalid_error_task_fails_at_compile() {
        let err = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"+a": {"sh>": "a", "_error": {"sh>": "x", "echo>": "y"}}})),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_check_task_fails_at_compile() {
        let err = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"+t": {"if>": true, "_do": {"+inner": {"echo>": "x"}}, "_check": {"echo>": "a", "fail>": "b"}}})),
        );
        assert!(err.is_err());

        let group = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"+g": {"+a": {"echo>": "a"}, "_check": {"+c": {"sh>": "c"}, "+d": "not an object"}}})),
        );
        assert!(group.is_err());
    }

    #[test]
    fn test_compile_generated_fragment() {
        let tasks = WorkflowCompiler::compile_tasks(
            "+wf+a",
            "^sub",
            &doc(json!({"+x": {"sh>": "x"}, "+y": {"sh>": "y"}})),
        )
        .unwrap();
        assert_eq!(tasks[0].full_name, "+wf+a^sub");
        assert_eq!(tasks[1].full_name, "+wf+a^sub+x");
        assert_eq!(tasks[2].upstream_indexes, vec![1]);
    }

    #[test]
    fn test_meta_is_split_off() {
        let wf = WorkflowCompiler::compile(
            "wf",
            &doc(json!({"meta": {"owner": "ops"}, "+a": {"sh>": "a"}})),
        )
        .unwrap();
        assert_eq!(wf.meta.get_str("owner").unwrap(), "ops");
        assert!(!wf.tasks[0].config.has("meta"));
    }
}
