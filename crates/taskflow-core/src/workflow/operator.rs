//! Operator trait, type-erased wrapper, registry and built-in operators.
//!
//! An operator runs one task: it receives the rendered [`Action`] and
//! returns an [`OperatorOutcome`]. Operators that need IO (e.g. `sh>`) live
//! in taskflow-infra; the pure ones are defined here.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use taskflow_types::document::Document;
use taskflow_types::task::{Action, TaskReport};

use super::error::DispatchError;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    /// Workflow fragment inserted as `^sub` under the task.
    pub subtask_config: Document,
    /// Parameters exported to downstream tasks.
    pub carry_params: Document,
    pub state_params: Document,
    pub report: TaskReport,
}

impl TaskResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_subtasks(mut self, config: Document) -> Self {
        self.subtask_config = config;
        self
    }

    pub fn with_carry_params(mut self, params: Document) -> Self {
        self.report.output_params = params.clone();
        self.carry_params = params;
        self
    }
}

/// The operator is not finished and wants to be polled again.
#[derive(Debug, Clone, PartialEq)]
pub struct PollAgain {
    pub state_params: Document,
    pub interval_secs: u32,
}

/// Failed run. `retry_interval` asks for a retry regardless of `_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    pub state_params: Document,
    pub retry_interval: Option<u32>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            state_params: Document::new(),
            retry_interval: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperatorOutcome {
    Succeeded(TaskResult),
    PollAgain(PollAgain),
    Failed(TaskFailure),
}

// ---------------------------------------------------------------------------
// Operator trait + Box wrapper
// ---------------------------------------------------------------------------

/// A task executor selected by the task's `name>` key or `_type`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait Operator: Send + Sync {
    /// Operator type name, e.g. `"sh"` for `sh>`.
    fn name(&self) -> &str;

    fn run(&self, action: &Action) -> impl Future<Output = OperatorOutcome> + Send;
}

/// Object-safe version of [`Operator`] with a boxed future.
pub trait OperatorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn run_boxed<'a>(&'a self, action: &'a Action) -> Pin<Box<dyn Future<Output = OperatorOutcome> + Send + 'a>>;
}

impl<T: Operator> OperatorDyn for T {
    fn name(&self) -> &str {
        Operator::name(self)
    }

    fn run_boxed<'a>(&'a self, action: &'a Action) -> Pin<Box<dyn Future<Output = OperatorOutcome> + Send + 'a>> {
        Box::pin(self.run(action))
    }
}

/// Type-erased operator so different implementations share one registry.
pub struct BoxOperator {
    inner: Box<dyn OperatorDyn + Send + Sync>,
}

impl BoxOperator {
    pub fn new<T: Operator + 'static>(operator: T) -> Self {
        Self {
            inner: Box::new(operator),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn run(&self, action: &Action) -> OperatorOutcome {
        self.inner.run_boxed(action).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Operator type name of a task config: the `name>` key, else `_type`/`type`.
pub fn operator_type(config: &Document) -> Option<String> {
    config
        .keys()
        .find_map(|k| k.strip_suffix('>').map(str::to_string))
        .or_else(|| {
            ["_type", "type"]
                .iter()
                .find_map(|k| config.get_optional_str(k).ok().flatten())
                .map(str::to_string)
        })
}

/// The operator's main argument: the value of its `name>` key.
pub fn command<'a>(action: &'a Action, name: &str) -> Option<&'a Value> {
    action.config.get(&format!("{name}>"))
}

#[derive(Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<BoxOperator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop`, `echo>`, `fail>`, `if>` and `loop>`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(NoopOperator);
        registry.register(EchoOperator);
        registry.register(FailOperator);
        registry.register(IfOperator);
        registry.register(LoopOperator);
        registry
    }

    pub fn register<T: Operator + 'static>(&mut self, operator: T) {
        let operator = BoxOperator::new(operator);
        self.operators
            .insert(operator.name().to_string(), Arc::new(operator));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operators.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn resolve(&self, action: &Action) -> Result<Arc<BoxOperator>, DispatchError> {
        let name = operator_type(&action.config)
            .ok_or_else(|| DispatchError::NoOperator(action.full_name.clone()))?;
        self.operators
            .get(&name)
            .cloned()
            .ok_or(DispatchError::UnknownOperator(name))
    }
}

// ---------------------------------------------------------------------------
// Built-in operators
// ---------------------------------------------------------------------------

/// `_type: noop`
pub struct NoopOperator;

impl Operator for NoopOperator {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self, _action: &Action) -> OperatorOutcome {
        OperatorOutcome::Succeeded(TaskResult::empty())
    }
}

/// `echo>: message` logs the message.
pub struct EchoOperator;

impl Operator for EchoOperator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, action: &Action) -> OperatorOutcome {
        let message = match command(action, "echo") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        tracing::info!(task = %action.full_name, "{message}");
        OperatorOutcome::Succeeded(TaskResult::empty())
    }
}

/// `fail>: message` always fails.
pub struct FailOperator;

impl Operator for FailOperator {
    fn name(&self) -> &str {
        "fail"
    }

    async fn run(&self, action: &Action) -> OperatorOutcome {
        let message = match command(action, "fail") {
            Some(Value::String(s)) => s.clone(),
            _ => format!("{} failed", action.full_name),
        };
        OperatorOutcome::Failed(TaskFailure::new(message))
    }
}

/// `if>: bool` runs `_do` when true and `_else_do` otherwise.
pub struct IfOperator;

impl Operator for IfOperator {
    fn name(&self) -> &str {
        "if"
    }

    async fn run(&self, action: &Action) -> OperatorOutcome {
        let condition = match action.config.get_bool_or("if>", false) {
            Ok(b) => b,
            Err(e) => return OperatorOutcome::Failed(TaskFailure::new(e.to_string())),
        };
        let branch = if condition { "_do" } else { "_else_do" };
        match action.config.get_nested_or_empty(branch) {
            Ok(subtasks) => OperatorOutcome::Succeeded(TaskResult::empty().with_subtasks(subtasks)),
            Err(e) => OperatorOutcome::Failed(TaskFailure::new(e.to_string())),
        }
    }
}

/// `loop>: N` runs `_do` N times, exporting `i` = 0..N.
pub struct LoopOperator;

impl LoopOperator {
    fn expand(action: &Action) -> Result<Document, taskflow_types::error::ConfigError> {
        let count = action.config.get_i64("loop>")?;
        let body = action.config.get_nested("_do")?;
        let mut generated = Document::new();
        for i in 0..count.max(0) {
            let mut iteration = body.clone();
            let mut export = iteration.get_nested_or_empty("_export")?;
            export.set("i", i);
            iteration.set("_export", export.into_value());
            generated.set(format!("+loop-{i}"), iteration.into_value());
        }
        if let Some(parallel) = action.config.get("_parallel") {
            generated.set("_parallel", parallel.clone());
        }
        Ok(generated)
    }
}

impl Operator for LoopOperator {
    fn name(&self) -> &str {
        "loop"
    }

    async fn run(&self, action: &Action) -> OperatorOutcome {
        match Self::expand(action) {
            Ok(subtasks) => OperatorOutcome::Succeeded(TaskResult::empty().with_subtasks(subtasks)),
            Err(e) => OperatorOutcome::Failed(TaskFailure::new(e.to_string())),
        }
    }
}
