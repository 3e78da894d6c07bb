//! Task dispatch boundary and result callbacks.
//!
//! The executor hands READY tasks to a [`TaskQueueDispatcher`]; whatever
//! runs them reports back through [`TaskApi`]. [`LocalAgent`] closes the loop
//! in-process by running operators on tokio tasks.

use std::future::Future;
use std::sync::Arc;

use taskflow_types::document::Document;
use taskflow_types::task::{Action, TaskId, TaskReport, error_document};

use super::error::{DispatchError, ExecutorError};
use super::operator::{OperatorOutcome, OperatorRegistry};

/// Fire-and-forget hand-off of a ready task.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait TaskQueueDispatcher: Send + Sync {
    fn dispatch(&self, action: Action) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// Result callbacks for dispatched tasks. Each returns whether the task
/// state changed; `false` means the callback was stale.
pub trait TaskApi: Send + Sync {
    fn task_succeeded(
        &self,
        task_id: TaskId,
        state_params: Document,
        subtask_config: Document,
        carry_params: Document,
        report: TaskReport,
    ) -> impl Future<Output = Result<bool, ExecutorError>> + Send;

    fn task_failed(
        &self,
        task_id: TaskId,
        error: Document,
        state_params: Document,
        retry_interval: Option<u32>,
    ) -> impl Future<Output = Result<bool, ExecutorError>> + Send;

    fn task_poll_next(
        &self,
        task_id: TaskId,
        state_params: Document,
        retry_interval_secs: u32,
    ) -> impl Future<Output = Result<bool, ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// LocalAgent
// ---------------------------------------------------------------------------

/// In-process dispatcher: runs each action on its own tokio task.
pub struct LocalAgent<A: TaskApi> {
    api: Arc<A>,
    operators: Arc<OperatorRegistry>,
}

impl<A: TaskApi + 'static> LocalAgent<A> {
    pub fn new(api: Arc<A>, operators: OperatorRegistry) -> Self {
        Self {
            api,
            operators: Arc::new(operators),
        }
    }
}

impl<A: TaskApi + 'static> TaskQueueDispatcher for LocalAgent<A> {
    async fn dispatch(&self, action: Action) -> Result<(), DispatchError> {
        let operator = self.operators.resolve(&action)?;
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let task_id = action.task_id;
            tracing::debug!(task_id, task = %action.full_name, operator = operator.name(), "running task");
            let outcome = operator.run(&action).await;
            if let Err(e) = report_outcome(api.as_ref(), task_id, outcome).await {
                tracing::error!(task_id, error = %e, "failed to report task result");
            }
        });
        Ok(())
    }
}

async fn report_outcome<A: TaskApi>(
    api: &A,
    task_id: TaskId,
    outcome: OperatorOutcome,
) -> Result<bool, ExecutorError> {
    match outcome {
        OperatorOutcome::Succeeded(result) => {
            api.task_succeeded(
                task_id,
                result.state_params,
                result.subtask_config,
                result.carry_params,
                result.report,
            )
            .await
        }
        OperatorOutcome::PollAgain(poll) => {
            api.task_poll_next(task_id, poll.state_params, poll.interval_secs)
                .await
        }
        OperatorOutcome::Failed(failure) => {
            tracing::info!(task_id, error = %failure.message, "task failed");
            api.task_failed(
                task_id,
                error_document(failure.message),
                failure.state_params,
                failure.retry_interval,
            )
            .await
        }
    }
}
