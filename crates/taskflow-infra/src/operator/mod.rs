//! Operators that need the host: processes, files, network.

pub mod sh;

use taskflow_core::workflow::operator::OperatorRegistry;

/// Built-in registry plus the host operators.
pub fn default_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::with_builtins();
    registry.register(sh::ShOperator::new());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use taskflow_core::repository::session::SessionStore;
    use taskflow_core::workflow::dispatch::LocalAgent;
    use taskflow_core::workflow::executor::SessionExecutor;
    use taskflow_types::config::ExecutorConfig;
    use taskflow_types::document::Document;
    use taskflow_types::session::NewSession;
    use taskflow_types::task::TaskStateCode;
    use taskflow_types::workflow::WorkflowDefinition;

    use crate::sqlite::pool::DatabasePool;
    use crate::sqlite::session::SqliteSessionStore;

    #[test]
    fn test_default_registry_includes_sh() {
        assert!(default_registry().names().contains(&"sh"));
    }

    #[tokio::test]
    async fn test_shell_workflow_on_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("e2e.db").display());
        let store = SqliteSessionStore::new(DatabasePool::new(&url).await.unwrap());
        let config = ExecutorConfig {
            min_wait_ms: 5,
            max_wait_ms: 50,
            ..ExecutorConfig::default()
        };
        let executor = Arc::new(SessionExecutor::new(Arc::new(store), config));
        let agent = LocalAgent::new(executor.clone(), default_registry());

        let definition = WorkflowDefinition::new(
            "e2e",
            Document::from_value(json!({"+a": {"sh>": "true"}, "+b": {"sh>": "false"}})).unwrap(),
        );
        let session = executor
            .submit_workflow(&definition, NewSession::new(0, "e2e"))
            .await
            .unwrap();
        executor.run_until_all_done(&agent).await.unwrap();

        let status = executor.session_status(session.id).await.unwrap();
        assert!(status.done);
        assert_eq!(status.root_state, TaskStateCode::GroupError);
        assert_eq!(status.failed_tasks.len(), 1);
        assert_eq!(status.failed_tasks[0].full_name, "+e2e+b");
        assert!(status.failed_tasks[0].error.as_ref().is_some_and(|e| !e.is_empty()));

        let tasks = executor.store().list_session_tasks(session.id).await.unwrap();
        let a = tasks.iter().find(|t| t.full_name == "+e2e+a").unwrap();
        assert_eq!(a.state, TaskStateCode::Success);
    }
}
