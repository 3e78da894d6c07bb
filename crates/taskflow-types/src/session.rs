//! Session types: one execution instance of a compiled workflow.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::Document;
use crate::task::{SessionId, TaskOutcome, TaskReport, TaskStateCode};

/// Submission-time options of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Tasks already completed by an earlier attempt, keyed by full name.
    /// Matching tasks short-circuit to SUCCESS with the stored report.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub skip_task_reports: BTreeMap<String, TaskReport>,
}

/// A session about to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub site_id: i32,
    pub workflow_name: String,
    /// Logical time of a scheduled session. `(workflow_name, session_time)`
    /// is unique, so a trigger fired twice submits only one session.
    pub session_time: Option<DateTime<Utc>>,
    /// Session-level parameters (e.g. `session_time`).
    pub params: Document,
    pub options: SessionOptions,
}

impl NewSession {
    pub fn new(site_id: i32, workflow_name: impl Into<String>) -> Self {
        Self {
            site_id,
            workflow_name: workflow_name.into(),
            session_time: None,
            params: Document::new(),
            options: SessionOptions::default(),
        }
    }

    /// Mark the session as scheduled at `time`; also exposed as the
    /// `session_time` parameter.
    pub fn with_session_time(mut self, time: DateTime<Utc>) -> Self {
        self.session_time = Some(time);
        self.params.set("session_time", time.to_rfc3339());
        self
    }

    pub fn with_params(mut self, params: Document) -> Self {
        self.params.merge(&params);
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }
}

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: SessionId,
    pub uuid: Uuid,
    pub site_id: i32,
    pub workflow_name: String,
    pub session_time: Option<DateTime<Utc>>,
    pub params: Document,
    pub options: SessionOptions,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of a session's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session: StoredSession,
    pub root_state: TaskStateCode,
    pub done: bool,
    /// Tasks that ended in ERROR, excluding GROUP_ERROR groups.
    pub failed_tasks: Vec<TaskOutcome>,
}

impl SessionStatus {
    pub fn is_success(&self) -> bool {
        self.done && self.root_state == TaskStateCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_session_builder() {
        let params = Document::from_value(json!({"session_time": "2024-01-01T00:00:00Z"})).unwrap();
        let s = NewSession::new(0, "etl").with_params(params.clone());
        assert_eq!(s.workflow_name, "etl");
        assert_eq!(s.params, params);
        assert!(s.options.skip_task_reports.is_empty());
    }

    #[test]
    fn test_session_time_sets_param() {
        let t = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let s = NewSession::new(0, "etl").with_session_time(t);
        assert_eq!(s.session_time, Some(t));
        assert_eq!(s.params.get_str("session_time").unwrap(), "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_options_skip_empty_map_on_serialize() {
        let json = serde_json::to_value(SessionOptions::default()).unwrap();
        assert_eq!(json, json!({}));
    }
}
