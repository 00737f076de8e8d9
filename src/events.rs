//! Store events and the change-notification feed
//!
//! [`StoreEvent`] is the write-path vocabulary: the host application
//! describes what happened (a message was logged, a network task advanced)
//! and the store materializes rows from it. The same vocabulary is what the
//! remote sync protocol serializes, so a mirror store can replay a peer's
//! events verbatim.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    Level, MessageId, Session, TaskError, TaskKind, TaskRequest, TaskResponse, TransactionMetrics,
};

/// An event processed by the event store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A log message was recorded
    MessageStored(MessageStored),
    /// A network task entered the pending state
    NetworkTaskCreated(NetworkTaskCreated),
    /// An in-flight network task reported progress
    NetworkTaskProgressUpdated(NetworkTaskProgressUpdated),
    /// A network task reached a terminal state
    NetworkTaskCompleted(NetworkTaskCompleted),
}

/// Payload for [`StoreEvent::MessageStored`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStored {
    /// Creation time in nanoseconds since the Unix epoch
    pub created_at: u64,
    /// Severity
    pub level: Level,
    /// Subsystem label
    pub label: String,
    /// Message text
    pub text: String,
    /// Ordered key/value metadata
    #[serde(default)]
    pub metadata: Vec<(String, String)>,
    /// Owning session
    pub session_id: Uuid,
    /// Source file
    pub file: String,
    /// Source function
    pub function: String,
    /// Source line
    pub line: u32,
}

/// Payload for [`StoreEvent::NetworkTaskCreated`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTaskCreated {
    /// Caller-assigned task id
    pub task_id: Uuid,
    /// Task kind
    pub kind: TaskKind,
    /// Creation time in nanoseconds since the Unix epoch
    pub created_at: u64,
    /// The request being performed
    pub request: TaskRequest,
    /// Owning session
    pub session_id: Uuid,
}

/// Payload for [`StoreEvent::NetworkTaskProgressUpdated`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTaskProgressUpdated {
    /// Task being updated
    pub task_id: Uuid,
    /// Units completed so far
    pub completed: i64,
    /// Total expected units, -1 when unknown
    pub total: i64,
}

/// Payload for [`StoreEvent::NetworkTaskCompleted`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTaskCompleted {
    /// Task being completed
    pub task_id: Uuid,
    /// Task kind
    pub kind: TaskKind,
    /// Creation time of the task
    pub created_at: u64,
    /// Owning session
    pub session_id: Uuid,
    /// Total duration in nanoseconds
    pub duration_ns: u64,
    /// Final request sub-record
    pub request: TaskRequest,
    /// Response, absent when the task failed before one arrived
    #[serde(default)]
    pub response: Option<TaskResponse>,
    /// Error details; presence marks the task as failed
    #[serde(default)]
    pub error: Option<TaskError>,
    /// Raw request body bytes
    #[serde(default)]
    pub request_body: Option<Vec<u8>>,
    /// Raw response body bytes
    #[serde(default)]
    pub response_body: Option<Vec<u8>>,
    /// Per-transaction metrics
    #[serde(default)]
    pub metrics: Vec<TransactionMetrics>,
}

impl NetworkTaskCompleted {
    /// Whether the outcome is a failure (an error was recorded or the
    /// response carries a non-2xx status).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        match &self.response {
            Some(response) => !(200..400).contains(&response.status),
            None => false,
        }
    }
}

/// Which record a change notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRef {
    /// A session, by id
    Session(Uuid),
    /// A message, by row id
    Message(MessageId),
    /// A network task, by id
    Task(Uuid),
}

/// The kind of change that occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Record was inserted
    Inserted,
    /// Record was updated in place
    Updated,
    /// Record was deleted (sweep or cascade)
    Deleted,
}

/// A change published to store observers after a successful mutation.
///
/// Observers never see partial writes: a task and its sub-records appear in
/// a single notification batch, after the mutation is fully applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    /// What happened
    pub kind: ChangeKind,
    /// Which record it happened to
    pub record: RecordRef,
}

impl Change {
    pub(crate) fn inserted(record: RecordRef) -> Self {
        Self {
            kind: ChangeKind::Inserted,
            record,
        }
    }

    pub(crate) fn updated(record: RecordRef) -> Self {
        Self {
            kind: ChangeKind::Updated,
            record,
        }
    }

    pub(crate) fn deleted(record: RecordRef) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            record,
        }
    }
}

/// Frame payload persisted when a session starts.
///
/// Not part of the remote event vocabulary: a peer learns about sessions
/// from the handshake, not from the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SessionStarted {
    pub session: Session,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(response: Option<TaskResponse>, error: Option<TaskError>) -> NetworkTaskCompleted {
        NetworkTaskCompleted {
            task_id: Uuid::new_v4(),
            kind: TaskKind::Data,
            created_at: 0,
            session_id: Uuid::new_v4(),
            duration_ns: 0,
            request: TaskRequest::default(),
            response,
            error,
            request_body: None,
            response_body: None,
            metrics: Vec::new(),
        }
    }

    #[test]
    fn test_failure_detection() {
        let ok = completed(
            Some(TaskResponse {
                status: 200,
                headers: vec![],
            }),
            None,
        );
        assert!(!ok.is_failure());

        let redirect = completed(
            Some(TaskResponse {
                status: 304,
                headers: vec![],
            }),
            None,
        );
        assert!(!redirect.is_failure());

        let not_found = completed(
            Some(TaskResponse {
                status: 404,
                headers: vec![],
            }),
            None,
        );
        assert!(not_found.is_failure());

        let errored = completed(
            None,
            Some(TaskError {
                domain: "io".to_string(),
                code: -1,
                debug_description: "connection reset".to_string(),
            }),
        );
        assert!(errored.is_failure());

        let no_response = completed(None, None);
        assert!(!no_response.is_failure());
    }
}
