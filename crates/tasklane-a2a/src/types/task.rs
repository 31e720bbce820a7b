//! Task types for the A2A protocol.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use super::{Artifact, Message};

/// The literal every task carries in its `kind` field.
pub const TASK_KIND: &str = "task";

fn task_kind() -> String {
    TASK_KIND.to_string()
}

/// A task represents a unit of work in the A2A protocol.
///
/// Tasks belong to a context (usually a conversation), carry their current
/// status, the message history that led to it and the artifacts produced
/// so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier for the task
    pub id: String,

    /// Context ID grouping related tasks
    pub context_id: String,

    /// Object discriminator, always `"task"` for well-formed tasks
    pub kind: String,

    /// Current status of the task
    pub status: TaskStatus,

    /// Messages exchanged before the current status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Message>>,

    /// Artifacts produced by the task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<Artifact>>,

    /// Additional metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    /// Create a new submitted task in the given context
    pub fn new(id: impl Into<String>, context_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context_id: context_id.into(),
            kind: task_kind(),
            status: TaskStatus::new(TaskState::Submitted),
            history: None,
            artifacts: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a new task with a generated UUID
    pub fn new_with_uuid(context_id: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), context_id)
    }

    /// Append a message to the task history
    pub fn push_history(&mut self, message: Message) {
        self.history.get_or_insert_with(Vec::new).push(message);
    }

    /// Add an artifact to the task
    pub fn push_artifact(&mut self, artifact: Artifact) {
        self.artifacts.get_or_insert_with(Vec::new).push(artifact);
    }

    /// Move the task to a new state, stamping the status with the current time
    pub fn set_state(&mut self, state: TaskState) {
        self.status = TaskStatus::new(state);
    }

    /// Builder variant of [`Task::set_state`]
    pub fn with_state(mut self, state: TaskState) -> Self {
        self.set_state(state);
        self
    }

    /// Replace the whole status
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Check if the task is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.state.is_terminal()
    }
}

/// Status of a task: its lifecycle state plus an optional agent message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Lifecycle state
    pub state: TaskState,

    /// Message accompanying the state change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,

    /// ISO-8601 time of the state change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TaskStatus {
    /// Status in the given state, timestamped now
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            message: None,
            timestamp: Some(canonical_now()),
        }
    }

    /// Attach a status message
    pub fn with_message(mut self, message: Message) -> Self {
        self.message = Some(message);
        self
    }

    /// Override the timestamp
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// Current UTC time in canonical ISO-8601 form (`2024-01-01T00:00:00.000Z`)
pub fn canonical_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Task was received but not started
    Submitted,

    /// Task is actively being processed
    Working,

    /// Task requires additional input to proceed
    InputRequired,

    /// Task completed successfully
    Completed,

    /// Task was canceled by the user
    Canceled,

    /// Task failed due to an error
    Failed,

    /// Task was rejected by the agent
    Rejected,

    /// Task needs authentication to proceed
    AuthRequired,

    /// State could not be determined
    Unknown,
}

impl TaskState {
    /// Every state, in lifecycle order
    pub const ALL: [TaskState; 9] = [
        TaskState::Submitted,
        TaskState::Working,
        TaskState::InputRequired,
        TaskState::Completed,
        TaskState::Canceled,
        TaskState::Failed,
        TaskState::Rejected,
        TaskState::AuthRequired,
        TaskState::Unknown,
    ];

    /// The terminal states, after which the orchestrator stops advancing a task
    pub const TERMINAL: [TaskState; 4] = [
        TaskState::Completed,
        TaskState::Canceled,
        TaskState::Failed,
        TaskState::Rejected,
    ];

    /// Check if this state represents a terminal state.
    ///
    /// The store never enforces transitions; this is for callers and retention policies.
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Wire name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Submitted => "submitted",
            TaskState::Working => "working",
            TaskState::InputRequired => "input-required",
            TaskState::Completed => "completed",
            TaskState::Canceled => "canceled",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::AuthRequired => "auth-required",
            TaskState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{}'", s))
    }
}
