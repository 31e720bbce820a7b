//! Conversation messages recorded in task status and history.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::Part;

fn message_kind() -> String {
    "message".to_string()
}

/// One turn of the conversation a task belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Object discriminator, always `"message"`
    #[serde(default = "message_kind")]
    pub kind: String,

    /// Message identifier
    pub message_id: String,

    /// Who sent it
    pub role: Role,

    /// Ordered content
    pub parts: Vec<Part>,

    /// Context the message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Task the message belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Ids of other tasks this message points at
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_task_ids: Vec<String>,

    /// Additional metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    fn with_role(role: Role, parts: Vec<Part>) -> Self {
        Self {
            kind: message_kind(),
            message_id: Uuid::new_v4().to_string(),
            role,
            parts,
            context_id: None,
            task_id: None,
            reference_task_ids: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Single-text message from the user side
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role(Role::User, vec![Part::text(text)])
    }

    /// Single-text message from the agent side
    pub fn agent(text: impl Into<String>) -> Self {
        Self::with_role(Role::Agent, vec![Part::text(text)])
    }

    /// Append a content part
    pub fn with_part(mut self, part: Part) -> Self {
        self.parts.push(part);
        self
    }

    /// Bind the message to a task and its context
    pub fn for_task(mut self, task_id: impl Into<String>, context_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self.context_id = Some(context_id.into());
        self
    }

    /// Point at another task
    pub fn with_reference(mut self, task_id: impl Into<String>) -> Self {
        self.reference_task_ids.push(task_id.into());
        self
    }
}

/// Sender side of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The requesting side, a person or a client agent
    User,

    /// Message from an agent
    Agent,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::User => "user",
            Role::Agent => "agent",
        })
    }
}
