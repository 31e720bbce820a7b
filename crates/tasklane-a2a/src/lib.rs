//! # Tasklane A2A - Agent2Agent Task Types
//!
//! Wire types of the A2A protocol as they are persisted by the Tasklane
//! task store: tasks, their status, conversation messages, content parts
//! and artifacts. Field names serialize in camelCase and discriminated
//! unions are tagged by `kind`, matching the protocol's JSON shape.
//!
//! ## Example
//!
//! ```rust
//! use tasklane_a2a::{Message, Task, TaskState};
//!
//! let mut task = Task::new("task-001", "conversation-1");
//! task.push_history(Message::user("Please summarize this document..."));
//! assert_eq!(task.status.state, TaskState::Submitted);
//!
//! task.set_state(TaskState::Completed);
//! assert!(task.is_terminal());
//! ```

pub mod types;

pub use types::{
    Artifact, DataPart, FileContent, FilePart, Message, Part, Role, TASK_KIND, Task, TaskState,
    TaskStatus, TextPart, canonical_now,
};
