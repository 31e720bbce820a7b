//! A2A Protocol Core Types
//!
//! ## Module Structure
//!
//! - [`task`] - Task, status and lifecycle state types
//! - [`message`] - Message and role types
//! - [`part`] - Content part types (text, file, data)
//! - [`artifact`] - Task output artifacts

mod artifact;
mod message;
mod part;
mod task;

pub use artifact::Artifact;
pub use message::{Message, Role};
pub use part::{DataPart, FileContent, FilePart, Part, TextPart};
pub use task::{TASK_KIND, Task, TaskState, TaskStatus, canonical_now};
