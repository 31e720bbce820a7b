//! Key layout under a configurable prefix.

use tasklane_a2a::TaskState;

/// Field in the stats hash holding the physical record count
pub const TOTAL_FIELD: &str = "totalTasks";

/// Builds every key the Redis provider touches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKeys {
    prefix: String,
}

impl TaskKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Hash holding one stored record
    pub fn task(&self, task_id: &str) -> String {
        format!("{}task:{}", self.prefix, task_id)
    }

    /// Set of task ids in one context
    pub fn context(&self, context_id: &str) -> String {
        format!("{}context:{}", self.prefix, context_id)
    }

    /// Hash of counters
    pub fn stats(&self) -> String {
        format!("{}stats", self.prefix)
    }

    /// Sorted set of task ids scored by their native expiry in ms
    pub fn expiries(&self) -> String {
        format!("{}expiries", self.prefix)
    }

    /// Hash from expiring task id to `state\ncontextId`, kept so counters
    /// can be corrected after Redis drops the task hash itself
    pub fn expiry_owners(&self) -> String {
        format!("{}expiry-owners", self.prefix)
    }

    /// `SCAN MATCH` pattern for every task hash
    pub fn task_pattern(&self) -> String {
        format!("{}task:*", escape_glob(&self.prefix))
    }

    /// `SCAN MATCH` pattern for every context set
    pub fn context_pattern(&self) -> String {
        format!("{}context:*", escape_glob(&self.prefix))
    }

    /// Context id encoded in a context set key
    pub fn context_id_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix("context:")
    }
}

/// Counter field for one state in the stats hash
pub fn state_field(state: TaskState) -> String {
    format!("state:{}", state.as_str())
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
