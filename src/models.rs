use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

/// Which queue a task belongs to
///
/// `User` tasks are human-authored and outrank `Internal` (system-generated)
/// tasks at equal priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Queue {
    User,
    Internal,
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Queue::User => write!(f, "user"),
            Queue::Internal => write!(f, "internal"),
        }
    }
}

impl FromStr for Queue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Queue::User),
            "internal" => Ok(Queue::Internal),
            _ => Err(format!("Unknown queue: {s}")),
        }
    }
}

/// Task priority levels
///
/// Derived ordering follows declaration order, so `Critical` sorts above
/// `High` and so on down to `Low`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Current status of a task in its queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

/// A unit of work read from a queue file
///
/// Unknown fields encountered in the file are captured in `extra` so a
/// read→write→read cycle preserves them byte-for-byte at the value level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Free-form task metadata: context, model, provider, app, blocker,
    /// taskType, autoApproved, ...
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Back-reference written and cleared by the supervisor while an agent
    /// holds this task. Never an owning pointer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_agent_id: Option<String>,
    /// Fields this version does not model; preserved on rewrite.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority,
            approval_required: false,
            approved: false,
            created_at: Utc::now(),
            metadata: HashMap::new(),
            current_agent_id: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Approval gate: a task requiring approval is ineligible until approved.
    pub fn approval_satisfied(&self) -> bool {
        !self.approval_required || self.approved
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// App this task touches, if declared. Drives per-app cooldowns.
    pub fn app(&self) -> Option<&str> {
        self.metadata_str("app")
    }

    /// Explicit task-type override from metadata, bypassing classification.
    pub fn task_type_override(&self) -> Option<&str> {
        self.metadata_str("taskType")
    }

    /// Explicit model override from metadata.
    pub fn model_override(&self) -> Option<&str> {
        self.metadata_str("model")
    }
}

/// Model power tier used for routing
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Heavy,
    Medium,
    Light,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Heavy => write!(f, "heavy"),
            ModelTier::Medium => write!(f, "medium"),
            ModelTier::Light => write!(f, "light"),
        }
    }
}

/// Agent lifecycle states
///
/// `Running` holds if and only if the recorded pid is live in the OS; the
/// monitor reconciles divergence (zombie detection).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Initializing,
    Working,
}

/// One captured output line with its arrival timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Outcome of a completed agent run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Routing and placement details captured at spawn time
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_tier: Option<ModelTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_reason: Option<String>,
    pub task_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_branch: Option<String>,
}

/// Persistent record of one managed agent
///
/// Owned exclusively by the supervisor while non-completed; persisted on
/// every state transition; immutable after completion except `feedback`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub task_id: String,
    pub queue: Queue,
    pub status: AgentStatus,
    pub phase: AgentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// In-memory bounded tail; the full stream is on disk.
    #[serde(default)]
    pub output: Vec<OutputLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<AgentResult>,
    pub metadata: AgentMetadata,
    pub task_type: String,
    /// The one field that stays mutable after completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl AgentRecord {
    pub fn new(task: &Task, queue: Queue, task_type: String, metadata: AgentMetadata) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            task_id: task.id.clone(),
            queue,
            status: AgentStatus::Initializing,
            phase: AgentPhase::Initializing,
            pid: None,
            started_at: Utc::now(),
            completed_at: None,
            output: Vec::new(),
            result: None,
            metadata,
            task_type,
            feedback: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status != AgentStatus::Completed
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }
}

/// Structured issue raised by the health check
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub category: String,
    #[serde(rename = "type")]
    pub kind: IssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueKind {
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_follows_severity() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn task_round_trips_unknown_fields() {
        let raw = serde_json::json!({
            "id": "t1",
            "description": "Fix typo in readme",
            "status": "pending",
            "priority": "LOW",
            "customField": {"nested": true},
        });
        let task: Task = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(task.extra.get("customField"), raw.get("customField"));

        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back.get("customField"), raw.get("customField"));
    }

    #[test]
    fn approval_gate() {
        let mut task = Task::new("needs sign-off", Priority::High);
        assert!(task.approval_satisfied());

        task.approval_required = true;
        assert!(!task.approval_satisfied());

        task.approved = true;
        assert!(task.approval_satisfied());
    }

    #[test]
    fn agent_ids_are_sortable_by_creation() {
        let a = AgentRecord::new(&Task::new("a", Priority::Low), Queue::User, "misc".into(), AgentMetadata::default());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = AgentRecord::new(&Task::new("b", Priority::Low), Queue::User, "misc".into(), AgentMetadata::default());
        assert!(a.id < b.id);
    }

    #[test]
    fn serialized_enums_use_wire_casing() {
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"CRITICAL\"");
        assert_eq!(serde_json::to_string(&TaskStatus::InProgress).unwrap(), "\"in_progress\"");
        assert_eq!(serde_json::to_string(&Queue::Internal).unwrap(), "\"internal\"");
        assert_eq!(serde_json::to_string(&ModelTier::Heavy).unwrap(), "\"heavy\"");
    }
}
