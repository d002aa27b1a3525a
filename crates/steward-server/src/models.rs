use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReminderKind {
    OneTime,
    Recurring,
}

impl ReminderKind {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ReminderKind::OneTime => "one-time",
            ReminderKind::Recurring => "recurring",
        }
    }

    pub fn from_db_str(value: &str) -> Option<Self> {
        match value {
            "one-time" => Some(ReminderKind::OneTime),
            "recurring" => Some(ReminderKind::Recurring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Completed,
    NotCompleted,
}

impl TaskStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::NotCompleted => "not_completed",
        }
    }

    pub fn from_db_str(value: &str) -> Self {
        match value {
            "completed" => TaskStatus::Completed,
            "not_completed" => TaskStatus::NotCompleted,
            _ => TaskStatus::Pending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub description: String,
    pub assignee: String,
    pub assigner: String,
    pub channel_id: String,
    pub due_at: i64,
    pub reminder: bool,
    pub reminder_kind: Option<ReminderKind>,
    pub reminder_spec: Option<String>,
    pub status: TaskStatus,
    pub not_completed_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}
