//! Domain newtypes shared by the store, queue, router and scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// A channel-qualified chat identifier, e.g. `"120363...@g.us"` (WhatsApp) or
/// `"telegram:-1001234"`. Opaque to the core — only channel adapters know how
/// to parse one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Jid(pub String);

impl Jid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Jid(s.to_string())
    }
}

impl From<String> for Jid {
    fn from(s: String) -> Self {
        Jid(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single inbound or outbound message as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_jid: Jid,
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub timestamp: Timestamp,
    pub is_from_me: bool,
    pub is_bot_message: bool,
}

/// Chat-level metadata (not every chat is a registered group).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMeta {
    pub jid: Jid,
    pub name: Option<String>,
    pub last_message_time: Option<Timestamp>,
    pub is_group: bool,
}

/// A chat that has been bound to an agent working folder and is eligible for
/// dispatch by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: Jid,
    pub name: String,
    pub folder: String,
    pub trigger: Option<String>,
    pub added_at: Timestamp,
}

/// Persisted agent session handle for a group folder, so a new prompt can
/// resume the same conversation instead of starting cold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub group_folder: String,
    pub session_id: String,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleType {
    Cron { expr: String },
    Interval { seconds: i64 },
    OneShot { at: Timestamp },
}

impl ScheduleType {
    /// The `schedule_type` column/snapshot value.
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleType::Cron { .. } => "cron",
            ScheduleType::Interval { .. } => "interval",
            ScheduleType::OneShot { .. } => "one_shot",
        }
    }

    /// The `schedule_value` column/snapshot value.
    pub fn value_string(&self) -> String {
        match self {
            ScheduleType::Cron { expr } => expr.clone(),
            ScheduleType::Interval { seconds } => seconds.to_string(),
            ScheduleType::OneShot { at } => at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Disabled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Disabled => "disabled",
        }
    }
}

/// A persisted scheduled prompt, dispatched into a group's work queue when
/// `next_run` is reached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub group_folder: String,
    pub prompt: String,
    pub schedule: ScheduleType,
    pub status: TaskStatus,
    pub next_run: Timestamp,
}
