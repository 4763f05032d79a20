//! The message store port.
//!
//! Schema and query plan are an external concern (see `ctb-store-sqlite` for
//! one concrete backing); the core only depends on this trait.

use async_trait::async_trait;

use crate::domain::{ChatMeta, Jid, Message, RegisteredGroup, SessionRecord, Task, TaskId, Timestamp};
use crate::Result;

/// Durable storage for messages, registered groups, sessions, tasks, and the
/// router's cursor state.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages for `jid` strictly newer than `since`, oldest first.
    async fn messages_since(&self, jid: &Jid, since: Timestamp) -> Result<Vec<Message>>;

    /// All messages strictly newer than `since` across every chat, oldest
    /// first. Used to advance the router's global watermark.
    async fn all_messages_since(&self, since: Timestamp) -> Result<Vec<Message>>;

    async fn chat_meta(&self, jid: &Jid) -> Result<Option<ChatMeta>>;

    async fn registered_groups(&self) -> Result<Vec<RegisteredGroup>>;

    async fn registered_group(&self, jid: &Jid) -> Result<Option<RegisteredGroup>>;

    async fn group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>>;

    async fn session_for_folder(&self, folder: &str) -> Result<Option<SessionRecord>>;

    async fn save_session(&self, record: &SessionRecord) -> Result<()>;

    /// The global `last_timestamp` router watermark, if any polling has run.
    async fn router_last_timestamp(&self) -> Result<Option<Timestamp>>;

    async fn set_router_last_timestamp(&self, ts: Timestamp) -> Result<()>;

    async fn router_last_agent_timestamp(&self, jid: &Jid) -> Result<Option<Timestamp>>;

    async fn set_router_last_agent_timestamp(&self, jid: &Jid, ts: Timestamp) -> Result<()>;

    /// Tasks due at or before `now`, in `Pending` status.
    async fn due_tasks(&self, now: Timestamp) -> Result<Vec<Task>>;

    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn task(&self, id: &TaskId) -> Result<Option<Task>>;

    /// Tasks belonging to `folder`, or every task if `folder` is `None` (the
    /// main group's snapshot sees the full task list).
    async fn tasks_for_folder(&self, folder: Option<&str>) -> Result<Vec<Task>>;
}
