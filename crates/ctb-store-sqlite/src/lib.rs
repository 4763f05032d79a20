//! SQLite-backed `MessageStore`.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE messages(id TEXT PRIMARY KEY, chat_jid TEXT NOT NULL, sender TEXT NOT NULL,
//!   sender_name TEXT, content TEXT NOT NULL, timestamp TEXT NOT NULL,
//!   is_from_me INTEGER NOT NULL DEFAULT 0, is_bot_message INTEGER NOT NULL DEFAULT 0);
//! CREATE INDEX idx_messages_chat_ts ON messages(chat_jid, timestamp);
//! CREATE TABLE chats(jid TEXT PRIMARY KEY, name TEXT, last_message_time TEXT, is_group INTEGER NOT NULL DEFAULT 0);
//! CREATE TABLE registered_groups(jid TEXT PRIMARY KEY, name TEXT NOT NULL, folder TEXT NOT NULL UNIQUE,
//!   trigger TEXT, added_at TEXT NOT NULL);
//! CREATE TABLE sessions(group_folder TEXT PRIMARY KEY, session_id TEXT NOT NULL, updated_at TEXT NOT NULL);
//! CREATE TABLE tasks(id TEXT PRIMARY KEY, group_folder TEXT NOT NULL, prompt TEXT NOT NULL,
//!   schedule_type TEXT NOT NULL, schedule_value TEXT NOT NULL, status TEXT NOT NULL, next_run TEXT NOT NULL);
//! CREATE TABLE router_kv(key TEXT PRIMARY KEY, value TEXT NOT NULL);
//! ```
//!
//! `router_kv` holds the global watermark under key `last_timestamp` and one
//! row per chat under `last_agent_timestamp:<jid>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteConnectOptions, Row, SqlitePool};

use ctb_core::{
    domain::{
        ChatMeta, Jid, Message, MessageId, RegisteredGroup, ScheduleType, SessionRecord, Task,
        TaskId, TaskStatus, Timestamp,
    },
    store::MessageStore,
    Error, Result,
};

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = database_url
            .parse()
            .map_err(|e| Error::Store(format!("invalid database url: {e}")))?;
        let pool = SqlitePool::connect_with(options.create_if_missing(true))
            .await
            .map_err(map_sqlx)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages(
                id TEXT PRIMARY KEY,
                chat_jid TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_name TEXT,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                is_from_me INTEGER NOT NULL DEFAULT 0,
                is_bot_message INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_jid, timestamp);

            CREATE TABLE IF NOT EXISTS chats(
                jid TEXT PRIMARY KEY,
                name TEXT,
                last_message_time TEXT,
                is_group INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS registered_groups(
                jid TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                folder TEXT NOT NULL UNIQUE,
                trigger TEXT,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions(
                group_folder TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks(
                id TEXT PRIMARY KEY,
                group_folder TEXT NOT NULL,
                prompt TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                schedule_value TEXT NOT NULL,
                status TEXT NOT NULL,
                next_run TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS router_kv(
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    fn agent_cursor_key(jid: &Jid) -> String {
        format!("last_agent_timestamp:{}", jid.as_str())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM router_kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO router_kv(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }
}

fn map_sqlx(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

fn parse_ts(s: &str) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("invalid stored timestamp {s:?}: {e}")))
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    Ok(Message {
        id: MessageId(row.try_get("id").map_err(map_sqlx)?),
        chat_jid: Jid(row.try_get("chat_jid").map_err(map_sqlx)?),
        sender: row.try_get("sender").map_err(map_sqlx)?,
        sender_name: row.try_get("sender_name").map_err(map_sqlx)?,
        content: row.try_get("content").map_err(map_sqlx)?,
        timestamp: parse_ts(&row.try_get::<String, _>("timestamp").map_err(map_sqlx)?)?,
        is_from_me: row.try_get::<i64, _>("is_from_me").map_err(map_sqlx)? != 0,
        is_bot_message: row.try_get::<i64, _>("is_bot_message").map_err(map_sqlx)? != 0,
    })
}

fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> Result<RegisteredGroup> {
    Ok(RegisteredGroup {
        jid: Jid(row.try_get("jid").map_err(map_sqlx)?),
        name: row.try_get("name").map_err(map_sqlx)?,
        folder: row.try_get("folder").map_err(map_sqlx)?,
        trigger: row.try_get("trigger").map_err(map_sqlx)?,
        added_at: parse_ts(&row.try_get::<String, _>("added_at").map_err(map_sqlx)?)?,
    })
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    let schedule_type: String = row.try_get("schedule_type").map_err(map_sqlx)?;
    let schedule_value: String = row.try_get("schedule_value").map_err(map_sqlx)?;
    let schedule = match schedule_type.as_str() {
        "cron" => ScheduleType::Cron { expr: schedule_value },
        "interval" => ScheduleType::Interval {
            seconds: schedule_value
                .parse()
                .map_err(|e| Error::Store(format!("invalid interval seconds: {e}")))?,
        },
        "one_shot" => ScheduleType::OneShot { at: parse_ts(&schedule_value)? },
        other => return Err(Error::Store(format!("unknown schedule_type: {other}"))),
    };

    let status = match row.try_get::<String, _>("status").map_err(map_sqlx)?.as_str() {
        "pending" => TaskStatus::Pending,
        "running" => TaskStatus::Running,
        "done" => TaskStatus::Done,
        "failed" => TaskStatus::Failed,
        "disabled" => TaskStatus::Disabled,
        other => return Err(Error::Store(format!("unknown task status: {other}"))),
    };

    Ok(Task {
        id: TaskId(row.try_get("id").map_err(map_sqlx)?),
        group_folder: row.try_get("group_folder").map_err(map_sqlx)?,
        prompt: row.try_get("prompt").map_err(map_sqlx)?,
        schedule,
        status,
        next_run: parse_ts(&row.try_get::<String, _>("next_run").map_err(map_sqlx)?)?,
    })
}

fn schedule_columns(schedule: &ScheduleType) -> (&'static str, String) {
    (schedule.kind(), schedule.value_string())
}

fn status_column(status: TaskStatus) -> &'static str {
    status.as_str()
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn messages_since(&self, jid: &Jid, since: Timestamp) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE chat_jid = ?1 AND timestamp > ?2 ORDER BY timestamp ASC",
        )
        .bind(jid.as_str())
        .bind(since.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_message).collect()
    }

    async fn all_messages_since(&self, since: Timestamp) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE timestamp > ?1 ORDER BY timestamp ASC")
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;

        rows.iter().map(row_to_message).collect()
    }

    async fn chat_meta(&self, jid: &Jid) -> Result<Option<ChatMeta>> {
        let row = sqlx::query("SELECT * FROM chats WHERE jid = ?1")
            .bind(jid.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let Some(row) = row else { return Ok(None) };
        let last_message_time: Option<String> = row.try_get("last_message_time").map_err(map_sqlx)?;
        Ok(Some(ChatMeta {
            jid: Jid(row.try_get("jid").map_err(map_sqlx)?),
            name: row.try_get("name").map_err(map_sqlx)?,
            last_message_time: last_message_time.map(|s| parse_ts(&s)).transpose()?,
            is_group: row.try_get::<i64, _>("is_group").map_err(map_sqlx)? != 0,
        }))
    }

    async fn registered_groups(&self) -> Result<Vec<RegisteredGroup>> {
        let rows = sqlx::query("SELECT * FROM registered_groups")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_group).collect()
    }

    async fn registered_group(&self, jid: &Jid) -> Result<Option<RegisteredGroup>> {
        let row = sqlx::query("SELECT * FROM registered_groups WHERE jid = ?1")
            .bind(jid.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_group).transpose()
    }

    async fn group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        let row = sqlx::query("SELECT * FROM registered_groups WHERE folder = ?1")
            .bind(folder)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_group).transpose()
    }

    async fn session_for_folder(&self, folder: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE group_folder = ?1")
            .bind(folder)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(SessionRecord {
            group_folder: row.try_get("group_folder").map_err(map_sqlx)?,
            session_id: row.try_get("session_id").map_err(map_sqlx)?,
            updated_at: parse_ts(&row.try_get::<String, _>("updated_at").map_err(map_sqlx)?)?,
        }))
    }

    async fn save_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions(group_folder, session_id, updated_at) VALUES(?1, ?2, ?3)
             ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id, updated_at = excluded.updated_at",
        )
        .bind(&record.group_folder)
        .bind(&record.session_id)
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn router_last_timestamp(&self) -> Result<Option<Timestamp>> {
        self.kv_get("last_timestamp").await?.map(|s| parse_ts(&s)).transpose()
    }

    async fn set_router_last_timestamp(&self, ts: Timestamp) -> Result<()> {
        self.kv_set("last_timestamp", &ts.to_rfc3339()).await
    }

    async fn router_last_agent_timestamp(&self, jid: &Jid) -> Result<Option<Timestamp>> {
        self.kv_get(&Self::agent_cursor_key(jid))
            .await?
            .map(|s| parse_ts(&s))
            .transpose()
    }

    async fn set_router_last_agent_timestamp(&self, jid: &Jid, ts: Timestamp) -> Result<()> {
        self.kv_set(&Self::agent_cursor_key(jid), &ts.to_rfc3339()).await
    }

    async fn due_tasks(&self, now: Timestamp) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'pending' AND next_run <= ?1 ORDER BY next_run ASC",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_task).collect()
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let (schedule_type, schedule_value) = schedule_columns(&task.schedule);
        sqlx::query(
            "INSERT INTO tasks(id, group_folder, prompt, schedule_type, schedule_value, status, next_run)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                group_folder = excluded.group_folder,
                prompt = excluded.prompt,
                schedule_type = excluded.schedule_type,
                schedule_value = excluded.schedule_value,
                status = excluded.status,
                next_run = excluded.next_run",
        )
        .bind(&task.id.0)
        .bind(&task.group_folder)
        .bind(&task.prompt)
        .bind(schedule_type)
        .bind(schedule_value)
        .bind(status_column(task.status))
        .bind(task.next_run.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn task(&self, id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn tasks_for_folder(&self, folder: Option<&str>) -> Result<Vec<Task>> {
        let rows = match folder {
            Some(f) => sqlx::query(
                "SELECT * FROM tasks WHERE group_folder = ?1 ORDER BY next_run ASC",
            )
            .bind(f)
            .fetch_all(&self.pool)
            .await,
            None => {
                sqlx::query("SELECT * FROM tasks ORDER BY next_run ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_task).collect()
    }
}
