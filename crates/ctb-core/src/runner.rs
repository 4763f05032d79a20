//! Agent Runner: spawns a containerized agent process, pipes prompts into
//! its stdin, parses its line-framed NDJSON result stream, and enforces an
//! idle timeout. At most one agent process is ever live per chat JID; a new
//! message for a JID whose agent is still running is piped into that same
//! process by the Router calling `GroupQueue::send_message` rather than
//! starting a second one — see `queue.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    domain::{Jid, RegisteredGroup, SessionRecord},
    formatting::{render_messages_xml, strip_internal_blocks},
    messaging::port::ChannelPort,
    queue::{GroupQueue, WorkItem},
    store::MessageStore,
    utils::iso_timestamp_utc,
    Error, Result,
};

/// One parsed line of the agent's NDJSON stdout stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub status: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, rename = "newSessionId")]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentRecord {
    fn has_output(&self) -> bool {
        self.result.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    fn is_success(&self) -> bool {
        self.status == "success"
    }
}

/// What the agent process needs to start a run.
pub struct SpawnRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: Jid,
    pub is_main: bool,
    pub assistant_name: String,
}

/// A running agent process: piped stdin, line-framed stdout.
#[async_trait]
pub trait AgentHandle: Send {
    async fn write_line(&mut self, line: &str) -> Result<()>;
    async fn close_stdin(&mut self);
    async fn kill(&mut self);
    /// Next parsed stdout record, or `None` at EOF. A line that fails to
    /// parse is dropped, never surfaced as an error.
    async fn next_record(&mut self) -> Option<AgentRecord>;
    /// Exit code, available only after `next_record` has returned `None`.
    async fn wait(&mut self) -> Result<i32>;
}

#[async_trait]
pub trait AgentProcess: Send + Sync {
    async fn spawn(&self, req: &SpawnRequest) -> Result<Box<dyn AgentHandle>>;
}

/// Shared handle to a live agent process, registered with the `GroupQueue`
/// so the Router can pipe into it and held locally so `drive_to_completion`
/// can read its stdout — the same handle, two owners.
pub type LiveHandle = Arc<Mutex<Box<dyn AgentHandle>>>;

/// Owns the per-JID "at most one live agent process" invariant and the
/// idle-timeout/termination-classification logic around it.
pub struct AgentRunner {
    process: Arc<dyn AgentProcess>,
    store: Arc<dyn MessageStore>,
    channel: Arc<dyn ChannelPort>,
    queue: Arc<GroupQueue>,
    idle_timeout: Duration,
    assistant_name: String,
    main_group_folder: String,
    live: Mutex<HashMap<Jid, LiveHandle>>,
}

impl AgentRunner {
    pub fn new(
        process: Arc<dyn AgentProcess>,
        store: Arc<dyn MessageStore>,
        channel: Arc<dyn ChannelPort>,
        queue: Arc<GroupQueue>,
        idle_timeout: Duration,
        assistant_name: String,
        main_group_folder: String,
    ) -> Self {
        Self {
            process,
            store,
            channel,
            queue,
            idle_timeout,
            assistant_name,
            main_group_folder,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// The function to hand to `GroupQueue::set_process_fn`.
    pub fn into_process_fn(self: Arc<Self>) -> crate::queue::ProcessFn {
        Arc::new(move |jid, item| {
            let this = self.clone();
            Box::pin(async move {
                if let Err(e) = this.handle_item(jid, item).await {
                    warn!(error = %e, "agent runner item failed");
                }
            })
        })
    }

    async fn handle_item(&self, jid: Jid, item: WorkItem) -> Result<()> {
        let rollback_to = match &item {
            WorkItem::Messages { rollback_to, .. } => *rollback_to,
            WorkItem::SyntheticPrompt(_) => None,
        };

        let prompt = match item {
            WorkItem::Messages { messages, .. } if !messages.is_empty() => {
                render_messages_xml(&messages)
            }
            WorkItem::Messages { .. } => return Ok(()),
            WorkItem::SyntheticPrompt(p) => p,
        };

        let result = self.run_prompt(jid.clone(), prompt).await;

        if result.is_err() {
            if let Some(ts) = rollback_to {
                if let Err(e) = self.store.set_router_last_agent_timestamp(&jid, ts).await {
                    warn!(%jid, error = %e, "failed to roll back router cursor after failed run");
                }
            }
        }

        result
    }

    /// Spawns a fresh agent and drives it to completion. By the time a
    /// `WorkItem` reaches this FIFO path, the Router has already tried (and
    /// failed) to pipe into a live agent via `GroupQueue::send_message`, so
    /// no such agent exists for `jid`.
    async fn run_prompt(&self, jid: Jid, prompt: String) -> Result<()> {
        let Some(group) = self.store.registered_group(&jid).await? else {
            warn!(%jid, "no registered group for jid, dropping prompt");
            return Ok(());
        };

        self.write_snapshot(&group).await;

        let session_id = self
            .store
            .session_for_folder(&group.folder)
            .await?
            .map(|s| s.session_id);

        let req = SpawnRequest {
            prompt,
            session_id,
            group_folder: group.folder.clone(),
            chat_jid: jid.clone(),
            is_main: group.folder == self.main_group_folder,
            assistant_name: self.assistant_name.clone(),
        };

        let _ = self.channel.set_typing(&jid, true).await;

        let handle = self.process.spawn(&req).await?;
        let live: LiveHandle = Arc::new(Mutex::new(handle));
        self.live.lock().await.insert(jid.clone(), live.clone());
        self.queue.register_process(jid.clone(), live).await;

        self.drive_to_completion(jid, group).await
    }

    async fn drive_to_completion(&self, jid: Jid, group: RegisteredGroup) -> Result<()> {
        let mut had_streaming_output = false;
        let mut last_session_id: Option<String> = None;

        loop {
            let handle = {
                let live = self.live.lock().await;
                match live.get(&jid) {
                    Some(h) => h.clone(),
                    None => break,
                }
            };

            let record = {
                let mut agent = handle.lock().await;
                tokio::time::timeout(self.idle_timeout, agent.next_record()).await
            };

            match record {
                Ok(Some(rec)) => {
                    if rec.has_output() {
                        had_streaming_output = true;
                    }
                    if let Some(sid) = rec.new_session_id.clone() {
                        last_session_id = Some(sid);
                    }
                    if rec.is_success() {
                        self.queue.notify_idle(&jid).await;
                    }
                    self.emit(&jid, &rec).await;
                }
                Ok(None) => break, // stdout EOF
                Err(_) => {
                    info!(%jid, "agent idle timeout, closing stdin");
                    handle.lock().await.close_stdin().await;
                    // Keep looping: the process may still flush remaining output.
                }
            }
        }

        let exit = {
            let removed = self.live.lock().await.remove(&jid);
            self.queue.deregister_process(&jid).await;
            match removed {
                Some(handle) => handle.lock().await.wait().await,
                None => Ok(0),
            }
        };

        let _ = self.channel.set_typing(&jid, false).await;

        if let Some(sid) = last_session_id {
            let _ = self
                .store
                .save_session(&SessionRecord {
                    group_folder: group.folder.clone(),
                    session_id: sid,
                    updated_at: chrono::Utc::now(),
                })
                .await;
        }

        match exit {
            Ok(code) if code == 0 || had_streaming_output => Ok(()),
            Ok(code) => Err(Error::Agent(format!(
                "agent exited with code {code} and produced no output"
            ))),
            Err(e) => {
                if had_streaming_output {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn emit(&self, jid: &Jid, rec: &AgentRecord) {
        if let Some(err) = &rec.error {
            warn!(%jid, error = %err, "agent reported error");
        }
        let Some(result) = rec.result.as_deref() else {
            return;
        };
        let clean = strip_internal_blocks(result);
        if clean.is_empty() {
            return;
        }
        if let Err(e) = self.channel.send_message(jid, &clean).await {
            warn!(%jid, error = %e, "failed to deliver agent output");
        }
    }

    /// Writes the group's task list and the available-groups roster into its
    /// workspace before the agent starts. The main group sees every task;
    /// other groups see only their own.
    async fn write_snapshot(&self, group: &RegisteredGroup) {
        let base = std::path::Path::new(&group.folder);

        let groups = self.store.registered_groups().await.unwrap_or_default();
        let groups_payload = serde_json::json!({
            "generatedAt": iso_timestamp_utc(),
            "groups": groups,
        });
        if let Ok(s) = serde_json::to_string_pretty(&groups_payload) {
            let _ = tokio::fs::write(base.join("groups.json"), s).await;
        }

        let is_main = group.folder == self.main_group_folder;
        let folder_filter = if is_main { None } else { Some(group.folder.as_str()) };
        let tasks = self
            .store
            .tasks_for_folder(folder_filter)
            .await
            .unwrap_or_default();
        let tasks_payload: Vec<_> = tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id.0,
                    "groupFolder": t.group_folder,
                    "prompt": t.prompt,
                    "schedule_type": t.schedule.kind(),
                    "schedule_value": t.schedule.value_string(),
                    "status": t.status.as_str(),
                    "next_run": t.next_run.to_rfc3339(),
                })
            })
            .collect();
        if let Ok(s) = serde_json::to_string_pretty(&tasks_payload) {
            let _ = tokio::fs::write(base.join("tasks.json"), s).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMeta, ScheduleType, Task, TaskId, TaskStatus, Timestamp};
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        group: RegisteredGroup,
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn messages_since(&self, _jid: &Jid, _since: Timestamp) -> Result<Vec<crate::domain::Message>> {
            Ok(vec![])
        }
        async fn all_messages_since(&self, _since: Timestamp) -> Result<Vec<crate::domain::Message>> {
            Ok(vec![])
        }
        async fn chat_meta(&self, _jid: &Jid) -> Result<Option<ChatMeta>> {
            Ok(None)
        }
        async fn registered_groups(&self) -> Result<Vec<RegisteredGroup>> {
            Ok(vec![self.group.clone()])
        }
        async fn registered_group(&self, jid: &Jid) -> Result<Option<RegisteredGroup>> {
            Ok((jid == &self.group.jid).then(|| self.group.clone()))
        }
        async fn group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
            Ok((folder == self.group.folder).then(|| self.group.clone()))
        }
        async fn session_for_folder(&self, _folder: &str) -> Result<Option<SessionRecord>> {
            Ok(None)
        }
        async fn save_session(&self, _record: &SessionRecord) -> Result<()> {
            Ok(())
        }
        async fn router_last_timestamp(&self) -> Result<Option<Timestamp>> {
            Ok(None)
        }
        async fn set_router_last_timestamp(&self, _ts: Timestamp) -> Result<()> {
            Ok(())
        }
        async fn router_last_agent_timestamp(&self, _jid: &Jid) -> Result<Option<Timestamp>> {
            Ok(None)
        }
        async fn set_router_last_agent_timestamp(&self, _jid: &Jid, _ts: Timestamp) -> Result<()> {
            Ok(())
        }
        async fn due_tasks(&self, _now: Timestamp) -> Result<Vec<Task>> {
            Ok(vec![])
        }
        async fn save_task(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
        async fn task(&self, _id: &TaskId) -> Result<Option<Task>> {
            Ok(None)
        }
        async fn tasks_for_folder(&self, _folder: Option<&str>) -> Result<Vec<Task>> {
            Ok(vec![])
        }
    }

    struct FakeChannel {
        sent: StdMutex<Vec<String>>,
        typing: StdMutex<Vec<bool>>,
    }

    #[async_trait]
    impl ChannelPort for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }
        fn owns_jid(&self, _jid: &Jid) -> bool {
            true
        }
        async fn send_message(&self, _jid: &Jid, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
        async fn set_typing(&self, _jid: &Jid, on: bool) -> Result<()> {
            self.typing.lock().unwrap().push(on);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeHandle {
        records: StdMutex<Vec<AgentRecord>>,
        exit_code: i32,
    }

    #[async_trait]
    impl AgentHandle for FakeHandle {
        async fn write_line(&mut self, _line: &str) -> Result<()> {
            Ok(())
        }
        async fn close_stdin(&mut self) {}
        async fn kill(&mut self) {}
        async fn next_record(&mut self) -> Option<AgentRecord> {
            self.records.lock().unwrap().pop()
        }
        async fn wait(&mut self) -> Result<i32> {
            Ok(self.exit_code)
        }
    }

    struct FakeProcess {
        records: Vec<AgentRecord>,
        exit_code: i32,
    }

    #[async_trait]
    impl AgentProcess for FakeProcess {
        async fn spawn(&self, _req: &SpawnRequest) -> Result<Box<dyn AgentHandle>> {
            let mut records = self.records.clone();
            records.reverse(); // so `pop()` yields them in order
            Ok(Box::new(FakeHandle {
                records: StdMutex::new(records),
                exit_code: self.exit_code,
            }))
        }
    }

    fn test_group() -> RegisteredGroup {
        RegisteredGroup {
            jid: Jid("g1".into()),
            name: "Group".into(),
            folder: "/tmp/ctb-runner-test-group".into(),
            trigger: None,
            added_at: chrono::Utc::now(),
        }
    }

    fn make_runner(
        process: Arc<FakeProcess>,
        store: Arc<FakeStore>,
        channel: Arc<FakeChannel>,
    ) -> AgentRunner {
        AgentRunner::new(
            process,
            store,
            channel,
            Arc::new(GroupQueue::new()),
            Duration::from_secs(5),
            "bot".into(),
            "main".into(),
        )
    }

    #[tokio::test]
    async fn nonzero_exit_with_streamed_output_is_not_an_error() {
        let group = test_group();
        std::fs::create_dir_all(&group.folder).unwrap();
        let store = Arc::new(FakeStore { group: group.clone() });
        let channel = Arc::new(FakeChannel {
            sent: StdMutex::new(vec![]),
            typing: StdMutex::new(vec![]),
        });
        let process = Arc::new(FakeProcess {
            records: vec![AgentRecord {
                status: "result".into(),
                result: Some("partial output before crash".into()),
                new_session_id: None,
                error: None,
            }],
            exit_code: 17,
        });

        let runner = make_runner(process, store, channel.clone());

        let res = runner
            .handle_item(group.jid.clone(), WorkItem::SyntheticPrompt("hi".into()))
            .await;
        assert!(res.is_ok());
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
        assert_eq!(*channel.typing.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn nonzero_exit_with_no_output_is_an_error() {
        let group = test_group();
        std::fs::create_dir_all(&group.folder).unwrap();
        let store = Arc::new(FakeStore { group: group.clone() });
        let channel = Arc::new(FakeChannel {
            sent: StdMutex::new(vec![]),
            typing: StdMutex::new(vec![]),
        });
        let process = Arc::new(FakeProcess {
            records: vec![],
            exit_code: 1,
        });

        let runner = make_runner(process, store, channel);

        let res = runner
            .handle_item(group.jid.clone(), WorkItem::SyntheticPrompt("hi".into()))
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn writes_tasks_and_groups_snapshots() {
        let group = test_group();
        std::fs::create_dir_all(&group.folder).unwrap();
        let store = Arc::new(FakeStoreWithTasks {
            group: group.clone(),
            tasks: vec![Task {
                id: TaskId("t1".into()),
                group_folder: group.folder.clone(),
                prompt: "ping".into(),
                schedule: ScheduleType::Interval { seconds: 60 },
                status: TaskStatus::Pending,
                next_run: chrono::Utc::now(),
            }],
        });
        let channel = Arc::new(FakeChannel {
            sent: StdMutex::new(vec![]),
            typing: StdMutex::new(vec![]),
        });
        let process = Arc::new(FakeProcess {
            records: vec![],
            exit_code: 0,
        });

        let runner = make_runner(process, store, channel);
        runner.write_snapshot(&group).await;

        let groups_json = std::fs::read_to_string(format!("{}/groups.json", group.folder)).unwrap();
        assert!(groups_json.contains("Group"));

        let tasks_json = std::fs::read_to_string(format!("{}/tasks.json", group.folder)).unwrap();
        assert!(tasks_json.contains("\"groupFolder\""));
        assert!(tasks_json.contains("\"ping\""));
        assert!(tasks_json.contains("\"interval\""));
    }

    struct FakeStoreWithTasks {
        group: RegisteredGroup,
        tasks: Vec<Task>,
    }

    #[async_trait]
    impl MessageStore for FakeStoreWithTasks {
        async fn messages_since(&self, _jid: &Jid, _since: Timestamp) -> Result<Vec<crate::domain::Message>> {
            Ok(vec![])
        }
        async fn all_messages_since(&self, _since: Timestamp) -> Result<Vec<crate::domain::Message>> {
            Ok(vec![])
        }
        async fn chat_meta(&self, _jid: &Jid) -> Result<Option<ChatMeta>> {
            Ok(None)
        }
        async fn registered_groups(&self) -> Result<Vec<RegisteredGroup>> {
            Ok(vec![self.group.clone()])
        }
        async fn registered_group(&self, jid: &Jid) -> Result<Option<RegisteredGroup>> {
            Ok((jid == &self.group.jid).then(|| self.group.clone()))
        }
        async fn group_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
            Ok((folder == self.group.folder).then(|| self.group.clone()))
        }
        async fn session_for_folder(&self, _folder: &str) -> Result<Option<SessionRecord>> {
            Ok(None)
        }
        async fn save_session(&self, _record: &SessionRecord) -> Result<()> {
            Ok(())
        }
        async fn router_last_timestamp(&self) -> Result<Option<Timestamp>> {
            Ok(None)
        }
        async fn set_router_last_timestamp(&self, _ts: Timestamp) -> Result<()> {
            Ok(())
        }
        async fn router_last_agent_timestamp(&self, _jid: &Jid) -> Result<Option<Timestamp>> {
            Ok(None)
        }
        async fn set_router_last_agent_timestamp(&self, _jid: &Jid, _ts: Timestamp) -> Result<()> {
            Ok(())
        }
        async fn due_tasks(&self, _now: Timestamp) -> Result<Vec<Task>> {
            Ok(vec![])
        }
        async fn save_task(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
        async fn task(&self, _id: &TaskId) -> Result<Option<Task>> {
            Ok(None)
        }
        async fn tasks_for_folder(&self, folder: Option<&str>) -> Result<Vec<Task>> {
            Ok(match folder {
                Some(f) => self.tasks.iter().filter(|t| t.group_folder == f).cloned().collect(),
                None => self.tasks.clone(),
            })
        }
    }
}
