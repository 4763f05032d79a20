//! Router / Message Loop: polls the store for new messages, advances the
//! global watermark, and dispatches each touched group's unsent messages —
//! first trying to pipe them directly into a live agent process via the
//! Group Queue's `send_message`, falling back to the FIFO queue (which spawns
//! a fresh agent) only when no such process exists. Dispatch always re-derives
//! the authoritative pending set from the store rather than trusting a single
//! poll batch, so a crash or rollback never permanently drops a message.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    domain::{Jid, Timestamp},
    errors::Error,
    formatting::render_messages_xml,
    messaging::port::ChannelPort,
    queue::GroupQueue,
    store::MessageStore,
    Result,
};

/// Epoch used as the "no cursor yet" sentinel, since the store trait deals
/// in `Timestamp` rather than `Option<Timestamp>` for the rollback target.
fn epoch() -> Timestamp {
    chrono::DateTime::UNIX_EPOCH
}

pub struct Router {
    store: Arc<dyn MessageStore>,
    queue: Arc<GroupQueue>,
    channel: Arc<dyn ChannelPort>,
    require_trigger: bool,
    trigger_re: Option<Regex>,
}

impl Router {
    pub fn new(
        store: Arc<dyn MessageStore>,
        queue: Arc<GroupQueue>,
        channel: Arc<dyn ChannelPort>,
        require_trigger: bool,
        trigger_pattern: Option<&str>,
    ) -> Result<Self> {
        let trigger_re = trigger_pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("invalid TRIGGER_PATTERN: {e}")))?;

        if require_trigger && trigger_re.is_none() {
            return Err(Error::Config(
                "router_require_trigger is set but no trigger pattern was provided".to_string(),
            ));
        }

        Ok(Self {
            store,
            queue,
            channel,
            require_trigger,
            trigger_re,
        })
    }

    pub async fn run(&self, poll_interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "router poll failed");
                    }
                }
            }
        }
    }

    /// One poll cycle: fetch everything new since the global watermark to
    /// find which chats were touched, dispatch each one's pending backlog
    /// (re-derived from the store, not the poll batch itself), then advance
    /// the watermark. Returns the number of chats dispatched to.
    pub async fn poll_once(&self) -> Result<usize> {
        let since = self.store.router_last_timestamp().await?.unwrap_or_else(epoch);
        let messages = self.store.all_messages_since(since).await?;
        if messages.is_empty() {
            return Ok(0);
        }

        let new_watermark = messages
            .iter()
            .map(|m| m.timestamp)
            .max()
            .expect("non-empty");

        let touched: HashSet<Jid> = messages.into_iter().map(|m| m.chat_jid).collect();

        let mut dispatched = 0usize;
        for jid in touched {
            match self.dispatch_jid(&jid).await {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(e) => warn!(%jid, error = %e, "failed to dispatch group's messages"),
            }
        }

        // The watermark advances regardless of per-group dispatch outcomes:
        // it only tracks "have we looked at this message", not "has every
        // group finished acting on it" — that's what the per-JID agent
        // cursor is for.
        self.store.set_router_last_timestamp(new_watermark).await?;
        Ok(dispatched)
    }

    /// Startup recovery: re-checks every registered group's pending backlog
    /// and dispatches it. Covers messages whose dispatch was interrupted by a
    /// crash between claiming the cursor and actually queuing/piping them.
    pub async fn recover_pending(&self) -> Result<usize> {
        let groups = self.store.registered_groups().await?;
        let mut recovered = 0usize;
        for group in groups {
            match self.dispatch_jid(&group.jid).await {
                Ok(true) => {
                    info!(jid = %group.jid, "recovered pending messages on startup");
                    recovered += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(jid = %group.jid, error = %e, "failed to recover pending messages"),
            }
        }
        Ok(recovered)
    }

    /// Re-derives `jid`'s authoritative pending set via `messages_since` and
    /// either pipes it straight into a live agent or hands it to the FIFO
    /// queue. Returns `Ok(true)` if anything was delivered.
    async fn dispatch_jid(&self, jid: &Jid) -> Result<bool> {
        let Some(_group) = self.store.registered_group(jid).await? else {
            debug!(%jid, "chat is not a registered group, skipping");
            return Ok(false);
        };

        let last_agent_ts = self
            .store
            .router_last_agent_timestamp(jid)
            .await?
            .unwrap_or_else(epoch);

        let to_send: Vec<_> = self
            .store
            .messages_since(jid, last_agent_ts)
            .await?
            .into_iter()
            .filter(|m| !m.is_from_me && !m.is_bot_message)
            .collect();

        if to_send.is_empty() {
            return Ok(false);
        }

        if self.require_trigger {
            let re = self.trigger_re.as_ref().expect("validated in new()");
            if !to_send.iter().any(|m| re.is_match(&m.content)) {
                debug!(%jid, "no message matched trigger pattern, skipping");
                return Ok(false);
            }
        }

        let claim_ts = to_send
            .iter()
            .map(|m| m.timestamp)
            .max()
            .expect("non-empty");

        // Try piping straight into a live agent first. Success means the
        // message reached an already-running process; the cursor still
        // advances so we don't re-derive (and re-pipe) the same text next
        // poll, but nothing is enqueued — there is no FIFO work item for the
        // queue to run twice.
        let formatted = render_messages_xml(&to_send);
        if self.queue.send_message(jid, &formatted).await {
            self.store.set_router_last_agent_timestamp(jid, claim_ts).await?;
            let _ = self.channel.set_typing(jid, true).await;
            info!(%jid, count = to_send.len(), "piped messages into live agent");
            return Ok(true);
        }

        // Phase 1: persist the claim before dispatch. A crash right after
        // this point still leaves the messages delivered at most once; a
        // failed run rolls this back below so they're retried, not lost.
        self.store
            .set_router_last_agent_timestamp(jid, claim_ts)
            .await?;

        info!(%jid, count = to_send.len(), "dispatching messages to agent queue");
        self.queue
            .enqueue_messages(jid.clone(), to_send, Some(last_agent_ts))
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatMeta, Message, MessageId, RegisteredGroup, SessionRecord, Task, TaskId, TaskStatus};
    use crate::queue::WorkItem;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        messages: Vec<Message>,
        group: RegisteredGroup,
        last_timestamp: StdMutex<Option<Timestamp>>,
        last_agent_timestamp: StdMutex<Option<Timestamp>>,
    }

    #[async_trait]
    impl MessageStore for FakeStore {
        async fn messages_since(&self, jid: &Jid, since: Timestamp) -> Result<Vec<Message>> {
            Ok(self
                .messages
                .iter()
                .filter(|m| &m.chat_jid == jid && m.timestamp > since)
                .cloned()
                .collect())
        }
        async fn all_messages_since(&self, since: Timestamp) -> Result<Vec<Message>> {
            Ok(self
                .messages
                .iter()
                .filter(|m| m.timestamp > since)
                .cloned()
                .collect())
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
            Ok(*self.last_timestamp.lock().unwrap())
        }
        async fn set_router_last_timestamp(&self, ts: Timestamp) -> Result<()> {
            *self.last_timestamp.lock().unwrap() = Some(ts);
            Ok(())
        }
        async fn router_last_agent_timestamp(&self, _jid: &Jid) -> Result<Option<Timestamp>> {
            Ok(*self.last_agent_timestamp.lock().unwrap())
        }
        async fn set_router_last_agent_timestamp(&self, _jid: &Jid, ts: Timestamp) -> Result<()> {
            *self.last_agent_timestamp.lock().unwrap() = Some(ts);
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
        typing: StdMutex<Vec<(Jid, bool)>>,
    }

    #[async_trait]
    impl ChannelPort for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }
        fn owns_jid(&self, _jid: &Jid) -> bool {
            true
        }
        async fn send_message(&self, _jid: &Jid, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn set_typing(&self, jid: &Jid, on: bool) -> Result<()> {
            self.typing.lock().unwrap().push((jid.clone(), on));
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn fake_channel() -> Arc<dyn ChannelPort> {
        Arc::new(FakeChannel {
            typing: StdMutex::new(vec![]),
        })
    }

    fn msg(jid: &str, content: &str, ts: Timestamp, from_me: bool) -> Message {
        Message {
            id: MessageId(format!("{jid}-{content}")),
            chat_jid: Jid(jid.to_string()),
            sender: "u1".into(),
            sender_name: None,
            content: content.to_string(),
            timestamp: ts,
            is_from_me: from_me,
            is_bot_message: false,
        }
    }

    fn group() -> RegisteredGroup {
        RegisteredGroup {
            jid: Jid("g1".into()),
            name: "Group".into(),
            folder: "g1-folder".into(),
            trigger: None,
            added_at: Utc::now(),
        }
    }

    fn queue_with(process: crate::queue::ProcessFn) -> Arc<GroupQueue> {
        let queue = Arc::new(GroupQueue::new());
        queue.set_process_fn(process);
        queue
    }

    #[tokio::test]
    async fn dispatches_new_messages_and_advances_watermark() {
        let t0 = Utc::now();
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "hi", t0, false)],
            group: group(),
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let seen: Arc<StdMutex<usize>> = Arc::new(StdMutex::new(0));
        let seen2 = seen.clone();
        let queue = queue_with(Arc::new(move |_jid, item| {
            let seen = seen2.clone();
            Box::pin(async move {
                if let WorkItem::Messages { messages, .. } = item {
                    *seen.lock().unwrap() += messages.len();
                }
            })
        }));

        let router = Router::new(store.clone(), queue, fake_channel(), false, None).unwrap();
        let dispatched = router.poll_once().await.unwrap();
        assert_eq!(dispatched, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(store.router_last_timestamp().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn skips_unregistered_chats() {
        let t0 = Utc::now();
        let mut g = group();
        g.jid = Jid("someone-else".into());
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "hi", t0, false)],
            group: g,
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let queue = queue_with(Arc::new(|_jid, _item| Box::pin(async move {})));

        let router = Router::new(store, queue, fake_channel(), false, None).unwrap();
        let dispatched = router.poll_once().await.unwrap();
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn trigger_filter_blocks_non_matching_batches_when_required() {
        let t0 = Utc::now();
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "just chatting", t0, false)],
            group: group(),
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let queue = queue_with(Arc::new(|_jid, _item| Box::pin(async move {})));

        let router = Router::new(store, queue, fake_channel(), true, Some(r"^@bot\b")).unwrap();
        let dispatched = router.poll_once().await.unwrap();
        assert_eq!(dispatched, 0);
    }

    #[tokio::test]
    async fn trigger_filter_allows_matching_batches() {
        let t0 = Utc::now();
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "@bot help me", t0, false)],
            group: group(),
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let queue = queue_with(Arc::new(|_jid, _item| Box::pin(async move {})));

        let router = Router::new(store, queue, fake_channel(), true, Some(r"^@bot\b")).unwrap();
        let dispatched = router.poll_once().await.unwrap();
        assert_eq!(dispatched, 1);
    }

    #[tokio::test]
    async fn claims_agent_cursor_before_enqueueing() {
        let t0 = Utc::now();
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "hi", t0, false)],
            group: group(),
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let queue = queue_with(Arc::new(|_jid, _item| Box::pin(async move {})));

        let router = Router::new(store.clone(), queue, fake_channel(), false, None).unwrap();
        router.poll_once().await.unwrap();

        let claimed = store.router_last_agent_timestamp(&Jid("g1".into())).await.unwrap();
        assert_eq!(claimed, Some(t0));
    }

    #[tokio::test]
    async fn pipes_into_live_agent_instead_of_enqueueing() {
        let t0 = Utc::now();
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "hi", t0, false)],
            group: group(),
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let enqueued: Arc<StdMutex<usize>> = Arc::new(StdMutex::new(0));
        let enqueued2 = enqueued.clone();
        let queue = queue_with(Arc::new(move |_jid, _item| {
            let enqueued = enqueued2.clone();
            Box::pin(async move {
                *enqueued.lock().unwrap() += 1;
            })
        }));

        struct LiveHandleStub;
        #[async_trait]
        impl crate::runner::AgentHandle for LiveHandleStub {
            async fn write_line(&mut self, _line: &str) -> Result<()> {
                Ok(())
            }
            async fn close_stdin(&mut self) {}
            async fn kill(&mut self) {}
            async fn next_record(&mut self) -> Option<crate::runner::AgentRecord> {
                None
            }
            async fn wait(&mut self) -> Result<i32> {
                Ok(0)
            }
        }
        let live: crate::runner::LiveHandle =
            Arc::new(tokio::sync::Mutex::new(Box::new(LiveHandleStub)));
        queue.register_process(Jid("g1".into()), live).await;

        let channel = fake_channel();
        let router = Router::new(store.clone(), queue, channel, false, None).unwrap();
        let dispatched = router.poll_once().await.unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(*enqueued.lock().unwrap(), 0, "must not also enqueue");
        assert!(store.router_last_agent_timestamp(&Jid("g1".into())).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn recover_pending_redelivers_unconsumed_backlog() {
        let t0 = Utc::now();
        let store = Arc::new(FakeStore {
            messages: vec![msg("g1", "hi", t0, false)],
            group: group(),
            last_timestamp: StdMutex::new(Some(t0)),
            last_agent_timestamp: StdMutex::new(None),
        });
        let seen: Arc<StdMutex<usize>> = Arc::new(StdMutex::new(0));
        let seen2 = seen.clone();
        let queue = queue_with(Arc::new(move |_jid, item| {
            let seen = seen2.clone();
            Box::pin(async move {
                if let WorkItem::Messages { messages, .. } = item {
                    *seen.lock().unwrap() += messages.len();
                }
            })
        }));

        let router = Router::new(store, queue, fake_channel(), false, None).unwrap();
        let recovered = router.recover_pending().await.unwrap();
        assert_eq!(recovered, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn rejects_require_trigger_without_pattern() {
        let store = Arc::new(FakeStore {
            messages: vec![],
            group: group(),
            last_timestamp: StdMutex::new(None),
            last_agent_timestamp: StdMutex::new(None),
        });
        let queue = queue_with(Arc::new(|_jid, _item| Box::pin(async move {})));
        assert!(Router::new(store, queue, fake_channel(), true, None).is_err());
    }
}
