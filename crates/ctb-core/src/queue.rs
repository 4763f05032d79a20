//! Group Queue: binds at most one live agent worker per chat JID and feeds
//! it a FIFO of work items. A new message batch for a JID with no running
//! worker starts one; a batch for a JID whose worker is already running is
//! handed to that same worker once it's free (no second process is ever
//! spawned for the same JID).
//!
//! Separately from the FIFO, the queue tracks a registry of *live* agent
//! handles so the Router can pipe a message directly into a running agent's
//! stdin (`send_message`) without waiting for the FIFO to drain.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::domain::{Jid, Message, Timestamp};
use crate::runner::{AgentHandle, LiveHandle};
use crate::Result;

/// How long a per-JID worker waits for new work before exiting and
/// deregistering itself. Kept well above any expected poll interval so
/// workers don't needlessly respawn between polling cycles.
const WORKER_IDLE_EXIT: Duration = Duration::from_secs(600);

#[derive(Clone, Debug)]
pub enum WorkItem {
    /// A batch of newly-polled messages to forward to the group's agent.
    ///
    /// `rollback_to` is the per-JID agent cursor value from before the
    /// router optimistically advanced it to claim these messages. If the
    /// run fails without producing any output, the runner writes this value
    /// back so the same messages are retried on the next poll.
    Messages {
        messages: Vec<Message>,
        rollback_to: Option<Timestamp>,
    },
    /// A scheduler-injected prompt, dispatched the same way a user message
    /// would be.
    SyntheticPrompt(String),
}

type ProcessFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type ProcessFn = Arc<dyn Fn(Jid, WorkItem) -> ProcessFuture + Send + Sync>;

struct LiveRegistration {
    handle: LiveHandle,
    /// Armed by `notify_idle` when the agent has emitted a successful
    /// result. Tracked for parity with the conceptual model and for
    /// observability; `send_message` itself only requires a registered
    /// handle to exist; a piped line just queues on the process's stdin
    /// pipe regardless of whether the agent has finished its prior output.
    #[allow(dead_code)]
    idle_notified: bool,
}

struct Inner {
    workers: Mutex<HashMap<Jid, mpsc::UnboundedSender<WorkItem>>>,
    process: OnceLock<ProcessFn>,
    shutting_down: AtomicBool,
    live: Mutex<HashMap<Jid, LiveRegistration>>,
}

/// The Group Queue. Cheaply `Clone`-able; all clones share the same worker
/// registry.
#[derive(Clone)]
pub struct GroupQueue(Arc<Inner>);

impl GroupQueue {
    /// Constructed without a process function so the Queue and the Agent
    /// Runner can be wired up without a construction-time cycle; call
    /// `set_process_fn` once the runner exists, before the first `enqueue`.
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            workers: Mutex::new(HashMap::new()),
            process: OnceLock::new(),
            shutting_down: AtomicBool::new(false),
            live: Mutex::new(HashMap::new()),
        }))
    }

    pub fn set_process_fn(&self, f: ProcessFn) {
        let _ = self.0.process.set(f);
    }

    pub async fn enqueue_messages(
        &self,
        jid: Jid,
        messages: Vec<Message>,
        rollback_to: Option<Timestamp>,
    ) -> Result<()> {
        self.enqueue(jid, WorkItem::Messages { messages, rollback_to }).await
    }

    pub async fn enqueue_synthetic_prompt(&self, jid: Jid, prompt: String) -> Result<()> {
        self.enqueue(jid, WorkItem::SyntheticPrompt(prompt)).await
    }

    async fn enqueue(&self, jid: Jid, item: WorkItem) -> Result<()> {
        if self.0.shutting_down.load(Ordering::SeqCst) {
            warn!(%jid, "dropping work item, queue is shutting down");
            return Ok(());
        }

        let mut workers = self.0.workers.lock().await;

        if let Some(tx) = workers.get(&jid) {
            if tx.send(item.clone()).is_ok() {
                return Ok(());
            }
            // Worker exited between our lookup and send; fall through to respawn.
            workers.remove(&jid);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(item);
        let tx_for_removal = tx.clone();
        workers.insert(jid.clone(), tx);
        drop(workers);

        info!(%jid, "starting worker");
        let inner = self.0.clone();
        let worker_jid = jid.clone();
        tokio::spawn(async move {
            Inner::worker_loop(inner, worker_jid, rx, tx_for_removal).await;
        });

        Ok(())
    }

    /// Writes `text` directly into the stdin of the live agent for `jid`, if
    /// one exists. Returns `true` if a live agent was found and the write
    /// succeeded — the caller (the Router) should treat this as delivery and
    /// must not also enqueue the same messages.
    pub async fn send_message(&self, jid: &Jid, text: &str) -> bool {
        let handle = {
            let live = self.0.live.lock().await;
            match live.get(jid) {
                Some(reg) => reg.handle.clone(),
                None => return false,
            }
        };

        let mut agent = handle.lock().await;
        if agent.write_line(text).await.is_ok() {
            debug!(%jid, "piped message into running agent");
            true
        } else {
            drop(agent);
            self.0.live.lock().await.remove(jid);
            false
        }
    }

    /// Registers a freshly-spawned agent so `send_message` can find it. Must
    /// be called before any piping is possible for `jid`.
    pub async fn register_process(&self, jid: Jid, handle: LiveHandle) {
        self.0.live.lock().await.insert(
            jid,
            LiveRegistration {
                handle,
                idle_notified: false,
            },
        );
    }

    pub async fn deregister_process(&self, jid: &Jid) {
        self.0.live.lock().await.remove(jid);
    }

    /// Called by the Agent Runner when the agent emits a successful result.
    pub async fn notify_idle(&self, jid: &Jid) {
        if let Some(reg) = self.0.live.lock().await.get_mut(jid) {
            reg.idle_notified = true;
        }
    }

    /// Stops accepting new work and waits up to `grace` for in-flight
    /// workers to drain on their own; any agent still live after the grace
    /// period is killed.
    pub async fn shutdown(&self, grace: Duration) {
        self.0.shutting_down.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            let remaining = {
                let workers = self.0.workers.lock().await;
                workers.len()
            };
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                if remaining > 0 {
                    warn!(remaining, "shutdown grace period elapsed, killing remaining agents");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut live = self.0.live.lock().await;
        for (jid, reg) in live.drain() {
            warn!(%jid, "killing agent still live after shutdown grace period");
            reg.handle.lock().await.kill().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn live_worker_count(&self) -> usize {
        self.0.workers.lock().await.len()
    }
}

impl Default for GroupQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    async fn worker_loop(
        self: Arc<Self>,
        jid: Jid,
        mut rx: mpsc::UnboundedReceiver<WorkItem>,
        self_tx: mpsc::UnboundedSender<WorkItem>,
    ) {
        loop {
            match tokio::time::timeout(WORKER_IDLE_EXIT, rx.recv()).await {
                Ok(Some(item)) => {
                    let process = self
                        .process
                        .get()
                        .expect("set_process_fn must be called before the first enqueue");
                    (process)(jid.clone(), item).await;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(%jid, "worker idle timeout, exiting");
                    break;
                }
            }
        }

        let mut workers = self.workers.lock().await;
        if workers
            .get(&jid)
            .map(|tx| tx.same_channel(&self_tx))
            .unwrap_or(false)
        {
            workers.remove(&jid);
        }
    }
}
