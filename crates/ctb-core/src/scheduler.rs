//! Task scheduler: polls persisted tasks (cron / interval / one-shot),
//! computes `next_run`, persists it before dispatch (at-most-once), and
//! injects the task's prompt into the owning group's work queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    domain::{ScheduleType, Task, TaskStatus, Timestamp},
    errors::Error,
    queue::GroupQueue,
    store::MessageStore,
    Result,
};

pub struct TaskScheduler {
    store: Arc<dyn MessageStore>,
    queue: Arc<GroupQueue>,
    poll_interval: Duration,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn MessageStore>, queue: Arc<GroupQueue>, poll_interval: Duration) -> Self {
        Self {
            store,
            queue,
            poll_interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.scan_once().await {
                        warn!(error = %e, "scheduler scan failed");
                    }
                }
            }
        }
    }

    /// One scan cycle: dispatch every task due at or before now. Returns the
    /// number of tasks dispatched.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.store.due_tasks(now).await?;
        let mut dispatched = 0usize;

        for task in due {
            if let Err(e) = self.dispatch_one(task, now).await {
                warn!(error = %e, "task dispatch failed");
                continue;
            }
            dispatched += 1;
        }

        Ok(dispatched)
    }

    async fn dispatch_one(&self, task: Task, now: Timestamp) -> Result<()> {
        let mut updated = task.clone();

        match &task.schedule {
            ScheduleType::OneShot { .. } => {
                updated.status = TaskStatus::Done;
            }
            ScheduleType::Cron { expr } => {
                let cron = CronExpr::parse(expr)?;
                updated.next_run = cron
                    .next_after(now)
                    .ok_or_else(|| Error::Config(format!("cron expression {expr} has no next run")))?;
            }
            ScheduleType::Interval { seconds } => {
                updated.next_run = now + chrono::Duration::seconds(*seconds);
            }
        }

        // Persist before dispatch: a crash here means the task fires at most
        // once, never twice.
        self.store.save_task(&updated).await?;

        let Some(group) = self.store.group_by_folder(&task.group_folder).await? else {
            warn!(folder = %task.group_folder, "task references unknown group folder, dropping");
            return Ok(());
        };

        info!(task = %task.id, folder = %task.group_folder, "dispatching scheduled prompt");
        self.queue
            .enqueue_synthetic_prompt(group.jid, task.prompt.clone())
            .await
    }
}

// === Cron expression engine ===
//
// A dependency-free 5-field (min hour dom mon dow) cron engine, evaluated in
// UTC since tasks are persisted with UTC timestamps.

#[derive(Clone, Debug)]
pub struct CronExpr {
    min: Field,
    hour: Field,
    dom: Field,
    mon: Field,
    dow: Field,
}

#[derive(Clone, Debug)]
struct Field {
    min: u32,
    max: u32,
    any: bool,
    allowed: Vec<bool>,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let parts = expr
            .split_whitespace()
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>();
        if parts.len() != 5 {
            return Err(Error::Config(format!(
                "expected 5 fields, got {}",
                parts.len()
            )));
        }

        Ok(Self {
            min: Field::parse(parts[0], 0, 59, false)?,
            hour: Field::parse(parts[1], 0, 23, false)?,
            dom: Field::parse(parts[2], 1, 31, false)?,
            mon: Field::parse(parts[3], 1, 12, false)?,
            dow: Field::parse(parts[4], 0, 6, true)?,
        })
    }

    pub fn matches(&self, dt: DateTime<Utc>) -> bool {
        let minute = dt.minute();
        let hour = dt.hour();
        let dom = dt.day();
        let mon = dt.month();
        let dow = dt.weekday().num_days_from_sunday();

        if !self.min.contains(minute) || !self.hour.contains(hour) || !self.mon.contains(mon) {
            return false;
        }

        let dom_match = self.dom.contains(dom);
        let dow_match = self.dow.contains(dow);

        match (self.dom.any, self.dow.any) {
            (true, true) => true,
            (true, false) => dow_match,
            (false, true) => dom_match,
            (false, false) => dom_match || dow_match,
        }
    }

    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = now + chrono::Duration::minutes(1);
        t = t.with_second(0)?.with_nanosecond(0)?;

        let max_iters = 366usize * 24 * 60;
        for _ in 0..max_iters {
            if self.matches(t) {
                return Some(t);
            }
            t += chrono::Duration::minutes(1);
        }
        None
    }
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32, allow_7_as_0: bool) -> Result<Self> {
        let raw = raw.trim();
        if raw == "*" {
            return Ok(Self {
                min,
                max,
                any: true,
                allowed: vec![true; (max + 1) as usize],
            });
        }

        let mut allowed = vec![false; (max + 1) as usize];
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (base, step) = if let Some((a, b)) = part.split_once('/') {
                let step: u32 = b
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config(format!("invalid step: {b}")))?;
                if step == 0 {
                    return Err(Error::Config("step must be > 0".to_string()));
                }
                (a.trim(), Some(step))
            } else {
                (part, None)
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                (
                    parse_u32(a.trim(), allow_7_as_0)?,
                    parse_u32(b.trim(), allow_7_as_0)?,
                )
            } else {
                let a = parse_u32(base.trim(), allow_7_as_0)?;
                if step.is_some() {
                    (a, max)
                } else {
                    (a, a)
                }
            };

            let start = start.max(min);
            let end = end.min(max);
            if start > end {
                return Err(Error::Config(format!("invalid range: {base}")));
            }

            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                allowed[v as usize] = true;
                v = v.saturating_add(step);
                if step == 0 {
                    break;
                }
            }
        }

        let any = (min..=max).all(|v| allowed[v as usize]);

        Ok(Self {
            min,
            max,
            any,
            allowed,
        })
    }

    fn contains(&self, v: u32) -> bool {
        if v < self.min || v > self.max {
            return false;
        }
        self.allowed.get(v as usize).copied().unwrap_or(false)
    }
}

fn parse_u32(s: &str, allow_7_as_0: bool) -> Result<u32> {
    let mut v: u32 = s
        .parse()
        .map_err(|_| Error::Config(format!("invalid number: {s}")))?;
    if allow_7_as_0 && v == 7 {
        v = 0;
    }
    Ok(v)
}
