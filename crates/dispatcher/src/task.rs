//! Task queue with single-claim semantics
//!
//! A task is claimed by exactly one worker at a time. Every claim carries a
//! token; once a claim is reclaimed (its holder stopped heartbeating) the old
//! token is dead and completions made with it are ignored. Reclaimed and
//! interrupted tasks go back to the front of the queue.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// One unit of crawl work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub key: String,
    pub state: TaskState,
    /// Upstream invocations made, across reclaims
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Task {
    fn new(key: String) -> Self {
        Self {
            key,
            state: TaskState::Pending,
            attempts: 0,
            last_error: None,
        }
    }
}

/// How a task finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed { error: String },
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Failed { .. } => "failed",
        }
    }
}

/// Proof of ownership of an in-progress task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: String,
    token: u64,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub closed: bool,
}

struct InFlight {
    token: u64,
    heartbeat: Instant,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<String>,
    /// Pending and in-progress records, by key
    tasks: HashMap<String, Task>,
    in_flight: HashMap<String, InFlight>,
    finished: Vec<(Task, TaskOutcome)>,
    closed: bool,
    next_token: u64,
    succeeded: u64,
    failed: u64,
}

impl QueueState {
    fn owns(&self, claim: &Claim) -> bool {
        self.in_flight
            .get(&claim.key)
            .is_some_and(|f| f.token == claim.token)
    }

    fn take_next(&mut self) -> Option<Claim> {
        let key = self.order.pop_front()?;
        self.next_token += 1;
        let token = self.next_token;
        if let Some(task) = self.tasks.get_mut(&key) {
            task.state = TaskState::InProgress;
        }
        self.in_flight.insert(
            key.clone(),
            InFlight {
                token,
                heartbeat: Instant::now(),
            },
        );
        Some(Claim { key, token })
    }

    fn put_back(&mut self, key: &str) {
        self.in_flight.remove(key);
        if let Some(task) = self.tasks.get_mut(key) {
            task.state = TaskState::Pending;
        }
        self.order.push_front(key.to_string());
    }
}

/// Work queue shared by the dispatcher's workers and its producers.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. Returns false if the key is already pending or in
    /// progress, or the queue is closed.
    ///
    /// A key whose earlier task already finished starts a fresh record.
    pub async fn enqueue(&self, key: impl Into<String>) -> bool {
        let key = key.into();
        let mut state = self.state.lock().await;
        if state.closed {
            debug!(task = %key, "queue closed, rejecting task");
            return false;
        }
        if state.tasks.contains_key(&key) {
            debug!(task = %key, "task already queued or running");
            return false;
        }
        state.tasks.insert(key.clone(), Task::new(key.clone()));
        state.order.push_back(key);
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Wait for the next pending task.
    ///
    /// Returns `None` once the queue is closed and nothing is pending or in
    /// progress (an in-progress task could still come back).
    pub async fn claim(&self) -> Option<Claim> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(claim) = state.take_next() {
                    return Some(claim);
                }
                if state.closed && state.in_flight.is_empty() {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Claim without waiting.
    pub async fn try_claim(&self) -> Option<Claim> {
        self.state.lock().await.take_next()
    }

    /// Refresh a claim's heartbeat. Returns false if the claim is stale.
    pub async fn touch(&self, claim: &Claim) -> bool {
        let mut state = self.state.lock().await;
        match state.in_flight.get_mut(&claim.key) {
            Some(f) if f.token == claim.token => {
                f.heartbeat = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Count one upstream invocation against the task.
    pub async fn record_attempt(&self, key: &str) {
        if let Some(task) = self.state.lock().await.tasks.get_mut(key) {
            task.attempts += 1;
        }
    }

    /// Invocations recorded for a pending or in-progress task.
    pub async fn attempts(&self, key: &str) -> u32 {
        self.state
            .lock()
            .await
            .tasks
            .get(key)
            .map_or(0, |t| t.attempts)
    }

    /// Finish a claimed task. Stale claims are ignored and return false.
    pub async fn complete(&self, claim: &Claim, outcome: TaskOutcome) -> bool {
        let mut state = self.state.lock().await;
        if !state.owns(claim) {
            warn!(task = %claim.key, "ignoring completion from a stale claim");
            return false;
        }
        state.in_flight.remove(&claim.key);
        let Some(mut task) = state.tasks.remove(&claim.key) else {
            return false;
        };
        match &outcome {
            TaskOutcome::Succeeded => {
                task.state = TaskState::Succeeded;
                state.succeeded += 1;
            }
            TaskOutcome::Failed { error } => {
                task.state = TaskState::Failed;
                task.last_error = Some(error.clone());
                state.failed += 1;
            }
        }
        state.finished.push((task, outcome));
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Give a claimed task back, to the front of the queue.
    pub async fn requeue(&self, claim: &Claim) -> bool {
        let mut state = self.state.lock().await;
        if !state.owns(claim) {
            return false;
        }
        state.put_back(&claim.key);
        drop(state);
        self.changed.notify_waiters();
        true
    }

    /// Requeue every claim not heartbeated within `timeout`. Returns their keys.
    pub async fn reclaim_expired(&self, timeout: Duration) -> Vec<String> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, f)| now.duration_since(f.heartbeat) >= timeout)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            warn!(task = %key, timeout_secs = timeout.as_secs(), "claim expired, requeueing task");
            state.put_back(key);
        }
        drop(state);
        if !expired.is_empty() {
            self.changed.notify_waiters();
        }
        expired
    }

    /// Mark the end of input. Already queued tasks still run.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.changed.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Tasks finished since the last drain.
    pub async fn drain_results(&self) -> Vec<(Task, TaskOutcome)> {
        std::mem::take(&mut self.state.lock().await.finished)
    }

    /// Pending and in-progress tasks, pending first in queue order.
    pub async fn snapshot(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .order
            .iter()
            .filter_map(|key| state.tasks.get(key).cloned())
            .collect();
        let mut running: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::InProgress)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.key.cmp(&b.key));
        tasks.extend(running);
        tasks
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            pending: state.order.len(),
            in_progress: state.in_flight.len(),
            succeeded: state.succeeded,
            failed: state.failed,
            closed: state.closed,
        }
    }
}
