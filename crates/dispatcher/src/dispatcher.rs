//! Concurrent worker pool driving tasks through the upstream
//!
//! `run` spawns `parallelism` workers and a liveness reaper. Each worker claims
//! a task, runs every call kind in the plan through the retry state machine,
//! writes the report to the result sink and completes the task.
//!
//! A worker heartbeats its claim while a call is in flight, while backing off
//! and while paused. If the claim turns out to be gone (the reaper handed the
//! task to another worker) the worker abandons the task: the call in flight is
//! cancelled and nothing is written to the sink.
//!
//! When the pool cannot cover a call, the worker keeps its claim and pauses:
//! it waits for the pool's capacity notification or a periodic ledger reload.
//! Too many consecutive reload failures while paused halt the whole
//! dispatcher.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use credential_pool::Pool;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::RateLimitedClient;
use crate::error::{CallError, DispatchError};
use crate::retry::{RetryAction, RetryEvent, RetryPolicy, RetryState};
use crate::sink::{CallRecord, ResultSink, TaskReport};
use crate::task::{Claim, QueueStats, Task, TaskOutcome, TaskQueue};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub parallelism: usize,
    /// Claims not heartbeated for this long are reclaimed
    pub liveness_timeout: Duration,
    /// How often a paused worker reloads the ledger
    pub reload_interval: Duration,
    /// Consecutive reload failures while paused before halting
    pub max_reload_failures: u32,
    /// Call kinds made for every task, in order
    pub plan: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            liveness_timeout: Duration::from_secs(300),
            reload_interval: Duration::from_secs(60),
            max_reload_failures: 5,
            plan: vec!["search".to_string()],
        }
    }
}

/// Counts at the end of `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: u64,
    pub failed: u64,
    /// Tasks still queued (interrupted or never started)
    pub pending: usize,
    pub worker_panics: usize,
}

/// How a single planned call ended for a task.
enum CallOutcome {
    Done(CallRecord),
    Failed(String),
    Interrupted,
    /// The claim was reclaimed; another worker owns the task now
    Lost,
}

enum PauseOutcome {
    Resumed,
    Stopped,
    Lost,
}

/// Why a wait that holds a claim ended early, if it did.
enum Held<T> {
    Done(T),
    Stopped,
    Lost,
}

/// Dispatches queued tasks over the credential pool.
pub struct Dispatcher {
    queue: Arc<TaskQueue>,
    client: Arc<RateLimitedClient>,
    retry: RetryPolicy,
    sink: Arc<dyn ResultSink>,
    config: DispatcherConfig,
    stop: watch::Sender<bool>,
    halted: Mutex<Option<String>>,
    paused: AtomicUsize,
}

impl Dispatcher {
    /// Fails if a single call could outlive the liveness timeout.
    pub fn new(
        client: Arc<RateLimitedClient>,
        retry: RetryPolicy,
        sink: Arc<dyn ResultSink>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        if config.liveness_timeout <= client.call_timeout() {
            return Err(DispatchError::InvalidConfig(format!(
                "liveness timeout ({}ms) must exceed the call timeout ({}ms)",
                config.liveness_timeout.as_millis(),
                client.call_timeout().as_millis()
            )));
        }
        let (stop, _) = watch::channel(false);
        Ok(Self {
            queue: Arc::new(TaskQueue::new()),
            client,
            retry,
            sink,
            config,
            stop,
            halted: Mutex::new(None),
            paused: AtomicUsize::new(0),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<Pool> {
        self.client.pool()
    }

    /// Queue a task. False if the key is already live or input is closed.
    pub async fn enqueue(&self, key: impl Into<String>) -> bool {
        self.queue.enqueue(key).await
    }

    /// No more tasks will be enqueued; `run` returns once the queue drains.
    pub async fn close(&self) {
        self.queue.close().await
    }

    /// Tasks finished since the last call.
    pub async fn drain_results(&self) -> Vec<(Task, TaskOutcome)> {
        self.queue.drain_results().await
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Workers currently paused on an exhausted pool.
    pub fn paused_workers(&self) -> usize {
        self.paused.load(Ordering::Relaxed)
    }

    /// Run workers until the queue is closed and drained, or `shutdown` turns true.
    ///
    /// The pool is flushed to the ledger before returning, whatever the outcome.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RunSummary, DispatchError> {
        let parallelism = self.config.parallelism.max(1);
        info!(
            parallelism,
            plan = ?self.config.plan,
            "dispatcher starting"
        );

        let forward = {
            let stop = self.stop.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown.borrow_and_update() {
                        stop.send_replace(true);
                        return;
                    }
                    if shutdown.changed().await.is_err() {
                        return;
                    }
                }
            })
        };
        let reaper = self.clone().spawn_reaper();

        let mut workers = JoinSet::new();
        for worker in 0..parallelism {
            workers.spawn(self.clone().worker_loop(worker));
        }

        let mut worker_panics = 0usize;
        let mut next_worker = parallelism;
        while let Some(joined) = workers.join_next().await {
            let Err(e) = joined else {
                continue;
            };
            if !e.is_panic() {
                continue;
            }
            worker_panics += 1;
            if *self.stop.borrow() {
                error!(error = %e, "worker panicked during shutdown");
                continue;
            }
            error!(error = %e, worker = next_worker, "worker panicked, starting a replacement");
            workers.spawn(self.clone().worker_loop(next_worker));
            next_worker += 1;
        }

        forward.abort();
        reaper.abort();
        self.stop.send_replace(true);

        if let Err(e) = self.pool().flush().await {
            let pending = self.pool().pending_ops().await;
            warn!(error = %e, pending, "final ledger flush failed");
        }
        metrics::gauge!("crawler_dispatcher_paused").set(0.0);

        let stats = self.queue.stats().await;
        let summary = RunSummary {
            succeeded: stats.succeeded,
            failed: stats.failed,
            pending: stats.pending + stats.in_progress,
            worker_panics,
        };

        if let Some(reason) = self.halted.lock().await.take() {
            error!(reason = %reason, ?summary, "dispatcher halted");
            return Err(DispatchError::Halted(reason));
        }
        info!(?summary, "dispatcher stopped");
        Ok(summary)
    }

    /// Requeue claims that stopped heartbeating.
    fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let timeout = self.config.liveness_timeout;
        let period = (timeout / 2).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reclaimed = self.queue.reclaim_expired(timeout).await;
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "reclaimed expired claims");
                }
            }
        })
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        let mut stop = self.stop.subscribe();
        debug!(worker, "worker started");
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            let claim = tokio::select! {
                claim = self.queue.claim() => claim,
                _ = stop.changed() => break,
            };
            let Some(claim) = claim else {
                break;
            };
            self.process(worker, claim, &mut stop).await;
        }
        debug!(worker, "worker stopped");
    }

    async fn process(&self, worker: usize, claim: Claim, stop: &mut watch::Receiver<bool>) {
        debug!(worker, task = %claim.key, "task claimed");
        let mut calls = Vec::with_capacity(self.config.plan.len());

        for kind in &self.config.plan {
            match self.run_call(worker, &claim, kind, stop).await {
                CallOutcome::Done(record) => calls.push(record),
                CallOutcome::Failed(error) => {
                    self.finish(&claim, TaskOutcome::Failed { error }).await;
                    return;
                }
                CallOutcome::Interrupted => {
                    if self.queue.requeue(&claim).await {
                        info!(worker, task = %claim.key, "task interrupted, requeued");
                    }
                    return;
                }
                CallOutcome::Lost => {
                    warn!(worker, task = %claim.key, "claim reclaimed, abandoning task");
                    return;
                }
            }
        }

        if !self.queue.touch(&claim).await {
            warn!(worker, task = %claim.key, "claim reclaimed before the report was written, abandoning task");
            return;
        }

        let report = TaskReport {
            task: claim.key.clone(),
            attempts: self.queue.attempts(&claim.key).await,
            finished_at_ms: quota_ledger::now_millis(),
            calls,
        };
        let outcome = match self.sink.write(&report).await {
            Ok(()) => TaskOutcome::Succeeded,
            Err(e) => TaskOutcome::Failed {
                error: e.to_string(),
            },
        };
        self.finish(&claim, outcome).await;
    }

    async fn finish(&self, claim: &Claim, outcome: TaskOutcome) {
        let label = outcome.label();
        match &outcome {
            TaskOutcome::Succeeded => info!(task = %claim.key, "task succeeded"),
            TaskOutcome::Failed { error } => warn!(task = %claim.key, error = %error, "task failed"),
        }
        if self.queue.complete(claim, outcome).await {
            metrics::counter!("crawler_tasks_total", "outcome" => label).increment(1);
        }
    }

    /// Drive one planned call through the retry state machine.
    async fn run_call(
        &self,
        worker: usize,
        claim: &Claim,
        kind: &str,
        stop: &mut watch::Receiver<bool>,
    ) -> CallOutcome {
        let mut excluding: HashSet<String> = HashSet::new();
        let mut record = None;
        let (mut state, mut action) = self
            .retry
            .handle_event(RetryState::Pending, RetryEvent::Begin);

        loop {
            let event = match action {
                RetryAction::Invoke => {
                    let result = loop {
                        let invoke = self.client.invoke(kind, &claim.key, &excluding);
                        let result = match self.holding(claim, invoke).await {
                            Held::Done(result) => result,
                            Held::Stopped | Held::Lost => return CallOutcome::Lost,
                        };
                        match result {
                            Err(CallError::ResourceExhausted(reason)) => {
                                if !excluding.is_empty() {
                                    // Every other credential is busy or spent;
                                    // allow the ones this call already failed on.
                                    excluding.clear();
                                    continue;
                                }
                                debug!(worker, task = %claim.key, kind, reason = %reason, "pool exhausted");
                                match self.pause(worker, claim, kind, stop).await {
                                    PauseOutcome::Resumed => continue,
                                    PauseOutcome::Stopped => return CallOutcome::Interrupted,
                                    PauseOutcome::Lost => return CallOutcome::Lost,
                                }
                            }
                            other => break other,
                        }
                    };
                    self.queue.record_attempt(&claim.key).await;

                    match result {
                        Ok(success) => {
                            record = Some(CallRecord {
                                kind: kind.to_string(),
                                cost: success.cost,
                                body: success.body,
                            });
                            RetryEvent::Succeeded
                        }
                        Err(
                            CallError::QuotaExceeded { credential }
                            | CallError::CredentialRevoked { credential, .. },
                        ) => {
                            excluding.insert(credential.expose().clone());
                            RetryEvent::CredentialRejected
                        }
                        Err(CallError::Transient {
                            credential,
                            message,
                        }) => {
                            debug!(
                                worker,
                                task = %claim.key,
                                kind,
                                attempt = state.attempts(),
                                error = %message,
                                "transient failure"
                            );
                            excluding.insert(credential.expose().clone());
                            RetryEvent::Transient(message)
                        }
                        Err(CallError::Permanent { message }) => RetryEvent::Permanent(message),
                        Err(CallError::ResourceExhausted(reason)) => RetryEvent::Transient(reason),
                    }
                }
                RetryAction::Wait { delay } => {
                    debug!(worker, task = %claim.key, kind, delay_ms = delay.as_millis() as u64, "backing off");
                    match self.sleep_holding(claim, delay, stop).await {
                        Held::Done(()) => RetryEvent::TimerElapsed,
                        Held::Stopped => return CallOutcome::Interrupted,
                        Held::Lost => return CallOutcome::Lost,
                    }
                }
                RetryAction::Finish => {
                    return match state {
                        RetryState::Success { .. } => match record {
                            Some(record) => CallOutcome::Done(record),
                            None => CallOutcome::Failed("call succeeded without a response".into()),
                        },
                        RetryState::GiveUp { attempts, error } => {
                            CallOutcome::Failed(format!("{kind} failed after {attempts} attempts: {error}"))
                        }
                        other => CallOutcome::Failed(format!("retry finished in state {other:?}")),
                    };
                }
                RetryAction::None => {
                    return CallOutcome::Failed(format!("retry stuck in state {state:?}"));
                }
            };
            (state, action) = self.retry.handle_event(state, event);
        }
    }

    /// Drive `work` to completion, heartbeating the claim alongside it.
    ///
    /// Dropping `work` on a lost claim cancels the call; its lease goes back
    /// to the pool uncharged.
    async fn holding<F: Future>(&self, claim: &Claim, work: F) -> Held<F::Output> {
        if !self.queue.touch(claim).await {
            return Held::Lost;
        }
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.heartbeat_period());
        heartbeat.tick().await;
        loop {
            tokio::select! {
                output = &mut work => return Held::Done(output),
                _ = heartbeat.tick() => {
                    if !self.queue.touch(claim).await {
                        return Held::Lost;
                    }
                }
            }
        }
    }

    /// Sleep while keeping the claim alive.
    async fn sleep_holding(
        &self,
        claim: &Claim,
        delay: Duration,
        stop: &mut watch::Receiver<bool>,
    ) -> Held<()> {
        let sleep = self.holding(claim, tokio::time::sleep(delay));
        tokio::select! {
            held = sleep => held,
            _ = stop.changed() => Held::Stopped,
        }
    }

    /// Hold the claim until the pool can cover `kind` again.
    async fn pause(
        &self,
        worker: usize,
        claim: &Claim,
        kind: &str,
        stop: &mut watch::Receiver<bool>,
    ) -> PauseOutcome {
        let cost = self.client.cost(kind).unwrap_or(0);
        let paused = self.paused.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("crawler_dispatcher_paused").set(paused as f64);
        info!(worker, task = %claim.key, kind, cost, "pool exhausted, pausing");

        let mut reload = tokio::time::interval(self.config.reload_interval);
        reload.tick().await;
        let heartbeat = self.heartbeat_period();
        let mut reload_failures = 0u32;

        let outcome = loop {
            if !self.queue.touch(claim).await {
                break PauseOutcome::Lost;
            }
            let notified = self.pool().capacity_notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pool().has_capacity(cost).await {
                break PauseOutcome::Resumed;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = reload.tick() => match self.flush_and_reload().await {
                    Ok(adopted) => {
                        reload_failures = 0;
                        debug!(worker, adopted, "reloaded ledger while paused");
                    }
                    Err(e) => {
                        reload_failures += 1;
                        warn!(
                            worker,
                            error = %e,
                            failures = reload_failures,
                            max = self.config.max_reload_failures,
                            "ledger reload failed while paused"
                        );
                        if reload_failures >= self.config.max_reload_failures.max(1) {
                            self.halt(format!(
                                "pool exhausted and ledger reload failed {reload_failures} times: {e}"
                            ))
                            .await;
                            break PauseOutcome::Stopped;
                        }
                    }
                },
                _ = tokio::time::sleep(heartbeat) => {}
                _ = stop.changed() => break PauseOutcome::Stopped,
            }
        };

        let paused = self.paused.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("crawler_dispatcher_paused").set(paused as f64);
        if matches!(outcome, PauseOutcome::Resumed) {
            info!(worker, task = %claim.key, "capacity available, resuming");
        }
        outcome
    }

    /// Buffered operations pin a credential to its in-memory state, so push
    /// them out before re-reading the ledger.
    async fn flush_and_reload(&self) -> credential_pool::Result<usize> {
        if let Err(e) = self.pool().flush().await {
            debug!(error = %e, "flush before reload failed");
        }
        self.pool().reload().await
    }

    /// Record the first fatal reason and stop every worker.
    async fn halt(&self, reason: String) {
        let mut halted = self.halted.lock().await;
        if halted.is_none() {
            error!(reason = %reason, "halting dispatcher");
            *halted = Some(reason);
        }
        self.stop.send_replace(true);
    }

    fn heartbeat_period(&self) -> Duration {
        (self.config.liveness_timeout / 3).max(Duration::from_millis(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::testing::{FakeUpstream, RecordedCall, fail, memory_ledger, memory_pool, ok};
    use credential_pool::CostTable;
    use quota_ledger::{CredentialStatus, QuotaLedger};
    use upstream::{CallResponse, ErrorClassification};

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        sink: Arc<MemorySink>,
        shutdown: watch::Sender<bool>,
    }

    impl Harness {
        fn start(&self) -> tokio::task::JoinHandle<Result<RunSummary, DispatchError>> {
            tokio::spawn(self.dispatcher.clone().run(self.shutdown.subscribe()))
        }
    }

    fn config(parallelism: usize) -> DispatcherConfig {
        DispatcherConfig {
            parallelism,
            liveness_timeout: Duration::from_secs(60),
            reload_interval: Duration::from_secs(10),
            max_reload_failures: 3,
            plan: vec!["search".into()],
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    fn build(
        pool: Arc<Pool>,
        upstream: Arc<FakeUpstream>,
        config: DispatcherConfig,
        retry: RetryPolicy,
    ) -> Harness {
        let client = Arc::new(RateLimitedClient::new(
            pool,
            upstream,
            CostTable::default(),
            Duration::from_secs(5),
        ));
        let sink = Arc::new(MemorySink::new());
        let dispatcher = Arc::new(Dispatcher::new(client, retry, sink.clone(), config).unwrap());
        let (shutdown, _) = watch::channel(false);
        Harness {
            dispatcher,
            sink,
            shutdown,
        }
    }

    async fn harness(
        creds: &[(&str, u64)],
        upstream: Arc<FakeUpstream>,
        config: DispatcherConfig,
    ) -> Harness {
        let pool = Arc::new(Pool::load(memory_ledger(creds)).await.unwrap());
        build(pool, upstream, config, retry())
    }

    fn outcome_of(results: &[(Task, TaskOutcome)], key: &str) -> (Task, TaskOutcome) {
        results
            .iter()
            .find(|(t, _)| t.key == key)
            .cloned()
            .unwrap_or_else(|| panic!("no result for {key}"))
    }

    async fn wait_until_paused(dispatcher: &Dispatcher) {
        for _ in 0..1_000 {
            if dispatcher.paused_workers() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("worker never paused");
    }

    #[tokio::test]
    async fn batch_runs_to_completion() {
        let upstream = FakeUpstream::new(|_| ok());
        let h = harness(
            &[("key-a-000001", 250), ("key-b-000002", 250)],
            upstream.clone(),
            config(2),
        )
        .await;
        for key in ["lofi", "jazz", "synthwave", "lofi"] {
            h.dispatcher.enqueue(key).await;
        }
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pending, 0);

        let results = h.dispatcher.drain_results().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(t, o)| *o == TaskOutcome::Succeeded && t.attempts == 1));
        assert_eq!(h.sink.reports().await.len(), 3);
        assert_eq!(upstream.calls().len(), 3);

        let remaining: u64 = h
            .dispatcher
            .pool()
            .snapshot()
            .await
            .iter()
            .map(|c| c.remaining_quota)
            .sum();
        assert_eq!(remaining, 500 - 300);
        assert_eq!(h.dispatcher.pool().pending_ops().await, 0, "flushed on exit");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_twice_then_success_takes_three_attempts() {
        let upstream = FakeUpstream::new(|call: &RecordedCall| {
            if call.nth_for_task < 2 {
                fail(ErrorClassification::Transient)
            } else {
                ok()
            }
        });
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), config(1)).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        h.start().await.unwrap().unwrap();
        let (task, outcome) = outcome_of(&h.dispatcher.drain_results().await, "lofi");
        assert_eq!(outcome, TaskOutcome::Succeeded);
        assert_eq!(task.attempts, 3);
        assert_eq!(h.sink.reports().await[0].attempts, 3);
        // Failed calls are not charged.
        assert_eq!(h.dispatcher.pool().snapshot().await[0].remaining_quota, 9_900);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_fails_without_delay() {
        let upstream = FakeUpstream::new(|_| fail(ErrorClassification::Permanent));
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), config(1)).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        let started = tokio::time::Instant::now();
        let summary = h.start().await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(summary.failed, 1);

        let (task, outcome) = outcome_of(&h.dispatcher.drain_results().await, "lofi");
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.unwrap().contains("scripted permanent"));
        assert!(h.sink.reports().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_cap_fails_task() {
        let upstream = FakeUpstream::new(|_| fail(ErrorClassification::Transient));
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), config(1)).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(upstream.calls_for("lofi"), 3);
    }

    #[tokio::test]
    async fn quota_exceeded_rotates_to_next_credential() {
        let upstream = FakeUpstream::new(|call: &RecordedCall| {
            if call.token == "key-a-000001" {
                fail(ErrorClassification::QuotaExceeded)
            } else {
                ok()
            }
        });
        let h = harness(
            &[("key-a-000001", 5_000), ("key-b-000002", 1_000)],
            upstream.clone(),
            config(1),
        )
        .await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);

        let tokens: Vec<String> = upstream.calls().into_iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec!["key-a-000001", "key-b-000002"]);

        let snapshot = h.dispatcher.pool().snapshot().await;
        assert_eq!(snapshot[0].status, CredentialStatus::Exhausted);
        assert_eq!(snapshot[1].remaining_quota, 900);
    }

    #[tokio::test]
    async fn revoked_credential_is_never_used_again() {
        let upstream = FakeUpstream::new(|call: &RecordedCall| {
            if call.token == "key-a-000001" {
                fail(ErrorClassification::InvalidCredential)
            } else {
                ok()
            }
        });
        let h = harness(
            &[("key-a-000001", 5_000), ("key-b-000002", 1_000)],
            upstream.clone(),
            config(2),
        )
        .await;
        for key in ["a", "b", "c", "d"] {
            h.dispatcher.enqueue(key).await;
        }
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 4);
        let revoked_calls = upstream
            .calls()
            .iter()
            .filter(|c| c.token == "key-a-000001")
            .count();
        assert!(revoked_calls <= 2, "revoked key used {revoked_calls} times");
        assert_eq!(
            h.dispatcher.pool().snapshot().await[0].status,
            CredentialStatus::Deactivated
        );
    }

    #[tokio::test]
    async fn every_key_is_processed_exactly_once() {
        let upstream = FakeUpstream::new(|_| ok());
        let h = harness(&[("key-a-000001", 1_000_000)], upstream.clone(), config(8)).await;
        for i in 0..40 {
            h.dispatcher.enqueue(format!("kw-{i}")).await;
            h.dispatcher.enqueue(format!("kw-{i}")).await;
        }
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 40);
        for i in 0..40 {
            assert_eq!(upstream.calls_for(&format!("kw-{i}")), 1);
        }
    }

    #[tokio::test]
    async fn unknown_plan_kind_fails_tasks() {
        let upstream = FakeUpstream::new(|_| ok());
        let mut cfg = config(1);
        cfg.plan = vec!["search".into(), "captions".into()];
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), cfg).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(upstream.calls().len(), 1);
    }

    #[tokio::test]
    async fn multi_kind_plan_records_each_call() {
        let upstream = FakeUpstream::new(|_| ok());
        let mut cfg = config(1);
        cfg.plan = vec!["search".into(), "videos".into()];
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), cfg).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        h.start().await.unwrap().unwrap();
        let reports = h.sink.reports().await;
        let kinds: Vec<&str> = reports[0].calls.iter().map(|c| c.kind.as_str()).collect();
        assert_eq!(kinds, vec!["search", "videos"]);
        assert_eq!(reports[0].calls[1].cost, 1);
        assert_eq!(h.dispatcher.pool().snapshot().await[0].remaining_quota, 9_899);
    }

    #[tokio::test]
    async fn exhausted_pool_pauses_until_reset() {
        let upstream = FakeUpstream::new(|_| ok());
        let h = harness(&[("key-a-000001", 150)], upstream.clone(), config(1)).await;
        for key in ["first", "second"] {
            h.dispatcher.enqueue(key).await;
        }
        h.dispatcher.close().await;
        let run = h.start();

        wait_until_paused(&h.dispatcher).await;
        assert_eq!(upstream.calls().len(), 1, "no calls while paused");
        assert_eq!(h.dispatcher.stats().await.in_progress, 1, "claim is held");

        h.dispatcher
            .pool()
            .reset("key-a-000001", 10_000)
            .await
            .unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(h.dispatcher.paused_workers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_worker_picks_up_external_reset_on_reload() {
        let ledger = memory_ledger(&[("key-a-000001", 0)]);
        let pool = Arc::new(Pool::load(ledger.clone()).await.unwrap());
        let upstream = FakeUpstream::new(|_| ok());
        let h = build(pool, upstream.clone(), config(1), retry());
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;
        let run = h.start();

        wait_until_paused(&h.dispatcher).await;
        h.dispatcher.pool().flush().await.unwrap();
        // An operator resets the key in the ledger.
        ledger.reset_quota("key-a-000001", 500).await.unwrap();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(ledger.load().await.unwrap()[0].credential.remaining_quota, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_failures_while_exhausted_halt() {
        let ledger = memory_ledger(&[("key-a-000001", 0)]);
        let pool = Arc::new(Pool::load(ledger.clone()).await.unwrap());
        let upstream = FakeUpstream::new(|_| ok());
        let h = build(pool, upstream, config(2), retry());
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.enqueue("jazz").await;
        ledger.set_unavailable(true);

        let err = h.start().await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Halted(_)), "got {err:?}");

        // Interrupted tasks go back to the queue.
        let stats = h.dispatcher.stats().await;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_progress, 0);
    }

    #[tokio::test]
    async fn shutdown_requeues_paused_task() {
        let upstream = FakeUpstream::new(|_| ok());
        let h = harness(&[("key-a-000001", 0)], upstream, config(1)).await;
        h.dispatcher.enqueue("lofi").await;
        let run = h.start();

        wait_until_paused(&h.dispatcher).await;
        h.shutdown.send_replace(true);

        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.succeeded, 0);
        assert!(h.dispatcher.drain_results().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_backoff_requeues() {
        let upstream = FakeUpstream::new(|_| fail(ErrorClassification::Transient));
        let pool = Arc::new(
            Pool::load(memory_ledger(&[("key-a-000001", 10_000)]))
                .await
                .unwrap(),
        );
        let slow_retry = RetryPolicy {
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            ..retry()
        };
        let h = build(pool, upstream.clone(), config(1), slow_retry);
        h.dispatcher.enqueue("lofi").await;
        let run = h.start();

        while upstream.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.shutdown.send_replace(true);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(h.dispatcher.queue().attempts("lofi").await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_worker_is_replaced_and_task_reclaimed() {
        let upstream = FakeUpstream::new(|call: &RecordedCall| {
            if call.nth_for_task == 0 {
                panic!("scripted worker crash");
            }
            Ok(CallResponse {
                body: serde_json::json!({ "ok": true }),
                cost: None,
            })
        });
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), config(1)).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.worker_panics, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(upstream.calls_for("lofi"), 2);

        // The crashed call's reservation went back to the pool.
        let pool = h.dispatcher.pool();
        assert_eq!(pool.health().await["credentials"][0]["reserved"], 0);
        assert_eq!(pool.snapshot().await[0].remaining_quota, 9_900);
        assert!(pool.has_capacity(9_900).await);
    }

    #[tokio::test(start_paused = true)]
    async fn reclaimed_task_is_abandoned_by_its_old_worker() {
        let upstream = FakeUpstream::slow(Duration::from_secs(3), |_| ok());
        let mut cfg = config(1);
        cfg.liveness_timeout = Duration::from_secs(6);
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), cfg).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;
        let run = h.start();

        while upstream.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        // The claim expires while the first call is still in flight.
        let reclaimed = h.dispatcher.queue().reclaim_expired(Duration::ZERO).await;
        assert_eq!(reclaimed, vec!["lofi".to_string()]);

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(upstream.calls_for("lofi"), 2);
        assert_eq!(h.sink.reports().await.len(), 1, "one report per task");

        let pool = h.dispatcher.pool();
        assert_eq!(
            pool.snapshot().await[0].remaining_quota,
            9_900,
            "the abandoned call is not charged"
        );
        assert_eq!(pool.health().await["credentials"][0]["reserved"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_keep_their_claim() {
        let upstream = FakeUpstream::slow(Duration::from_millis(4_500), |_| ok());
        let mut cfg = config(2);
        cfg.liveness_timeout = Duration::from_secs(6);
        cfg.plan = vec!["search".into(), "videos".into()];
        let h = harness(&[("key-a-000001", 10_000)], upstream.clone(), cfg).await;
        h.dispatcher.enqueue("lofi").await;
        h.dispatcher.close().await;

        let summary = h.start().await.unwrap().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(upstream.calls_for("lofi"), 2, "one call per plan step");
        assert_eq!(h.sink.reports().await.len(), 1);
        assert_eq!(h.dispatcher.pool().snapshot().await[0].remaining_quota, 9_899);
    }

    #[tokio::test]
    async fn liveness_must_exceed_call_timeout() {
        let client = Arc::new(RateLimitedClient::new(
            memory_pool(&[("key-a-000001", 100)]).await,
            FakeUpstream::new(|_| ok()),
            CostTable::default(),
            Duration::from_secs(5),
        ));
        let mut cfg = config(1);
        cfg.liveness_timeout = Duration::from_secs(5);

        let err = Dispatcher::new(client, retry(), Arc::new(MemorySink::new()), cfg)
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::InvalidConfig(_)), "got {err:?}");
    }
}
