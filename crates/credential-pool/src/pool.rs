//! Credential table, reservation-based checkout and the ledger write-ahead buffer
//!
//! The pool is the authoritative in-memory view of every credential. Each
//! admission decision and its mutation happen under a single write-lock
//! acquisition, so concurrent workers can never jointly overspend a
//! credential. Every mutation is appended to an ordered buffer of
//! `LedgerOp`s which `flush` mirrors into the durable ledger. The lock is
//! never held across ledger I/O.
//!
//! Persisted remaining minus in-memory remaining always equals the sum of the
//! credential's buffered, unflushed charges.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};

use common::Secret;
use quota_ledger::{
    Credential, CredentialStatus, LedgerOp, OpKind, QuotaLedger, StatusEvent, Usage,
};
use tokio::sync::{Mutex, Notify, RwLock, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Shared between the pool and its leases.
#[derive(Default)]
struct Returns {
    /// Reservations of leases dropped without `settle` or `release`
    dropped: std::sync::Mutex<Vec<(String, u64)>>,
    capacity: Notify,
}

impl fmt::Debug for Returns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Returns").finish_non_exhaustive()
    }
}

/// A checked-out credential with its cost reserved.
///
/// Hand it back through [`Pool::settle`] or [`Pool::release`]. A lease
/// dropped any other way (a panicking caller, a cancelled call) returns its
/// reservation to the pool without charging.
#[derive(Debug)]
pub struct Lease {
    token: Secret<String>,
    reserved: u64,
    returns: Arc<Returns>,
}

impl Lease {
    /// Credential token for the outbound call.
    pub fn token(&self) -> &str {
        self.token.expose()
    }

    /// Id of the leased credential (the token itself).
    pub fn credential_id(&self) -> &str {
        self.token.expose()
    }

    pub fn masked_id(&self) -> String {
        self.token.masked()
    }

    /// Quota units reserved at checkout.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    fn take_reservation(&mut self) -> u64 {
        std::mem::take(&mut self.reserved)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.reserved == 0 {
            return;
        }
        debug!(
            credential = %self.token.masked(),
            reserved = self.reserved,
            "lease dropped without settling, returning reservation"
        );
        self.returns
            .dropped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.token.expose().clone(), self.reserved));
        self.returns.capacity.notify_waiters();
    }
}

/// Per-status credential counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub total: usize,
    pub active: usize,
    pub exhausted: usize,
    pub deactivated: usize,
}

struct Entry {
    credential: Credential,
    usage: Usage,
    reserved: u64,
}

impl Entry {
    /// Quota not yet spent or reserved.
    fn available(&self) -> u64 {
        self.credential.remaining_quota.saturating_sub(self.reserved)
    }
}

struct PoolState {
    /// Insertion order, used for stable listings and tie-breaking.
    ids: Vec<String>,
    entries: HashMap<String, Entry>,
    pending: VecDeque<LedgerOp>,
    next_op_id: u64,
}

impl PoolState {
    fn entry_mut(&mut self, credential_id: &str) -> Result<&mut Entry> {
        self.entries
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(common::mask(credential_id)))
    }

    fn push_op(&mut self, credential_id: &str, kind: OpKind) {
        let op = LedgerOp {
            op_id: self.next_op_id,
            credential_id: credential_id.to_string(),
            kind,
        };
        self.next_op_id += 1;
        self.pending.push_back(op);
    }

    /// Queue a status op if `before` differs from the credential's current status.
    fn push_status_change(&mut self, credential_id: &str, before: CredentialStatus) {
        let Some(entry) = self.entries.get(credential_id) else {
            return;
        };
        let status = entry.credential.status;
        if status == before {
            return;
        }
        let reason = entry.credential.deactivation_reason.clone();
        self.push_op(credential_id, OpKind::Status { status, reason });
    }

    fn charge(&mut self, credential_id: &str, amount: u64) -> Result<u64> {
        let entry = self.entry_mut(credential_id)?;
        let before = entry.credential.status;
        let remaining = entry.credential.apply_charge(amount);
        entry.usage.total_charged += amount;
        entry.usage.charge_count += 1;
        let status = entry.credential.status;

        self.push_op(credential_id, OpKind::Charge { amount });
        self.push_status_change(credential_id, before);
        if before == CredentialStatus::Active && status == CredentialStatus::Exhausted {
            info!(
                credential = %common::mask(credential_id),
                "credential quota depleted, marking exhausted"
            );
        }
        Ok(remaining)
    }

    fn reset(&mut self, credential_id: &str, quota: u64) -> Result<()> {
        let entry = self.entry_mut(credential_id)?;
        entry.credential.apply_reset(quota);
        self.push_op(credential_id, OpKind::Reset { quota });
        Ok(())
    }

    /// Give back reservations of leases that were dropped unsettled.
    fn return_dropped(&mut self, returns: &Returns) {
        let dropped = std::mem::take(
            &mut *returns
                .dropped
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (id, reserved) in dropped {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.reserved = entry.reserved.saturating_sub(reserved);
            }
        }
    }

    fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts {
            total: self.ids.len(),
            ..StatusCounts::default()
        };
        for entry in self.entries.values() {
            match entry.credential.status {
                CredentialStatus::Active => counts.active += 1,
                CredentialStatus::Exhausted => counts.exhausted += 1,
                CredentialStatus::Deactivated => counts.deactivated += 1,
            }
        }
        counts
    }

    fn has_capacity(&self, cost: u64) -> bool {
        self.entries
            .values()
            .any(|e| e.credential.is_active() && e.available() >= cost)
    }

    fn publish_gauges(&self) {
        let counts = self.counts();
        metrics::gauge!("pool_credentials", "status" => "active").set(counts.active as f64);
        metrics::gauge!("pool_credentials", "status" => "exhausted").set(counts.exhausted as f64);
        metrics::gauge!("pool_credentials", "status" => "deactivated")
            .set(counts.deactivated as f64);
        metrics::gauge!("pool_pending_ledger_ops").set(self.pending.len() as f64);
    }
}

/// Load a stored credential, repairing an active record with no quota left.
fn normalize(mut credential: Credential) -> Credential {
    if credential.remaining_quota == 0 && credential.is_active() {
        credential.status = credential.status.transition(StatusEvent::Depleted);
    }
    credential
}

/// Pool of metered API credentials backed by a durable ledger.
pub struct Pool {
    ledger: Arc<dyn QuotaLedger>,
    state: RwLock<PoolState>,
    /// Serializes flush, reload and add so each sees a consistent buffer.
    ledger_lock: Mutex<()>,
    returns: Arc<Returns>,
    degraded: AtomicBool,
}

impl Pool {
    /// Build the pool from the ledger's current contents.
    ///
    /// Operation ids continue after the highest id the ledger has applied, so
    /// replays of already-persisted operations stay idempotent across restarts.
    pub async fn load(ledger: Arc<dyn QuotaLedger>) -> Result<Self> {
        let stored = ledger.load().await?;

        let mut state = PoolState {
            ids: Vec::with_capacity(stored.len()),
            entries: HashMap::with_capacity(stored.len()),
            pending: VecDeque::new(),
            next_op_id: 1,
        };
        for record in stored {
            state.next_op_id = state.next_op_id.max(record.last_op_id + 1);
            let id = record.credential.id.clone();
            let before = record.credential.status;
            state.ids.push(id.clone());
            state.entries.insert(
                id.clone(),
                Entry {
                    credential: normalize(record.credential),
                    usage: record.usage,
                    reserved: 0,
                },
            );
            state.push_status_change(&id, before);
        }

        let counts = state.counts();
        info!(
            credentials = counts.total,
            active = counts.active,
            exhausted = counts.exhausted,
            deactivated = counts.deactivated,
            "credential pool loaded"
        );
        state.publish_gauges();

        Ok(Self {
            ledger,
            state: RwLock::new(state),
            ledger_lock: Mutex::new(()),
            returns: Arc::new(Returns::default()),
            degraded: AtomicBool::new(false),
        })
    }

    /// Check out the active credential with the most available quota.
    ///
    /// Available quota is remaining minus outstanding reservations. Credentials
    /// in `excluding` are skipped; ties go to the earliest credential. The
    /// cost is reserved in the same lock acquisition as the decision.
    ///
    /// Returns `PoolExhausted` with pool counts if no credential can cover `cost`.
    pub async fn checkout(&self, cost: u64, excluding: &HashSet<String>) -> Result<Lease> {
        let mut state = self.write_state().await;

        let mut best: Option<(&String, u64)> = None;
        for id in &state.ids {
            if excluding.contains(id) {
                continue;
            }
            let Some(entry) = state.entries.get(id) else {
                continue;
            };
            if !entry.credential.is_active() {
                continue;
            }
            let available = entry.available();
            if available < cost {
                continue;
            }
            if best.is_none_or(|(_, most)| available > most) {
                best = Some((id, available));
            }
        }

        let Some((id, available)) = best else {
            let counts = state.counts();
            debug!(cost, excluded = excluding.len(), "no credential can cover cost");
            return Err(Error::PoolExhausted(exhausted_message(counts, cost)));
        };
        let id = id.clone();

        let entry = state.entry_mut(&id)?;
        entry.reserved += cost;
        debug!(
            credential = %common::mask(&id),
            cost,
            available_before = available,
            "credential checked out"
        );

        Ok(Lease {
            token: Secret::new(id),
            reserved: cost,
            returns: self.returns.clone(),
        })
    }

    /// Write access, with reservations of dropped leases returned first.
    async fn write_state(&self) -> RwLockWriteGuard<'_, PoolState> {
        let mut state = self.state.write().await;
        state.return_dropped(&self.returns);
        state
    }

    fn notify_capacity(&self) {
        self.returns.capacity.notify_waiters();
    }

    /// Drop the lease's reservation and charge the actual cost.
    ///
    /// Returns the credential's new remaining quota.
    pub async fn settle(&self, mut lease: Lease, actual_cost: u64) -> Result<u64> {
        let reserved = lease.take_reservation();
        let mut state = self.write_state().await;
        let entry = state.entry_mut(lease.credential_id())?;
        entry.reserved = entry.reserved.saturating_sub(reserved);
        let remaining = state.charge(lease.credential_id(), actual_cost)?;
        state.publish_gauges();
        drop(state);

        if actual_cost < reserved {
            self.notify_capacity();
        }
        Ok(remaining)
    }

    /// Drop the lease's reservation without charging.
    pub async fn release(&self, mut lease: Lease) {
        let reserved = lease.take_reservation();
        let mut state = self.write_state().await;
        if let Ok(entry) = state.entry_mut(lease.credential_id()) {
            entry.reserved = entry.reserved.saturating_sub(reserved);
        }
        drop(state);
        self.notify_capacity();
    }

    /// Charge a credential directly, outside of a lease.
    ///
    /// Saturates at zero; reaching zero marks the credential exhausted.
    /// Returns the new remaining quota.
    pub async fn charge(&self, credential_id: &str, amount: u64) -> Result<u64> {
        let mut state = self.write_state().await;
        let remaining = state.charge(credential_id, amount)?;
        state.publish_gauges();
        Ok(remaining)
    }

    /// Upstream reported the credential's quota spent.
    ///
    /// Takes it out of rotation whatever the local count says. Recoverable
    /// through `reset`.
    pub async fn mark_exhausted(&self, credential_id: &str) -> Result<()> {
        let mut state = self.write_state().await;
        let entry = state.entry_mut(credential_id)?;
        let before = entry.credential.status;
        entry
            .credential
            .apply_event(StatusEvent::UpstreamExhausted, None);
        if before == CredentialStatus::Active {
            info!(
                credential = %common::mask(credential_id),
                remaining_quota = entry.credential.remaining_quota,
                "upstream reported quota exhausted"
            );
        }
        state.push_status_change(credential_id, before);
        state.publish_gauges();
        Ok(())
    }

    /// Permanently remove a credential from rotation.
    ///
    /// Only an operator `reset` brings it back.
    pub async fn deactivate(&self, credential_id: &str, reason: &str) -> Result<()> {
        let mut state = self.write_state().await;
        let entry = state.entry_mut(credential_id)?;
        let before = entry.credential.status;
        if before == CredentialStatus::Deactivated {
            return Ok(());
        }
        entry
            .credential
            .apply_event(StatusEvent::Revoked, Some(reason));
        warn!(
            credential = %common::mask(credential_id),
            reason,
            "credential deactivated"
        );
        state.push_status_change(credential_id, before);
        state.publish_gauges();
        Ok(())
    }

    /// Reactivate a credential with a fresh quota.
    pub async fn reset(&self, credential_id: &str, quota: u64) -> Result<()> {
        let mut state = self.write_state().await;
        state.reset(credential_id, quota)?;
        info!(credential = %common::mask(credential_id), quota, "credential reset");
        state.publish_gauges();
        drop(state);
        self.notify_capacity();
        Ok(())
    }

    /// Reset every credential that isn't deactivated to `quota`.
    ///
    /// This is the periodic quota replenishment. Returns how many were reset.
    pub async fn reset_all(&self, quota: u64) -> usize {
        let mut state = self.write_state().await;
        let targets: Vec<String> = state
            .ids
            .iter()
            .filter(|id| {
                state
                    .entries
                    .get(*id)
                    .is_some_and(|e| e.credential.status != CredentialStatus::Deactivated)
            })
            .cloned()
            .collect();
        for id in &targets {
            // Ids come from the table itself.
            let _ = state.reset(id, quota);
        }
        info!(count = targets.len(), quota, "reset all credentials");
        state.publish_gauges();
        drop(state);
        self.notify_capacity();
        targets.len()
    }

    /// Add a new credential. Persisted to the ledger before it enters rotation.
    pub async fn add_credential(
        &self,
        credential_id: &str,
        owner: Option<String>,
        quota: u64,
    ) -> Result<()> {
        let _guard = self.ledger_lock.lock().await;
        if self.state.read().await.entries.contains_key(credential_id) {
            return Err(Error::Duplicate(common::mask(credential_id)));
        }

        let credential = Credential::new(credential_id, owner, quota);
        self.ledger
            .add_credential(credential.clone())
            .await
            .map_err(|e| match e {
                quota_ledger::Error::Duplicate(id) => Error::Duplicate(id),
                other => Error::Ledger(other),
            })?;

        let mut state = self.write_state().await;
        state.ids.push(credential_id.to_string());
        state.entries.insert(
            credential_id.to_string(),
            Entry {
                credential,
                usage: Usage::default(),
                reserved: 0,
            },
        );
        info!(credential = %common::mask(credential_id), quota, "credential added to pool");
        state.publish_gauges();
        drop(state);
        self.notify_capacity();
        Ok(())
    }

    /// Consistent point-in-time copy of every credential, in insertion order.
    pub async fn snapshot(&self) -> Vec<Credential> {
        let state = self.state.read().await;
        state
            .ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| e.credential.clone())
            .collect()
    }

    /// Like `snapshot`, with accumulated usage per credential.
    pub async fn snapshot_with_usage(&self) -> Vec<(Credential, Usage)> {
        let state = self.state.read().await;
        state
            .ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| (e.credential.clone(), e.usage))
            .collect()
    }

    pub async fn counts(&self) -> StatusCounts {
        self.state.read().await.counts()
    }

    /// Whether any active credential could cover `cost` right now.
    pub async fn has_capacity(&self, cost: u64) -> bool {
        self.write_state().await.has_capacity(cost)
    }

    /// Notified whenever capacity may have returned (reset, add, release, reload).
    pub fn capacity_notify(&self) -> &Notify {
        &self.returns.capacity
    }

    /// Number of operations not yet mirrored into the ledger.
    pub async fn pending_ops(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// True while the last flush attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all active and the ledger reachable → healthy, some
    /// active → degraded, none active → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.write_state().await;
        let counts = state.counts();

        let credentials: Vec<serde_json::Value> = state
            .ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| {
                serde_json::json!({
                    "id": e.credential.masked_id(),
                    "status": e.credential.status.label(),
                    "remaining_quota": e.credential.remaining_quota,
                    "reserved": e.reserved,
                })
            })
            .collect();

        let degraded = self.is_degraded();
        let status = if counts.total > 0 && counts.active == counts.total && !degraded {
            "healthy"
        } else if counts.active > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "credentials_total": counts.total,
            "credentials_active": counts.active,
            "credentials_exhausted": counts.exhausted,
            "credentials_deactivated": counts.deactivated,
            "ledger_degraded": degraded,
            "pending_ledger_ops": state.pending.len(),
            "credentials": credentials
        })
    }

    /// Mirror buffered operations into the ledger, oldest first.
    ///
    /// Stops at the first failure; that operation and everything after it
    /// stay buffered for the next attempt. An operation on a credential the
    /// ledger no longer has can never succeed, so it is logged and dropped.
    /// Returns how many were persisted.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.ledger_lock.lock().await;
        let batch: Vec<LedgerOp> = self.state.read().await.pending.iter().cloned().collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let mut persisted = 0usize;
        let mut dropped = 0usize;
        let mut failure = None;
        for op in &batch {
            match self.ledger.persist(op).await {
                Ok(()) => persisted += 1,
                Err(quota_ledger::Error::NotFound(credential)) => {
                    warn!(
                        credential = %credential,
                        op_id = op.op_id,
                        "credential no longer in ledger, dropping operation"
                    );
                    metrics::counter!("pool_ledger_dropped_ops_total").increment(1);
                    dropped += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let mut state = self.write_state().await;
        // Only flush drains the buffer and flushes are serialized, so the
        // handled prefix is still at the front.
        state.pending.drain(..persisted + dropped);
        state.publish_gauges();
        let remaining = state.pending.len();
        drop(state);

        match failure {
            Some(e) => {
                metrics::counter!("pool_ledger_flush_failures_total").increment(1);
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, persisted, pending = remaining, "ledger unavailable, buffering operations");
                } else {
                    debug!(error = %e, pending = remaining, "ledger still unavailable");
                }
                Err(Error::Ledger(e))
            }
            None => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!(persisted, dropped, "ledger reachable again, buffer drained");
                } else {
                    debug!(persisted, dropped, "flushed ledger operations");
                }
                Ok(persisted)
            }
        }
    }

    /// Re-read the ledger and adopt changes made outside this pool.
    ///
    /// New credentials are added. Credentials with no buffered operations and
    /// no outstanding reservations take the ledger's state (e.g. an external
    /// reset). Returns how many credentials were added or updated.
    pub async fn reload(&self) -> Result<usize> {
        let _guard = self.ledger_lock.lock().await;
        let stored = self.ledger.load().await?;

        let mut state = self.write_state().await;
        let busy: HashSet<String> = state
            .pending
            .iter()
            .map(|op| op.credential_id.clone())
            .collect();

        let mut adopted = 0usize;
        for record in stored {
            state.next_op_id = state.next_op_id.max(record.last_op_id + 1);
            let id = record.credential.id.clone();
            let incoming = normalize(record.credential);

            if !state.entries.contains_key(&id) {
                info!(credential = %common::mask(&id), "adopted credential from ledger");
                state.ids.push(id.clone());
                state.entries.insert(
                    id,
                    Entry {
                        credential: incoming,
                        usage: record.usage,
                        reserved: 0,
                    },
                );
                adopted += 1;
                continue;
            }
            if busy.contains(&id) {
                continue;
            }
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            if entry.reserved > 0 {
                continue;
            }
            entry.usage = record.usage;
            let current = &entry.credential;
            if current.remaining_quota == incoming.remaining_quota
                && current.status == incoming.status
                && current.deactivation_reason == incoming.deactivation_reason
                && current.owner == incoming.owner
            {
                continue;
            }
            info!(
                credential = %common::mask(&id),
                status = %incoming.status,
                remaining_quota = incoming.remaining_quota,
                "adopted external ledger change"
            );
            entry.credential = incoming;
            adopted += 1;
        }
        state.publish_gauges();
        drop(state);

        if adopted > 0 {
            self.notify_capacity();
        }
        Ok(adopted)
    }
}

/// Build the exhausted error message JSON.
fn exhausted_message(counts: StatusCounts, cost: u64) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "No active credential can cover the call cost",
            "cost": cost,
            "pool": {
                "credentials_total": counts.total,
                "credentials_active": counts.active,
                "credentials_exhausted": counts.exhausted,
                "credentials_deactivated": counts.deactivated
            }
        }
    })
    .to_string()
}
