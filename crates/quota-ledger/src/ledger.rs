//! Ledger abstraction and the operations mirrored into it

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::credential::{Credential, CredentialStatus};
use crate::error::Result;

/// Boxed future returned by ledger methods, keeping the trait dyn-compatible.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Accumulated usage for a credential since it was added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub total_charged: u64,
    pub charge_count: u64,
}

/// A credential as persisted, with the id of the last applied operation.
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub credential: Credential,
    pub last_op_id: u64,
    pub usage: Usage,
}

/// What a buffered ledger operation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpKind {
    Charge {
        amount: u64,
    },
    Status {
        status: CredentialStatus,
        reason: Option<String>,
    },
    Reset {
        quota: u64,
    },
}

/// One mutation of a credential, in the order the pool applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOp {
    pub op_id: u64,
    pub credential_id: String,
    pub kind: OpKind,
}

/// Durable store of credential quota state.
///
/// Every `persist_*` call must be idempotent under at-least-once delivery: an
/// operation whose `op_id` is not greater than the credential's stored
/// `last_op_id` is acknowledged without being applied. A write that fails
/// must leave no trace, so the retried operation is applied.
///
/// Operation ids come from the single pool that owns the ledger. Anything
/// else mutating records must not raise `last_op_id`, or the pool's next
/// operations on that credential are acknowledged and dropped.
///
/// Uses `Pin<Box<dyn Future>>` return types so the pool can hold an
/// `Arc<dyn QuotaLedger>`.
pub trait QuotaLedger: Send + Sync {
    /// Every stored credential, in a stable order.
    fn load(&self) -> LedgerFuture<'_, Vec<StoredCredential>>;

    /// Insert a new credential. Fails with `Duplicate` if the id exists.
    fn add_credential(&self, credential: Credential) -> LedgerFuture<'_, ()>;

    /// Decrement a credential's stored quota.
    fn persist_charge<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        amount: u64,
    ) -> LedgerFuture<'a, ()>;

    /// Record a status change.
    fn persist_status<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        status: CredentialStatus,
        reason: Option<&'a str>,
    ) -> LedgerFuture<'a, ()>;

    /// Record an operator reset to a fresh quota.
    fn persist_reset<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        quota: u64,
    ) -> LedgerFuture<'a, ()>;

    /// Persist a buffered operation.
    fn persist<'a>(&'a self, op: &'a LedgerOp) -> LedgerFuture<'a, ()> {
        match &op.kind {
            OpKind::Charge { amount } => self.persist_charge(op.op_id, &op.credential_id, *amount),
            OpKind::Status { status, reason } => {
                self.persist_status(op.op_id, &op.credential_id, *status, reason.as_deref())
            }
            OpKind::Reset { quota } => self.persist_reset(op.op_id, &op.credential_id, *quota),
        }
    }
}
