//! In-process ledger
//!
//! Keeps records in memory only. Used for dry runs and tests; it can be
//! switched into an outage mode where every call fails with `Unavailable`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::credential::{Credential, CredentialStatus, now_millis};
use crate::error::{Error, Result};
use crate::ledger::{LedgerFuture, QuotaLedger, StoredCredential, Usage};

/// Ledger that lives and dies with the process.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<BTreeMap<String, StoredCredential>>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger pre-populated with credentials.
    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let records = credentials
            .into_iter()
            .map(|credential| {
                (
                    credential.id.clone(),
                    StoredCredential {
                        credential,
                        last_op_id: 0,
                        usage: Usage::default(),
                    },
                )
            })
            .collect();
        Self {
            records: Mutex::new(records),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail (`true`) or succeed again (`false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(Error::Unavailable("memory ledger switched off".into()));
        }
        Ok(())
    }

    /// Operator reset outside the owning pool's operation stream. Leaves
    /// `last_op_id` alone.
    pub async fn reset_quota(&self, credential_id: &str, quota: u64) -> Result<()> {
        self.check()?;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(common::mask(credential_id)))?;
        record.credential.apply_reset(quota);
        record.credential.last_updated_ms = now_millis();
        Ok(())
    }

    async fn apply(
        &self,
        op_id: u64,
        credential_id: &str,
        update: impl FnOnce(&mut StoredCredential),
    ) -> Result<()> {
        self.check()?;
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(common::mask(credential_id)))?;
        if op_id <= record.last_op_id {
            return Ok(());
        }
        update(record);
        record.last_op_id = op_id;
        record.credential.last_updated_ms = now_millis();
        Ok(())
    }
}

impl QuotaLedger for MemoryLedger {
    fn load(&self) -> LedgerFuture<'_, Vec<StoredCredential>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.records.lock().await.values().cloned().collect())
        })
    }

    fn add_credential(&self, credential: Credential) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            self.check()?;
            let mut records = self.records.lock().await;
            if records.contains_key(&credential.id) {
                return Err(Error::Duplicate(credential.masked_id()));
            }
            records.insert(
                credential.id.clone(),
                StoredCredential {
                    credential,
                    last_op_id: 0,
                    usage: Usage::default(),
                },
            );
            Ok(())
        })
    }

    fn persist_charge<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        amount: u64,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(self.apply(op_id, credential_id, move |record| {
            let credential = &mut record.credential;
            credential.remaining_quota = credential.remaining_quota.saturating_sub(amount);
            record.usage.total_charged += amount;
            record.usage.charge_count += 1;
        }))
    }

    fn persist_status<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        status: CredentialStatus,
        reason: Option<&'a str>,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(self.apply(op_id, credential_id, move |record| {
            record.credential.status = status;
            if status == CredentialStatus::Deactivated {
                record.credential.deactivation_reason = reason.map(str::to_string);
            }
        }))
    }

    fn persist_reset<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        quota: u64,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(self.apply(op_id, credential_id, move |record| {
            record.credential.apply_reset(quota);
        }))
    }
}
