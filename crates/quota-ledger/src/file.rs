//! JSON file ledger
//!
//! Stores a JSON object mapping credential ids to their quota records. All
//! writes use atomic temp-file + rename to prevent corruption on crash. A tokio
//! Mutex serializes writers, so the flush task and admin operations never
//! interleave partial updates.
//!
//! Every write starts from the file's current contents, applies one change
//! and renames the result into place; the in-memory copy is replaced only
//! once the rename succeeded. A failed write therefore leaves no trace and a
//! retry of the same operation applies it.
//!
//! One pool owns a ledger file. Operator tooling may change records between
//! writes, through `reset_quota` or by editing the file, as long as it leaves
//! `last_op_id` alone: the pool's operation ids are only compared against that
//! field, so raising it makes the pool's next operations look already
//! applied. There is no cross-process file lock; two pools writing one file
//! lose updates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credential::{Credential, CredentialStatus, now_millis};
use crate::error::{Error, Result};
use crate::ledger::{LedgerFuture, QuotaLedger, StoredCredential, Usage};

/// On-disk form of one credential. The id is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerRecord {
    #[serde(default)]
    owner: Option<String>,
    remaining_quota: u64,
    status: CredentialStatus,
    last_updated_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deactivation_reason: Option<String>,
    #[serde(default)]
    last_op_id: u64,
    #[serde(default)]
    total_charged: u64,
    #[serde(default)]
    charge_count: u64,
}

impl LedgerRecord {
    fn from_credential(credential: &Credential) -> Self {
        Self {
            owner: credential.owner.clone(),
            remaining_quota: credential.remaining_quota,
            status: credential.status,
            last_updated_ms: credential.last_updated_ms,
            deactivation_reason: credential.deactivation_reason.clone(),
            last_op_id: 0,
            total_charged: 0,
            charge_count: 0,
        }
    }

    fn reset(&mut self, quota: u64) {
        self.remaining_quota = quota;
        self.status = if quota == 0 {
            CredentialStatus::Exhausted
        } else {
            CredentialStatus::Active
        };
        self.deactivation_reason = None;
    }

    fn to_stored(&self, id: &str) -> StoredCredential {
        StoredCredential {
            credential: Credential {
                id: id.to_string(),
                owner: self.owner.clone(),
                remaining_quota: self.remaining_quota,
                status: self.status,
                last_updated_ms: self.last_updated_ms,
                deactivation_reason: self.deactivation_reason.clone(),
            },
            last_op_id: self.last_op_id,
            usage: Usage {
                total_charged: self.total_charged,
                charge_count: self.charge_count,
            },
        }
    }
}

/// Ledger backed by a single JSON file.
pub struct FileLedger {
    path: PathBuf,
    state: Mutex<BTreeMap<String, LedgerRecord>>,
}

impl FileLedger {
    /// Open the ledger at the given path.
    ///
    /// If the file doesn't exist, creates it as `{}` (cold start with zero
    /// credentials).
    pub async fn open(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let records = read_records(&path).await?;
            info!(path = %path.display(), credentials = records.len(), "loaded quota ledger");
            records
        } else {
            info!(path = %path.display(), "ledger file not found, starting with empty ledger");
            let records = BTreeMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored credentials.
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a credential with this id is stored.
    pub async fn contains(&self, credential_id: &str) -> bool {
        self.state.lock().await.contains_key(credential_id)
    }

    /// Operator reset made outside the owning pool's operation stream.
    ///
    /// Leaves `last_op_id` alone, so the pool's buffered operations still
    /// apply on top of it. The pool adopts the new quota on its next reload.
    pub async fn reset_quota(&self, credential_id: &str, quota: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut records = read_records(&self.path).await?;
        let record = records
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(common::mask(credential_id)))?;
        record.reset(quota);
        record.last_updated_ms = now_millis();
        write_atomic(&self.path, &records).await?;
        *state = records;
        info!(credential = %common::mask(credential_id), quota, "operator reset written to ledger");
        Ok(())
    }

    /// Apply `update` to one record unless `op_id` was already applied.
    async fn apply(
        &self,
        op_id: u64,
        credential_id: &str,
        update: impl FnOnce(&mut LedgerRecord),
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut records = read_records(&self.path).await?;
        let record = records
            .get_mut(credential_id)
            .ok_or_else(|| Error::NotFound(common::mask(credential_id)))?;
        if op_id <= record.last_op_id {
            debug!(
                credential = %common::mask(credential_id),
                op_id,
                last_op_id = record.last_op_id,
                "operation already applied, acknowledging"
            );
            *state = records;
            return Ok(());
        }
        update(record);
        record.last_op_id = op_id;
        record.last_updated_ms = now_millis();
        write_atomic(&self.path, &records).await?;
        *state = records;
        Ok(())
    }
}

impl QuotaLedger for FileLedger {
    /// Re-reads the file so operator edits (a reset job) are picked up.
    fn load(&self) -> LedgerFuture<'_, Vec<StoredCredential>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            *state = read_records(&self.path).await?;
            Ok(state
                .iter()
                .map(|(id, record)| record.to_stored(id))
                .collect())
        })
    }

    fn add_credential(&self, credential: Credential) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let mut records = read_records(&self.path).await?;
            if records.contains_key(&credential.id) {
                return Err(Error::Duplicate(credential.masked_id()));
            }
            records.insert(
                credential.id.clone(),
                LedgerRecord::from_credential(&credential),
            );
            write_atomic(&self.path, &records).await?;
            *state = records;
            debug!(credential = %credential.masked_id(), "added credential to ledger");
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
            record.remaining_quota = record.remaining_quota.saturating_sub(amount);
            record.total_charged += amount;
            record.charge_count += 1;
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
            record.status = status;
            if status == CredentialStatus::Deactivated {
                record.deactivation_reason = reason.map(str::to_string);
            }
        }))
    }

    fn persist_reset<'a>(
        &'a self,
        op_id: u64,
        credential_id: &'a str,
        quota: u64,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(self.apply(op_id, credential_id, move |record| record.reset(quota)))
    }
}

async fn read_records(path: &Path) -> Result<BTreeMap<String, LedgerRecord>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Io(format!("reading ledger file: {e}")))?;
    serde_json::from_str(&contents).map_err(|e| Error::Parse(format!("parsing ledger file: {e}")))
}

/// Write the ledger to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. Sets file permissions to 0600 (owner read/write only) since
/// the file contains API keys.
async fn write_atomic(path: &Path, data: &BTreeMap<String, LedgerRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::Parse(format!("serializing ledger: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        Some(_) => Path::new("."),
        None => return Err(Error::Io("ledger path has no parent directory".into())),
    };

    let tmp_path = dir.join(format!(".quota-ledger.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp ledger file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting ledger file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp ledger file: {e}")))?;

    debug!(path = %path.display(), "persisted ledger");
    Ok(())
}
