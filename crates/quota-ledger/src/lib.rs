//! Durable quota ledger for metered API credentials
//!
//! The ledger is the record of every credential's remaining quota and status
//! that survives restarts. The in-memory credential pool is authoritative for
//! admission decisions; it mirrors each mutation here as an operation carrying
//! a monotonically increasing id, so a resent operation is acknowledged
//! without being applied twice.
//!
//! Credential lifecycle:
//! 1. Operator adds a credential with an initial quota → `Active`
//! 2. Charges decrement the quota; reaching zero → `Exhausted`
//! 3. Upstream reports the quota spent → `Exhausted` regardless of local count
//! 4. Upstream reports the key invalid or revoked → `Deactivated`
//! 5. Operator reset → `Active` with a fresh quota

pub mod credential;
pub mod error;
pub mod file;
pub mod ledger;
pub mod memory;

pub use credential::{Credential, CredentialStatus, StatusEvent, now_millis};
pub use error::{Error, Result};
pub use file::FileLedger;
pub use ledger::{LedgerFuture, LedgerOp, OpKind, QuotaLedger, StoredCredential, Usage};
pub use memory::MemoryLedger;
