//! Quota-aware pool of metered API credentials
//!
//! Holds every credential's remaining quota and status in memory, hands out
//! the credential with the most available quota for each call (reserving the
//! call's cost), and mirrors every mutation into a durable `QuotaLedger`.
//!
//! Credential lifecycle in the pool:
//! 1. Operator adds a credential → persisted to the ledger, status `Active`
//! 2. `checkout` reserves a call's cost; `settle` charges the actual cost
//! 3. Charges reaching zero → `Exhausted` before the next checkout
//! 4. Upstream says the quota is spent → `mark_exhausted`
//! 5. Upstream rejects the key → `deactivate`, never used again
//! 6. Operator `reset` / `reset_all` → `Active` with a fresh quota
//! 7. Background task flushes buffered operations to the ledger

pub mod cost;
pub mod error;
pub mod flush;
pub mod pool;

pub use cost::{CostTable, DEFAULT_COSTS};
pub use error::{Error, Result};
pub use flush::spawn_flush_task;
pub use pool::{Lease, Pool, StatusCounts};
