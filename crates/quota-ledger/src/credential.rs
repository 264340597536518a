//! Credential record and status state machine

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a metered credential.
///
/// Transitions (see [`CredentialStatus::transition`]):
/// - Active → Exhausted (quota reached zero, or upstream reported it spent)
/// - Active/Exhausted → Deactivated (upstream rejected the key)
/// - any → Active (operator reset)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Exhausted,
    Deactivated,
}

/// Events that move a credential between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// Local bookkeeping shows no quota left
    Depleted,
    /// Upstream says the quota is spent
    UpstreamExhausted,
    /// Upstream says the key is invalid, banned or revoked
    Revoked,
    /// Operator restored the quota
    Reset,
}

impl CredentialStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Exhausted => "exhausted",
            CredentialStatus::Deactivated => "deactivated",
        }
    }

    /// Apply an event. Pure: no I/O, no clock.
    ///
    /// Deactivated credentials only leave that state through an explicit reset.
    pub fn transition(self, event: StatusEvent) -> CredentialStatus {
        match (self, event) {
            (_, StatusEvent::Reset) => CredentialStatus::Active,
            (_, StatusEvent::Revoked) => CredentialStatus::Deactivated,
            (CredentialStatus::Deactivated, _) => CredentialStatus::Deactivated,
            (_, StatusEvent::Depleted | StatusEvent::UpstreamExhausted) => {
                CredentialStatus::Exhausted
            }
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A metered API credential and its quota state.
///
/// `id` is the opaque token itself, so `Debug` masks it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub remaining_quota: u64,
    pub status: CredentialStatus,
    /// Unix timestamp in milliseconds
    pub last_updated_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<String>,
}

impl Credential {
    /// New credential with an initial quota. A zero quota starts exhausted.
    pub fn new(id: impl Into<String>, owner: Option<String>, quota: u64) -> Self {
        let status = if quota == 0 {
            CredentialStatus::Exhausted
        } else {
            CredentialStatus::Active
        };
        Self {
            id: id.into(),
            owner,
            remaining_quota: quota,
            status,
            last_updated_ms: now_millis(),
            deactivation_reason: None,
        }
    }

    /// Masked id for logs and listings.
    pub fn masked_id(&self) -> String {
        common::mask(&self.id)
    }

    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Decrement quota, saturating at zero. Returns the new remaining quota.
    pub fn apply_charge(&mut self, amount: u64) -> u64 {
        self.remaining_quota = self.remaining_quota.saturating_sub(amount);
        if self.remaining_quota == 0 {
            self.status = self.status.transition(StatusEvent::Depleted);
        }
        self.last_updated_ms = now_millis();
        self.remaining_quota
    }

    /// Apply a status event, recording the reason when deactivating.
    pub fn apply_event(&mut self, event: StatusEvent, reason: Option<&str>) {
        self.status = self.status.transition(event);
        match event {
            StatusEvent::Revoked => self.deactivation_reason = reason.map(str::to_string),
            StatusEvent::Reset => self.deactivation_reason = None,
            _ => {}
        }
        self.last_updated_ms = now_millis();
    }

    /// Reactivate with a fresh quota. A zero quota leaves it exhausted.
    pub fn apply_reset(&mut self, quota: u64) {
        self.remaining_quota = quota;
        self.apply_event(StatusEvent::Reset, None);
        if quota == 0 {
            self.status = self.status.transition(StatusEvent::Depleted);
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.masked_id())
            .field("owner", &self.owner)
            .field("remaining_quota", &self.remaining_quota)
            .field("status", &self.status)
            .field("last_updated_ms", &self.last_updated_ms)
            .field("deactivation_reason", &self.deactivation_reason)
            .finish()
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
