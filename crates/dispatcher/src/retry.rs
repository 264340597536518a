//! Per-call retry state machine
//!
//! Pure state machine: receives events, returns (new_state, action). The
//! worker executes the I/O implied by each action: `Invoke` makes one upstream
//! call, `Wait` sleeps, `Finish` reads the terminal state.
//!
//! Credential-level rejections rotate to another credential at once and don't
//! count as failures. Transient failures back off exponentially with equal
//! jitter. Permanent failures give up immediately.

use std::time::Duration;

use rand::RngExt;

/// Retry limits and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Invocations allowed to fail transiently before giving up. 0 acts as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Apply equal jitter to backoff delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Retry states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    /// Nothing invoked yet
    Pending,
    /// An invocation is in flight
    Attempting { attempt: u32, failures: u32 },
    /// Backing off after a transient failure
    RetryScheduled {
        attempt: u32,
        failures: u32,
        delay: Duration,
    },
    /// Terminal: the call succeeded
    Success { attempts: u32 },
    /// Terminal: retries exhausted or permanent failure
    GiveUp { attempts: u32, error: String },
}

impl RetryState {
    /// Invocations made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryState::Pending => 0,
            RetryState::Attempting { attempt, .. } | RetryState::RetryScheduled { attempt, .. } => {
                *attempt
            }
            RetryState::Success { attempts } | RetryState::GiveUp { attempts, .. } => *attempts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Success { .. } | RetryState::GiveUp { .. })
    }
}

/// Events that drive retry transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// Start the first attempt
    Begin,
    /// The invocation succeeded
    Succeeded,
    /// The credential was rejected (quota spent or key invalid)
    CredentialRejected,
    /// Retryable failure
    Transient(String),
    /// Non-retryable failure
    Permanent(String),
    /// Backoff delay elapsed
    TimerElapsed,
}

/// Actions the caller should execute after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Make one upstream call
    Invoke,
    /// Sleep, then send `TimerElapsed`
    Wait { delay: Duration },
    /// Stop; the state is terminal
    Finish,
    /// No-op
    None,
}

impl RetryPolicy {
    /// Handle a state transition. No I/O; jitter draws from the thread RNG.
    pub fn handle_event(&self, state: RetryState, event: RetryEvent) -> (RetryState, RetryAction) {
        match (state, event) {
            (RetryState::Pending, RetryEvent::Begin) => (
                RetryState::Attempting {
                    attempt: 1,
                    failures: 0,
                },
                RetryAction::Invoke,
            ),

            // --- Attempting ---
            (RetryState::Attempting { attempt, .. }, RetryEvent::Succeeded) => (
                RetryState::Success { attempts: attempt },
                RetryAction::Finish,
            ),

            (RetryState::Attempting { attempt, failures }, RetryEvent::CredentialRejected) => (
                RetryState::Attempting {
                    attempt: attempt + 1,
                    failures,
                },
                RetryAction::Invoke,
            ),

            (RetryState::Attempting { attempt, failures }, RetryEvent::Transient(error)) => {
                let failures = failures + 1;
                if failures >= self.max_attempts.max(1) {
                    return (
                        RetryState::GiveUp {
                            attempts: attempt,
                            error,
                        },
                        RetryAction::Finish,
                    );
                }
                let delay = self.delay(failures);
                (
                    RetryState::RetryScheduled {
                        attempt,
                        failures,
                        delay,
                    },
                    RetryAction::Wait { delay },
                )
            }

            (RetryState::Attempting { attempt, .. }, RetryEvent::Permanent(error)) => (
                RetryState::GiveUp {
                    attempts: attempt,
                    error,
                },
                RetryAction::Finish,
            ),

            // --- RetryScheduled ---
            (RetryState::RetryScheduled { attempt, failures, .. }, RetryEvent::TimerElapsed) => (
                RetryState::Attempting {
                    attempt: attempt + 1,
                    failures,
                },
                RetryAction::Invoke,
            ),

            // --- Terminal states stay terminal ---
            (state @ (RetryState::Success { .. } | RetryState::GiveUp { .. }), _) => {
                (state, RetryAction::Finish)
            }

            // --- Invalid/unhandled transition: stay in current state ---
            (state, _event) => (state, RetryAction::None),
        }
    }

    /// Backoff before retry number `failures` (1-based), without jitter:
    /// `min(max_delay, base_delay * 2^(failures - 1))`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay(&self, failures: u32) -> Duration {
        let backoff = self.backoff(failures);
        if self.jitter {
            equal_jitter(backoff, rand::rng().random::<f64>())
        } else {
            backoff
        }
    }
}

/// Half the delay fixed, half scaled by `fraction` in `[0, 1)`.
fn equal_jitter(delay: Duration, fraction: f64) -> Duration {
    let half = delay / 2;
    half + half.mul_f64(fraction.clamp(0.0, 1.0))
}
