//! Concurrent task dispatcher for a metered upstream API
//!
//! Tasks (search keywords) are queued once, claimed by exactly one worker at
//! a time, and driven through a fixed plan of call kinds. Every call goes
//! through `RateLimitedClient`, which picks a credential from the pool and
//! charges the call's cost. Failed calls are retried per `RetryPolicy`; an
//! exhausted pool pauses workers instead of failing tasks.

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod sink;
pub mod task;

#[cfg(test)]
mod testing;

pub use client::{CallSuccess, RateLimitedClient};
pub use dispatcher::{Dispatcher, DispatcherConfig, RunSummary};
pub use error::{CallError, DispatchError, SinkError};
pub use retry::{RetryAction, RetryEvent, RetryPolicy, RetryState};
pub use sink::{CallRecord, MemorySink, ResultSink, TaskReport};
pub use task::{Claim, QueueStats, Task, TaskOutcome, TaskQueue};
