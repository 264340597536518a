//! Where finished task reports go

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::SinkError;

/// Response of one call kind made for a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub kind: String,
    /// Quota units charged for the call
    pub cost: u64,
    pub body: serde_json::Value,
}

/// Everything a successful task produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub attempts: u32,
    /// Unix timestamp in milliseconds
    pub finished_at_ms: u64,
    pub calls: Vec<CallRecord>,
}

/// Destination for task reports.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn ResultSink>`).
pub trait ResultSink: Send + Sync {
    fn write<'a>(
        &'a self,
        report: &'a TaskReport,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// Sink that keeps reports in memory.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<TaskReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<TaskReport> {
        self.reports.lock().await.clone()
    }
}

impl ResultSink for MemorySink {
    fn write<'a>(
        &'a self,
        report: &'a TaskReport,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            self.reports.lock().await.push(report.clone());
            Ok(())
        })
    }
}
