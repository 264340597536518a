//! Test doubles shared by the dispatcher's unit tests

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use credential_pool::Pool;
use quota_ledger::{Credential, MemoryLedger};
use upstream::{CallRequest, CallResponse, ErrorClassification, Upstream, UpstreamError};

/// One recorded upstream call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub kind: String,
    pub task: String,
    pub token: String,
    /// How many earlier calls were made for the same task
    pub nth_for_task: usize,
}

type Handler = dyn Fn(&RecordedCall) -> upstream::Result<CallResponse> + Send + Sync;

/// Upstream answering from a closure, recording every call.
pub struct FakeUpstream {
    handler: Box<Handler>,
    delay: Option<Duration>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeUpstream {
    pub fn new(
        handler: impl Fn(&RecordedCall) -> upstream::Result<CallResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Like `new`, sleeping `delay` before answering.
    pub fn slow(
        delay: Duration,
        handler: impl Fn(&RecordedCall) -> upstream::Result<CallResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            delay: Some(delay),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, task: &str) -> usize {
        self.calls().iter().filter(|c| c.task == task).count()
    }
}

impl Upstream for FakeUpstream {
    fn id(&self) -> &str {
        "fake"
    }

    fn call<'a>(
        &'a self,
        request: CallRequest<'a>,
    ) -> Pin<Box<dyn Future<Output = upstream::Result<CallResponse>> + Send + 'a>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let call = RecordedCall {
                kind: request.kind.to_string(),
                task: request.task.to_string(),
                token: request.token.to_string(),
                nth_for_task: calls.iter().filter(|c| c.task == request.task).count(),
            };
            calls.push(call.clone());
            call
        };
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            (self.handler)(&call)
        })
    }
}

pub fn ok() -> upstream::Result<CallResponse> {
    Ok(CallResponse {
        body: serde_json::json!({ "items": [] }),
        cost: None,
    })
}

pub fn fail(classification: ErrorClassification) -> upstream::Result<CallResponse> {
    Err(UpstreamError::new(
        classification,
        format!("scripted {classification}"),
    ))
}

pub fn memory_ledger(creds: &[(&str, u64)]) -> Arc<MemoryLedger> {
    Arc::new(MemoryLedger::with_credentials(
        creds
            .iter()
            .map(|(id, quota)| Credential::new(*id, None, *quota)),
    ))
}

pub async fn memory_pool(creds: &[(&str, u64)]) -> Arc<Pool> {
    Arc::new(Pool::load(memory_ledger(creds)).await.unwrap())
}
