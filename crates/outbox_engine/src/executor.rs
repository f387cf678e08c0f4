//! Remote operation executor abstraction.

use crate::error::SyncResult;
use async_trait::async_trait;
use outbox_protocol::{ExecuteResponse, SyncOperation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Applies queued operations on the remote service.
///
/// This trait abstracts the network layer (HTTP, RPC, mock for testing).
/// `op.id` is stable across retries and crashes, so implementations should
/// pass it to the server as an idempotency key.
///
/// Returning `Err` is equivalent to an error response and is classified
/// through [`crate::SyncError::classify`].
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Sends one operation to the server.
    async fn execute(&self, op: &SyncOperation) -> SyncResult<ExecuteResponse>;
}

type Handler = Box<dyn Fn(&SyncOperation) -> SyncResult<ExecuteResponse> + Send + Sync>;

/// A scripted executor for tests and demos.
///
/// Scripted replies are consumed in order; once the script is empty every
/// call is answered by the handler, which applies everything by default.
/// Every call is recorded.
pub struct MockExecutor {
    script: Mutex<VecDeque<SyncResult<ExecuteResponse>>>,
    handler: Mutex<Handler>,
    calls: Mutex<Vec<SyncOperation>>,
    latency: Mutex<Option<Duration>>,
}

impl MockExecutor {
    /// Creates an executor that applies every operation.
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            handler: Mutex::new(Box::new(|_| Ok(ExecuteResponse::applied()))),
            calls: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
        }
    }

    /// Queues a reply for the next unscripted call.
    pub fn push_response(&self, response: ExecuteResponse) {
        self.script.lock().push_back(Ok(response));
    }

    /// Queues an executor failure for the next unscripted call.
    pub fn push_error(&self, error: crate::SyncError) {
        self.script.lock().push_back(Err(error));
    }

    /// Replaces the fallback handler.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&SyncOperation) -> SyncResult<ExecuteResponse> + Send + Sync + 'static,
    {
        *self.handler.lock() = Box::new(handler);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Returns the operations received so far, in call order.
    pub fn calls(&self) -> Vec<SyncOperation> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls received.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the number of scripted replies not yet consumed.
    pub fn remaining_script(&self) -> usize {
        self.script.lock().len()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExecutor")
            .field("calls", &self.call_count())
            .field("scripted", &self.remaining_script())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn execute(&self, op: &SyncOperation) -> SyncResult<ExecuteResponse> {
        self.calls.lock().push(op.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(reply) => reply,
            None => (self.handler.lock())(op),
        }
    }
}
