//! Sandbox stream bridge
//!
//! `BuildOptions -> AcquireManager -> CreateExecutor -> Stream -> Close`.
//! The "preparing" status opened at the start is resolved on every path:
//! by the first output chunk, or by the outcome when no chunk arrived.

use super::{build_options, Executor};
use crate::assistant::Assistant;
use crate::context::Context;
use crate::output::{ChunkHandler, LoadingStatus};
use crate::runtime::Runtime;
use sdk::errors::EngineError;
use sdk::types::{CompletionResponse, Message, StreamChunk};
use std::sync::{Arc, Mutex};

type PendingStatus = Arc<Mutex<Option<LoadingStatus>>>;

fn take_status(pending: &PendingStatus) -> Option<LoadingStatus> {
    pending.lock().expect("sandbox status lock poisoned").take()
}

/// Closes the executor even when the stream future is dropped mid-run
struct ExecutorGuard {
    executor: Arc<dyn Executor>,
    assistant_id: String,
    closed: bool,
}

impl ExecutorGuard {
    fn new(executor: Arc<dyn Executor>, assistant_id: &str) -> Self {
        Self {
            executor,
            assistant_id: assistant_id.to_string(),
            closed: false,
        }
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.executor.close().await {
            tracing::warn!("Failed to close sandbox for '{}': {}", self.assistant_id, e);
        }
    }
}

impl Drop for ExecutorGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let executor = Arc::clone(&self.executor);
        let assistant_id = std::mem::take(&mut self.assistant_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Sandbox stream for '{}' dropped, closing executor", assistant_id);
                handle.spawn(async move {
                    if let Err(e) = executor.close().await {
                        tracing::warn!("Failed to close sandbox for '{}': {}", assistant_id, e);
                    }
                });
            }
            Err(_) => tracing::warn!("Sandbox for '{}' dropped outside a runtime", assistant_id),
        }
    }
}

/// Run the completion inside the assistant's sandbox
pub async fn stream_with_sandbox(
    rt: &Runtime,
    assistant: &Assistant,
    ctx: &Context,
    messages: &[Message],
    handler: ChunkHandler,
) -> Result<CompletionResponse, EngineError> {
    let status = (!ctx.silent)
        .then(|| LoadingStatus::open(Arc::clone(&ctx.output), "Preparing sandbox"));
    let loading_id = status.as_ref().and_then(|s| s.id().map(String::from));
    let pending: PendingStatus = Arc::new(Mutex::new(status));

    let fail = |message: &str| {
        if let Some(status) = take_status(&pending) {
            status.fail(message);
        }
    };

    let options = match build_options(rt, assistant, ctx).await {
        Ok(options) => options,
        Err(e) => {
            fail("Invalid sandbox configuration");
            return Err(e);
        }
    };
    let timeout = options.timeout;

    let manager = match rt.sandbox().get_manager().await {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("Sandbox unavailable for '{}': {}", assistant.id(), e);
            fail("Sandbox unavailable");
            return Err(e);
        }
    };

    let executor = match manager.create_executor(options).await {
        Ok(executor) => executor,
        Err(e) => {
            tracing::error!("Failed to create sandbox for '{}': {}", assistant.id(), e);
            fail("Failed to start sandbox");
            return Err(e);
        }
    };

    let executor: Arc<dyn Executor> = Arc::from(executor);
    let guard = ExecutorGuard::new(Arc::clone(&executor), assistant.id());

    if let Some(id) = &loading_id {
        executor.set_loading_msg_id(id);
    }

    let first_chunk = Arc::clone(&pending);
    let forward: ChunkHandler = Arc::new(move |chunk: &StreamChunk| {
        if let Some(status) = take_status(&first_chunk) {
            status.done("Sandbox ready");
        }
        handler(chunk);
    });

    let result = tokio::select! {
        result = executor.stream(ctx, messages, forward) => result,
        _ = tokio::time::sleep(timeout) => {
            tracing::warn!("Sandbox for '{}' timed out after {:?}", assistant.id(), timeout);
            Err(EngineError::Execution(format!("sandbox timed out after {:?}", timeout)))
        }
        _ = ctx.cancel.cancelled() => {
            tracing::info!("Sandbox for '{}' cancelled", assistant.id());
            Err(EngineError::Execution("sandbox execution cancelled".to_string()))
        }
    };

    if let Some(status) = take_status(&pending) {
        match &result {
            Ok(_) => status.done("Sandbox finished"),
            Err(_) => status.fail("Sandbox execution failed"),
        }
    }

    guard.close().await;

    result
}
