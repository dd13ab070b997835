//! Execution trace nodes
//!
//! Pipeline stages that matter to an operator (search, sandbox) open a trace
//! node and close it with `complete` or `fail`.

use serde_json::Value;
use std::sync::Arc;

/// Collects trace nodes for one request
pub trait Tracer: Send + Sync {
    fn add(&self, label: &str, kind: &str, input: Value) -> Arc<dyn TraceNode>;
}

/// One traced stage
pub trait TraceNode: Send + Sync {
    fn info(&self, message: &str);
    fn complete(&self, output: Value);
    fn fail(&self, error: &str);
}

/// Tracer that writes nodes to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

struct LogNode {
    id: String,
    label: String,
}

impl Tracer for LogTracer {
    fn add(&self, label: &str, kind: &str, input: Value) -> Arc<dyn TraceNode> {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(trace_id = %id, kind = kind, input = %input, "trace: {} started", label);
        Arc::new(LogNode {
            id,
            label: label.to_string(),
        })
    }
}

impl TraceNode for LogNode {
    fn info(&self, message: &str) {
        tracing::debug!(trace_id = %self.id, "trace: {}: {}", self.label, message);
    }

    fn complete(&self, output: Value) {
        tracing::debug!(trace_id = %self.id, output = %output, "trace: {} completed", self.label);
    }

    fn fail(&self, error: &str) {
        tracing::warn!(trace_id = %self.id, "trace: {} failed: {}", self.label, error);
    }
}
