use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{field, info_span, Instrument as _};

use crate::mux::{Call, Handler, Status};

/// Metadata key carrying the caller's distributed trace id.
pub const TRACE_ID_KEY: &str = "trace-id";

/// Metadata key tagging the call with a rollout experiment.
pub const EXPERIMENT_KEY: &str = "experiment";

/// Runs every dispatch inside an `rpc` span, recording the remote trace id
/// when the caller supplied one.
pub struct TraceHandler {
    inner: Arc<dyn Handler>,
}

impl TraceHandler {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Handler for TraceHandler {
    async fn handle(&self, call: Call) -> Result<Bytes, Status> {
        let span = info_span!("rpc", method = %call.method, trace_id = field::Empty);

        if let Some(trace_id) = call.metadata.get(TRACE_ID_KEY) {
            span.record("trace_id", trace_id);
        }

        self.inner.handle(call).instrument(span).await
    }
}

tokio::task_local! {
    static EXPERIMENT: Option<String>;
}

/// Returns the experiment tag of the call being dispatched, if any.
///
/// Only meaningful inside a handler served through an [`ExperimentHandler`].
pub fn current_experiment() -> Option<String> {
    EXPERIMENT.try_with(Clone::clone).ok().flatten()
}

/// Propagates the caller's experiment tag to the handler through a
/// task-local, so deeply nested code can branch on it without plumbing.
pub struct ExperimentHandler {
    inner: Arc<dyn Handler>,
}

impl ExperimentHandler {
    pub fn new(inner: Arc<dyn Handler>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Handler for ExperimentHandler {
    async fn handle(&self, call: Call) -> Result<Bytes, Status> {
        let experiment = call.metadata.get(EXPERIMENT_KEY).map(str::to_owned);
        EXPERIMENT.scope(experiment, self.inner.handle(call)).await
    }
}
