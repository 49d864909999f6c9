use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::frame::Metadata;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Internal,
    Unimplemented,
    InvalidArgument,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Internal => 1,
            StatusCode::Unimplemented => 2,
            StatusCode::InvalidArgument => 3,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            2 => StatusCode::Unimplemented,
            3 => StatusCode::InvalidArgument,
            _ => StatusCode::Internal,
        }
    }
}

/// Error surface returned to the remote caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rpc status {code:?}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Internal,
            message: message.into(),
        }
    }

    pub fn unimplemented(method: &str) -> Self {
        Self {
            code: StatusCode::Unimplemented,
            message: format!("unknown method: {method}"),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::InvalidArgument,
            message: message.into(),
        }
    }
}

/// A single dispatched invocation.
#[derive(Debug)]
pub struct Call {
    pub method: String,
    pub metadata: Metadata,
    pub payload: Bytes,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, call: Call) -> Result<Bytes, Status>;
}

/// Routing table from stable method names to handlers.
///
/// Populated during startup; registration after the owning server started
/// serving is undefined behavior as far as in-flight dispatch is concerned.
pub struct Mux {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Mux {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn Handler>) -> Result<(), Error> {
        let method = method.into();
        let mut handlers = self.handlers.write();

        if handlers.contains_key(&method) {
            return Err(Error::DuplicateMethod { method });
        }

        handlers.insert(method, handler);
        Ok(())
    }

    fn lookup(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(method).map(Arc::clone)
    }
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Mux {
    async fn handle(&self, call: Call) -> Result<Bytes, Status> {
        match self.lookup(&call.method) {
            Some(handler) => handler.handle(call).await,
            None => Err(Status::unimplemented(&call.method)),
        }
    }
}

/// Adapts an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
{
    struct FnHandler<F>(F);

    #[async_trait]
    impl<F, Fut> Handler for FnHandler<F>
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, Status>> + Send + 'static,
    {
        async fn handle(&self, call: Call) -> Result<Bytes, Status> {
            (self.0)(call).await
        }
    }

    Arc::new(FnHandler(f))
}
