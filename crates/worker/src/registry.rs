//! Handler registration: the name → handler mapping the worker dispatches
//! through.
//!
//! Feature modules contribute their handlers at startup; the builder
//! collects them and freezes into an immutable registry that is passed by
//! reference into the worker loop. No ambient/global lookup, so tests can
//! inject a fake registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// A job handler.
///
/// Handlers own their payload schema: the queue hands over the parsed JSON
/// value and the handler deserializes whatever it expects. Returning `Err`
/// requeues the job (until its attempts run out); handlers are expected to
/// complete or fail, a handler that never returns stalls its worker slot.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job name this handler processes (e.g. `sitemap.generate`).
    fn name(&self) -> &str;

    async fn execute(&self, payload: Value) -> anyhow::Result<()>;
}

/// A handler that completes immediately. Placeholder wiring and tests.
#[derive(Debug, Default, Clone)]
pub struct NoOpHandler {
    name: String,
}

impl NoOpHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _payload: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Immutable name → handler mapping, built once before the loop starts.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Collects handlers from feature modules, then freezes.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl RegistryBuilder {
    /// Register one handler. Re-registering a name replaces the previous
    /// handler (last registration wins); the collision is logged.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Self {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(job_name = %name, "handler re-registered, last registration wins");
        }
        self
    }

    /// Register a module's handler list.
    pub fn register_all(mut self, handlers: impl IntoIterator<Item = Arc<dyn JobHandler>>) -> Self {
        for handler in handlers {
            self = self.register(handler);
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers),
        }
    }
}
