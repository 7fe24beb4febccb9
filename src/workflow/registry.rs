/// Process-wide workflow function registry
///
/// Maps stable workflow names to callable bodies. Populated once at
/// startup through the runtime builder, consulted by the execution engine
/// and the recovery subsystem alike: recovery re-binds a persisted name to
/// code through this map, and a name with no binding fails recovery with
/// NotRegistered rather than being silently dropped.
///
/// Uses ArcSwap for lock-free reads; registration swaps the whole map.

use arc_swap::ArcSwap;
use serde_json::Value;
use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use crate::workflow::context::WorkflowContext;

/// Boxed future returned by a workflow body.
pub type WorkflowFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A registered workflow body: an async function of (context, input).
///
/// Implemented for any `Fn(WorkflowContext, Value) -> WorkflowFuture`, so
/// registration takes an ordinary closure that boxes its async block.
pub trait WorkflowFn: Send + Sync {
    fn call(&self, ctx: WorkflowContext, input: Value) -> WorkflowFuture;
}

impl<F> WorkflowFn for F
where
    F: Fn(WorkflowContext, Value) -> WorkflowFuture + Send + Sync,
{
    fn call(&self, ctx: WorkflowContext, input: Value) -> WorkflowFuture {
        (self)(ctx, input)
    }
}

/// Opaque handle returned by registration; used for invocation instead of
/// raw name strings.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    name: String,
}

impl RegisteredWorkflow {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lock-free name → body registry.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: ArcSwap<HashMap<String, Arc<dyn WorkflowFn>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Bind a name to a workflow body. Names must be unique; registering
    /// the same name twice is a startup bug, not a hot-reload.
    pub fn register(
        &self,
        name: impl Into<String>,
        body: Arc<dyn WorkflowFn>,
    ) -> anyhow::Result<RegisteredWorkflow> {
        let name = name.into();
        let current = self.workflows.load();
        if current.contains_key(&name) {
            anyhow::bail!("workflow '{}' is already registered", name);
        }
        let mut next = (**current).clone();
        next.insert(name.clone(), body);
        self.workflows.store(Arc::new(next));
        tracing::debug!("registered workflow '{}'", name);
        Ok(RegisteredWorkflow { name })
    }

    /// Resolve a name to its body (lock-free read).
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn WorkflowFn>> {
        self.workflows.load().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.load().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.workflows.load().keys().cloned().collect()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_body() -> Arc<dyn WorkflowFn> {
        Arc::new(|_ctx: WorkflowContext, input: Value| -> WorkflowFuture {
            Box::pin(async move { Ok(input) })
        })
    }

    #[test]
    fn registration_resolves_and_rejects_duplicates() {
        let registry = WorkflowRegistry::new();
        let handle = registry.register("echo", noop_body()).expect("register");
        assert_eq!(handle.name(), "echo");
        assert!(registry.resolve("echo").is_some());
        assert!(registry.resolve("missing").is_none());
        assert!(registry.register("echo", noop_body()).is_err());
    }
}
