//! Process-wide action registry: uppercase name to handler.
//!
//! Grounded on the teacher's `TaskExecutor` provider cache
//! (`runtime/executor.rs`), which caches `Arc<dyn Provider>` behind a
//! `DashMap` keyed by name; here the map holds the registration itself
//! (handlers are stateless plug-ins, not connection-bearing clients), and
//! lookups happen once per task dispatch via a single process-wide
//! `OnceLock`.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde_json::Value as Json;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::value::{Control, ResultType, Value};

/// The value an action handler produces.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub value: Value,
    pub result_type: ResultType,
    pub control: Control,
}

impl ActionOutcome {
    pub fn new(value: Value, result_type: ResultType) -> Self {
        Self {
            value,
            result_type,
            control: Control::default(),
        }
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.control = control;
        self
    }
}

/// The one interface any action plug-in, control-flow or otherwise, must
/// satisfy (§4.3 / §6).
#[async_trait]
pub trait Action: Send + Sync {
    /// The uppercase name this action is registered under.
    fn name(&self) -> &'static str;

    /// Executes against the already-expanded payload. MUST be
    /// cancellation-aware: long-running handlers should race their work
    /// against `ctx.run`'s token.
    async fn execute(&self, ctx: &ExecutionContext<'_>, payload: &Json) -> Result<ActionOutcome>;

    /// Optional JSON-schema fragment used by the loader to validate a
    /// task's payload before a run ever starts.
    fn json_schema(&self) -> Option<Json> {
        None
    }
}

/// Process-wide registry. Registration is idempotent by name; registering
/// two different handlers under the same name is a programming error.
pub struct ActionRegistry {
    handlers: DashMap<String, Arc<dyn Action>, FxBuildHasher>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Registers `handler` under its uppercased name. Re-registering the
    /// exact same handler instance is a no-op; registering a *different*
    /// handler under an already-occupied name panics, matching spec.md
    /// §4.3 ("duplicate registration with different handlers is a
    /// programming error").
    pub fn register(&self, handler: Arc<dyn Action>) {
        let name = handler.name().to_uppercase();
        if let Some(existing) = self.handlers.get(&name) {
            if !Arc::ptr_eq(&existing, &handler) {
                panic!("action '{name}' already registered with a different handler");
            }
            return;
        }
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.handlers.get(&name.to_uppercase()).map(|h| h.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_uppercase())
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: OnceLock<ActionRegistry> = OnceLock::new();

/// The process-wide registry, lazily initialized and pre-seeded with the
/// built-in control-flow actions on first access.
pub fn global_registry() -> &'static ActionRegistry {
    REGISTRY.get_or_init(|| {
        let registry = ActionRegistry::new();
        crate::actions::register_builtins(&registry);
        registry
    })
}
