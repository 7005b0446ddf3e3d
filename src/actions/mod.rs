//! Built-in action handlers (§4.5–§4.9).

mod evaluate;
mod for_loop;
mod parallel;
mod print;
mod sleep;
mod variables;

use std::sync::Arc;

use crate::registry::ActionRegistry;

pub use evaluate::EvaluateAction;
pub use for_loop::ForAction;
pub use parallel::ParallelAction;
pub use print::PrintAction;
pub use sleep::SleepAction;
pub use variables::VariablesAction;

/// Registers every built-in action. Called once by `global_registry()`.
pub fn register_builtins(registry: &ActionRegistry) {
    registry.register(Arc::new(SleepAction));
    registry.register(Arc::new(VariablesAction));
    registry.register(Arc::new(EvaluateAction));
    registry.register(Arc::new(ParallelAction));
    registry.register(Arc::new(ForAction));
    registry.register(Arc::new(PrintAction));
}
