//! Placeholder expansion: `${var}`, `${from.task:TID...}`, and the minimal
//! JSONPath grammar `result$.<jsonpath>` uses to dig into task results.

pub mod jsonpath;
pub mod template;

pub use template::{expand_json, expand_object_excluding, expand_string};
