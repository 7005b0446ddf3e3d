//! `${...}` placeholder expansion (§4.2).
//!
//! Grounded on the teacher's `binding/template.rs`: a precompiled regex
//! scans for placeholders, a `Cow`-free full-string fast path swaps in a
//! variable's native typed value, and anything else is stringified and
//! spliced. Unlike the teacher's `{{use.alias.path}}` grammar (which binds
//! against a single resolved-input map), FlowK's placeholders resolve
//! against either the live variable store or a completed task's result,
//! so the inner-content parser here branches on a `from.task:` prefix.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value as Json};

use crate::error::{FlowError, Result};
use crate::expansion::jsonpath;
use crate::store::{ResultStore, TaskStatus};
use crate::value::Value;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\s*([^}]+?)\s*\}").unwrap())
}

enum Ref {
    Variable(String),
    TaskStatus(String),
    TaskSuccess(String),
    TaskResultPath(String, String),
}

fn parse_ref(inner: &str) -> Ref {
    if let Some(rest) = inner.strip_prefix("from.task:") {
        if let Some(dot) = rest.find('.') {
            let task_id = rest[..dot].to_string();
            let field = &rest[dot + 1..];
            if field == "status" {
                return Ref::TaskStatus(task_id);
            }
            if field == "success" {
                return Ref::TaskSuccess(task_id);
            }
            if let Some(path) = field.strip_prefix("result$.") {
                return Ref::TaskResultPath(task_id, path.to_string());
            }
            if field == "result$" {
                return Ref::TaskResultPath(task_id, String::new());
            }
        }
    }
    Ref::Variable(inner.to_string())
}

/// Resolves one placeholder reference to its native typed value, expanding
/// any placeholders nested inside a variable's own stored string value.
/// `stack` guards against self-referential variables (§9 cycle detection).
fn resolve_ref(
    reference: &Ref,
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
    stack: &mut Vec<String>,
) -> Result<Value> {
    match reference {
        Ref::Variable(name) => {
            if stack.iter().any(|s| s == name) {
                return Err(FlowError::Cycle { name: name.clone() });
            }
            let value = variables
                .get(name)
                .cloned()
                .ok_or_else(|| FlowError::Undefined { name: name.clone() })?;
            match value {
                Value::String(s) if placeholder_re().is_match(&s) => {
                    stack.push(name.clone());
                    let expanded = expand_string(&s, variables, results, stack)?;
                    stack.pop();
                    Ok(expanded)
                }
                other => Ok(other),
            }
        }
        Ref::TaskStatus(task_id) => {
            let result = results
                .get(task_id)
                .ok_or_else(|| FlowError::Undefined {
                    name: format!("from.task:{task_id}.status"),
                })?;
            let status = match result.status {
                TaskStatus::Success => "success",
                TaskStatus::Failed(_) => "failed",
            };
            Ok(Value::String(status.to_string()))
        }
        Ref::TaskSuccess(task_id) => {
            let result = results
                .get(task_id)
                .ok_or_else(|| FlowError::Undefined {
                    name: format!("from.task:{task_id}.success"),
                })?;
            Ok(Value::Bool(result.is_success()))
        }
        Ref::TaskResultPath(task_id, path) => {
            let result = results
                .get(task_id)
                .ok_or_else(|| FlowError::Undefined {
                    name: format!("from.task:{task_id}.result$.{path}"),
                })?;
            let json = result.value.to_json_unmasked();
            let resolved = jsonpath::resolve(&json, path, task_id)?;
            match resolved {
                Some(j) => Ok(Value::from_json_raw(j)),
                None => Err(FlowError::JsonPath {
                    task_id: task_id.clone(),
                    path: path.clone(),
                    detail: "path did not resolve to a value".to_string(),
                }),
            }
        }
    }
}

/// Expands all placeholders in `s`. If `s` is exactly one placeholder, the
/// referenced value's native type is preserved; otherwise every placeholder
/// is stringified (true value, not masked — masking is a display concern
/// applied by PRINT/event rendering, not by expansion itself) and spliced.
pub fn expand_string(
    s: &str,
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
    stack: &mut Vec<String>,
) -> Result<Value> {
    let re = placeholder_re();

    if let Some(full) = re.captures(s) {
        if full.get(0).unwrap().as_str() == s {
            let reference = parse_ref(full.get(1).unwrap().as_str());
            return resolve_ref(&reference, variables, results, stack);
        }
    }

    if !re.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let m = caps.get(0).unwrap();
        out.push_str(&s[last..m.start()]);
        let reference = parse_ref(caps.get(1).unwrap().as_str());
        let value = resolve_ref(&reference, variables, results, stack)?;
        out.push_str(&value.display_unmasked());
        last = m.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Recursively expands a JSON payload: strings are expanded, arrays and
/// objects are walked structurally (§4.2 "Recursion").
pub fn expand_json(
    json: &Json,
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
) -> Result<Json> {
    let mut stack = Vec::new();
    expand_json_inner(json, variables, results, &mut stack)
}

fn expand_json_inner(
    json: &Json,
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
    stack: &mut Vec<String>,
) -> Result<Json> {
    match json {
        Json::String(s) => {
            let value = expand_string(s, variables, results, stack)?;
            Ok(value.to_json_unmasked())
        }
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_json_inner(item, variables, results, stack)?);
            }
            Ok(Json::Array(out))
        }
        Json::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_json_inner(v, variables, results, stack)?);
            }
            Ok(Json::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Expands a JSON object's fields except those named in `exclude`, which
/// are carried through verbatim (the PARALLEL `tasks` / EVALUATE
/// `if_conditions` carve-out of §4.2).
pub fn expand_object_excluding(
    map: &Map<String, Json>,
    exclude: &[&str],
    variables: &BTreeMap<String, Value>,
    results: &ResultStore,
) -> Result<Map<String, Json>> {
    let mut out = Map::with_capacity(map.len());
    for (k, v) in map {
        if exclude.contains(&k.as_str()) {
            out.insert(k.clone(), v.clone());
        } else {
            out.insert(k.clone(), expand_json(v, variables, results)?);
        }
    }
    Ok(out)
}
