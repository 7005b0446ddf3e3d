//! A minimal JSONPath subset for `result$.<jsonpath>` queries (§4.2).
//!
//! Supports `a.b.c`, `a[0].b`, and bare numeric segments as array indices
//! (`items.0`). Deliberately does not support filters, wildcards, or
//! slices — the grammar this engine exposes is the same restricted subset
//! the teacher crate's own `jsonpath.rs` implements for task-output
//! lookups, just without the leading `$.` requirement being mandatory.

use serde_json::Value as Json;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
}

fn parse(path: &str, task_id: &str) -> Result<Vec<Segment>> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() || path == "$" {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for raw in path.split('.') {
        if raw.is_empty() {
            continue;
        }
        // field[idx] or field[idx][idx2]...
        if let Some(bracket) = raw.find('[') {
            let (field, rest) = raw.split_at(bracket);
            if !field.is_empty() {
                segments.push(Segment::Field(field.to_string()));
            }
            let mut rest = rest;
            while let Some(close) = rest.find(']') {
                let idx_str = &rest[1..close];
                let idx: usize = idx_str.parse().map_err(|_| FlowError::JsonPath {
                    task_id: task_id.to_string(),
                    path: path.to_string(),
                    detail: format!("invalid array index '{idx_str}'"),
                })?;
                segments.push(Segment::Index(idx));
                rest = &rest[close + 1..];
            }
        } else if let Ok(idx) = raw.parse::<usize>() {
            segments.push(Segment::Index(idx));
        } else {
            segments.push(Segment::Field(raw.to_string()));
        }
    }
    Ok(segments)
}

fn apply(value: &Json, segments: &[Segment]) -> Option<Json> {
    let mut current = value.clone();
    for seg in segments {
        current = match (seg, &current) {
            (Segment::Field(name), Json::Object(map)) => map.get(name)?.clone(),
            (Segment::Index(idx), Json::Array(items)) => items.get(*idx)?.clone(),
            _ => return None,
        };
    }
    Some(current)
}

/// Resolves `path` (e.g. `items[0].name` or empty for the whole result)
/// against `value`, returning `None` when any segment doesn't exist.
pub fn resolve(value: &Json, path: &str, task_id: &str) -> Result<Option<Json>> {
    let segments = parse(path, task_id)?;
    Ok(apply(value, &segments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_field() {
        let v = json!({"a": {"b": {"c": 42}}});
        assert_eq!(resolve(&v, "a.b.c", "t").unwrap(), Some(json!(42)));
    }

    #[test]
    fn resolves_array_index() {
        let v = json!({"items": [{"name": "x"}, {"name": "y"}]});
        assert_eq!(
            resolve(&v, "items[0].name", "t").unwrap(),
            Some(json!("x"))
        );
    }

    #[test]
    fn resolves_bare_numeric_segment_as_index() {
        let v = json!({"items": ["x", "y"]});
        assert_eq!(resolve(&v, "items.1", "t").unwrap(), Some(json!("y")));
    }

    #[test]
    fn missing_path_returns_none() {
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, "b.c", "t").unwrap(), None);
    }

    #[test]
    fn empty_path_returns_whole_value() {
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, "", "t").unwrap(), Some(v));
    }

    #[test]
    fn invalid_index_errors() {
        let v = json!({"items": [1, 2]});
        assert!(resolve(&v, "items[x]", "t").is_err());
    }
}
