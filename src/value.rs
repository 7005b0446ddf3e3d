//! Typed values: variables, task results, and the coercions between them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{FlowError, Result};

/// A fully-resolved, typed value flowing through variables and task results.
///
/// `Secret` is a distinct variant (not a flag on `String`) so every
/// serialization and logging call site is forced to decide how to handle it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Secret(String),
    Proxy(ProxyMap),
    Null,
}

/// Normalized proxy configuration: scheme name to proxy URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyMap {
    pub http: Option<String>,
    pub https: Option<String>,
    pub no: Option<String>,
}

impl Value {
    pub fn is_secret(&self) -> bool {
        matches!(self, Value::Secret(_))
    }

    /// Stringifies per §4.2: strings pass through, numbers/bools use their
    /// natural textual form, arrays/maps serialize to canonical JSON.
    /// Secrets render masked — callers that need the true value for an
    /// outgoing payload must match `Value::Secret` directly instead.
    pub fn display_masked(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
            Value::Secret(_) => "****".to_string(),
            Value::Null => "null".to_string(),
            Value::Array(_) | Value::Object(_) | Value::Proxy(_) => {
                serde_json::to_string(&self.to_json_masked()).unwrap_or_default()
            }
        }
    }

    /// The true stringified value, secrets included — used when splicing
    /// into an outgoing action payload rather than a log or PRINT entry.
    pub fn display_unmasked(&self) -> String {
        match self {
            Value::Secret(s) => s.clone(),
            other => other.display_masked_internal_for_unmask(),
        }
    }

    fn display_masked_internal_for_unmask(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Number(n) => format_number(*n),
            Value::Bool(b) => b.to_string(),
            Value::Null => "null".to_string(),
            Value::Secret(s) => s.clone(),
            Value::Array(_) | Value::Object(_) | Value::Proxy(_) => {
                serde_json::to_string(&self.to_json_unmasked()).unwrap_or_default()
            }
        }
    }

    pub fn to_json_unmasked(&self) -> Json {
        match self {
            Value::String(s) => Json::String(s.clone()),
            Value::Secret(s) => Json::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Bool(b) => Json::Bool(*b),
            Value::Null => Json::Null,
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json_unmasked).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_unmasked()))
                    .collect(),
            ),
            Value::Proxy(p) => serde_json::to_value(p).unwrap_or(Json::Null),
        }
    }

    pub fn to_json_masked(&self) -> Json {
        match self {
            Value::Secret(_) => Json::String("****".to_string()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json_masked).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_masked()))
                    .collect(),
            ),
            other => other.to_json_unmasked(),
        }
    }

    /// Construct from a decoded JSON value and a declared variable type,
    /// applying the coercion rules of §4.6.
    pub fn coerce(json: Json, declared: &str) -> Result<Value> {
        match declared {
            "string" => Ok(Value::String(json_to_plain_string(&json))),
            "secret" => Ok(Value::Secret(json_to_plain_string(&json))),
            "number" => coerce_number(&json),
            "bool" => match json {
                Json::Bool(b) => Ok(Value::Bool(b)),
                Json::String(s) => s
                    .parse::<bool>()
                    .map(Value::Bool)
                    .map_err(|_| FlowError::TypeMismatch {
                        name: "<bool coercion>".into(),
                        detail: format!("cannot parse '{s}' as bool"),
                    }),
                other => Err(FlowError::TypeMismatch {
                    name: "<bool coercion>".into(),
                    detail: format!("cannot coerce {other} to bool"),
                }),
            },
            "array" => match json {
                Json::Array(items) => Ok(Value::Array(
                    items.into_iter().map(Value::from_json_raw).collect(),
                )),
                other => Err(FlowError::TypeMismatch {
                    name: "<array coercion>".into(),
                    detail: format!("expected array, got {other}"),
                }),
            },
            "object" => match json {
                Json::Object(map) => Ok(Value::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Value::from_json_raw(v)))
                        .collect(),
                )),
                other => Err(FlowError::TypeMismatch {
                    name: "<object coercion>".into(),
                    detail: format!("expected object, got {other}"),
                }),
            },
            "proxy" => {
                let p: ProxyMap = serde_json::from_value(json).map_err(|e| FlowError::TypeMismatch {
                    name: "<proxy coercion>".into(),
                    detail: e.to_string(),
                })?;
                Ok(Value::Proxy(p))
            }
            other => Err(FlowError::TypeMismatch {
                name: "<declared type>".into(),
                detail: format!("unknown variable type '{other}'"),
            }),
        }
    }

    /// Converts an already-typed JSON value into `Value` without coercion,
    /// preserving native shape (used for array/object element values and for
    /// task-result decoding).
    pub fn from_json_raw(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from_json_raw).collect()),
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json_raw(v)))
                    .collect(),
            ),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_masked())
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn json_to_plain_string(json: &Json) -> String {
    match json {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        Json::Bool(b) => b.to_string(),
        Json::Null => String::new(),
        other => other.to_string(),
    }
}

fn coerce_number(json: &Json) -> Result<Value> {
    match json {
        Json::Number(n) => Ok(Value::Number(n.as_f64().unwrap_or(0.0))),
        Json::String(s) => s
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| FlowError::TypeMismatch {
                name: "<number coercion>".into(),
                detail: format!("cannot parse '{s}' as number"),
            }),
        other => Err(FlowError::TypeMismatch {
            name: "<number coercion>".into(),
            detail: format!("cannot coerce {other} to number"),
        }),
    }
}

/// Closed result-type enumeration (spec.md §9 design note: a closed
/// enumeration is preferable to free-form strings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Bool,
    Float,
    Int,
    String,
    Json,
}

impl ResultType {
    pub fn wire_str(&self) -> &'static str {
        match self {
            ResultType::Bool => "bool",
            ResultType::Float => "float",
            ResultType::Int => "int",
            ResultType::String => "string",
            ResultType::Json => "json",
        }
    }
}

/// A control directive attached to a task result by control-flow actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Control {
    pub jump_to_task_id: Option<String>,
    pub exit: bool,
    pub break_loop: bool,
}

impl Control {
    pub fn is_empty(&self) -> bool {
        self.jump_to_task_id.is_none() && !self.exit && !self.break_loop
    }
}

/// A variable declared by `VARIABLES` and held in the flow-scoped store.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub value: Value,
}

/// Validates the variable-name grammar from spec.md §3: `[A-Za-z0-9_.\-]+`.
pub fn is_valid_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_masks_but_unmasks_on_demand() {
        let v = Value::Secret("s3cr3t".into());
        assert_eq!(v.display_masked(), "****");
        assert_eq!(v.display_unmasked(), "s3cr3t");
    }

    #[test]
    fn number_coercion_accepts_numeric_strings() {
        let v = Value::coerce(Json::String("42".into()), "number").unwrap();
        assert_eq!(v, Value::Number(42.0));
    }

    #[test]
    fn number_coercion_rejects_non_numeric_strings() {
        let err = Value::coerce(Json::String("nope".into()), "number").unwrap_err();
        assert!(matches!(err, FlowError::TypeMismatch { .. }));
    }

    #[test]
    fn variable_name_grammar() {
        assert!(is_valid_variable_name("a.b-c_1"));
        assert!(!is_valid_variable_name(""));
        assert!(!is_valid_variable_name("a b"));
    }

    #[test]
    fn array_values_stringify_as_canonical_json() {
        let v = Value::Array(vec![Value::Number(1.0), Value::String("x".into())]);
        assert_eq!(v.display_masked(), r#"[1,"x"]"#);
    }
}
