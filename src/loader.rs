//! Flow loader: JSON parsing, import inlining, action/schema validation.
//!
//! Grounded on the teacher's `ast/workflow.rs` two-stage
//! `WorkflowRaw -> Workflow` deserialize: a thin raw struct captures the
//! known envelope fields plus `#[serde(flatten)]` for everything else,
//! and a second pass builds the typed, validated structure the engine
//! actually runs against.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value as Json};

use crate::error::{FlowError, Result};
use crate::registry::ActionRegistry;

#[derive(Debug, Clone, Deserialize)]
struct RawFlow {
    id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    imports: Vec<String>,
    tasks: Vec<RawTask>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTask {
    id: String,
    action: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(flatten)]
    fields: Map<String, Json>,
}

/// A task as produced by the loader: envelope fields pulled out, everything
/// else (action-specific) kept as an open JSON mapping on `fields`.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub action: String,
    pub description: Option<String>,
    pub fields: Map<String, Json>,
}

impl Task {
    /// The task's payload as a single JSON object, `id`/`action`/
    /// `description` stripped, suitable for expansion and handler dispatch.
    pub fn payload(&self) -> Json {
        Json::Object(self.fields.clone())
    }
}

/// A fully resolved, immutable flow ready to run.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: String,
    pub description: String,
    pub tasks: Vec<Task>,
    pub source_file_name: Option<String>,
}

impl Flow {
    pub fn task_index(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }
}

/// Parses a flow from an in-memory JSON string with no import resolution;
/// useful for nested `PARALLEL`/`FOR` task lists that are already inline.
pub fn parse_flow_json(content: &str) -> Result<Flow> {
    let raw: RawFlow = serde_json::from_str(content).map_err(|e| FlowError::Decode {
        detail: e.to_string(),
    })?;
    build_flow(raw, None, &[])
}

/// Loads a flow from disk, recursively inlining `imports` and validating
/// every task's action against `registry`.
pub async fn load_flow_file(path: impl AsRef<Path>, registry: &ActionRegistry) -> Result<Flow> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| FlowError::Decode {
            detail: format!("reading {}: {e}", path.display()),
        })?;
    let raw: RawFlow = serde_json::from_str(&content).map_err(|e| FlowError::Decode {
        detail: e.to_string(),
    })?;

    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut seen: HashSet<String> = raw.tasks.iter().map(|t| t.id.clone()).collect();
    let mut imported = Vec::new();
    for import_path in &raw.imports {
        let resolved = resolve_import(&base_dir, import_path, &mut seen).await?;
        imported.extend(resolved);
    }

    let mut flow = build_flow(raw, Some(path.display().to_string()), &[])?;
    imported.extend(flow.tasks);
    flow.tasks = imported;

    validate_actions(&flow, registry)?;
    Ok(flow)
}

async fn resolve_import(
    base_dir: &Path,
    import_path: &str,
    seen: &mut HashSet<String>,
) -> Result<Vec<Task>> {
    let full_path: PathBuf = base_dir.join(import_path);
    let content = tokio::fs::read_to_string(&full_path)
        .await
        .map_err(|_| FlowError::ImportMissing {
            path: import_path.to_string(),
        })?;
    let raw: RawFlow = serde_json::from_str(&content).map_err(|e| FlowError::Decode {
        detail: format!("in import {import_path}: {e}"),
    })?;

    let alias = full_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| import_path.to_string());

    let nested_base = full_path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut out = Vec::new();
    for nested_import in &raw.imports {
        out.extend(Box::pin(resolve_import(&nested_base, nested_import, seen)).await?);
    }

    for raw_task in raw.tasks {
        let mut id = raw_task.id.clone();
        if seen.contains(&id) {
            id = format!("{alias}.{id}");
        }
        if !seen.insert(id.clone()) {
            return Err(FlowError::DuplicateId { id });
        }
        out.push(Task {
            id,
            action: raw_task.action,
            description: raw_task.description,
            fields: raw_task.fields,
        });
    }
    Ok(out)
}

fn build_flow(raw: RawFlow, source_file_name: Option<String>, _exclude: &[&str]) -> Result<Flow> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(raw.tasks.len());
    for raw_task in raw.tasks {
        if !seen.insert(raw_task.id.clone()) {
            return Err(FlowError::DuplicateId { id: raw_task.id });
        }
        tasks.push(Task {
            id: raw_task.id,
            action: raw_task.action,
            description: raw_task.description,
            fields: raw_task.fields,
        });
    }
    Ok(Flow {
        id: raw.id,
        description: raw.description,
        tasks,
        source_file_name,
    })
}

/// Parses a raw `tasks: [...]` JSON array (the PARALLEL/FOR body carve-out)
/// into loader `Task`s, without flow-level import resolution or schema
/// validation — those already happened for the enclosing flow.
pub(crate) fn parse_tasks_array(json: &Json) -> Result<Vec<Task>> {
    let items = json.as_array().ok_or_else(|| FlowError::Decode {
        detail: "expected 'tasks' to be an array".to_string(),
    })?;
    let mut tasks = Vec::with_capacity(items.len());
    let mut seen = HashSet::new();
    for item in items {
        let raw: RawTask = serde_json::from_value(item.clone()).map_err(|e| FlowError::Decode {
            detail: e.to_string(),
        })?;
        if !seen.insert(raw.id.clone()) {
            return Err(FlowError::DuplicateId { id: raw.id });
        }
        tasks.push(Task {
            id: raw.id,
            action: raw.action,
            description: raw.description,
            fields: raw.fields,
        });
    }
    Ok(tasks)
}

fn validate_actions(flow: &Flow, registry: &ActionRegistry) -> Result<()> {
    for task in &flow.tasks {
        if !registry.contains(&task.action) {
            return Err(FlowError::UnknownAction {
                action: task.action.clone(),
            });
        }
        if let Some(handler) = registry.get(&task.action) {
            if let Some(schema) = handler.json_schema() {
                let compiled = jsonschema::validator_for(&schema).map_err(|e| FlowError::Schema {
                    task_id: task.id.clone(),
                    detail: format!("invalid schema for action '{}': {e}", task.action),
                })?;
                let payload = task.payload();
                if let Err(err) = compiled.validate(&payload) {
                    return Err(FlowError::Schema {
                        task_id: task.id.clone(),
                        detail: err.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::register_builtins;

    fn registry() -> ActionRegistry {
        let registry = ActionRegistry::new();
        register_builtins(&registry);
        registry
    }

    #[test]
    fn parses_minimal_flow() {
        let json = r#"{"id":"f1","description":"d","tasks":[{"id":"t1","action":"PRINT","entries":[]}]}"#;
        let flow = parse_flow_json(json).unwrap();
        assert_eq!(flow.id, "f1");
        assert_eq!(flow.tasks.len(), 1);
        assert_eq!(flow.tasks[0].action, "PRINT");
    }

    #[test]
    fn duplicate_task_ids_fail() {
        let json = r#"{"id":"f1","description":"d","tasks":[
            {"id":"t1","action":"PRINT","entries":[]},
            {"id":"t1","action":"PRINT","entries":[]}
        ]}"#;
        let err = parse_flow_json(json).unwrap_err();
        assert!(matches!(err, FlowError::DuplicateId { .. }));
    }

    #[test]
    fn unknown_action_fails_validation() {
        let json = r#"{"id":"f1","description":"d","tasks":[{"id":"t1","action":"NOT_REAL"}]}"#;
        let flow = parse_flow_json(json).unwrap();
        let err = validate_actions(&flow, &registry()).unwrap_err();
        assert!(matches!(err, FlowError::UnknownAction { .. }));
    }

    #[test]
    fn unknown_fields_are_captured_on_payload() {
        let json = r#"{"id":"f1","description":"d","tasks":[{"id":"t1","action":"SLEEP","seconds":2}]}"#;
        let flow = parse_flow_json(json).unwrap();
        assert_eq!(flow.tasks[0].payload()["seconds"], 2);
    }

    #[tokio::test]
    async fn loads_and_inlines_imports() {
        let dir = tempfile::tempdir().unwrap();
        let sub_path = dir.path().join("sub.json");
        tokio::fs::write(
            &sub_path,
            r#"{"id":"sub","description":"d","tasks":[{"id":"t1","action":"PRINT","entries":[]}]}"#,
        )
        .await
        .unwrap();
        let main_path = dir.path().join("main.json");
        tokio::fs::write(
            &main_path,
            r#"{"id":"main","description":"d","imports":["sub.json"],"tasks":[{"id":"t2","action":"PRINT","entries":[]}]}"#,
        )
        .await
        .unwrap();

        let flow = load_flow_file(&main_path, &registry()).await.unwrap();
        assert_eq!(flow.tasks.len(), 2);
        assert_eq!(flow.tasks[0].id, "t1");
        assert_eq!(flow.tasks[1].id, "t2");
    }

    #[tokio::test]
    async fn missing_import_fails() {
        let dir = tempfile::tempdir().unwrap();
        let main_path = dir.path().join("main.json");
        tokio::fs::write(
            &main_path,
            r#"{"id":"main","description":"d","imports":["missing.json"],"tasks":[]}"#,
        )
        .await
        .unwrap();
        let err = load_flow_file(&main_path, &registry()).await.unwrap_err();
        assert!(matches!(err, FlowError::ImportMissing { .. }));
    }

    #[tokio::test]
    async fn colliding_import_ids_get_alias_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let sub_path = dir.path().join("sub.json");
        tokio::fs::write(
            &sub_path,
            r#"{"id":"sub","description":"d","tasks":[{"id":"t1","action":"PRINT","entries":[]}]}"#,
        )
        .await
        .unwrap();
        let main_path = dir.path().join("main.json");
        tokio::fs::write(
            &main_path,
            r#"{"id":"main","description":"d","imports":["sub.json"],"tasks":[{"id":"t1","action":"PRINT","entries":[]}]}"#,
        )
        .await
        .unwrap();

        let flow = load_flow_file(&main_path, &registry()).await.unwrap();
        assert_eq!(flow.tasks.len(), 2);
        assert_eq!(flow.tasks[0].id, "sub.t1");
        assert_eq!(flow.tasks[1].id, "t1");
    }
}
