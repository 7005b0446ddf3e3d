//! Error types for the FlowK execution engine.
//!
//! Codes are grouped by subsystem, `[FLOWK-0NN]`:
//! - 000-019 load/parse
//! - 020-039 expansion
//! - 040-059 action dispatch
//! - 060-079 control flow
//! - 080-099 cancellation / stop

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("[FLOWK-000] failed to decode flow JSON: {detail}")]
    Decode { detail: String },

    #[error("[FLOWK-001] import not found: {path}")]
    ImportMissing { path: String },

    #[error("[FLOWK-002] duplicate task id after import resolution: {id}")]
    DuplicateId { id: String },

    #[error("[FLOWK-003] unknown action: {action}")]
    UnknownAction { action: String },

    #[error("[FLOWK-004] task '{task_id}' failed schema validation: {detail}")]
    Schema { task_id: String, detail: String },

    #[error("[FLOWK-020] undefined reference: {name}")]
    Undefined { name: String },

    #[error("[FLOWK-021] cycle detected while expanding: {name}")]
    Cycle { name: String },

    #[error("[FLOWK-022] jsonpath error resolving '{path}' on task '{task_id}': {detail}")]
    JsonPath {
        task_id: String,
        path: String,
        detail: String,
    },

    #[error("[FLOWK-023] type mismatch expanding '{name}': {detail}")]
    TypeMismatch { name: String, detail: String },

    #[error("[FLOWK-040] action '{action}' failed on task '{task_id}': {source}")]
    Action {
        task_id: String,
        action: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("[FLOWK-041] variable '{name}' already declared (set overwrite=true)")]
    Redeclare { name: String },

    #[error("[FLOWK-042] variable '{name}' is not a number variable")]
    NotNumber { name: String },

    #[error("[FLOWK-043] sleep of {seconds}s exceeds the configured ceiling of {ceiling}s")]
    SleepCeilingExceeded { seconds: f64, ceiling: f64 },

    #[error("[FLOWK-060] jump target not found: {task_id}")]
    JumpTargetMissing { task_id: String },

    #[error("[FLOWK-061] break encountered outside a FOR frame")]
    BreakOutsideLoop,

    #[error("[FLOWK-062] FOR loop required a break but none occurred")]
    RequiredBreakMissing,

    #[error("[FLOWK-063] invalid branch in EVALUATE: {detail}")]
    InvalidBranch { detail: String },

    #[error("[FLOWK-080] PARALLEL merge conflict on variable '{variable}'")]
    MergeConflict { variable: String },

    #[error("[FLOWK-081] run was cancelled")]
    Cancelled,

    #[error("[FLOWK-082] stop was requested")]
    StopRequested,

    #[error("[FLOWK-090] configuration error: {reason}")]
    Config { reason: String },
}

impl FlowError {
    /// The stable `[FLOWK-0NN]` prefix, useful for host-side categorization.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "FLOWK-000",
            Self::ImportMissing { .. } => "FLOWK-001",
            Self::DuplicateId { .. } => "FLOWK-002",
            Self::UnknownAction { .. } => "FLOWK-003",
            Self::Schema { .. } => "FLOWK-004",
            Self::Undefined { .. } => "FLOWK-020",
            Self::Cycle { .. } => "FLOWK-021",
            Self::JsonPath { .. } => "FLOWK-022",
            Self::TypeMismatch { .. } => "FLOWK-023",
            Self::Action { .. } => "FLOWK-040",
            Self::Redeclare { .. } => "FLOWK-041",
            Self::NotNumber { .. } => "FLOWK-042",
            Self::SleepCeilingExceeded { .. } => "FLOWK-043",
            Self::JumpTargetMissing { .. } => "FLOWK-060",
            Self::BreakOutsideLoop => "FLOWK-061",
            Self::RequiredBreakMissing => "FLOWK-062",
            Self::InvalidBranch { .. } => "FLOWK-063",
            Self::MergeConflict { .. } => "FLOWK-080",
            Self::Cancelled => "FLOWK-081",
            Self::StopRequested => "FLOWK-082",
            Self::Config { .. } => "FLOWK-090",
        }
    }

    /// Task id this failure should be attributed to, when applicable.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Schema { task_id, .. }
            | Self::JsonPath { task_id, .. }
            | Self::Action { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
