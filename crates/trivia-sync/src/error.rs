use thiserror::Error;
use trivia_adapters::AdapterError;
use trivia_core::EntityKind;

/// Fatal reconciliation failures. None are retried; the run is re-executed after the data is fixed.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("ambiguous {kind} match for key `{key}`: candidate ids {candidate_ids:?}")]
    AmbiguousMatch {
        kind: EntityKind,
        key: String,
        candidate_ids: Vec<i64>,
    },
    #[error("{referenced_by} references missing {kind} id {id}")]
    UnresolvedReference {
        kind: EntityKind,
        id: i64,
        referenced_by: String,
    },
    #[error("duplicate {kind} identity: {detail}")]
    DuplicateIdentity { kind: EntityKind, detail: String },
    #[error("fetch failed: {0}")]
    Fetch(#[from] AdapterError),
    #[error("invalid rules: {0}")]
    InvalidRules(String),
}

pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;
