use indexmap::IndexMap;
use shared::{FieldKey, GroupId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("init requests form a cycle: {}", .0.join(" -> "))]
    InitRequestCycle(Vec<String>),

    #[error("init request `{request}` depends on unknown request `{dependency}`")]
    UnknownInitRequest { request: String, dependency: String },

    #[error("form has {} invalid field(s)", .errors.len())]
    Invalid {
        errors: IndexMap<FieldKey, Vec<String>>,
    },

    #[error("submit handler failed: {0:#}")]
    Submit(anyhow::Error),

    #[error("no field request registered for `{0}`")]
    UnknownFieldRequest(FieldKey),

    #[error("unknown group `{0}`")]
    UnknownGroup(GroupId),

    #[error("row {row} is out of range for group `{group}` with {total} row(s)")]
    RowOutOfRange {
        group: GroupId,
        row: usize,
        total: usize,
    },

    #[error("store has been destroyed")]
    Destroyed,
}

pub type StoreResult<T> = Result<T, StoreError>;
