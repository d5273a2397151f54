use crate::types::{LoanId, UnitId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {field} {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Integrity violation on unit {unit_id}: open loans {loan_ids:?}")]
    IntegrityViolation { unit_id: UnitId, loan_ids: Vec<LoanId> },

    #[error("Run '{run_id}' not initialized")]
    RunNotInitialized { run_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SimResult<T> = Result<T, SimError>;
