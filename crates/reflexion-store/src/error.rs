use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Idempotency guard: one evaluation record per (attempt, kind)
    #[error("Duplicate evaluation record for attempt {attempt_id} (kind: {kind})")]
    DuplicateRecord { attempt_id: String, kind: String },

    /// Attempt sequence numbers must be gapless; a gap is a bug, not data
    #[error("Sequence gap for task {task_id}: expected {expected}, got {got}")]
    SequenceGap {
        task_id: String,
        expected: u32,
        got: u32,
    },

    #[error("Resolution already recorded for challenge {0}")]
    DuplicateResolution(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
