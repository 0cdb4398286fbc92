use thiserror::Error;

use reflexion_proxy::ProxyError;
use reflexion_review::ReviewError;
use reflexion_store::StoreError;

#[derive(Error, Debug)]
pub enum LoopError {
    /// Another controller already holds the task's in-flight flag
    #[error("Task {0} is already being driven by another controller")]
    TaskBusy(String),

    #[error("Task {id} is {status}, not open")]
    TaskNotOpen { id: String, status: String },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Durable state contradicts itself; the loop must not guess
    #[error("Inconsistent state for task {task_id}: {detail}")]
    Inconsistency { task_id: String, detail: String },

    #[error("Worker call failed: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Review failed: {0}")]
    Review(#[from] ReviewError),

    #[error("Conflict error: {0}")]
    Conflict(#[from] crate::conflict::ConflictError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
