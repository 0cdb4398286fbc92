//! Full audit chain for a task: everything a caller or a human decision
//! maker needs to see, in one serializable value.

use serde::{Deserialize, Serialize};

use reflexion_review::Critique;

use crate::{
    Attempt, Challenge, ChallengeResponse, Database, Resolution, StoreError, Task,
};

/// The complete history of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskChain {
    pub task: Task,
    pub attempts: Vec<Attempt>,
    pub critiques: Vec<Critique>,
    pub challenges: Vec<Challenge>,
    pub responses: Vec<ChallengeResponse>,
    pub resolutions: Vec<Resolution>,
}

impl TaskChain {
    /// Short single-line summary for logs and escalation messages
    pub fn summary(&self) -> String {
        format!(
            "task {} [{}]: {} attempt(s), {} critique(s), {} challenge(s), {} resolution(s)",
            self.task.id,
            self.task.status,
            self.attempts.len(),
            self.critiques.len(),
            self.challenges.len(),
            self.resolutions.len(),
        )
    }
}

pub(crate) fn assemble(db: &Database, task_id: &str) -> Result<TaskChain, StoreError> {
    let task = db
        .tasks()
        .get(task_id)?
        .ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))?;
    let attempts = db.attempts().list_for_task(task_id)?;
    let critiques = db.attempts().critiques_for_task(task_id)?;
    let challenges = db.challenges().list_for_task(task_id)?;
    let mut responses = Vec::new();
    for challenge in &challenges {
        responses.extend(db.challenges().responses(&challenge.id)?);
    }
    let resolutions = db.challenges().resolutions_for_task(task_id)?;

    Ok(TaskChain {
        task,
        attempts,
        critiques,
        challenges,
        responses,
        resolutions,
    })
}
