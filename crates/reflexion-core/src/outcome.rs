use serde::{Deserialize, Serialize};

use reflexion_store::TaskChain;

/// Why a task left the loop without converging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The same critique recurred across the whole deadlock window
    DeadlockDetected,
    MaxAttemptsExhausted,
    /// A challenge escalated and took the task with it
    UnresolvedChallenge,
    /// A collaborator kept failing after retries; not a content dispute
    InfrastructureFailure,
    /// Durable state contradicted itself
    InternalInconsistency,
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationReason::DeadlockDetected => write!(f, "deadlock_detected"),
            EscalationReason::MaxAttemptsExhausted => write!(f, "max_attempts_exhausted"),
            EscalationReason::UnresolvedChallenge => write!(f, "unresolved_challenge"),
            EscalationReason::InfrastructureFailure => write!(f, "infrastructure_failure"),
            EscalationReason::InternalInconsistency => write!(f, "internal_inconsistency"),
        }
    }
}

/// Terminal result of `run_task`. Always carries the full audit chain so
/// a human picking up an escalation sees everything that happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Converged {
        attempts: u32,
        summary: String,
        chain: TaskChain,
    },
    Escalated {
        attempts: u32,
        reason: EscalationReason,
        chain: TaskChain,
    },
    Abandoned {
        attempts: u32,
        chain: TaskChain,
    },
}

impl TaskOutcome {
    pub fn converged(attempts: u32, summary: String, chain: TaskChain) -> Self {
        TaskOutcome::Converged {
            attempts,
            summary,
            chain,
        }
    }

    pub fn escalated(attempts: u32, reason: EscalationReason, chain: TaskChain) -> Self {
        TaskOutcome::Escalated {
            attempts,
            reason,
            chain,
        }
    }

    pub fn abandoned(attempts: u32, chain: TaskChain) -> Self {
        TaskOutcome::Abandoned { attempts, chain }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, TaskOutcome::Converged { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            TaskOutcome::Converged { attempts, .. }
            | TaskOutcome::Escalated { attempts, .. }
            | TaskOutcome::Abandoned { attempts, .. } => *attempts,
        }
    }

    pub fn chain(&self) -> &TaskChain {
        match self {
            TaskOutcome::Converged { chain, .. }
            | TaskOutcome::Escalated { chain, .. }
            | TaskOutcome::Abandoned { chain, .. } => chain,
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            TaskOutcome::Converged { .. } => 0,
            TaskOutcome::Escalated { .. } => 1,
            TaskOutcome::Abandoned { .. } => 130,
        }
    }
}
