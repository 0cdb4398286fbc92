use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reflexion_review::CritiqueCategory;

/// Lifecycle of a task routed through the review loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    Converged,
    Escalated,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Open)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::Converged => write!(f, "converged"),
            TaskStatus::Escalated => write!(f, "escalated"),
            TaskStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TaskStatus::Open),
            "converged" => Ok(TaskStatus::Converged),
            "escalated" => Ok(TaskStatus::Escalated),
            "abandoned" => Ok(TaskStatus::Abandoned),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// One acceptance criterion the reviewer judges against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub id: String,
    pub text: String,
}

/// One unit of work routed through the review loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub acceptance_criteria: Vec<Criterion>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(description: String, acceptance_criteria: Vec<Criterion>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description,
            acceptance_criteria,
            status: TaskStatus::Open,
            created_at: Utc::now(),
        }
    }

    pub fn criteria_texts(&self) -> Vec<String> {
        self.acceptance_criteria
            .iter()
            .map(|c| c.text.clone())
            .collect()
    }
}

/// Verdict state recorded on an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Pending,
    Accepted,
    Rejected,
}

impl std::fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerdictKind::Pending => write!(f, "pending"),
            VerdictKind::Accepted => write!(f, "accepted"),
            VerdictKind::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for VerdictKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VerdictKind::Pending),
            "accepted" => Ok(VerdictKind::Accepted),
            "rejected" => Ok(VerdictKind::Rejected),
            _ => Err(format!("Unknown verdict: {}", s)),
        }
    }
}

/// One iteration of work-then-review for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub task_id: String,
    /// 1-based, strictly increasing per task with no gaps
    pub sequence_number: u32,
    pub instructions_used: String,
    pub artifact_ref: Option<String>,
    pub verdict: VerdictKind,
    pub critique_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(task_id: &str, sequence_number: u32, instructions_used: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            sequence_number,
            instructions_used,
            artifact_ref: None,
            verdict: VerdictKind::Pending,
            critique_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Which side of the loop an action came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Worker,
    Reviewer,
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Party::Worker => write!(f, "worker"),
            Party::Reviewer => write!(f, "reviewer"),
        }
    }
}

impl std::str::FromStr for Party {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Party::Worker),
            "reviewer" => Ok(Party::Reviewer),
            _ => Err(format!("Unknown party: {}", s)),
        }
    }
}

/// Challenge lifecycle: Open -> Responded -> {Resolved | Escalated}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    Open,
    Responded,
    Resolved,
    Escalated,
}

impl ChallengeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeState::Resolved | ChallengeState::Escalated)
    }
}

impl std::fmt::Display for ChallengeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeState::Open => write!(f, "open"),
            ChallengeState::Responded => write!(f, "responded"),
            ChallengeState::Resolved => write!(f, "resolved"),
            ChallengeState::Escalated => write!(f, "escalated"),
        }
    }
}

impl std::str::FromStr for ChallengeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ChallengeState::Open),
            "responded" => Ok(ChallengeState::Responded),
            "resolved" => Ok(ChallengeState::Resolved),
            "escalated" => Ok(ChallengeState::Escalated),
            _ => Err(format!("Unknown challenge state: {}", s)),
        }
    }
}

/// A formal disagreement raised against a verdict or critique
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub task_id: String,
    pub raised_by: Party,
    pub against_attempt_id: String,
    pub criterion_id: Option<String>,
    pub category: CritiqueCategory,
    pub claim: String,
    pub claim_fingerprint: String,
    pub state: ChallengeState,
    pub opened_at: DateTime<Utc>,
    pub respond_by: DateTime<Utc>,
}

/// Recorded outcome of a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    WorkerWasRight,
    ReviewerWasRight,
    BothPartiallyRight,
    Unresolved,
}

impl std::fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionOutcome::WorkerWasRight => write!(f, "worker_was_right"),
            ResolutionOutcome::ReviewerWasRight => write!(f, "reviewer_was_right"),
            ResolutionOutcome::BothPartiallyRight => write!(f, "both_partially_right"),
            ResolutionOutcome::Unresolved => write!(f, "unresolved"),
        }
    }
}

impl std::str::FromStr for ResolutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker_was_right" => Ok(ResolutionOutcome::WorkerWasRight),
            "reviewer_was_right" => Ok(ResolutionOutcome::ReviewerWasRight),
            "both_partially_right" => Ok(ResolutionOutcome::BothPartiallyRight),
            "unresolved" => Ok(ResolutionOutcome::Unresolved),
            _ => Err(format!("Unknown resolution outcome: {}", s)),
        }
    }
}

/// One party's position on a challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge_id: String,
    pub party: Party,
    pub position: ResolutionOutcome,
    pub rationale: String,
    pub responded_at: DateTime<Utc>,
}

/// The single recorded outcome of a resolved challenge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub challenge_id: String,
    pub outcome: ResolutionOutcome,
    pub rationale: String,
    /// Provenance: "agreement", "pattern", "timeout", "human", ...
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
}

pub(crate) fn parse_enum<T>(value: String) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

pub(crate) fn parse_timestamp(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
