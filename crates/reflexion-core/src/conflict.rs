//! Challenge lifecycle: structured disagreement between worker and
//! reviewer, resolved by agreement, by precedent, or by a human after
//! escalation.
//!
//! State machine: Open -> Responded -> {Resolved | Escalated}. Terminal
//! transitions go through the store's guarded UPDATE so they fire exactly
//! once even when two drivers race.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use reflexion_review::{claim_fingerprint, Critique, Severity};
use reflexion_store::{
    Challenge, ChallengeResponse, ChallengeState, Database, EvaluationRecord, Evaluator, Party,
    Resolution, ResolutionOutcome, StoreError,
};

#[derive(Error, Debug)]
pub enum ConflictError {
    #[error("Challenge not found: {0}")]
    NotFound(String),

    #[error("Challenge {0} is already {1}")]
    AlreadyTerminal(String, ChallengeState),

    #[error("Only minor critiques may be dismissed without a response; critique {0} is {1}")]
    NotMinor(String, Severity),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a recorded position led to
#[derive(Debug)]
pub enum ResponseOutcome {
    /// The counter-party has not spoken yet
    AwaitingCounterparty,
    /// Both parties spoke and the challenge settled
    Resolved(Resolution),
    /// Both parties spoke, disagreed, and precedent was inconclusive
    Escalated,
}

/// Settings the conflict manager needs from the loop configuration
#[derive(Debug, Clone, Copy)]
pub struct ConflictSettings {
    pub response_window: std::time::Duration,
    pub min_pattern_support: usize,
    pub consistency_threshold: f64,
}

pub struct ConflictManager {
    db: Arc<Database>,
    evaluator: Arc<Evaluator>,
    settings: ConflictSettings,
}

impl ConflictManager {
    pub fn new(db: Arc<Database>, evaluator: Arc<Evaluator>, settings: ConflictSettings) -> Self {
        Self {
            db,
            evaluator,
            settings,
        }
    }

    /// Open a challenge against a critique's claim. The respond-by
    /// deadline starts now.
    pub fn open_challenge(
        &self,
        task_id: &str,
        raised_by: Party,
        critique: &Critique,
        criterion_id: Option<String>,
    ) -> Result<Challenge, ConflictError> {
        let now = Utc::now();
        let respond_by = now
            + chrono::Duration::from_std(self.settings.response_window)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            raised_by,
            against_attempt_id: critique.attempt_id.clone(),
            criterion_id,
            category: critique.category,
            claim: critique.claim.clone(),
            claim_fingerprint: claim_fingerprint(&critique.claim),
            state: ChallengeState::Open,
            opened_at: now,
            respond_by,
        };
        self.db.challenges().open(&challenge)?;
        info!(
            challenge_id = %challenge.id,
            task_id,
            category = %challenge.category,
            "Challenge opened"
        );
        Ok(challenge)
    }

    /// Record one party's position. Once both parties have spoken the
    /// challenge settles: agreement resolves it directly; disagreement
    /// consults precedent; an unsettled disagreement escalates.
    pub fn respond(
        &self,
        challenge_id: &str,
        party: Party,
        position: ResolutionOutcome,
        rationale: &str,
    ) -> Result<ResponseOutcome, ConflictError> {
        let challenge = self.load(challenge_id)?;
        if challenge.state.is_terminal() {
            return Err(ConflictError::AlreadyTerminal(
                challenge_id.to_string(),
                challenge.state,
            ));
        }

        self.db.challenges().record_response(&ChallengeResponse {
            challenge_id: challenge_id.to_string(),
            party,
            position,
            rationale: rationale.to_string(),
            responded_at: Utc::now(),
        })?;
        self.db.challenges().transition(
            challenge_id,
            &[ChallengeState::Open],
            ChallengeState::Responded,
        )?;
        debug!(challenge_id, party = %party, position = %position, "Position recorded");

        let responses = self.db.challenges().responses(challenge_id)?;
        let worker = responses.iter().find(|r| r.party == Party::Worker);
        let reviewer = responses.iter().find(|r| r.party == Party::Reviewer);
        let (Some(worker), Some(reviewer)) = (worker, reviewer) else {
            return Ok(ResponseOutcome::AwaitingCounterparty);
        };

        if worker.position == reviewer.position {
            let rationale = format!(
                "Both parties agree. Worker: {} Reviewer: {}",
                worker.rationale, reviewer.rationale
            );
            return self
                .resolve(&challenge, worker.position, &rationale, "agreement")
                .map(ResponseOutcome::Resolved);
        }

        self.settle_disagreement(&challenge)
    }

    /// Dismiss a minor critique with a justification, without waiting for
    /// the counter-party. Produces an auto-resolved challenge so the
    /// dismissal is part of the durable record.
    pub fn dismiss_minor(
        &self,
        task_id: &str,
        critique: &Critique,
        justification: &str,
    ) -> Result<Resolution, ConflictError> {
        if critique.severity != Severity::Minor {
            return Err(ConflictError::NotMinor(
                critique.id.clone(),
                critique.severity,
            ));
        }
        let challenge = self.open_challenge(task_id, Party::Worker, critique, None)?;
        self.resolve(
            &challenge,
            ResolutionOutcome::WorkerWasRight,
            justification,
            "minor_dismissal",
        )
    }

    /// Escalate every challenge past its respond-by deadline. The guarded
    /// transition makes this idempotent: a challenge already settled by a
    /// concurrent driver is skipped. Returns ids of challenges escalated
    /// by this call.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<String>, ConflictError> {
        let mut escalated = Vec::new();
        // Bind first: an accessor temporary in the loop head would hold the
        // connection lock across the body.
        let overdue = self.db.challenges().overdue(now)?;
        for challenge in overdue {
            let transitioned = self.db.challenges().transition(
                &challenge.id,
                &[ChallengeState::Open, ChallengeState::Responded],
                ChallengeState::Escalated,
            )?;
            if !transitioned {
                continue;
            }
            warn!(challenge_id = %challenge.id, task_id = %challenge.task_id, "Challenge timed out");
            self.record_terminal(
                &challenge,
                ResolutionOutcome::Unresolved,
                "No resolution before the response deadline",
                "timeout",
            )?;
            escalated.push(challenge.id);
        }
        Ok(escalated)
    }

    fn settle_disagreement(
        &self,
        challenge: &Challenge,
    ) -> Result<ResponseOutcome, ConflictError> {
        let stats = self
            .evaluator
            .outcome_consistency(challenge.category, challenge.criterion_id.as_deref())?;

        if let Some(stats) = stats {
            if stats.support >= self.settings.min_pattern_support
                && stats.consistency >= self.settings.consistency_threshold
            {
                let rationale = format!(
                    "{} of {} prior analogous resolutions ended {}",
                    (stats.consistency * stats.support as f64).round() as usize,
                    stats.support,
                    stats.majority
                );
                return self
                    .resolve(challenge, stats.majority, &rationale, "pattern")
                    .map(ResponseOutcome::Resolved);
            }
            debug!(
                challenge_id = %challenge.id,
                support = stats.support,
                consistency = stats.consistency,
                "Precedent too weak to settle disagreement"
            );
        }

        let transitioned = self.db.challenges().transition(
            &challenge.id,
            &[ChallengeState::Open, ChallengeState::Responded],
            ChallengeState::Escalated,
        )?;
        if transitioned {
            info!(challenge_id = %challenge.id, "Disagreement escalated for a human");
            self.record_terminal(
                challenge,
                ResolutionOutcome::Unresolved,
                "Parties disagree and precedent is inconclusive",
                "escalated",
            )?;
        } else if let Some(resolution) = self.db.challenges().resolution(&challenge.id)? {
            // A concurrent driver settled it first
            if resolution.outcome != ResolutionOutcome::Unresolved {
                return Ok(ResponseOutcome::Resolved(resolution));
            }
        }
        Ok(ResponseOutcome::Escalated)
    }

    fn resolve(
        &self,
        challenge: &Challenge,
        outcome: ResolutionOutcome,
        rationale: &str,
        resolved_by: &str,
    ) -> Result<Resolution, ConflictError> {
        let transitioned = self.db.challenges().transition(
            &challenge.id,
            &[ChallengeState::Open, ChallengeState::Responded],
            ChallengeState::Resolved,
        )?;
        if !transitioned {
            let state = self.load(&challenge.id)?.state;
            return Err(ConflictError::AlreadyTerminal(challenge.id.clone(), state));
        }
        let resolution = self.record_terminal(challenge, outcome, rationale, resolved_by)?;
        info!(
            challenge_id = %challenge.id,
            outcome = %outcome,
            resolved_by,
            "Challenge resolved"
        );
        Ok(resolution)
    }

    /// Persist the resolution row and append it to the evaluation log.
    /// A duplicate evaluation record means a concurrent driver got there
    /// first; the history already holds the truth, so it is ignored.
    fn record_terminal(
        &self,
        challenge: &Challenge,
        outcome: ResolutionOutcome,
        rationale: &str,
        resolved_by: &str,
    ) -> Result<Resolution, ConflictError> {
        let resolution = Resolution {
            challenge_id: challenge.id.clone(),
            outcome,
            rationale: rationale.to_string(),
            resolved_by: resolved_by.to_string(),
            resolved_at: Utc::now(),
        };
        self.db.challenges().record_resolution(&resolution)?;

        let record = EvaluationRecord::challenge_resolution(challenge, &resolution);
        match self.evaluator.record(&record) {
            Ok(_) => {}
            Err(StoreError::DuplicateRecord { attempt_id, kind }) => {
                debug!(attempt_id, kind, "Duplicate evaluation record ignored");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(resolution)
    }

    fn load(&self, challenge_id: &str) -> Result<Challenge, ConflictError> {
        self.db
            .challenges()
            .get(challenge_id)?
            .ok_or_else(|| ConflictError::NotFound(challenge_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflexion_review::CritiqueCategory;
    use reflexion_store::{RecordKind, Task, TaskStatus};

    fn manager(db: Arc<Database>) -> ConflictManager {
        let evaluator = Arc::new(Evaluator::new(
            Arc::clone(&db),
            std::time::Duration::from_secs(7 * 24 * 3600),
        ));
        ConflictManager::new(
            db,
            evaluator,
            ConflictSettings {
                response_window: std::time::Duration::from_secs(600),
                min_pattern_support: 3,
                consistency_threshold: 0.8,
            },
        )
    }

    fn seed_task(db: &Database) -> Task {
        let task = Task::new("demo".into(), vec![]);
        db.tasks().create(&task).unwrap();
        task
    }

    fn seed_attempt(db: &Database, task_id: &str) -> String {
        let attempt = reflexion_store::Attempt::new(task_id, 1, "do it".into());
        db.attempts().insert(&attempt).unwrap();
        attempt.id
    }

    fn critique(attempt_id: &str, severity: Severity) -> Critique {
        Critique {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            category: CritiqueCategory::AmbiguitySuspected,
            severity,
            claim: "criterion two is ambiguous".into(),
            detail: "Could mean the API or the CLI surface.".into(),
            suggestion: None,
        }
    }

    #[test]
    fn agreement_resolves_with_one_resolution() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let task = seed_task(&db);
        let attempt_id = seed_attempt(&db, &task.id);
        let mgr = manager(Arc::clone(&db));

        let challenge = mgr
            .open_challenge(
                &task.id,
                Party::Worker,
                &critique(&attempt_id, Severity::Major),
                Some("C-2".into()),
            )
            .unwrap();

        let pending = mgr
            .respond(
                &challenge.id,
                Party::Worker,
                ResolutionOutcome::WorkerWasRight,
                "the criterion names the API",
            )
            .unwrap();
        assert!(matches!(pending, ResponseOutcome::AwaitingCounterparty));

        let outcome = mgr
            .respond(
                &challenge.id,
                Party::Reviewer,
                ResolutionOutcome::WorkerWasRight,
                "agreed on rereading",
            )
            .unwrap();
        let ResponseOutcome::Resolved(resolution) = outcome else {
            panic!("expected a resolution, got {:?}", outcome);
        };
        assert_eq!(resolution.outcome, ResolutionOutcome::WorkerWasRight);
        assert_eq!(resolution.resolved_by, "agreement");

        let stored = db.challenges().get(&challenge.id).unwrap().unwrap();
        assert_eq!(stored.state, ChallengeState::Resolved);

        // A third response is refused
        let err = mgr
            .respond(
                &challenge.id,
                Party::Worker,
                ResolutionOutcome::ReviewerWasRight,
                "changed my mind",
            )
            .unwrap_err();
        assert!(matches!(err, ConflictError::AlreadyTerminal(_, _)));
    }

    #[test]
    fn disagreement_without_precedent_escalates() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let task = seed_task(&db);
        let attempt_id = seed_attempt(&db, &task.id);
        let mgr = manager(Arc::clone(&db));

        let challenge = mgr
            .open_challenge(
                &task.id,
                Party::Worker,
                &critique(&attempt_id, Severity::Major),
                Some("C-2".into()),
            )
            .unwrap();
        mgr.respond(
            &challenge.id,
            Party::Worker,
            ResolutionOutcome::WorkerWasRight,
            "reads fine to me",
        )
        .unwrap();
        let settled = mgr
            .respond(
                &challenge.id,
                Party::Reviewer,
                ResolutionOutcome::ReviewerWasRight,
                "still ambiguous",
            )
            .unwrap();
        assert!(matches!(settled, ResponseOutcome::Escalated));

        let stored = db.challenges().get(&challenge.id).unwrap().unwrap();
        assert_eq!(stored.state, ChallengeState::Escalated);
    }

    #[test]
    fn strong_precedent_settles_a_disagreement() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let task = seed_task(&db);
        let attempt_id = seed_attempt(&db, &task.id);
        let mgr = manager(Arc::clone(&db));
        let evaluator = Evaluator::new(Arc::clone(&db), std::time::Duration::from_secs(600));

        // Three prior analogous challenges all ended worker_was_right
        for i in 0..3 {
            let payload = serde_json::json!({
                "category": CritiqueCategory::AmbiguitySuspected,
                "criterion_id": "C-2",
                "outcome": ResolutionOutcome::WorkerWasRight,
            });
            evaluator
                .record(&EvaluationRecord::new(
                    &format!("prior-{}", i),
                    RecordKind::ChallengeResolution,
                    payload,
                ))
                .unwrap();
        }

        let challenge = mgr
            .open_challenge(
                &task.id,
                Party::Worker,
                &critique(&attempt_id, Severity::Major),
                Some("C-2".into()),
            )
            .unwrap();
        mgr.respond(
            &challenge.id,
            Party::Worker,
            ResolutionOutcome::WorkerWasRight,
            "same reading as always",
        )
        .unwrap();
        let outcome = mgr
            .respond(
                &challenge.id,
                Party::Reviewer,
                ResolutionOutcome::ReviewerWasRight,
                "disagree",
            )
            .unwrap();
        let ResponseOutcome::Resolved(resolution) = outcome else {
            panic!("expected precedent to settle, got {:?}", outcome);
        };
        assert_eq!(resolution.outcome, ResolutionOutcome::WorkerWasRight);
        assert_eq!(resolution.resolved_by, "pattern");
    }

    #[test]
    fn overdue_challenges_escalate_exactly_once() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let task = seed_task(&db);
        let attempt_id = seed_attempt(&db, &task.id);
        let mgr = manager(Arc::clone(&db));

        let challenge = mgr
            .open_challenge(
                &task.id,
                Party::Worker,
                &critique(&attempt_id, Severity::Major),
                None,
            )
            .unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        let first = mgr.expire_overdue(later).unwrap();
        assert_eq!(first, vec![challenge.id.clone()]);

        let second = mgr.expire_overdue(later).unwrap();
        assert!(second.is_empty());

        let resolution = db.challenges().resolution(&challenge.id).unwrap().unwrap();
        assert_eq!(resolution.resolved_by, "timeout");
        assert_eq!(resolution.outcome, ResolutionOutcome::Unresolved);
    }

    #[test]
    fn minor_critique_dismisses_without_counterparty() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let task = seed_task(&db);
        let attempt_id = seed_attempt(&db, &task.id);
        let mgr = manager(Arc::clone(&db));

        let resolution = mgr
            .dismiss_minor(
                &task.id,
                &critique(&attempt_id, Severity::Minor),
                "style preference, not a defect",
            )
            .unwrap();
        assert_eq!(resolution.outcome, ResolutionOutcome::WorkerWasRight);
        assert_eq!(resolution.resolved_by, "minor_dismissal");

        let err = mgr
            .dismiss_minor(
                &task.id,
                &critique(&attempt_id, Severity::Major),
                "nope",
            )
            .unwrap_err();
        assert!(matches!(err, ConflictError::NotMinor(_, _)));

        // Tasks stay open; dismissal only settles the critique dispute
        assert_eq!(
            db.tasks().get(&task.id).unwrap().unwrap().status,
            TaskStatus::Open
        );
    }
}
