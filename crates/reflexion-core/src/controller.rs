use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use reflexion_logging::{LogEvent, LogFormat, Logger};
use reflexion_proxy::{Artifact, CallConfig, InstructionGenerator, RetryPolicy, TaskContext, WorkerProxy};
use reflexion_review::{Critique, CritiqueCategory, ReviewerProxy, Verdict};
use reflexion_store::{
    Attempt, Challenge, ChallengeState, Database, EvaluationRecord, Evaluator, Party, Resolution,
    StoreError, Task, TaskChain, TaskStatus, VerdictKind,
};

use crate::conflict::{ConflictManager, ConflictSettings};
use crate::deadlock::DeadlockDetector;
use crate::error::LoopError;
use crate::improver::Improver;
use crate::outcome::{EscalationReason, TaskOutcome};
use crate::LoopConfig;

/// Invoked for every escalation, before the outcome is returned
pub type EscalationHook = Arc<dyn Fn(&str, EscalationReason, &TaskChain) + Send + Sync>;

enum ChallengeWait {
    Resolved(Resolution),
    Escalated,
    Abandoned,
}

/// Drives one task through the attempt/review loop until a terminal
/// outcome.
///
/// The controller is a sequential state machine per task; all position is
/// reconstructed from durable records on entry, so a crashed run resumes
/// where it stopped. Distinct tasks may run under distinct controllers
/// concurrently; the per-task in-flight flag keeps two controllers off the
/// same task.
pub struct ReflexionController {
    db: Arc<Database>,
    worker: Arc<dyn WorkerProxy>,
    reviewer: Arc<dyn ReviewerProxy>,
    improver: Improver,
    conflicts: ConflictManager,
    evaluator: Arc<Evaluator>,
    detector: DeadlockDetector,
    retry: RetryPolicy,
    config: LoopConfig,
    call_config: CallConfig,
    logger: Arc<Logger>,
    escalation_hook: Option<EscalationHook>,
}

impl ReflexionController {
    pub fn new(
        db: Arc<Database>,
        worker: Arc<dyn WorkerProxy>,
        reviewer: Arc<dyn ReviewerProxy>,
        config: LoopConfig,
    ) -> Self {
        let evaluator = Arc::new(Evaluator::new(Arc::clone(&db), config.pattern_half_life));
        let conflicts = ConflictManager::new(
            Arc::clone(&db),
            Arc::clone(&evaluator),
            ConflictSettings {
                response_window: config.response_window,
                min_pattern_support: config.min_pattern_support,
                consistency_threshold: config.consistency_threshold,
            },
        );
        let retry = RetryPolicy::new(
            config.max_retries,
            config.initial_backoff,
            config.max_backoff,
        );
        Self {
            worker,
            reviewer,
            improver: Improver::new(None, config.pattern_top_k),
            conflicts,
            evaluator,
            detector: DeadlockDetector::new(config.deadlock_window),
            retry,
            call_config: CallConfig::default().with_timeout(config.call_timeout),
            logger: Arc::new(Logger::new(LogFormat::Pretty)),
            escalation_hook: None,
            config,
            db,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn InstructionGenerator>) -> Self {
        self.improver = Improver::new(Some(generator), self.config.pattern_top_k);
        self
    }

    pub fn with_call_config(mut self, call_config: CallConfig) -> Self {
        self.call_config = call_config;
        self
    }

    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_escalation_hook(mut self, hook: EscalationHook) -> Self {
        self.escalation_hook = Some(hook);
        self
    }

    pub fn conflicts(&self) -> &ConflictManager {
        &self.conflicts
    }

    /// Run the task to a terminal outcome. Fails fast with `TaskBusy` when
    /// another controller already holds the task.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskOutcome, LoopError> {
        let task = self
            .db
            .tasks()
            .get(task_id)?
            .ok_or_else(|| LoopError::TaskNotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Open {
            return Err(LoopError::TaskNotOpen {
                id: task_id.to_string(),
                status: task.status.to_string(),
            });
        }
        if !self.db.tasks().claim(task_id)? {
            return Err(LoopError::TaskBusy(task_id.to_string()));
        }

        let result = self.drive(&task).await;
        if let Err(e) = self.db.tasks().release(task_id) {
            warn!(task_id, error = %e, "Failed to release in-flight flag");
        }
        result
    }

    async fn drive(&self, task: &Task) -> Result<TaskOutcome, LoopError> {
        let started = Instant::now();
        let context = TaskContext {
            task_id: task.id.clone(),
            description: task.description.clone(),
            acceptance_criteria: task.criteria_texts(),
        };

        let prior = self.db.attempts().list_for_task(&task.id)?;
        if prior.is_empty() {
            self.logger.log(&LogEvent::TaskStarted {
                task_id: task.id.clone(),
                description: task.description.clone(),
                max_attempts: self.config.max_attempts,
            });
        } else {
            self.logger.log(&LogEvent::TaskResumed {
                task_id: task.id.clone(),
                prior_attempts: prior.len(),
            });
        }

        // A challenge left pending by a previous run blocks new attempts.
        // The pending list is bound first so the store lock is not held
        // across the waits.
        let mut clarification: Option<String> = None;
        let pending = self.db.challenges().pending_for_task(&task.id)?;
        for challenge in pending {
            match self.wait_for_challenge(&task.id, &challenge).await? {
                ChallengeWait::Resolved(resolution) => {
                    clarification = Some(resolution.rationale);
                }
                ChallengeWait::Escalated => {
                    return self
                        .escalate(&task.id, EscalationReason::UnresolvedChallenge)
                        .await;
                }
                ChallengeWait::Abandoned => return self.abandon(&task.id).await,
            }
        }

        loop {
            // Abandon is honored only here, at the attempt boundary
            if self.db.tasks().abandon_requested(&task.id)? {
                return self.abandon(&task.id).await;
            }

            let attempt = match self.next_attempt(task, &mut clarification).await {
                Ok(attempt) => attempt,
                Err(NextAttemptStop::Escalate(reason)) => {
                    return self.escalate(&task.id, reason).await
                }
                Err(NextAttemptStop::Error(e)) => return Err(e),
            };

            self.logger.log(&LogEvent::AttemptStarted {
                task_id: task.id.clone(),
                sequence: attempt.sequence_number,
                instructions_preview: preview(&attempt.instructions_used),
            });

            let artifact = match self.run_worker(&attempt, &context).await {
                Ok(artifact) => artifact,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Worker failed after retries");
                    return self
                        .escalate(&task.id, EscalationReason::InfrastructureFailure)
                        .await;
                }
            };
            self.db
                .attempts()
                .set_artifact_ref(&attempt.id, &artifact.reference())?;
            self.logger.log(&LogEvent::WorkerCompleted {
                sequence: attempt.sequence_number,
                artifact_lines: artifact.content_lines(),
                duration_secs: artifact.duration.as_secs_f64(),
            });

            let verdict = match self
                .retry
                .execute(|| {
                    self.reviewer
                        .evaluate(&context.acceptance_criteria, &artifact, &self.call_config)
                })
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Reviewer failed after retries");
                    return self
                        .escalate(&task.id, EscalationReason::InfrastructureFailure)
                        .await;
                }
            };
            self.logger.log(&LogEvent::ReviewerCompleted {
                sequence: attempt.sequence_number,
                verdict: verdict.short_description(),
            });

            // An abandon recorded while the calls were in flight discards
            // their result before anything is persisted.
            if self.db.tasks().abandon_requested(&task.id)? {
                debug!(task_id = %task.id, "Abandon requested mid-attempt, discarding result");
                return self.abandon(&task.id).await;
            }

            match verdict {
                Verdict::Accepted { summary } => {
                    if let Err(stop) = self.persist_verdict(&attempt, None) {
                        return self.settle_persist_failure(&task.id, stop).await;
                    }
                    self.logger.log(&LogEvent::VerdictRecorded {
                        sequence: attempt.sequence_number,
                        verdict: "accepted".into(),
                    });
                    // Convergence requires every challenge settled
                    let pending = self.db.challenges().pending_for_task(&task.id)?;
                    for challenge in pending {
                        match self.wait_for_challenge(&task.id, &challenge).await? {
                            ChallengeWait::Resolved(_) => {}
                            ChallengeWait::Escalated => {
                                return self
                                    .escalate(&task.id, EscalationReason::UnresolvedChallenge)
                                    .await;
                            }
                            ChallengeWait::Abandoned => return self.abandon(&task.id).await,
                        }
                    }
                    return self.converge(&task.id, summary, started).await;
                }
                Verdict::Rejected {
                    critique: draft,
                    criterion_id,
                } => {
                    let critique = Critique::from_draft(draft, &attempt.id);

                    // A lone minor style nit never blocks convergence: the
                    // verdict goes durable as an accept and the nit is kept
                    // on the dismissal record instead.
                    if !critique.blocks_convergence() {
                        if let Err(stop) = self.persist_verdict(&attempt, None) {
                            return self.settle_persist_failure(&task.id, stop).await;
                        }
                        self.conflicts.dismiss_minor(
                            &task.id,
                            &critique,
                            "minor style-only finding, waved through",
                        )?;
                        self.logger.log(&LogEvent::VerdictRecorded {
                            sequence: attempt.sequence_number,
                            verdict: "accepted (style nit dismissed)".into(),
                        });
                        let summary =
                            format!("accepted with a dismissed style nit: {}", critique.claim);
                        return self.converge(&task.id, summary, started).await;
                    }

                    if let Err(stop) = self.persist_verdict(&attempt, Some(&critique)) {
                        return self.settle_persist_failure(&task.id, stop).await;
                    }
                    self.logger.log(&LogEvent::VerdictRecorded {
                        sequence: attempt.sequence_number,
                        verdict: format!("rejected ({})", critique.category),
                    });

                    if critique.category == CritiqueCategory::AmbiguitySuspected {
                        let challenge = self.conflicts.open_challenge(
                            &task.id,
                            Party::Worker,
                            &critique,
                            criterion_id,
                        )?;
                        self.logger.log(&LogEvent::ChallengeOpened {
                            challenge_id: challenge.id.clone(),
                            claim: critique.claim.clone(),
                        });
                        match self.wait_for_challenge(&task.id, &challenge).await? {
                            ChallengeWait::Resolved(resolution) => {
                                clarification = Some(resolution.rationale);
                            }
                            ChallengeWait::Escalated => {
                                return self
                                    .escalate(&task.id, EscalationReason::UnresolvedChallenge)
                                    .await;
                            }
                            ChallengeWait::Abandoned => return self.abandon(&task.id).await,
                        }
                    }
                }
            }
        }
    }

    /// Build the next attempt: reuse one left pending by a crashed run, or
    /// create a new one after the max-attempts and deadlock gates.
    async fn next_attempt(
        &self,
        task: &Task,
        clarification: &mut Option<String>,
    ) -> Result<Attempt, NextAttemptStop> {
        let attempts = self
            .db
            .attempts()
            .list_for_task(&task.id)
            .map_err(LoopError::from)?;

        if let Some(last) = attempts.last() {
            if last.verdict == VerdictKind::Pending {
                debug!(
                    task_id = %task.id,
                    sequence = last.sequence_number,
                    "Re-running attempt left pending by a previous run"
                );
                return Ok(last.clone());
            }
        }

        if attempts.len() as u32 >= self.config.max_attempts {
            return Err(NextAttemptStop::Escalate(
                EscalationReason::MaxAttemptsExhausted,
            ));
        }

        let critiques = self
            .db
            .attempts()
            .critiques_for_task(&task.id)
            .map_err(LoopError::from)?;
        if self.detector.is_deadlocked(&critiques) {
            self.logger.log(&LogEvent::DeadlockDetected {
                task_id: task.id.clone(),
                window: self.detector.window(),
            });
            return Err(NextAttemptStop::Escalate(EscalationReason::DeadlockDetected));
        }

        let sequence = self
            .db
            .attempts()
            .next_sequence(&task.id)
            .map_err(LoopError::from)?;

        let mut instructions = match critiques.last() {
            None => task.description.clone(),
            Some(latest) => {
                let patterns = self
                    .evaluator
                    .query_patterns(None, self.config.pattern_window)
                    .map_err(LoopError::from)?;
                let revised = self
                    .improver
                    .revise(&task.description, latest, &patterns, &self.call_config)
                    .await;
                self.logger.log(&LogEvent::InstructionsRevised {
                    sequence,
                    generator: "improver".into(),
                    fallback: revised.fallback,
                });
                revised.text
            }
        };
        if let Some(rationale) = clarification.take() {
            instructions = self.improver.fold_clarification(&instructions, &rationale);
        }

        let attempt = Attempt::new(&task.id, sequence, instructions);
        match self.db.attempts().insert(&attempt) {
            Ok(()) => Ok(attempt),
            Err(e) if is_inconsistency(&e) => {
                warn!(task_id = %task.id, error = %e, "Attempt insert violated an invariant");
                Err(NextAttemptStop::Escalate(
                    EscalationReason::InternalInconsistency,
                ))
            }
            Err(e) => Err(NextAttemptStop::Error(e.into())),
        }
    }

    async fn run_worker(
        &self,
        attempt: &Attempt,
        context: &TaskContext,
    ) -> Result<Artifact, reflexion_proxy::ProxyError> {
        self.retry
            .execute(|| {
                self.worker
                    .execute(&attempt.instructions_used, context, &self.call_config)
            })
            .await
    }

    /// Verdict and evaluation record go durable before anything reacts to
    /// them. A duplicate evaluation record (retried write) is logged and
    /// ignored; a conflicting one is an inconsistency.
    fn persist_verdict(
        &self,
        attempt: &Attempt,
        critique: Option<&Critique>,
    ) -> Result<(), NextAttemptStop> {
        let kind = if critique.is_some() {
            VerdictKind::Rejected
        } else {
            VerdictKind::Accepted
        };
        match self.db.attempts().record_verdict(&attempt.id, kind, critique) {
            Ok(()) => {}
            Err(e) if is_inconsistency(&e) => {
                warn!(attempt_id = %attempt.id, error = %e, "Verdict persistence inconsistency");
                return Err(NextAttemptStop::Escalate(
                    EscalationReason::InternalInconsistency,
                ));
            }
            Err(e) => return Err(NextAttemptStop::Error(e.into())),
        }

        match self
            .evaluator
            .record(&EvaluationRecord::verdict(&attempt.id, critique))
        {
            Ok(_) => Ok(()),
            Err(StoreError::DuplicateRecord { attempt_id, kind }) => {
                self.logger
                    .log(&LogEvent::DuplicateRecordIgnored { attempt_id, kind });
                Ok(())
            }
            Err(e) => Err(NextAttemptStop::Error(e.into())),
        }
    }

    async fn settle_persist_failure(
        &self,
        task_id: &str,
        stop: NextAttemptStop,
    ) -> Result<TaskOutcome, LoopError> {
        match stop {
            NextAttemptStop::Escalate(reason) => self.escalate(task_id, reason).await,
            NextAttemptStop::Error(e) => Err(e),
        }
    }

    /// Poll a challenge until it reaches a terminal state. The respond-by
    /// deadline bounds the wait: `expire_overdue` escalates the challenge
    /// once the window passes.
    async fn wait_for_challenge(
        &self,
        task_id: &str,
        challenge: &Challenge,
    ) -> Result<ChallengeWait, LoopError> {
        loop {
            self.conflicts.expire_overdue(Utc::now())?;

            let current = self
                .db
                .challenges()
                .get(&challenge.id)?
                .ok_or_else(|| LoopError::Inconsistency {
                    task_id: task_id.to_string(),
                    detail: format!("challenge {} vanished", challenge.id),
                })?;
            match current.state {
                ChallengeState::Resolved => {
                    let resolution = self.db.challenges().resolution(&challenge.id)?.ok_or_else(
                        || LoopError::Inconsistency {
                            task_id: task_id.to_string(),
                            detail: format!("challenge {} resolved without a resolution", challenge.id),
                        },
                    )?;
                    self.logger.log(&LogEvent::ChallengeResolved {
                        challenge_id: challenge.id.clone(),
                        outcome: resolution.outcome.to_string(),
                        resolved_by: resolution.resolved_by.clone(),
                    });
                    return Ok(ChallengeWait::Resolved(resolution));
                }
                ChallengeState::Escalated => {
                    self.logger.log(&LogEvent::ChallengeEscalated {
                        challenge_id: challenge.id.clone(),
                        reason: "unresolved disagreement".into(),
                    });
                    return Ok(ChallengeWait::Escalated);
                }
                ChallengeState::Open | ChallengeState::Responded => {
                    if self.db.tasks().abandon_requested(task_id)? {
                        return Ok(ChallengeWait::Abandoned);
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn converge(
        &self,
        task_id: &str,
        summary: String,
        started: Instant,
    ) -> Result<TaskOutcome, LoopError> {
        self.db.tasks().set_status(task_id, TaskStatus::Converged)?;
        let chain = self.db.chain(task_id)?;
        let attempts = chain.attempts.len() as u32;
        self.logger.log(&LogEvent::TaskConverged {
            task_id: task_id.to_string(),
            attempts,
            summary: summary.clone(),
            duration_secs: started.elapsed().as_secs_f64(),
        });
        info!(task_id, attempts, "Task converged");
        Ok(TaskOutcome::converged(attempts, summary, chain))
    }

    async fn escalate(
        &self,
        task_id: &str,
        reason: EscalationReason,
    ) -> Result<TaskOutcome, LoopError> {
        self.db.tasks().set_status(task_id, TaskStatus::Escalated)?;
        let chain = self.db.chain(task_id)?;
        let attempts = chain.attempts.len() as u32;
        self.logger.log(&LogEvent::TaskEscalated {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
            attempts,
        });
        if let Some(ref hook) = self.escalation_hook {
            hook(task_id, reason, &chain);
        }
        Ok(TaskOutcome::escalated(attempts, reason, chain))
    }

    async fn abandon(&self, task_id: &str) -> Result<TaskOutcome, LoopError> {
        self.db.tasks().set_status(task_id, TaskStatus::Abandoned)?;
        let chain = self.db.chain(task_id)?;
        let attempts = chain.attempts.len() as u32;
        self.logger.log(&LogEvent::TaskAbandoned {
            task_id: task_id.to_string(),
            attempts,
        });
        Ok(TaskOutcome::abandoned(attempts, chain))
    }
}

enum NextAttemptStop {
    Escalate(EscalationReason),
    Error(LoopError),
}

impl From<LoopError> for NextAttemptStop {
    fn from(e: LoopError) -> Self {
        NextAttemptStop::Error(e)
    }
}

fn is_inconsistency(e: &StoreError) -> bool {
    matches!(
        e,
        StoreError::SequenceGap { .. } | StoreError::InvariantViolation(_)
    )
}

fn preview(s: &str) -> String {
    let first = s.lines().next().unwrap_or_default();
    if first.chars().count() > 80 {
        first.chars().take(80).collect()
    } else {
        first.to_string()
    }
}
