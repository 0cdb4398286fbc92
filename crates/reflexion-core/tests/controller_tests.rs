//! End-to-end loop tests with scripted in-memory collaborators.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reflexion_core::{
    ConflictManager, ConflictSettings, EscalationReason, LoopConfig, LoopError,
    ReflexionController, TaskOutcome,
};
use reflexion_proxy::{Artifact, CallConfig, ProxyError, TaskContext, WorkerProxy};
use reflexion_review::{
    CritiqueCategory, CritiqueDraft, ReviewError, ReviewerProxy, Severity, Verdict,
};
use reflexion_store::{
    Criterion, Database, EvaluationRecord, Evaluator, Party, RecordKind, ResolutionOutcome, Task,
    TaskStatus, VerdictKind,
};

fn artifact(content: &str) -> Artifact {
    Artifact::new(content.into(), HashMap::new(), Duration::from_millis(10))
}

fn rejection(claim: &str, category: CritiqueCategory, criterion_id: Option<&str>) -> Verdict {
    Verdict::Rejected {
        critique: CritiqueDraft {
            category,
            severity: Severity::Major,
            claim: claim.into(),
            detail: format!("{}.", claim),
            suggestion: None,
        },
        criterion_id: criterion_id.map(String::from),
    }
}

fn accepted() -> Verdict {
    Verdict::Accepted {
        summary: "all criteria met".into(),
    }
}

struct ScriptedWorker {
    calls: AtomicUsize,
    delay: Duration,
}

impl ScriptedWorker {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
        }
    }
}

#[async_trait]
impl WorkerProxy for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted-worker"
    }

    async fn execute(
        &self,
        _instructions: &str,
        _context: &TaskContext,
        _config: &CallConfig,
    ) -> Result<Artifact, ProxyError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(artifact(&format!("artifact for call {}", n)))
    }
}

struct FailingWorker;

#[async_trait]
impl WorkerProxy for FailingWorker {
    fn name(&self) -> &str {
        "failing-worker"
    }

    async fn execute(
        &self,
        _instructions: &str,
        _context: &TaskContext,
        _config: &CallConfig,
    ) -> Result<Artifact, ProxyError> {
        Err(ProxyError::Unavailable("worker backend down".into()))
    }
}

struct ScriptedReviewer {
    script: Mutex<VecDeque<Verdict>>,
}

impl ScriptedReviewer {
    fn new(verdicts: Vec<Verdict>) -> Self {
        Self {
            script: Mutex::new(verdicts.into()),
        }
    }
}

#[async_trait]
impl ReviewerProxy for ScriptedReviewer {
    fn name(&self) -> &str {
        "scripted-reviewer"
    }

    async fn evaluate(
        &self,
        _criteria: &[String],
        _artifact: &Artifact,
        _config: &CallConfig,
    ) -> Result<Verdict, ReviewError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProxyError::Unavailable("script exhausted".into()).into())
    }
}

fn fast_config() -> LoopConfig {
    LoopConfig {
        max_retries: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        poll_interval: Duration::from_millis(5),
        response_window: Duration::from_secs(5),
        ..LoopConfig::default()
    }
}

fn seed_task(db: &Database) -> Task {
    let task = Task::new(
        "Implement the pager".into(),
        vec![Criterion {
            id: "C-1".into(),
            text: "every page is reachable".into(),
        }],
    );
    db.tasks().create(&task).unwrap();
    task
}

fn conflict_manager(db: &Arc<Database>, config: &LoopConfig) -> ConflictManager {
    let evaluator = Arc::new(Evaluator::new(Arc::clone(db), config.pattern_half_life));
    ConflictManager::new(
        Arc::clone(db),
        evaluator,
        ConflictSettings {
            response_window: config.response_window,
            min_pattern_support: config.min_pattern_support,
            consistency_threshold: config.consistency_threshold,
        },
    )
}

#[tokio::test]
async fn rejections_until_the_budget_runs_out_escalate() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let escalations: Arc<Mutex<Vec<EscalationReason>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&escalations);

    let config = LoopConfig {
        max_attempts: 3,
        ..fast_config()
    };
    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![
            rejection("missing pagination", CritiqueCategory::ImplementationDefect, None),
            rejection("last page dropped", CritiqueCategory::ImplementationDefect, None),
            rejection("page size ignored", CritiqueCategory::RequirementGap, None),
        ])),
        config,
    )
    .with_escalation_hook(Arc::new(move |_, reason, _| {
        seen.lock().unwrap().push(reason);
    }));

    let outcome = controller.run_task(&task.id).await.unwrap();
    let TaskOutcome::Escalated {
        attempts,
        reason,
        chain,
    } = outcome
    else {
        panic!("expected escalation");
    };
    assert_eq!(attempts, 3);
    assert_eq!(reason, EscalationReason::MaxAttemptsExhausted);
    assert_eq!(chain.task.status, TaskStatus::Escalated);

    // Sequences are gapless and every verdict is settled
    let sequences: Vec<u32> = chain.attempts.iter().map(|a| a.sequence_number).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
    assert!(chain.attempts.iter().all(|a| a.verdict == VerdictKind::Rejected));
    assert_eq!(chain.critiques.len(), 3);

    assert_eq!(
        *escalations.lock().unwrap(),
        vec![EscalationReason::MaxAttemptsExhausted]
    );
}

#[tokio::test]
async fn a_lone_minor_style_nit_is_dismissed_and_converges() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![Verdict::Rejected {
            critique: CritiqueDraft {
                category: CritiqueCategory::StyleOnly,
                severity: Severity::Minor,
                claim: "prefer iterators over index loops".into(),
                detail: "The loop in the pager would read better as an iterator chain.".into(),
                suggestion: None,
            },
            criterion_id: None,
        }])),
        fast_config(),
    );

    let outcome = controller.run_task(&task.id).await.unwrap();
    let TaskOutcome::Converged {
        attempts,
        summary,
        chain,
    } = outcome
    else {
        panic!("expected convergence");
    };
    assert_eq!(attempts, 1);
    assert!(summary.contains("prefer iterators"));
    assert_eq!(chain.attempts[0].verdict, VerdictKind::Accepted);

    // The nit itself survives on the auto-dismissal record
    assert_eq!(chain.resolutions.len(), 1);
    assert_eq!(chain.resolutions[0].resolved_by, "minor_dismissal");
    assert_eq!(chain.resolutions[0].outcome, ResolutionOutcome::WorkerWasRight);
}

#[tokio::test]
async fn ambiguity_challenge_agreed_then_second_attempt_converges() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);
    let config = fast_config();
    let conflicts = conflict_manager(&db, &config);

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![
            rejection(
                "criterion one is ambiguous about reachability",
                CritiqueCategory::AmbiguitySuspected,
                Some("C-1"),
            ),
            accepted(),
        ])),
        config,
    );

    let responder = async {
        let challenge = loop {
            let pending = db.challenges().pending_for_task(&task.id).unwrap();
            if let Some(c) = pending.into_iter().next() {
                break c;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        conflicts
            .respond(
                &challenge.id,
                Party::Worker,
                ResolutionOutcome::WorkerWasRight,
                "reachable means linked from the index page",
            )
            .unwrap();
        conflicts
            .respond(
                &challenge.id,
                Party::Reviewer,
                ResolutionOutcome::WorkerWasRight,
                "agreed after rereading",
            )
            .unwrap();
    };

    let (outcome, _) = tokio::join!(controller.run_task(&task.id), responder);
    let outcome = outcome.unwrap();
    assert!(outcome.is_converged());
    assert_eq!(outcome.attempts(), 2);

    let chain = outcome.chain();
    assert_eq!(chain.task.status, TaskStatus::Converged);
    assert_eq!(chain.attempts.last().unwrap().verdict, VerdictKind::Accepted);
    assert!(chain
        .challenges
        .iter()
        .all(|c| c.state.is_terminal()));

    // The resolution rationale is folded into the second attempt
    assert!(chain.attempts[1]
        .instructions_used
        .contains("linked from the index page"));
    assert_eq!(chain.resolutions.len(), 1);
    assert_eq!(chain.resolutions[0].resolved_by, "agreement");
}

#[tokio::test]
async fn strong_precedent_settles_a_dispute_without_escalating() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);
    let config = fast_config();
    let conflicts = conflict_manager(&db, &config);

    // Three prior analogous disputes all ended in the worker's favor
    let evaluator = Evaluator::new(Arc::clone(&db), config.pattern_half_life);
    for i in 0..3 {
        evaluator
            .record(&EvaluationRecord::new(
                &format!("prior-{}", i),
                RecordKind::ChallengeResolution,
                serde_json::json!({
                    "category": CritiqueCategory::AmbiguitySuspected,
                    "criterion_id": "C-1",
                    "outcome": ResolutionOutcome::WorkerWasRight,
                }),
            ))
            .unwrap();
    }

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![
            rejection(
                "criterion one is ambiguous about reachability",
                CritiqueCategory::AmbiguitySuspected,
                Some("C-1"),
            ),
            accepted(),
        ])),
        config,
    );

    let responder = async {
        let challenge = loop {
            let pending = db.challenges().pending_for_task(&task.id).unwrap();
            if let Some(c) = pending.into_iter().next() {
                break c;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        conflicts
            .respond(
                &challenge.id,
                Party::Worker,
                ResolutionOutcome::WorkerWasRight,
                "same reading as the last three disputes",
            )
            .unwrap();
        conflicts
            .respond(
                &challenge.id,
                Party::Reviewer,
                ResolutionOutcome::ReviewerWasRight,
                "still disagree",
            )
            .unwrap();
    };

    let (outcome, _) = tokio::join!(controller.run_task(&task.id), responder);
    let outcome = outcome.unwrap();
    assert!(outcome.is_converged());

    let chain = outcome.chain();
    let resolution = chain
        .resolutions
        .iter()
        .find(|r| r.resolved_by == "pattern")
        .expect("pattern resolution");
    assert_eq!(resolution.outcome, ResolutionOutcome::WorkerWasRight);
}

#[tokio::test]
async fn unanswered_challenge_times_out_and_escalates_the_task() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let config = LoopConfig {
        response_window: Duration::from_millis(50),
        ..fast_config()
    };
    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![rejection(
            "criterion one is ambiguous",
            CritiqueCategory::AmbiguitySuspected,
            Some("C-1"),
        )])),
        config,
    );

    let outcome = controller.run_task(&task.id).await.unwrap();
    let TaskOutcome::Escalated { reason, chain, .. } = outcome else {
        panic!("expected escalation");
    };
    assert_eq!(reason, EscalationReason::UnresolvedChallenge);
    assert_eq!(chain.resolutions.len(), 1);
    assert_eq!(chain.resolutions[0].resolved_by, "timeout");
    assert_eq!(chain.resolutions[0].outcome, ResolutionOutcome::Unresolved);
}

#[tokio::test]
async fn same_critique_three_times_is_a_deadlock_before_the_fourth_attempt() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![
            rejection("missing error handling", CritiqueCategory::ImplementationDefect, None),
            rejection("Missing error handling!", CritiqueCategory::ImplementationDefect, None),
            rejection("missing  ERROR  handling", CritiqueCategory::ImplementationDefect, None),
        ])),
        fast_config(),
    );

    let outcome = controller.run_task(&task.id).await.unwrap();
    let TaskOutcome::Escalated {
        attempts, reason, ..
    } = outcome
    else {
        panic!("expected escalation");
    };
    assert_eq!(reason, EscalationReason::DeadlockDetected);
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn worker_outage_after_retries_escalates_as_infrastructure() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(FailingWorker),
        Arc::new(ScriptedReviewer::new(vec![accepted()])),
        fast_config(),
    );

    let outcome = controller.run_task(&task.id).await.unwrap();
    let TaskOutcome::Escalated { reason, chain, .. } = outcome else {
        panic!("expected escalation");
    };
    assert_eq!(reason, EscalationReason::InfrastructureFailure);
    // The attempt exists but never reached a verdict
    assert_eq!(chain.attempts.len(), 1);
    assert_eq!(chain.attempts[0].verdict, VerdictKind::Pending);
}

#[tokio::test]
async fn a_claimed_task_refuses_a_second_controller() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![accepted()])),
        fast_config(),
    );

    assert!(db.tasks().claim(&task.id).unwrap());
    let err = controller.run_task(&task.id).await.unwrap_err();
    assert!(matches!(err, LoopError::TaskBusy(_)));

    db.tasks().release(&task.id).unwrap();
    let outcome = controller.run_task(&task.id).await.unwrap();
    assert!(outcome.is_converged());
}

#[tokio::test]
async fn abandon_during_a_call_discards_the_result() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::slow(Duration::from_millis(100))),
        Arc::new(ScriptedReviewer::new(vec![accepted()])),
        fast_config(),
    );

    let abandoner = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        db.tasks().request_abandon(&task.id).unwrap();
    };

    let (outcome, _) = tokio::join!(controller.run_task(&task.id), abandoner);
    let outcome = outcome.unwrap();
    let TaskOutcome::Abandoned { chain, .. } = outcome else {
        panic!("expected abandonment");
    };
    assert_eq!(chain.task.status, TaskStatus::Abandoned);
    // The in-flight call completed but its verdict was never persisted
    assert_eq!(chain.attempts.len(), 1);
    assert_eq!(chain.attempts[0].verdict, VerdictKind::Pending);
}

#[tokio::test]
async fn abandon_requested_before_the_first_attempt_stops_immediately() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);
    db.tasks().request_abandon(&task.id).unwrap();

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![accepted()])),
        fast_config(),
    );

    let outcome = controller.run_task(&task.id).await.unwrap();
    let TaskOutcome::Abandoned { attempts, .. } = outcome else {
        panic!("expected abandonment");
    };
    assert_eq!(attempts, 0);
}

#[tokio::test]
async fn terminal_tasks_are_not_runnable() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let task = seed_task(&db);
    db.tasks().set_status(&task.id, TaskStatus::Converged).unwrap();

    let controller = ReflexionController::new(
        Arc::clone(&db),
        Arc::new(ScriptedWorker::new()),
        Arc::new(ScriptedReviewer::new(vec![accepted()])),
        fast_config(),
    );

    let err = controller.run_task(&task.id).await.unwrap_err();
    assert!(matches!(err, LoopError::TaskNotOpen { .. }));
}
