//! Attempts store: gapless sequence numbers and verdict recording.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::MutexGuard;

use reflexion_review::Critique;

use crate::types::{parse_enum, parse_timestamp};
use crate::{Attempt, StoreError, VerdictKind};

/// Attempts store with a borrowed connection.
pub struct Attempts<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Attempts<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    /// Next sequence number for a task (1-based).
    pub fn next_sequence(&self, task_id: &str) -> Result<u32, StoreError> {
        let next: u32 = self.conn.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM attempts WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(next)
    }

    /// Insert an attempt. The sequence number must be exactly the next one
    /// for the task; anything else is an internal inconsistency.
    pub fn insert(&self, attempt: &Attempt) -> Result<(), StoreError> {
        let expected = self.next_sequence(&attempt.task_id)?;
        if attempt.sequence_number != expected {
            return Err(StoreError::SequenceGap {
                task_id: attempt.task_id.clone(),
                expected,
                got: attempt.sequence_number,
            });
        }

        self.conn.execute(
            r#"
            INSERT INTO attempts (id, task_id, sequence_number, instructions_used, artifact_ref, verdict, critique_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                attempt.id,
                attempt.task_id,
                attempt.sequence_number,
                attempt.instructions_used,
                attempt.artifact_ref,
                attempt.verdict.to_string(),
                attempt.critique_id,
                attempt.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_artifact_ref(&self, attempt_id: &str, artifact_ref: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE attempts SET artifact_ref = ?2 WHERE id = ?1",
            params![attempt_id, artifact_ref],
        )?;
        Ok(())
    }

    /// Record the verdict for an attempt, attaching the critique when the
    /// verdict is a rejection.
    ///
    /// Recording the same verdict twice is a no-op (safe under retried
    /// writes); recording a different verdict over a settled one is an
    /// invariant violation.
    pub fn record_verdict(
        &self,
        attempt_id: &str,
        verdict: VerdictKind,
        critique: Option<&Critique>,
    ) -> Result<(), StoreError> {
        if (verdict == VerdictKind::Rejected) != critique.is_some() {
            return Err(StoreError::InvariantViolation(format!(
                "attempt {}: a critique must accompany a rejection and nothing else",
                attempt_id
            )));
        }

        let critique_id = critique.map(|c| c.id.clone());
        let changed = self.conn.execute(
            "UPDATE attempts SET verdict = ?2, critique_id = ?3 WHERE id = ?1 AND verdict = 'pending'",
            params![attempt_id, verdict.to_string(), critique_id],
        )?;

        if changed == 0 {
            let current: VerdictKind = self
                .conn
                .query_row(
                    "SELECT verdict FROM attempts WHERE id = ?1",
                    params![attempt_id],
                    |row| parse_enum(row.get::<_, String>(0)?),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(format!("attempt {}", attempt_id)))?;
            if current != verdict {
                return Err(StoreError::InvariantViolation(format!(
                    "attempt {} verdict already recorded as {}, refusing {}",
                    attempt_id, current, verdict
                )));
            }
            return Ok(());
        }

        if let Some(critique) = critique {
            self.conn.execute(
                r#"
                INSERT INTO critiques (id, attempt_id, category, severity, claim, detail, suggestion)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    critique.id,
                    critique.attempt_id,
                    critique.category.to_string(),
                    critique.severity.to_string(),
                    critique.claim,
                    critique.detail,
                    critique.suggestion,
                ],
            )?;
        }
        Ok(())
    }

    pub fn get(&self, attempt_id: &str) -> Result<Option<Attempt>, StoreError> {
        let attempt = self
            .conn
            .query_row(
                "SELECT id, task_id, sequence_number, instructions_used, artifact_ref, verdict, critique_id, created_at
                 FROM attempts WHERE id = ?1",
                params![attempt_id],
                Self::row_to_attempt,
            )
            .optional()?;
        Ok(attempt)
    }

    pub fn list_for_task(&self, task_id: &str) -> Result<Vec<Attempt>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, task_id, sequence_number, instructions_used, artifact_ref, verdict, critique_id, created_at
             FROM attempts WHERE task_id = ?1 ORDER BY sequence_number",
        )?;
        let rows = stmt.query_map(params![task_id], Self::row_to_attempt)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn latest(&self, task_id: &str) -> Result<Option<Attempt>, StoreError> {
        let attempt = self
            .conn
            .query_row(
                "SELECT id, task_id, sequence_number, instructions_used, artifact_ref, verdict, critique_id, created_at
                 FROM attempts WHERE task_id = ?1 ORDER BY sequence_number DESC LIMIT 1",
                params![task_id],
                Self::row_to_attempt,
            )
            .optional()?;
        Ok(attempt)
    }

    pub fn critique(&self, critique_id: &str) -> Result<Option<Critique>, StoreError> {
        let critique = self
            .conn
            .query_row(
                "SELECT id, attempt_id, category, severity, claim, detail, suggestion
                 FROM critiques WHERE id = ?1",
                params![critique_id],
                Self::row_to_critique,
            )
            .optional()?;
        Ok(critique)
    }

    /// All critiques for a task, oldest first.
    pub fn critiques_for_task(&self, task_id: &str) -> Result<Vec<Critique>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.attempt_id, c.category, c.severity, c.claim, c.detail, c.suggestion
             FROM critiques c JOIN attempts a ON a.id = c.attempt_id
             WHERE a.task_id = ?1 ORDER BY a.sequence_number",
        )?;
        let rows = stmt.query_map(params![task_id], Self::row_to_critique)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<Attempt> {
        Ok(Attempt {
            id: row.get(0)?,
            task_id: row.get(1)?,
            sequence_number: row.get(2)?,
            instructions_used: row.get(3)?,
            artifact_ref: row.get(4)?,
            verdict: parse_enum(row.get::<_, String>(5)?)?,
            critique_id: row.get(6)?,
            created_at: parse_timestamp(row.get::<_, String>(7)?)?,
        })
    }

    fn row_to_critique(row: &rusqlite::Row<'_>) -> rusqlite::Result<Critique> {
        Ok(Critique {
            id: row.get(0)?,
            attempt_id: row.get(1)?,
            category: parse_enum(row.get::<_, String>(2)?)?,
            severity: parse_enum(row.get::<_, String>(3)?)?,
            claim: row.get(4)?,
            detail: row.get(5)?,
            suggestion: row.get(6)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, Task};
    use reflexion_review::{CritiqueCategory, Severity};

    fn setup() -> (Database, Task) {
        let db = Database::open_in_memory().unwrap();
        let task = Task::new("demo".into(), vec![]);
        db.tasks().create(&task).unwrap();
        (db, task)
    }

    #[test]
    fn sequence_numbers_are_gapless() {
        let (db, task) = setup();

        let a1 = Attempt::new(&task.id, 1, "do it".into());
        db.attempts().insert(&a1).unwrap();

        // Skipping 2 is rejected
        let a3 = Attempt::new(&task.id, 3, "do it again".into());
        let err = db.attempts().insert(&a3).unwrap_err();
        assert!(matches!(err, StoreError::SequenceGap { expected: 2, got: 3, .. }));

        let a2 = Attempt::new(&task.id, 2, "do it again".into());
        db.attempts().insert(&a2).unwrap();
        assert_eq!(db.attempts().next_sequence(&task.id).unwrap(), 3);
    }

    #[test]
    fn verdict_recording_is_idempotent_for_the_same_verdict() {
        let (db, task) = setup();
        let attempt = Attempt::new(&task.id, 1, "do it".into());
        db.attempts().insert(&attempt).unwrap();

        db.attempts()
            .record_verdict(&attempt.id, VerdictKind::Accepted, None)
            .unwrap();
        // Same verdict again: fine
        db.attempts()
            .record_verdict(&attempt.id, VerdictKind::Accepted, None)
            .unwrap();

        let critique = Critique {
            id: "c-1".into(),
            attempt_id: attempt.id.clone(),
            category: CritiqueCategory::ImplementationDefect,
            severity: Severity::Major,
            claim: "broken".into(),
            detail: "it is broken".into(),
            suggestion: None,
        };
        // A different verdict over a settled one is a bug
        let err = db
            .attempts()
            .record_verdict(&attempt.id, VerdictKind::Rejected, Some(&critique))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[test]
    fn rejection_requires_a_critique() {
        let (db, task) = setup();
        let attempt = Attempt::new(&task.id, 1, "do it".into());
        db.attempts().insert(&attempt).unwrap();

        let err = db
            .attempts()
            .record_verdict(&attempt.id, VerdictKind::Rejected, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[test]
    fn critiques_are_listed_in_attempt_order() {
        let (db, task) = setup();
        for seq in 1..=2u32 {
            let attempt = Attempt::new(&task.id, seq, format!("round {}", seq));
            db.attempts().insert(&attempt).unwrap();
            let critique = Critique {
                id: format!("c-{}", seq),
                attempt_id: attempt.id.clone(),
                category: CritiqueCategory::RequirementGap,
                severity: Severity::Major,
                claim: format!("gap {}", seq),
                detail: "missing".into(),
                suggestion: None,
            };
            db.attempts()
                .record_verdict(&attempt.id, VerdictKind::Rejected, Some(&critique))
                .unwrap();
        }

        let critiques = db.attempts().critiques_for_task(&task.id).unwrap();
        assert_eq!(critiques.len(), 2);
        assert_eq!(critiques[0].claim, "gap 1");
        assert_eq!(critiques[1].claim, "gap 2");
    }
}
