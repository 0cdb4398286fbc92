//! Challenges store: the disagreement protocol's durable side.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::MutexGuard;

use reflexion_review::CritiqueCategory;

use crate::types::{parse_enum, parse_timestamp};
use crate::{Challenge, ChallengeResponse, ChallengeState, Resolution, StoreError};

/// Challenges store with a borrowed connection.
pub struct Challenges<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Challenges<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    pub fn open(&self, challenge: &Challenge) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO challenges (id, task_id, raised_by, against_attempt_id, criterion_id,
                                    category, claim, claim_fingerprint, state, opened_at, respond_by)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                challenge.id,
                challenge.task_id,
                challenge.raised_by.to_string(),
                challenge.against_attempt_id,
                challenge.criterion_id,
                challenge.category.to_string(),
                challenge.claim,
                challenge.claim_fingerprint,
                challenge.state.to_string(),
                challenge.opened_at.to_rfc3339(),
                challenge.respond_by.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Challenge>, StoreError> {
        let challenge = self
            .conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_CHALLENGE),
                params![id],
                Self::row_to_challenge,
            )
            .optional()?;
        Ok(challenge)
    }

    pub fn list_for_task(&self, task_id: &str) -> Result<Vec<Challenge>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE task_id = ?1 ORDER BY opened_at", SELECT_CHALLENGE))?;
        let rows = stmt.query_map(params![task_id], Self::row_to_challenge)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Challenges that still block convergence for a task.
    pub fn pending_for_task(&self, task_id: &str) -> Result<Vec<Challenge>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE task_id = ?1 AND state IN ('open', 'responded') ORDER BY opened_at",
            SELECT_CHALLENGE
        ))?;
        let rows = stmt.query_map(params![task_id], Self::row_to_challenge)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Challenges past their response deadline that are not yet terminal.
    pub fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<Challenge>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE state IN ('open', 'responded') AND respond_by < ?1",
            SELECT_CHALLENGE
        ))?;
        let rows = stmt.query_map(params![now.to_rfc3339()], Self::row_to_challenge)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Guarded state transition. Returns true when the transition happened;
    /// false when the challenge was no longer in one of `from` (so terminal
    /// transitions fire exactly once).
    pub fn transition(
        &self,
        id: &str,
        from: &[ChallengeState],
        to: ChallengeState,
    ) -> Result<bool, StoreError> {
        let placeholders = from
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");
        let changed = self.conn.execute(
            &format!(
                "UPDATE challenges SET state = ?2 WHERE id = ?1 AND state IN ({})",
                placeholders
            ),
            params![id, to.to_string()],
        )?;
        Ok(changed == 1)
    }

    /// Record (or replace) one party's position on a challenge.
    pub fn record_response(&self, response: &ChallengeResponse) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO challenge_responses (challenge_id, party, position, rationale, responded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(challenge_id, party) DO UPDATE SET
                position = excluded.position,
                rationale = excluded.rationale,
                responded_at = excluded.responded_at
            "#,
            params![
                response.challenge_id,
                response.party.to_string(),
                response.position.to_string(),
                response.rationale,
                response.responded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn responses(&self, challenge_id: &str) -> Result<Vec<ChallengeResponse>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT challenge_id, party, position, rationale, responded_at
             FROM challenge_responses WHERE challenge_id = ?1 ORDER BY responded_at",
        )?;
        let rows = stmt.query_map(params![challenge_id], |row| {
            Ok(ChallengeResponse {
                challenge_id: row.get(0)?,
                party: parse_enum(row.get::<_, String>(1)?)?,
                position: parse_enum(row.get::<_, String>(2)?)?,
                rationale: row.get(3)?,
                responded_at: parse_timestamp(row.get::<_, String>(4)?)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Record the single resolution of a challenge. A second resolution for
    /// the same challenge is refused.
    pub fn record_resolution(&self, resolution: &Resolution) -> Result<(), StoreError> {
        let result = self.conn.execute(
            r#"
            INSERT INTO resolutions (challenge_id, outcome, rationale, resolved_by, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                resolution.challenge_id,
                resolution.outcome.to_string(),
                resolution.rationale,
                resolution.resolved_by,
                resolution.resolved_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::DuplicateResolution(resolution.challenge_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn resolution(&self, challenge_id: &str) -> Result<Option<Resolution>, StoreError> {
        let resolution = self
            .conn
            .query_row(
                "SELECT challenge_id, outcome, rationale, resolved_by, resolved_at
                 FROM resolutions WHERE challenge_id = ?1",
                params![challenge_id],
                Self::row_to_resolution,
            )
            .optional()?;
        Ok(resolution)
    }

    pub fn resolutions_for_task(&self, task_id: &str) -> Result<Vec<Resolution>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT r.challenge_id, r.outcome, r.rationale, r.resolved_by, r.resolved_at
             FROM resolutions r JOIN challenges c ON c.id = r.challenge_id
             WHERE c.task_id = ?1 ORDER BY r.resolved_at",
        )?;
        let rows = stmt.query_map(params![task_id], Self::row_to_resolution)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn row_to_challenge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Challenge> {
        Ok(Challenge {
            id: row.get(0)?,
            task_id: row.get(1)?,
            raised_by: parse_enum(row.get::<_, String>(2)?)?,
            against_attempt_id: row.get(3)?,
            criterion_id: row.get(4)?,
            category: parse_enum::<CritiqueCategory>(row.get::<_, String>(5)?)?,
            claim: row.get(6)?,
            claim_fingerprint: row.get(7)?,
            state: parse_enum(row.get::<_, String>(8)?)?,
            opened_at: parse_timestamp(row.get::<_, String>(9)?)?,
            respond_by: parse_timestamp(row.get::<_, String>(10)?)?,
        })
    }

    fn row_to_resolution(row: &rusqlite::Row<'_>) -> rusqlite::Result<Resolution> {
        Ok(Resolution {
            challenge_id: row.get(0)?,
            outcome: parse_enum(row.get::<_, String>(1)?)?,
            rationale: row.get(2)?,
            resolved_by: row.get(3)?,
            resolved_at: parse_timestamp(row.get::<_, String>(4)?)?,
        })
    }
}

const SELECT_CHALLENGE: &str = "SELECT id, task_id, raised_by, against_attempt_id, criterion_id, \
     category, claim, claim_fingerprint, state, opened_at, respond_by FROM challenges";

pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
