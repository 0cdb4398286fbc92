//! Append-only evaluation log and its pattern projection.
//!
//! `record` only ever appends; `Pattern` rows are a derived, versioned
//! snapshot recomputed from the log. Reads may briefly lag writes, which is
//! acceptable because patterns are advisory inputs, never authoritative
//! state.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use reflexion_review::{Critique, CritiqueCategory};

use crate::challenges::is_unique_violation;
use crate::types::parse_enum;
use crate::{Challenge, Database, Resolution, ResolutionOutcome, StoreError};

/// What a record captures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// The reviewer's verdict on an attempt
    Verdict,
    /// The outcome of a challenge against an attempt
    ChallengeResolution,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Verdict => write!(f, "verdict"),
            RecordKind::ChallengeResolution => write!(f, "challenge_resolution"),
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verdict" => Ok(RecordKind::Verdict),
            "challenge_resolution" => Ok(RecordKind::ChallengeResolution),
            _ => Err(format!("Unknown record kind: {}", s)),
        }
    }
}

/// One immutable row in the evaluation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: String,
    pub attempt_id: String,
    pub kind: RecordKind,
    /// What the duplicate guard keys on: the attempt for verdicts, the
    /// challenge for resolutions. An attempt may accrue several resolved
    /// challenges; each must survive in the log.
    pub dedupe_key: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl EvaluationRecord {
    pub fn new(attempt_id: &str, kind: RecordKind, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            attempt_id: attempt_id.to_string(),
            kind,
            dedupe_key: attempt_id.to_string(),
            payload,
            recorded_at: Utc::now(),
        }
    }

    /// Record a reviewer verdict (the critique is present iff rejected).
    pub fn verdict(attempt_id: &str, critique: Option<&Critique>) -> Self {
        let payload = match critique {
            Some(c) => serde_json::json!({
                "accepted": false,
                "category": c.category,
                "severity": c.severity,
                "claim": c.claim,
                "fingerprint": reflexion_review::claim_fingerprint(&c.claim),
            }),
            None => serde_json::json!({ "accepted": true }),
        };
        Self::new(attempt_id, RecordKind::Verdict, payload)
    }

    /// Record a challenge resolution against the attempt it disputed.
    pub fn challenge_resolution(challenge: &Challenge, resolution: &Resolution) -> Self {
        let payload = serde_json::json!({
            "challenge_id": challenge.id,
            "category": challenge.category,
            "criterion_id": challenge.criterion_id,
            "claim_fingerprint": challenge.claim_fingerprint,
            "outcome": resolution.outcome,
            "resolved_by": resolution.resolved_by,
        });
        let mut record = Self::new(
            &challenge.against_attempt_id,
            RecordKind::ChallengeResolution,
            payload,
        );
        record.dedupe_key = challenge.id.clone();
        record
    }
}

/// A mined, recurring critique category with a recency-weighted score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub category: CritiqueCategory,
    /// Sum of per-record weights `0.5 ^ (age / half_life)`
    pub frequency: f64,
    pub example_refs: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub version: i64,
}

/// Majority outcome over prior analogous challenge resolutions
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeStats {
    pub majority: ResolutionOutcome,
    /// Share of analogous resolutions agreeing with the majority
    pub consistency: f64,
    pub support: usize,
    pub example_refs: Vec<String>,
}

/// Durable, append-only history of review outcomes.
pub struct Evaluator {
    db: Arc<Database>,
    half_life: Duration,
}

impl Evaluator {
    pub fn new(db: Arc<Database>, half_life: std::time::Duration) -> Self {
        Self {
            db,
            half_life: Duration::from_std(half_life).unwrap_or_else(|_| Duration::days(7)),
        }
    }

    /// Append a record. A duplicate `(dedupe_key, kind)` pair fails with
    /// `StoreError::DuplicateRecord` and leaves history untouched.
    ///
    /// Successful writes schedule an asynchronous recompute of the affected
    /// category's pattern snapshot.
    pub fn record(&self, record: &EvaluationRecord) -> Result<String, StoreError> {
        {
            let conn = self.db.lock();
            let result = conn.execute(
                r#"
                INSERT INTO evaluations (id, attempt_id, kind, dedupe_key, payload, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.id,
                    record.attempt_id,
                    record.kind.to_string(),
                    record.dedupe_key,
                    record.payload.to_string(),
                    record.recorded_at.to_rfc3339(),
                ],
            );
            if let Err(e) = result {
                if is_unique_violation(&e) {
                    return Err(StoreError::DuplicateRecord {
                        attempt_id: record.attempt_id.clone(),
                        kind: record.kind.to_string(),
                    });
                }
                return Err(e.into());
            }
        }

        if let Some(category) = record
            .payload
            .get("category")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<CritiqueCategory>().ok())
        {
            self.schedule_recompute(category);
        }

        Ok(record.id.clone())
    }

    /// Patterns ranked by recency-weighted frequency, freshest snapshot per
    /// category. `window` bounds how stale a pattern's last sighting may be.
    pub fn query_patterns(
        &self,
        category: Option<CritiqueCategory>,
        window: std::time::Duration,
    ) -> Result<Vec<Pattern>, StoreError> {
        let cutoff = Utc::now() - Duration::from_std(window).unwrap_or_else(|_| Duration::days(30));
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT p.category, p.version, p.frequency, p.example_refs, p.last_seen
             FROM patterns p
             JOIN (SELECT category, MAX(version) AS version FROM patterns GROUP BY category) latest
               ON latest.category = p.category AND latest.version = p.version",
        )?;
        let rows = stmt.query_map([], |row| {
            let refs_json: String = row.get(3)?;
            let example_refs = serde_json::from_str(&refs_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(Pattern {
                category: parse_enum(row.get::<_, String>(0)?)?,
                version: row.get(1)?,
                frequency: row.get(2)?,
                example_refs,
                last_seen: crate::types::parse_timestamp(row.get::<_, String>(4)?)?,
            })
        })?;

        let mut patterns: Vec<Pattern> = rows
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|p| p.last_seen >= cutoff)
            .filter(|p| category.map_or(true, |c| p.category == c))
            .collect();
        patterns.sort_by(|a, b| {
            b.frequency
                .partial_cmp(&a.frequency)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(patterns)
    }

    /// Majority outcome among resolved challenges analogous to the given
    /// one: same claim category and same criterion. Unresolved outcomes do
    /// not count toward support.
    pub fn outcome_consistency(
        &self,
        category: CritiqueCategory,
        criterion_id: Option<&str>,
    ) -> Result<Option<OutcomeStats>, StoreError> {
        let records = self.load_records(RecordKind::ChallengeResolution)?;

        let mut counts: std::collections::HashMap<ResolutionOutcome, usize> = Default::default();
        let mut refs = Vec::new();
        for record in &records {
            let rec_category = record
                .payload
                .get("category")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<CritiqueCategory>().ok());
            let rec_criterion = record.payload.get("criterion_id").and_then(|v| v.as_str());
            if rec_category != Some(category) || rec_criterion != criterion_id {
                continue;
            }
            let Some(outcome) = record
                .payload
                .get("outcome")
                .and_then(|v| serde_json::from_value::<ResolutionOutcome>(v.clone()).ok())
            else {
                continue;
            };
            if outcome == ResolutionOutcome::Unresolved {
                continue;
            }
            *counts.entry(outcome).or_default() += 1;
            refs.push(record.id.clone());
        }

        let support: usize = counts.values().sum();
        if support == 0 {
            return Ok(None);
        }
        let (majority, majority_count) = counts
            .into_iter()
            .max_by_key(|(_, n)| *n)
            .expect("non-empty counts");

        Ok(Some(OutcomeStats {
            majority,
            consistency: majority_count as f64 / support as f64,
            support,
            example_refs: refs,
        }))
    }

    /// Recompute the pattern snapshot for one category from the log and
    /// commit it as a new immutable version.
    pub fn recompute(&self, category: CritiqueCategory) -> Result<(), StoreError> {
        let now = Utc::now();
        let half_life_secs = self.half_life.num_seconds().max(1) as f64;

        let records = self.load_records(RecordKind::Verdict)?;
        let mut frequency = 0.0;
        let mut last_seen: Option<DateTime<Utc>> = None;
        let mut refs = Vec::new();
        for record in &records {
            let matches = record
                .payload
                .get("category")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<CritiqueCategory>().ok())
                == Some(category);
            if !matches {
                continue;
            }
            let age_secs = (now - record.recorded_at).num_seconds().max(0) as f64;
            frequency += 0.5_f64.powf(age_secs / half_life_secs);
            last_seen = Some(last_seen.map_or(record.recorded_at, |l| l.max(record.recorded_at)));
            refs.push(record.id.clone());
        }

        let Some(last_seen) = last_seen else {
            debug!(category = %category, "No records for category, skipping snapshot");
            return Ok(());
        };
        // Keep the most recent examples only
        let example_refs: Vec<String> = refs.into_iter().rev().take(5).collect();

        let conn = self.db.lock();
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM patterns WHERE category = ?1",
            params![category.to_string()],
            |row| row.get(0),
        )?;
        conn.execute(
            r#"
            INSERT INTO patterns (category, version, frequency, example_refs, last_seen, computed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                category.to_string(),
                version,
                frequency,
                serde_json::to_string(&example_refs)?,
                last_seen.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        debug!(category = %category, version, frequency, "Pattern snapshot committed");
        Ok(())
    }

    fn schedule_recompute(&self, category: CritiqueCategory) {
        // Off the write path when a runtime is available; inline otherwise
        // so non-async callers still converge.
        if tokio::runtime::Handle::try_current().is_ok() {
            let evaluator = Evaluator {
                db: Arc::clone(&self.db),
                half_life: self.half_life,
            };
            tokio::task::spawn_blocking(move || {
                if let Err(e) = evaluator.recompute(category) {
                    warn!(category = %category, error = %e, "Pattern recompute failed");
                }
            });
        } else if let Err(e) = self.recompute(category) {
            warn!(category = %category, error = %e, "Pattern recompute failed");
        }
    }

    fn load_records(&self, kind: RecordKind) -> Result<Vec<EvaluationRecord>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, attempt_id, kind, dedupe_key, payload, recorded_at
             FROM evaluations WHERE kind = ?1 ORDER BY recorded_at",
        )?;
        let rows = stmt.query_map(params![kind.to_string()], |row| {
            let payload_json: String = row.get(4)?;
            let payload = serde_json::from_str(&payload_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(EvaluationRecord {
                id: row.get(0)?,
                attempt_id: row.get(1)?,
                kind: parse_enum(row.get::<_, String>(2)?)?,
                dedupe_key: row.get(3)?,
                payload,
                recorded_at: crate::types::parse_timestamp(row.get::<_, String>(5)?)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
