//! Durable state for the reflexion loop.
//!
//! Provides a unified `Database` struct that owns the SQLite connection and
//! exposes domain-specific stores, plus the append-only `Evaluator` log with
//! its pattern projection.

mod attempts;
mod chain;
mod challenges;
mod error;
mod evaluator;
mod tasks;
mod types;

pub use attempts::Attempts;
pub use chain::TaskChain;
pub use challenges::Challenges;
pub use error::StoreError;
pub use evaluator::{EvaluationRecord, Evaluator, OutcomeStats, Pattern, RecordKind};
pub use tasks::Tasks;
pub use types::{
    Attempt, Challenge, ChallengeResponse, ChallengeState, Criterion, Party, Resolution,
    ResolutionOutcome, Task, TaskStatus, VerdictKind,
};

use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Mutex;

/// The main database struct that owns the SQLite connection.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the default location.
    ///
    /// The default location is `~/.local/share/reflexion/reflexion.db`.
    pub fn open() -> Result<Self, StoreError> {
        let db_path = Self::default_path();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        Self::open_at(&db_path)
    }

    /// Open or create a database at a specific path.
    pub fn open_at(path: &std::path::Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the default database path.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reflexion")
            .join("reflexion.db")
    }

    /// Access the tasks store.
    pub fn tasks(&self) -> Tasks<'_> {
        Tasks::new(self.lock())
    }

    /// Access the attempts store.
    pub fn attempts(&self) -> Attempts<'_> {
        Attempts::new(self.lock())
    }

    /// Access the challenges store.
    pub fn challenges(&self) -> Challenges<'_> {
        Challenges::new(self.lock())
    }

    /// Assemble the full audit chain for a task.
    pub fn chain(&self, task_id: &str) -> Result<TaskChain, StoreError> {
        chain::assemble(self, task_id)
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("Database lock poisoned")
    }

    /// Initialize the database schema.
    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                acceptance_criteria TEXT NOT NULL,
                status TEXT NOT NULL,
                in_flight INTEGER NOT NULL DEFAULT 0,
                abandon_requested INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attempts (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                sequence_number INTEGER NOT NULL,
                instructions_used TEXT NOT NULL,
                artifact_ref TEXT,
                verdict TEXT NOT NULL,
                critique_id TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(task_id, sequence_number)
            );

            CREATE TABLE IF NOT EXISTS critiques (
                id TEXT PRIMARY KEY,
                attempt_id TEXT NOT NULL REFERENCES attempts(id),
                category TEXT NOT NULL,
                severity TEXT NOT NULL,
                claim TEXT NOT NULL,
                detail TEXT NOT NULL,
                suggestion TEXT
            );

            CREATE TABLE IF NOT EXISTS challenges (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(id),
                raised_by TEXT NOT NULL,
                against_attempt_id TEXT NOT NULL REFERENCES attempts(id),
                criterion_id TEXT,
                category TEXT NOT NULL,
                claim TEXT NOT NULL,
                claim_fingerprint TEXT NOT NULL,
                state TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                respond_by TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS challenge_responses (
                challenge_id TEXT NOT NULL REFERENCES challenges(id),
                party TEXT NOT NULL,
                position TEXT NOT NULL,
                rationale TEXT NOT NULL,
                responded_at TEXT NOT NULL,
                UNIQUE(challenge_id, party)
            );

            CREATE TABLE IF NOT EXISTS resolutions (
                challenge_id TEXT PRIMARY KEY REFERENCES challenges(id),
                outcome TEXT NOT NULL,
                rationale TEXT NOT NULL,
                resolved_by TEXT NOT NULL,
                resolved_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evaluations (
                id TEXT PRIMARY KEY,
                attempt_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                dedupe_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                UNIQUE(dedupe_key, kind)
            );

            CREATE TABLE IF NOT EXISTS patterns (
                category TEXT NOT NULL,
                version INTEGER NOT NULL,
                frequency REAL NOT NULL,
                example_refs TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                computed_at TEXT NOT NULL,
                PRIMARY KEY(category, version)
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(task_id, sequence_number);
            CREATE INDEX IF NOT EXISTS idx_critiques_attempt ON critiques(attempt_id);
            CREATE INDEX IF NOT EXISTS idx_challenges_task ON challenges(task_id);
            CREATE INDEX IF NOT EXISTS idx_challenges_state ON challenges(state, respond_by);
            CREATE INDEX IF NOT EXISTS idx_evaluations_kind ON evaluations(kind, recorded_at);
            "#,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_on_open() {
        let db = Database::open_in_memory().unwrap();
        // All stores are reachable on a fresh database
        assert!(db.tasks().list().unwrap().is_empty());
    }

    #[test]
    fn open_at_creates_a_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reflexion.db");
        {
            let db = Database::open_at(&path).unwrap();
            let task = Task::new("persisted".into(), vec![]);
            db.tasks().create(&task).unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.tasks().list().unwrap().len(), 1);
    }
}
