//! Tasks store: lifecycle, in-flight claims and abandon requests.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::MutexGuard;

use crate::types::{parse_enum, parse_timestamp};
use crate::{StoreError, Task, TaskStatus};

/// Tasks store with a borrowed connection.
pub struct Tasks<'db> {
    conn: MutexGuard<'db, Connection>,
}

impl<'db> Tasks<'db> {
    pub(crate) fn new(conn: MutexGuard<'db, Connection>) -> Self {
        Self { conn }
    }

    pub fn create(&self, task: &Task) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO tasks (id, description, acceptance_criteria, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                task.id,
                task.description,
                serde_json::to_string(&task.acceptance_criteria)?,
                task.status.to_string(),
                task.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let task = self
            .conn
            .query_row(
                "SELECT id, description, acceptance_criteria, status, created_at FROM tasks WHERE id = ?1",
                params![id],
                Self::row_to_task,
            )
            .optional()?;
        Ok(task)
    }

    pub fn list(&self) -> Result<Vec<Task>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, description, acceptance_criteria, status, created_at FROM tasks ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], Self::row_to_task)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET status = ?2 WHERE id = ?1",
            params![id, status.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    /// Optimistically claim the per-task in-flight flag.
    ///
    /// Returns true when this caller won the claim; false when the task is
    /// already being driven or is not open.
    pub fn claim(&self, id: &str) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET in_flight = 1 WHERE id = ?1 AND in_flight = 0 AND status = 'open'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    /// Release the in-flight flag at a state boundary.
    pub fn release(&self, id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("UPDATE tasks SET in_flight = 0 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Record a cancellation request; honored at the next attempt boundary.
    pub fn request_abandon(&self, id: &str) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE tasks SET abandon_requested = 1 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    pub fn abandon_requested(&self, id: &str) -> Result<bool, StoreError> {
        let flag: i64 = self.conn.query_row(
            "SELECT abandon_requested FROM tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(flag != 0)
    }

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let criteria_json: String = row.get(2)?;
        let acceptance_criteria = serde_json::from_str(&criteria_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Task {
            id: row.get(0)?,
            description: row.get(1)?,
            acceptance_criteria,
            status: parse_enum(row.get::<_, String>(3)?)?,
            created_at: parse_timestamp(row.get::<_, String>(4)?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{Criterion, Database, Task, TaskStatus};

    fn task() -> Task {
        Task::new(
            "Build the importer".into(),
            vec![Criterion {
                id: "C-1".into(),
                text: "Reads CSV input".into(),
            }],
        )
    }

    #[test]
    fn create_and_get_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let task = task();
        db.tasks().create(&task).unwrap();

        let loaded = db.tasks().get(&task.id).unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let db = Database::open_in_memory().unwrap();
        let task = task();
        db.tasks().create(&task).unwrap();

        assert!(db.tasks().claim(&task.id).unwrap());
        assert!(!db.tasks().claim(&task.id).unwrap());

        db.tasks().release(&task.id).unwrap();
        assert!(db.tasks().claim(&task.id).unwrap());
    }

    #[test]
    fn terminal_tasks_cannot_be_claimed() {
        let db = Database::open_in_memory().unwrap();
        let task = task();
        db.tasks().create(&task).unwrap();
        db.tasks()
            .set_status(&task.id, TaskStatus::Converged)
            .unwrap();

        assert!(!db.tasks().claim(&task.id).unwrap());
    }

    #[test]
    fn abandon_request_is_durable() {
        let db = Database::open_in_memory().unwrap();
        let task = task();
        db.tasks().create(&task).unwrap();

        assert!(!db.tasks().abandon_requested(&task.id).unwrap());
        db.tasks().request_abandon(&task.id).unwrap();
        assert!(db.tasks().abandon_requested(&task.id).unwrap());
    }
}
