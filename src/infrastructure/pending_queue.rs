use crate::domain::models::ActionType;
use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub transaction_hash: String,
    pub user_id: String,
    pub action_type: ActionType,
    pub points_delta: i64,
    pub occurred_at: DateTime<Utc>,
}

pub trait PendingWriteQueue: Send + Sync {
    fn enqueue(&self, write: &PendingWrite) -> Result<(), CoreError>;
    fn pending_for_user(&self, user_id: &str) -> Result<Vec<PendingWrite>, CoreError>;
    fn remove(&self, transaction_hash: &str) -> Result<(), CoreError>;
    fn save_sync_state(&self, user_id: &str, last_sync_time: DateTime<Utc>) -> Result<(), CoreError>;
    fn load_sync_state(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, CoreError>;
}

#[derive(Debug, Clone)]
pub struct SqlitePendingWriteQueue {
    db_path: PathBuf,
}

impl SqlitePendingWriteQueue {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path)
            .map_err(|error| CoreError::PersistenceUnavailable(format!("pending queue: {error}")))
    }
}

impl PendingWriteQueue for SqlitePendingWriteQueue {
    fn enqueue(&self, write: &PendingWrite) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT OR IGNORE INTO pending_writes
                 (transaction_hash, user_id, action_type, points_delta, occurred_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                write.transaction_hash,
                write.user_id,
                write.action_type.as_str(),
                write.points_delta,
                write.occurred_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn pending_for_user(&self, user_id: &str) -> Result<Vec<PendingWrite>, CoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT transaction_hash, action_type, points_delta, occurred_at
             FROM pending_writes WHERE user_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = statement.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut writes = Vec::new();
        for row in rows {
            let (transaction_hash, action_raw, points_delta, occurred_raw) = row?;
            let action_type = ActionType::parse(&action_raw).ok_or_else(|| {
                CoreError::InvalidConfig(format!("unknown action_type '{action_raw}' in queue"))
            })?;
            let occurred_at = DateTime::parse_from_rfc3339(&occurred_raw)
                .map_err(|error| {
                    CoreError::InvalidConfig(format!(
                        "invalid pending_writes.occurred_at '{occurred_raw}': {error}"
                    ))
                })?
                .with_timezone(&Utc);
            writes.push(PendingWrite {
                transaction_hash,
                user_id: user_id.to_string(),
                action_type,
                points_delta,
                occurred_at,
            });
        }
        Ok(writes)
    }

    fn remove(&self, transaction_hash: &str) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "DELETE FROM pending_writes WHERE transaction_hash = ?1",
            params![transaction_hash],
        )?;
        Ok(())
    }

    fn save_sync_state(&self, user_id: &str, last_sync_time: DateTime<Utc>) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO sync_state (user_id, last_sync_time)
             VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET last_sync_time = excluded.last_sync_time",
            params![user_id, last_sync_time.to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_sync_state(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, CoreError> {
        let connection = self.connect()?;
        let raw: Option<String> = connection
            .query_row(
                "SELECT last_sync_time FROM sync_state WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|error| {
                    CoreError::InvalidConfig(format!(
                        "invalid sync_state.last_sync_time '{value}': {error}"
                    ))
                })
        })
        .transpose()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPendingWriteQueue {
    writes: Mutex<Vec<PendingWrite>>,
    sync_state: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl InMemoryPendingWriteQueue {
    fn poisoned(error: impl std::fmt::Display) -> CoreError {
        CoreError::PersistenceUnavailable(format!("pending queue lock poisoned: {error}"))
    }
}

impl PendingWriteQueue for InMemoryPendingWriteQueue {
    fn enqueue(&self, write: &PendingWrite) -> Result<(), CoreError> {
        let mut writes = self.writes.lock().map_err(Self::poisoned)?;
        if !writes
            .iter()
            .any(|entry| entry.transaction_hash == write.transaction_hash)
        {
            writes.push(write.clone());
        }
        Ok(())
    }

    fn pending_for_user(&self, user_id: &str) -> Result<Vec<PendingWrite>, CoreError> {
        let writes = self.writes.lock().map_err(Self::poisoned)?;
        Ok(writes
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    fn remove(&self, transaction_hash: &str) -> Result<(), CoreError> {
        let mut writes = self.writes.lock().map_err(Self::poisoned)?;
        writes.retain(|entry| entry.transaction_hash != transaction_hash);
        Ok(())
    }

    fn save_sync_state(&self, user_id: &str, last_sync_time: DateTime<Utc>) -> Result<(), CoreError> {
        let mut state = self.sync_state.lock().map_err(Self::poisoned)?;
        state.insert(user_id.to_string(), last_sync_time);
        Ok(())
    }

    fn load_sync_state(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, CoreError> {
        let state = self.sync_state.lock().map_err(Self::poisoned)?;
        Ok(state.get(user_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn sample_write(hash: &str, delta: i64) -> PendingWrite {
        PendingWrite {
            transaction_hash: hash.to_string(),
            user_id: "usr-1".to_string(),
            action_type: ActionType::AddSite,
            points_delta: delta,
            occurred_at: fixed_time("2026-03-02T08:00:00Z"),
        }
    }

    #[test]
    fn queue_preserves_submission_order() {
        let queue = InMemoryPendingWriteQueue::default();
        queue.enqueue(&sample_write("h1", 10)).expect("enqueue");
        queue.enqueue(&sample_write("h2", 8)).expect("enqueue");
        queue.enqueue(&sample_write("h3", 25)).expect("enqueue");

        let pending = queue.pending_for_user("usr-1").expect("pending");
        let hashes: Vec<&str> = pending
            .iter()
            .map(|write| write.transaction_hash.as_str())
            .collect();
        assert_eq!(hashes, vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn duplicate_hashes_are_ignored() {
        let queue = InMemoryPendingWriteQueue::default();
        queue.enqueue(&sample_write("h1", 10)).expect("enqueue");
        queue.enqueue(&sample_write("h1", 10)).expect("enqueue");
        assert_eq!(queue.pending_for_user("usr-1").expect("pending").len(), 1);
    }

    #[test]
    fn remove_drops_only_the_named_write() {
        let queue = InMemoryPendingWriteQueue::default();
        queue.enqueue(&sample_write("h1", 10)).expect("enqueue");
        queue.enqueue(&sample_write("h2", 8)).expect("enqueue");

        queue.remove("h1").expect("remove");
        let pending = queue.pending_for_user("usr-1").expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transaction_hash, "h2");
    }

    #[test]
    fn sync_state_round_trips() {
        let queue = InMemoryPendingWriteQueue::default();
        assert!(queue.load_sync_state("usr-1").expect("load").is_none());

        let stamp = fixed_time("2026-03-02T09:30:00Z");
        queue.save_sync_state("usr-1", stamp).expect("save");
        assert_eq!(queue.load_sync_state("usr-1").expect("load"), Some(stamp));
    }
}
