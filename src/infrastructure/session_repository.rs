use crate::domain::models::{Session, SessionStatus};
use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait SessionRepository: Send + Sync {
    fn get(&self, session_id: &str) -> Result<Option<Session>, CoreError>;
    fn active_for_owner(&self, owner_id: &str) -> Result<Option<Session>, CoreError>;
    fn insert(&self, session: &Session) -> Result<(), CoreError>;
    fn update(&self, session: &Session) -> Result<(), CoreError>;
    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Session>, CoreError>;
}

const SESSION_COLUMNS: &str = "id, owner_id, start_time, duration_days, blocked_site_snapshot, \
     status, emergency_attempts, last_daily_bonus_day, disable_reason, version";

type SessionRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    i64,
    i64,
    Option<String>,
    i64,
);

fn session_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn hydrate_session(row: SessionRow) -> Result<Session, CoreError> {
    let (
        id,
        owner_id,
        start_raw,
        duration_days,
        snapshot_raw,
        status_raw,
        emergency_attempts,
        last_daily_bonus_day,
        disable_reason,
        version,
    ) = row;

    let start_time = DateTime::parse_from_rfc3339(&start_raw)
        .map_err(|error| {
            CoreError::InvalidConfig(format!("invalid sessions.start_time '{start_raw}': {error}"))
        })?
        .with_timezone(&Utc);
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::InvalidConfig(format!("unknown session status '{status_raw}'")))?;

    Ok(Session {
        id,
        owner_id,
        start_time,
        duration_days: duration_days as u32,
        blocked_site_snapshot: serde_json::from_str(&snapshot_raw)?,
        status,
        emergency_attempts: emergency_attempts as u32,
        last_daily_bonus_day: last_daily_bonus_day as u32,
        disable_reason,
        version,
    })
}

#[derive(Debug, Clone)]
pub struct SqliteSessionRepository {
    db_path: PathBuf,
}

impl SqliteSessionRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path)
            .map_err(|error| CoreError::PersistenceUnavailable(format!("session store: {error}")))
    }
}

impl SessionRepository for SqliteSessionRepository {
    fn get(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![session_id],
                session_row,
            )
            .optional()?;
        row.map(hydrate_session).transpose()
    }

    fn active_for_owner(&self, owner_id: &str) -> Result<Option<Session>, CoreError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions \
                     WHERE owner_id = ?1 AND status = 'active'"
                ),
                params![owner_id],
                session_row,
            )
            .optional()?;
        row.map(hydrate_session).transpose()
    }

    fn insert(&self, session: &Session) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO sessions
                 (id, owner_id, start_time, duration_days, blocked_site_snapshot,
                  status, emergency_attempts, last_daily_bonus_day, disable_reason, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.owner_id,
                session.start_time.to_rfc3339(),
                session.duration_days as i64,
                serde_json::to_string(&session.blocked_site_snapshot)?,
                session.status.as_str(),
                session.emergency_attempts as i64,
                session.last_daily_bonus_day as i64,
                session.disable_reason,
                session.version,
            ],
        )?;
        Ok(())
    }

    fn update(&self, session: &Session) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "UPDATE sessions SET
                 start_time = ?2,
                 duration_days = ?3,
                 blocked_site_snapshot = ?4,
                 status = ?5,
                 emergency_attempts = ?6,
                 last_daily_bonus_day = ?7,
                 disable_reason = ?8,
                 version = ?9
             WHERE id = ?1",
            params![
                session.id,
                session.start_time.to_rfc3339(),
                session.duration_days as i64,
                serde_json::to_string(&session.blocked_site_snapshot)?,
                session.status.as_str(),
                session.emergency_attempts as i64,
                session.last_daily_bonus_day as i64,
                session.disable_reason,
                session.version,
            ],
        )?;
        Ok(())
    }

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Session>, CoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE owner_id = ?1 ORDER BY start_time ASC"
        ))?;
        let rows = statement.query_map(params![owner_id], session_row)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(hydrate_session(row?)?);
        }
        Ok(sessions)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySessionRepository {
    sessions: Mutex<HashMap<String, Session>>,
}

impl InMemorySessionRepository {
    fn poisoned(error: impl std::fmt::Display) -> CoreError {
        CoreError::PersistenceUnavailable(format!("session store lock poisoned: {error}"))
    }
}

impl SessionRepository for InMemorySessionRepository {
    fn get(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let sessions = self.sessions.lock().map_err(Self::poisoned)?;
        Ok(sessions.get(session_id).cloned())
    }

    fn active_for_owner(&self, owner_id: &str) -> Result<Option<Session>, CoreError> {
        let sessions = self.sessions.lock().map_err(Self::poisoned)?;
        Ok(sessions
            .values()
            .find(|session| session.owner_id == owner_id && session.status == SessionStatus::Active)
            .cloned())
    }

    fn insert(&self, session: &Session) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().map_err(Self::poisoned)?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn update(&self, session: &Session) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().map_err(Self::poisoned)?;
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Session>, CoreError> {
        let sessions = self.sessions.lock().map_err(Self::poisoned)?;
        let mut list: Vec<Session> = sessions
            .values()
            .filter(|session| session.owner_id == owner_id)
            .cloned()
            .collect();
        list.sort_by_key(|session| session.start_time);
        Ok(list)
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

    fn sample_session(id: &str, status: SessionStatus) -> Session {
        Session {
            id: id.to_string(),
            owner_id: "usr-1".to_string(),
            start_time: fixed_time("2026-03-02T08:00:00Z"),
            duration_days: 7,
            blocked_site_snapshot: vec!["reddit.com".to_string()],
            status,
            emergency_attempts: 0,
            last_daily_bonus_day: 0,
            disable_reason: None,
            version: 0,
        }
    }

    #[test]
    fn active_lookup_skips_terminal_sessions() {
        let repository = InMemorySessionRepository::default();
        repository
            .insert(&sample_session("ses-done", SessionStatus::Completed))
            .expect("insert");
        assert!(repository.active_for_owner("usr-1").expect("lookup").is_none());

        repository
            .insert(&sample_session("ses-live", SessionStatus::Active))
            .expect("insert");
        let active = repository
            .active_for_owner("usr-1")
            .expect("lookup")
            .expect("active exists");
        assert_eq!(active.id, "ses-live");
    }

    #[test]
    fn update_replaces_stored_state() {
        let repository = InMemorySessionRepository::default();
        let mut session = sample_session("ses-1", SessionStatus::Active);
        repository.insert(&session).expect("insert");

        session.status = SessionStatus::EmergencyDisabled;
        session.disable_reason = Some("travel week".to_string());
        session.version += 1;
        repository.update(&session).expect("update");

        let loaded = repository.get("ses-1").expect("get").expect("exists");
        assert_eq!(loaded.status, SessionStatus::EmergencyDisabled);
        assert_eq!(loaded.disable_reason.as_deref(), Some("travel week"));
        assert!(repository.active_for_owner("usr-1").expect("lookup").is_none());
    }
}
