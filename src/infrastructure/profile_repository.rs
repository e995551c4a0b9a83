use crate::domain::models::{BlockedSite, UserProfile, UserStatus};
use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait ProfileRepository: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<UserProfile>, CoreError>;
    fn upsert(&self, profile: &UserProfile) -> Result<(), CoreError>;
    fn list_sites(&self, user_id: &str) -> Result<Vec<BlockedSite>, CoreError>;
    fn upsert_site(&self, site: &BlockedSite) -> Result<(), CoreError>;
    fn remove_site(&self, user_id: &str, domain: &str) -> Result<bool, CoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteProfileRepository {
    db_path: PathBuf,
}

impl SqliteProfileRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path)
            .map_err(|error| CoreError::PersistenceUnavailable(format!("profile store: {error}")))
    }
}

fn parse_stored_time(raw: &str, column: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| CoreError::InvalidConfig(format!("invalid {column} '{raw}': {error}")))
}

impl ProfileRepository for SqliteProfileRepository {
    fn get(&self, user_id: &str) -> Result<Option<UserProfile>, CoreError> {
        let connection = self.connect()?;
        let row: Option<(i64, i64, i64, i64, i64, String, String, i64)> = connection
            .query_row(
                "SELECT total_score, current_streak, best_streak, total_clean_days,
                        sessions_completed, status, last_activity_at, version
                 FROM user_profiles WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((score, streak, best, clean, completed, status_raw, activity_raw, version)) = row
        else {
            return Ok(None);
        };

        let status = UserStatus::parse(&status_raw).ok_or_else(|| {
            CoreError::InvalidConfig(format!("unknown profile status '{status_raw}'"))
        })?;

        Ok(Some(UserProfile {
            user_id: user_id.to_string(),
            total_score: score,
            current_streak: streak as u32,
            best_streak: best as u32,
            total_clean_days: clean as u32,
            sessions_completed: completed as u32,
            status,
            last_activity_at: parse_stored_time(&activity_raw, "user_profiles.last_activity_at")?,
            version,
        }))
    }

    fn upsert(&self, profile: &UserProfile) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO user_profiles
                 (user_id, total_score, current_streak, best_streak, total_clean_days,
                  sessions_completed, status, last_activity_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(user_id) DO UPDATE SET
                 total_score = excluded.total_score,
                 current_streak = excluded.current_streak,
                 best_streak = excluded.best_streak,
                 total_clean_days = excluded.total_clean_days,
                 sessions_completed = excluded.sessions_completed,
                 status = excluded.status,
                 last_activity_at = excluded.last_activity_at,
                 version = excluded.version",
            params![
                profile.user_id,
                profile.total_score,
                profile.current_streak as i64,
                profile.best_streak as i64,
                profile.total_clean_days as i64,
                profile.sessions_completed as i64,
                profile.status.as_str(),
                profile.last_activity_at.to_rfc3339(),
                profile.version,
            ],
        )?;
        Ok(())
    }

    fn list_sites(&self, user_id: &str) -> Result<Vec<BlockedSite>, CoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT domain, added_at, removed FROM blocked_sites
             WHERE user_id = ?1 AND removed = 0 ORDER BY added_at ASC, domain ASC",
        )?;
        let rows = statement.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut sites = Vec::new();
        for row in rows {
            let (domain, added_raw, removed) = row?;
            sites.push(BlockedSite {
                user_id: user_id.to_string(),
                domain,
                added_at: parse_stored_time(&added_raw, "blocked_sites.added_at")?,
                removed: removed != 0,
            });
        }
        Ok(sites)
    }

    fn upsert_site(&self, site: &BlockedSite) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO blocked_sites (user_id, domain, added_at, removed)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, domain) DO UPDATE SET
                 added_at = excluded.added_at,
                 removed = excluded.removed",
            params![
                site.user_id,
                site.domain,
                site.added_at.to_rfc3339(),
                site.removed as i64,
            ],
        )?;
        Ok(())
    }

    fn remove_site(&self, user_id: &str, domain: &str) -> Result<bool, CoreError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE blocked_sites SET removed = 1
             WHERE user_id = ?1 AND domain = ?2 AND removed = 0",
            params![user_id, domain],
        )?;
        Ok(changed > 0)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProfileRepository {
    profiles: Mutex<HashMap<String, UserProfile>>,
    sites: Mutex<HashMap<String, Vec<BlockedSite>>>,
}

impl InMemoryProfileRepository {
    fn poisoned(error: impl std::fmt::Display) -> CoreError {
        CoreError::PersistenceUnavailable(format!("profile store lock poisoned: {error}"))
    }
}

impl ProfileRepository for InMemoryProfileRepository {
    fn get(&self, user_id: &str) -> Result<Option<UserProfile>, CoreError> {
        let profiles = self.profiles.lock().map_err(Self::poisoned)?;
        Ok(profiles.get(user_id).cloned())
    }

    fn upsert(&self, profile: &UserProfile) -> Result<(), CoreError> {
        let mut profiles = self.profiles.lock().map_err(Self::poisoned)?;
        profiles.insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }

    fn list_sites(&self, user_id: &str) -> Result<Vec<BlockedSite>, CoreError> {
        let sites = self.sites.lock().map_err(Self::poisoned)?;
        Ok(sites
            .get(user_id)
            .map(|list| {
                list.iter()
                    .filter(|site| !site.removed)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert_site(&self, site: &BlockedSite) -> Result<(), CoreError> {
        let mut sites = self.sites.lock().map_err(Self::poisoned)?;
        let list = sites.entry(site.user_id.clone()).or_default();
        if let Some(existing) = list.iter_mut().find(|entry| entry.domain == site.domain) {
            *existing = site.clone();
        } else {
            list.push(site.clone());
        }
        Ok(())
    }

    fn remove_site(&self, user_id: &str, domain: &str) -> Result<bool, CoreError> {
        let mut sites = self.sites.lock().map_err(Self::poisoned)?;
        let Some(list) = sites.get_mut(user_id) else {
            return Ok(false);
        };
        let Some(existing) = list
            .iter_mut()
            .find(|entry| entry.domain == domain && !entry.removed)
        else {
            return Ok(false);
        };
        existing.removed = true;
        Ok(true)
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

    fn sample_site(domain: &str) -> BlockedSite {
        BlockedSite {
            user_id: "usr-1".to_string(),
            domain: domain.to_string(),
            added_at: fixed_time("2026-03-02T08:00:00Z"),
            removed: false,
        }
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let repository = InMemoryProfileRepository::default();
        assert!(repository.get("usr-1").expect("get").is_none());

        let mut profile = UserProfile::new("usr-1", fixed_time("2026-03-02T08:00:00Z"));
        profile.apply_delta(150, fixed_time("2026-03-02T09:00:00Z"));
        repository.upsert(&profile).expect("upsert");

        let loaded = repository.get("usr-1").expect("get").expect("exists");
        assert_eq!(loaded, profile);
    }

    #[test]
    fn removed_sites_disappear_from_listing() {
        let repository = InMemoryProfileRepository::default();
        repository.upsert_site(&sample_site("reddit.com")).expect("add");
        repository.upsert_site(&sample_site("x.com")).expect("add");

        assert!(repository.remove_site("usr-1", "reddit.com").expect("remove"));
        let remaining = repository.list_sites("usr-1").expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].domain, "x.com");

        // second soft delete is a no-op
        assert!(!repository.remove_site("usr-1", "reddit.com").expect("remove"));
    }

    #[test]
    fn re_adding_a_removed_site_restores_it() {
        let repository = InMemoryProfileRepository::default();
        repository.upsert_site(&sample_site("reddit.com")).expect("add");
        repository.remove_site("usr-1", "reddit.com").expect("remove");

        repository.upsert_site(&sample_site("reddit.com")).expect("re-add");
        let sites = repository.list_sites("usr-1").expect("list");
        assert_eq!(sites.len(), 1);
    }
}
