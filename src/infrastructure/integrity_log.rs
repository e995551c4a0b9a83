//! Append-only, hash-chained ledger of point events. The chain and its
//! proof-of-work are tamper-evidence and append throttling for a single
//! writer, not a security boundary: whoever controls the store can rewrite
//! the whole chain.

use crate::domain::models::{ActionType, PointTransaction};
use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const GENESIS_HASH: &str = "0";
pub const DEFAULT_POW_DIFFICULTY: usize = 2;

pub fn digest_context(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn compute_entry_hash(
    previous_hash: &str,
    occurred_at: DateTime<Utc>,
    action: ActionType,
    points: i64,
    context_digest: &str,
    nonce: u64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(occurred_at.timestamp_millis().to_be_bytes());
    hasher.update(action.as_str().as_bytes());
    hasher.update(points.to_be_bytes());
    hasher.update(context_digest.as_bytes());
    hasher.update(nonce.to_be_bytes());
    hex::encode(hasher.finalize())
}

pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|byte| byte == b'0')
}

pub fn mine_nonce(
    previous_hash: &str,
    occurred_at: DateTime<Utc>,
    action: ActionType,
    points: i64,
    context_digest: &str,
    difficulty: usize,
) -> (u64, String) {
    let mut nonce = 0u64;
    loop {
        let hash = compute_entry_hash(
            previous_hash,
            occurred_at,
            action,
            points,
            context_digest,
            nonce,
        );
        if meets_difficulty(&hash, difficulty) {
            return (nonce, hash);
        }
        nonce += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVerification {
    Valid,
    TamperedAt(usize),
}

pub fn verify_chain(entries: &[PointTransaction], difficulty: usize) -> ChainVerification {
    let mut previous = GENESIS_HASH.to_string();
    for (index, entry) in entries.iter().enumerate() {
        if entry.previous_hash != previous {
            return ChainVerification::TamperedAt(index);
        }
        let recomputed = compute_entry_hash(
            &entry.previous_hash,
            entry.occurred_at,
            entry.action_type,
            entry.points_awarded,
            &entry.context_digest,
            entry.nonce,
        );
        if recomputed != entry.integrity_hash || !meets_difficulty(&recomputed, difficulty) {
            return ChainVerification::TamperedAt(index);
        }
        previous = entry.integrity_hash.clone();
    }
    ChainVerification::Valid
}

pub trait IntegrityLogRepository: Send + Sync {
    fn append(&self, entry: &PointTransaction) -> Result<(), CoreError>;
    fn head_hash(&self, user_id: &str) -> Result<Option<String>, CoreError>;
    fn list_for_user(&self, user_id: &str) -> Result<Vec<PointTransaction>, CoreError>;
    fn count_unflagged(&self, user_id: &str, action: ActionType) -> Result<u64, CoreError>;
    fn mark_flagged(&self, user_id: &str, integrity_hash: &str) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteIntegrityLog {
    db_path: PathBuf,
}

impl SqliteIntegrityLog {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, CoreError> {
        Connection::open(&self.db_path)
            .map_err(|error| CoreError::PersistenceUnavailable(format!("integrity log: {error}")))
    }
}

impl IntegrityLogRepository for SqliteIntegrityLog {
    fn append(&self, entry: &PointTransaction) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO point_transactions
                 (user_id, action_type, points_awarded, occurred_at,
                  context_digest, nonce, integrity_hash, previous_hash, flagged)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.user_id,
                entry.action_type.as_str(),
                entry.points_awarded,
                entry.occurred_at.to_rfc3339(),
                entry.context_digest,
                entry.nonce as i64,
                entry.integrity_hash,
                entry.previous_hash,
                entry.flagged as i64,
            ],
        )?;
        Ok(())
    }

    fn head_hash(&self, user_id: &str) -> Result<Option<String>, CoreError> {
        let connection = self.connect()?;
        let head: Option<String> = connection
            .query_row(
                "SELECT integrity_hash FROM point_transactions
                 WHERE user_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(head)
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<PointTransaction>, CoreError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT user_id, action_type, points_awarded, occurred_at,
                    context_digest, nonce, integrity_hash, previous_hash, flagged
             FROM point_transactions WHERE user_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = statement.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (user, action_raw, points, occurred_raw, digest, nonce, hash, previous, flagged) =
                row?;
            let action_type = ActionType::parse(&action_raw).ok_or_else(|| {
                CoreError::InvalidConfig(format!("unknown action_type '{action_raw}' in ledger"))
            })?;
            let occurred_at = DateTime::parse_from_rfc3339(&occurred_raw)
                .map_err(|error| {
                    CoreError::InvalidConfig(format!(
                        "invalid ledger timestamp '{occurred_raw}': {error}"
                    ))
                })?
                .with_timezone(&Utc);
            entries.push(PointTransaction {
                user_id: user,
                action_type,
                points_awarded: points,
                occurred_at,
                context_digest: digest,
                nonce: nonce as u64,
                integrity_hash: hash,
                previous_hash: previous,
                flagged: flagged != 0,
            });
        }
        Ok(entries)
    }

    fn count_unflagged(&self, user_id: &str, action: ActionType) -> Result<u64, CoreError> {
        let connection = self.connect()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM point_transactions
             WHERE user_id = ?1 AND action_type = ?2 AND flagged = 0",
            params![user_id, action.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn mark_flagged(&self, user_id: &str, integrity_hash: &str) -> Result<(), CoreError> {
        let connection = self.connect()?;
        connection.execute(
            "UPDATE point_transactions SET flagged = 1
             WHERE user_id = ?1 AND integrity_hash = ?2",
            params![user_id, integrity_hash],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryIntegrityLog {
    chains: Mutex<HashMap<String, Vec<PointTransaction>>>,
}

impl InMemoryIntegrityLog {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<PointTransaction>>>, CoreError> {
        self.chains
            .lock()
            .map_err(|error| CoreError::PersistenceUnavailable(format!("integrity log lock poisoned: {error}")))
    }
}

impl IntegrityLogRepository for InMemoryIntegrityLog {
    fn append(&self, entry: &PointTransaction) -> Result<(), CoreError> {
        let mut chains = self.lock()?;
        chains
            .entry(entry.user_id.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn head_hash(&self, user_id: &str) -> Result<Option<String>, CoreError> {
        let chains = self.lock()?;
        Ok(chains
            .get(user_id)
            .and_then(|chain| chain.last())
            .map(|entry| entry.integrity_hash.clone()))
    }

    fn list_for_user(&self, user_id: &str) -> Result<Vec<PointTransaction>, CoreError> {
        let chains = self.lock()?;
        Ok(chains.get(user_id).cloned().unwrap_or_default())
    }

    fn count_unflagged(&self, user_id: &str, action: ActionType) -> Result<u64, CoreError> {
        let chains = self.lock()?;
        Ok(chains
            .get(user_id)
            .map(|chain| {
                chain
                    .iter()
                    .filter(|entry| entry.action_type == action && !entry.flagged)
                    .count() as u64
            })
            .unwrap_or(0))
    }

    fn mark_flagged(&self, user_id: &str, integrity_hash: &str) -> Result<(), CoreError> {
        let mut chains = self.lock()?;
        if let Some(chain) = chains.get_mut(user_id) {
            for entry in chain.iter_mut() {
                if entry.integrity_hash == integrity_hash {
                    entry.flagged = true;
                }
            }
        }
        Ok(())
    }
}
