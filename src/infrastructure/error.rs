use crate::domain::models::ActionType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("session duration must be between 1 and 365 days, got {days}")]
    InvalidDuration { days: u32 },
    #[error("site list must not be empty")]
    EmptySiteList,
    #[error("emergency disable requires a non-empty reason")]
    MissingReason,
    #[error("emergency disable for user {user_id} requires 3 attempts, only {attempts_used} made")]
    EmergencyNotUnlocked { user_id: String, attempts_used: u32 },
    #[error("user {user_id} already has an active blocking session")]
    SessionAlreadyActive { user_id: String },
    #[error("user {user_id} has no active blocking session")]
    NoActiveSession { user_id: String },
    #[error("rate limit exceeded for {action} by user {user_id}; retry after {retry_after_seconds}s")]
    RateLimitExceeded {
        user_id: String,
        action: ActionType,
        retry_after_seconds: i64,
    },
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("client clock differs from server time by {skew_seconds}s")]
    ClockDriftTooLarge { skew_seconds: i64 },
    #[error("integrity violation in chain for user {user_id} at index {index}")]
    IntegrityViolation { user_id: String, index: usize },
    #[error("remote store error: {0}")]
    Remote(String),
    #[error("credential error: {0}")]
    Credential(String),
}
