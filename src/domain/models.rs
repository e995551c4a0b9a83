use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_SESSION_DAYS: u32 = 1;
pub const MAX_SESSION_DAYS: u32 = 365;
pub const SECONDS_PER_DAY: i64 = 86_400;
pub const MAX_EMERGENCY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    AddSite,
    StartSession,
    CompleteSession,
    DailyBonus,
    PanicMode,
    EmergencyResist,
    EmergencyDisable,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddSite => "add_site",
            Self::StartSession => "start_session",
            Self::CompleteSession => "complete_session",
            Self::DailyBonus => "daily_bonus",
            Self::PanicMode => "panic_mode",
            Self::EmergencyResist => "emergency_resist",
            Self::EmergencyDisable => "emergency_disable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "add_site" => Some(Self::AddSite),
            "start_session" => Some(Self::StartSession),
            "complete_session" => Some(Self::CompleteSession),
            "daily_bonus" => Some(Self::DailyBonus),
            "panic_mode" => Some(Self::PanicMode),
            "emergency_resist" => Some(Self::EmergencyResist),
            "emergency_disable" => Some(Self::EmergencyDisable),
            _ => None,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
    Banned,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Banned => "banned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "suspended" => Some(Self::Suspended),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    EmergencyDisabled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::EmergencyDisabled => "emergency_disabled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "emergency_disabled" => Some(Self::EmergencyDisabled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub total_score: i64,
    pub current_streak: u32,
    pub best_streak: u32,
    pub total_clean_days: u32,
    pub sessions_completed: u32,
    pub status: UserStatus,
    pub last_activity_at: DateTime<Utc>,
    pub version: i64,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            total_score: 0,
            current_streak: 0,
            best_streak: 0,
            total_clean_days: 0,
            sessions_completed: 0,
            status: UserStatus::Active,
            last_activity_at: now,
            version: 0,
        }
    }

    // Score never goes negative: penalties clamp at zero.
    pub fn apply_delta(&mut self, delta: i64, now: DateTime<Utc>) {
        self.total_score = (self.total_score + delta).max(0);
        self.last_activity_at = now;
        self.version += 1;
    }

    pub fn record_completion(&mut self, days_completed: u32, now: DateTime<Utc>) {
        self.current_streak += days_completed;
        self.best_streak = self.best_streak.max(self.current_streak);
        self.total_clean_days += days_completed;
        self.sessions_completed += 1;
        self.last_activity_at = now;
        self.version += 1;
    }

    pub fn reset_streak(&mut self, now: DateTime<Utc>) {
        self.current_streak = 0;
        self.last_activity_at = now;
        self.version += 1;
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.user_id, "profile.user_id")?;
        if self.total_score < 0 {
            return Err("profile.total_score must be >= 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockedSite {
    pub user_id: String,
    pub domain: String,
    pub added_at: DateTime<Utc>,
    pub removed: bool,
}

impl BlockedSite {
    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.user_id, "site.user_id")?;
        validate_non_empty(&self.domain, "site.domain")?;
        if normalize_domain(&self.domain).as_deref() != Some(self.domain.as_str()) {
            return Err("site.domain must be normalized (lowercase, no scheme)".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub owner_id: String,
    pub start_time: DateTime<Utc>,
    pub duration_days: u32,
    pub blocked_site_snapshot: Vec<String>,
    pub status: SessionStatus,
    pub emergency_attempts: u32,
    pub last_daily_bonus_day: u32,
    pub disable_reason: Option<String>,
    pub version: i64,
}

impl Session {
    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::seconds(self.duration_days as i64 * SECONDS_PER_DAY)
    }

    pub fn days_elapsed(&self, now: DateTime<Utc>) -> u32 {
        let elapsed_seconds = (now - self.start_time).num_seconds().max(0);
        (elapsed_seconds / SECONDS_PER_DAY) as u32
    }

    pub fn days_completed(&self, now: DateTime<Utc>) -> u32 {
        self.days_elapsed(now).min(self.duration_days)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_time()
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "session.id")?;
        validate_non_empty(&self.owner_id, "session.owner_id")?;
        if !(MIN_SESSION_DAYS..=MAX_SESSION_DAYS).contains(&self.duration_days) {
            return Err(format!(
                "session.duration_days must be within {MIN_SESSION_DAYS}..={MAX_SESSION_DAYS}"
            ));
        }
        if self.blocked_site_snapshot.is_empty() {
            return Err("session.blocked_site_snapshot must not be empty".to_string());
        }
        if self.emergency_attempts > MAX_EMERGENCY_ATTEMPTS {
            return Err(format!(
                "session.emergency_attempts must be <= {MAX_EMERGENCY_ATTEMPTS}"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointTransaction {
    pub user_id: String,
    pub action_type: ActionType,
    pub points_awarded: i64,
    pub occurred_at: DateTime<Utc>,
    pub context_digest: String,
    pub nonce: u64,
    pub integrity_hash: String,
    pub previous_hash: String,
    pub flagged: bool,
}

pub fn normalize_domain(value: &str) -> Option<String> {
    let trimmed = value
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains(char::is_whitespace) || !trimmed.contains('.') {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
