use crate::domain::models::ActionType;
use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_calls: usize,
    pub window_seconds: i64,
}

pub fn rule_for(action: ActionType) -> Option<RateLimitRule> {
    match action {
        ActionType::AddSite => Some(RateLimitRule {
            max_calls: 5,
            window_seconds: 3_600,
        }),
        ActionType::PanicMode => Some(RateLimitRule {
            max_calls: 3,
            window_seconds: 1_800,
        }),
        ActionType::EmergencyResist => Some(RateLimitRule {
            max_calls: 10,
            window_seconds: 3_600,
        }),
        ActionType::StartSession => Some(RateLimitRule {
            max_calls: 3,
            window_seconds: 86_400,
        }),
        _ => None,
    }
}

// Windows are process-local and deliberately not persisted: a host restart
// clears them.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, ActionType), Vec<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record(
        &self,
        user_id: &str,
        action: ActionType,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let Some(rule) = rule_for(action) else {
            return Ok(());
        };

        let mut windows = self.windows.lock().map_err(|error| {
            CoreError::PersistenceUnavailable(format!("rate limiter lock poisoned: {error}"))
        })?;
        let stamps = windows
            .entry((user_id.to_string(), action))
            .or_default();

        let cutoff = now - Duration::seconds(rule.window_seconds);
        stamps.retain(|stamp| *stamp > cutoff);

        if stamps.len() >= rule.max_calls {
            let oldest = stamps[0];
            let retry_after_seconds =
                (oldest + Duration::seconds(rule.window_seconds) - now).num_seconds();
            return Err(CoreError::RateLimitExceeded {
                user_id: user_id.to_string(),
                action,
                retry_after_seconds: retry_after_seconds.max(1),
            });
        }

        stamps.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    #[test]
    fn sixth_add_site_within_the_hour_is_rejected() {
        let limiter = RateLimiter::new();
        let start = fixed_time("2026-03-02T08:00:00Z");

        for minute in 0..5 {
            limiter
                .check_and_record("usr-1", ActionType::AddSite, start + Duration::minutes(minute))
                .expect("within limit");
        }

        let result =
            limiter.check_and_record("usr-1", ActionType::AddSite, start + Duration::minutes(5));
        match result {
            Err(CoreError::RateLimitExceeded {
                retry_after_seconds,
                action,
                ..
            }) => {
                assert_eq!(action, ActionType::AddSite);
                assert!(retry_after_seconds > 0 && retry_after_seconds <= 3_600);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[test]
    fn call_succeeds_after_window_fully_elapses() {
        let limiter = RateLimiter::new();
        let start = fixed_time("2026-03-02T08:00:00Z");

        for _ in 0..5 {
            limiter
                .check_and_record("usr-1", ActionType::AddSite, start)
                .expect("within limit");
        }
        assert!(limiter
            .check_and_record("usr-1", ActionType::AddSite, start + Duration::seconds(3_599))
            .is_err());
        limiter
            .check_and_record("usr-1", ActionType::AddSite, start + Duration::seconds(3_600))
            .expect("window elapsed");
    }

    #[test]
    fn keys_are_scoped_per_user_and_action() {
        let limiter = RateLimiter::new();
        let now = fixed_time("2026-03-02T08:00:00Z");

        for _ in 0..5 {
            limiter
                .check_and_record("usr-1", ActionType::AddSite, now)
                .expect("usr-1 within limit");
        }
        // a different user and a different action are unaffected
        limiter
            .check_and_record("usr-2", ActionType::AddSite, now)
            .expect("usr-2 unaffected");
        limiter
            .check_and_record("usr-1", ActionType::PanicMode, now)
            .expect("other action unaffected");
    }

    #[test]
    fn unconfigured_actions_are_unlimited() {
        let limiter = RateLimiter::new();
        let now = fixed_time("2026-03-02T08:00:00Z");
        for _ in 0..100 {
            limiter
                .check_and_record("usr-1", ActionType::DailyBonus, now)
                .expect("no limit configured");
        }
    }

    #[test]
    fn concurrent_calls_never_exceed_the_window_max() {
        let limiter = Arc::new(RateLimiter::new());
        let now = fixed_time("2026-03-02T08:00:00Z");
        let successes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let successes = Arc::clone(&successes);
                std::thread::spawn(move || {
                    if limiter
                        .check_and_record("usr-1", ActionType::AddSite, now)
                        .is_ok()
                    {
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread join");
        }

        assert_eq!(successes.load(Ordering::SeqCst), 5);
    }
}
