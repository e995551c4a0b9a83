use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub const MAX_CLOCK_DRIFT_SECONDS: i64 = 300;

pub fn system_now_provider() -> NowProvider {
    Arc::new(Utc::now)
}

pub fn ensure_within_drift(
    claimed: DateTime<Utc>,
    authoritative: DateTime<Utc>,
) -> Result<(), CoreError> {
    let skew_seconds = (claimed - authoritative).num_seconds();
    if skew_seconds.abs() > MAX_CLOCK_DRIFT_SECONDS {
        return Err(CoreError::ClockDriftTooLarge { skew_seconds });
    }
    Ok(())
}

#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set(&self, value: DateTime<Utc>) {
        match self.now.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    pub fn advance(&self, duration: Duration) {
        match self.now.lock() {
            Ok(mut guard) => *guard += duration,
            Err(poisoned) => *poisoned.into_inner() += duration,
        }
    }

    pub fn provider(&self) -> NowProvider {
        let clock = self.clone();
        Arc::new(move || clock.now())
    }
}
