use crate::domain::models::ActionType;
use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    SessionStarted {
        user_id: String,
        session_id: String,
        duration_days: u32,
        points_awarded: i64,
    },
    DailyBonus {
        user_id: String,
        session_id: String,
        days_granted: u32,
        points_awarded: i64,
    },
    SessionCompleted {
        user_id: String,
        session_id: String,
        days_completed: u32,
        points_awarded: i64,
    },
    EmergencyDisabled {
        user_id: String,
        session_id: String,
        points_deducted: i64,
    },
    RateLimited {
        user_id: String,
        action: ActionType,
        retry_after_seconds: i64,
    },
    OfflineModeEntered {
        user_id: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<CoreEvent>>,
}

impl InMemoryEventSink {
    pub fn snapshot(&self) -> Vec<CoreEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn drain(&self) -> Vec<CoreEvent> {
        match self.events.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl EventSink for InMemoryEventSink {
    fn emit(&self, event: CoreEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: CoreEvent) {
        match &event {
            CoreEvent::OfflineModeEntered { user_id } => {
                tracing::warn!(user_id = %user_id, "entered offline mode");
            }
            CoreEvent::RateLimited {
                user_id,
                action,
                retry_after_seconds,
            } => {
                tracing::warn!(
                    user_id = %user_id,
                    action = %action,
                    retry_after_seconds,
                    "action rate limited"
                );
            }
            other => {
                let payload = serde_json::to_string(other).unwrap_or_default();
                tracing::info!(event = %payload, "core event");
            }
        }
    }
}
