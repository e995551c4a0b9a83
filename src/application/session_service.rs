use crate::application::point_policy::{PointContext, EMERGENCY_DISABLE_PENALTY};
use crate::application::points::PointEngine;
use crate::domain::models::{
    normalize_domain, ActionType, Session, SessionStatus, MAX_EMERGENCY_ATTEMPTS,
    MAX_SESSION_DAYS, MIN_SESSION_DAYS,
};
use crate::infrastructure::blocking::BlockingEnforcer;
use crate::infrastructure::clock::{system_now_provider, NowProvider};
use crate::infrastructure::error::CoreError;
use crate::infrastructure::events::{CoreEvent, EventSink};
use crate::infrastructure::integrity_log::IntegrityLogRepository;
use crate::infrastructure::pending_queue::PendingWriteQueue;
use crate::infrastructure::profile_repository::ProfileRepository;
use crate::infrastructure::session_repository::SessionRepository;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str, now_millis: i64) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{now_millis}-{sequence}")
}

#[derive(Debug, Clone, Serialize)]
pub struct StartSessionOutcome {
    pub session: Session,
    pub points_awarded: i64,
    pub new_total: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletionOutcome {
    pub session: Session,
    pub days_completed: u32,
    pub points_awarded: i64,
    pub new_total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    NoActiveSession,
    AlreadyGranted,
    BonusGranted {
        days_granted: u32,
        points_awarded: i64,
        new_total: i64,
    },
    Completed(CompletionOutcome),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EmergencyAttemptOutcome {
    Intervention {
        attempts_used: u32,
        attempts_remaining: u32,
    },
    ConfirmationUnlocked {
        attempts_used: u32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergencyDisableOutcome {
    pub session: Session,
    pub points_deducted: i64,
    pub new_total: i64,
}

pub struct SessionService<S, L, P, Q>
where
    S: SessionRepository,
    L: IntegrityLogRepository,
    P: ProfileRepository,
    Q: PendingWriteQueue,
{
    sessions: Arc<S>,
    points: Arc<PointEngine<L, P, Q>>,
    profiles: Arc<P>,
    blocking: Arc<dyn BlockingEnforcer>,
    events: Arc<dyn EventSink>,
    now_provider: NowProvider,
    redirect_target: String,
}

impl<S, L, P, Q> SessionService<S, L, P, Q>
where
    S: SessionRepository,
    L: IntegrityLogRepository,
    P: ProfileRepository,
    Q: PendingWriteQueue,
{
    pub fn new(
        sessions: Arc<S>,
        points: Arc<PointEngine<L, P, Q>>,
        profiles: Arc<P>,
        blocking: Arc<dyn BlockingEnforcer>,
        events: Arc<dyn EventSink>,
        redirect_target: impl Into<String>,
    ) -> Self {
        Self {
            sessions,
            points,
            profiles,
            blocking,
            events,
            now_provider: system_now_provider(),
            redirect_target: redirect_target.into(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn start_session(
        &self,
        user_id: &str,
        site_list: &[String],
        duration_days: u32,
    ) -> Result<StartSessionOutcome, CoreError> {
        if !(MIN_SESSION_DAYS..=MAX_SESSION_DAYS).contains(&duration_days) {
            return Err(CoreError::InvalidDuration {
                days: duration_days,
            });
        }

        let mut snapshot: Vec<String> = site_list
            .iter()
            .filter_map(|raw| normalize_domain(raw))
            .collect();
        snapshot.sort();
        snapshot.dedup();
        if snapshot.is_empty() {
            return Err(CoreError::EmptySiteList);
        }

        if self.sessions.active_for_owner(user_id)?.is_some() {
            return Err(CoreError::SessionAlreadyActive {
                user_id: user_id.to_string(),
            });
        }

        // rate limit and award gate creation; a rejected start leaves no session
        let award = self.points.award(
            user_id,
            ActionType::StartSession,
            PointContext {
                duration_days,
                ..Default::default()
            },
            &serde_json::json!({ "duration_days": duration_days, "sites": snapshot.len() }),
        )?;

        let now = (self.now_provider)();
        let session = Session {
            id: next_id("ses", now.timestamp_millis()),
            owner_id: user_id.to_string(),
            start_time: now,
            duration_days,
            blocked_site_snapshot: snapshot,
            status: SessionStatus::Active,
            emergency_attempts: 0,
            last_daily_bonus_day: 0,
            disable_reason: None,
            version: 0,
        };
        self.sessions.insert(&session)?;
        self.blocking
            .install(&session.blocked_site_snapshot, &self.redirect_target)?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            duration_days,
            "blocking session started"
        );
        self.events.emit(CoreEvent::SessionStarted {
            user_id: user_id.to_string(),
            session_id: session.id.clone(),
            duration_days,
            points_awarded: award.points_awarded,
        });

        Ok(StartSessionOutcome {
            session,
            points_awarded: award.points_awarded,
            new_total: award.new_total,
        })
    }

    pub fn tick(&self, user_id: &str) -> Result<TickOutcome, CoreError> {
        let now = (self.now_provider)();
        let Some(mut session) = self.sessions.active_for_owner(user_id)? else {
            return Ok(TickOutcome::NoActiveSession);
        };

        if session.is_expired(now) {
            let outcome = self.complete(&mut session)?;
            return Ok(TickOutcome::Completed(outcome));
        }

        let days_elapsed = session.days_elapsed(now);
        if days_elapsed <= session.last_daily_bonus_day {
            return Ok(TickOutcome::AlreadyGranted);
        }

        let days_granted = days_elapsed - session.last_daily_bonus_day;
        let award = self.points.award(
            user_id,
            ActionType::DailyBonus,
            PointContext {
                bonus_days: days_granted,
                ..Default::default()
            },
            &serde_json::json!({ "session_id": session.id, "days": days_granted }),
        )?;

        session.last_daily_bonus_day = days_elapsed;
        session.version += 1;
        self.sessions.update(&session)?;

        self.events.emit(CoreEvent::DailyBonus {
            user_id: user_id.to_string(),
            session_id: session.id.clone(),
            days_granted,
            points_awarded: award.points_awarded,
        });

        Ok(TickOutcome::BonusGranted {
            days_granted,
            points_awarded: award.points_awarded,
            new_total: award.new_total,
        })
    }

    pub fn complete_naturally(&self, user_id: &str) -> Result<CompletionOutcome, CoreError> {
        let Some(mut session) = self.sessions.active_for_owner(user_id)? else {
            return Err(CoreError::NoActiveSession {
                user_id: user_id.to_string(),
            });
        };
        self.complete(&mut session)
    }

    fn complete(&self, session: &mut Session) -> Result<CompletionOutcome, CoreError> {
        let now = (self.now_provider)();
        let days_completed = session.days_completed(now);

        let award = self.points.award(
            &session.owner_id,
            ActionType::CompleteSession,
            PointContext {
                days_completed,
                ..Default::default()
            },
            &serde_json::json!({ "session_id": session.id, "days_completed": days_completed }),
        )?;

        let mut profile = self
            .profiles
            .get(&session.owner_id)?
            .ok_or_else(|| CoreError::NoActiveSession {
                user_id: session.owner_id.clone(),
            })?;
        profile.record_completion(days_completed, now);
        self.profiles.upsert(&profile)?;

        session.status = SessionStatus::Completed;
        session.version += 1;
        self.sessions.update(session)?;
        self.blocking.clear()?;

        tracing::info!(
            user_id = %session.owner_id,
            session_id = %session.id,
            days_completed,
            "blocking session completed"
        );
        self.events.emit(CoreEvent::SessionCompleted {
            user_id: session.owner_id.clone(),
            session_id: session.id.clone(),
            days_completed,
            points_awarded: award.points_awarded,
        });

        Ok(CompletionOutcome {
            session: session.clone(),
            days_completed,
            points_awarded: award.points_awarded,
            new_total: award.new_total,
        })
    }

    pub fn attempt_emergency_disable(
        &self,
        user_id: &str,
    ) -> Result<EmergencyAttemptOutcome, CoreError> {
        let Some(mut session) = self.sessions.active_for_owner(user_id)? else {
            return Err(CoreError::NoActiveSession {
                user_id: user_id.to_string(),
            });
        };

        session.emergency_attempts = (session.emergency_attempts + 1).min(MAX_EMERGENCY_ATTEMPTS);
        session.version += 1;
        self.sessions.update(&session)?;

        if session.emergency_attempts < MAX_EMERGENCY_ATTEMPTS {
            Ok(EmergencyAttemptOutcome::Intervention {
                attempts_used: session.emergency_attempts,
                attempts_remaining: MAX_EMERGENCY_ATTEMPTS - session.emergency_attempts,
            })
        } else {
            Ok(EmergencyAttemptOutcome::ConfirmationUnlocked {
                attempts_used: session.emergency_attempts,
            })
        }
    }

    pub fn confirm_emergency_disable(
        &self,
        user_id: &str,
        reason: &str,
    ) -> Result<EmergencyDisableOutcome, CoreError> {
        if reason.trim().is_empty() {
            return Err(CoreError::MissingReason);
        }

        let Some(mut session) = self.sessions.active_for_owner(user_id)? else {
            return Err(CoreError::NoActiveSession {
                user_id: user_id.to_string(),
            });
        };
        if session.emergency_attempts < MAX_EMERGENCY_ATTEMPTS {
            return Err(CoreError::EmergencyNotUnlocked {
                user_id: user_id.to_string(),
                attempts_used: session.emergency_attempts,
            });
        }

        let now = (self.now_provider)();
        let penalty = self.points.penalize(
            user_id,
            ActionType::EmergencyDisable,
            EMERGENCY_DISABLE_PENALTY,
            &serde_json::json!({ "session_id": session.id, "reason": reason.trim() }),
        )?;

        let mut profile = self
            .profiles
            .get(user_id)?
            .ok_or_else(|| CoreError::NoActiveSession {
                user_id: user_id.to_string(),
            })?;
        profile.reset_streak(now);
        self.profiles.upsert(&profile)?;

        session.status = SessionStatus::EmergencyDisabled;
        session.disable_reason = Some(reason.trim().to_string());
        session.version += 1;
        self.sessions.update(&session)?;
        self.blocking.clear()?;

        tracing::warn!(
            user_id = %user_id,
            session_id = %session.id,
            "blocking session emergency disabled"
        );
        self.events.emit(CoreEvent::EmergencyDisabled {
            user_id: user_id.to_string(),
            session_id: session.id.clone(),
            points_deducted: EMERGENCY_DISABLE_PENALTY,
        });

        Ok(EmergencyDisableOutcome {
            session,
            points_deducted: EMERGENCY_DISABLE_PENALTY,
            new_total: penalty.new_total,
        })
    }

    pub fn resist_emergency(&self, user_id: &str) -> Result<(i64, i64), CoreError> {
        let Some(session) = self.sessions.active_for_owner(user_id)? else {
            return Err(CoreError::NoActiveSession {
                user_id: user_id.to_string(),
            });
        };
        if session.emergency_attempts >= MAX_EMERGENCY_ATTEMPTS {
            return Err(CoreError::Validation(
                "emergency disable is already unlocked; resist applies before the final attempt"
                    .to_string(),
            ));
        }

        let award = self.points.award(
            user_id,
            ActionType::EmergencyResist,
            PointContext::default(),
            &serde_json::json!({ "session_id": session.id }),
        )?;
        Ok((award.points_awarded, award.new_total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::blocking::InMemoryBlockingEnforcer;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::events::InMemoryEventSink;
    use crate::infrastructure::integrity_log::InMemoryIntegrityLog;
    use crate::infrastructure::pending_queue::InMemoryPendingWriteQueue;
    use crate::infrastructure::profile_repository::InMemoryProfileRepository;
    use chrono::{DateTime, Duration, Utc};
    use proptest::prelude::*;

    use crate::infrastructure::session_repository::InMemorySessionRepository;

    type TestService = SessionService<
        InMemorySessionRepository,
        InMemoryIntegrityLog,
        InMemoryProfileRepository,
        InMemoryPendingWriteQueue,
    >;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    struct Harness {
        service: TestService,
        sessions: Arc<InMemorySessionRepository>,
        profiles: Arc<InMemoryProfileRepository>,
        blocking: Arc<InMemoryBlockingEnforcer>,
        events: Arc<InMemoryEventSink>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let sessions = Arc::new(InMemorySessionRepository::default());
        let integrity_log = Arc::new(InMemoryIntegrityLog::default());
        let profiles = Arc::new(InMemoryProfileRepository::default());
        let pending = Arc::new(InMemoryPendingWriteQueue::default());
        let blocking = Arc::new(InMemoryBlockingEnforcer::default());
        let events = Arc::new(InMemoryEventSink::default());
        let clock = ManualClock::new(fixed_time("2026-03-02T08:00:00Z"));

        let points = Arc::new(
            PointEngine::new(
                integrity_log,
                Arc::clone(&profiles),
                pending,
                Arc::clone(&events) as Arc<dyn EventSink>,
            )
            .with_now_provider(clock.provider())
            .with_pow_difficulty(1),
        );
        let service = SessionService::new(
            Arc::clone(&sessions),
            points,
            Arc::clone(&profiles),
            Arc::clone(&blocking) as Arc<dyn BlockingEnforcer>,
            Arc::clone(&events) as Arc<dyn EventSink>,
            "blocked.html",
        )
        .with_now_provider(clock.provider());

        Harness {
            service,
            sessions,
            profiles,
            blocking,
            events,
            clock,
        }
    }

    fn sites() -> Vec<String> {
        vec!["reddit.com".to_string(), "x.com".to_string()]
    }

    #[test]
    fn start_session_validates_input() {
        let harness = harness();
        assert!(matches!(
            harness.service.start_session("usr-1", &sites(), 0),
            Err(CoreError::InvalidDuration { days: 0 })
        ));
        assert!(matches!(
            harness.service.start_session("usr-1", &sites(), 366),
            Err(CoreError::InvalidDuration { days: 366 })
        ));
        assert!(matches!(
            harness.service.start_session("usr-1", &[], 7),
            Err(CoreError::EmptySiteList)
        ));
        assert!(matches!(
            harness
                .service
                .start_session("usr-1", &["   ".to_string()], 7),
            Err(CoreError::EmptySiteList)
        ));
    }

    #[test]
    fn start_session_awards_points_and_installs_rules() {
        let harness = harness();
        let outcome = harness
            .service
            .start_session("usr-1", &sites(), 7)
            .expect("start");

        assert_eq!(outcome.points_awarded, 350);
        assert_eq!(outcome.new_total, 350);
        assert_eq!(outcome.session.blocked_site_snapshot.len(), 2);

        let rules = harness.blocking.installed().expect("rules installed");
        assert_eq!(rules.domains, outcome.session.blocked_site_snapshot);
        assert_eq!(rules.redirect_target, "blocked.html");

        assert!(matches!(
            harness.service.start_session("usr-1", &sites(), 3),
            Err(CoreError::SessionAlreadyActive { .. })
        ));
    }

    #[test]
    fn snapshot_ignores_later_site_list_changes() {
        let harness = harness();
        let outcome = harness
            .service
            .start_session("usr-1", &sites(), 7)
            .expect("start");
        let snapshot = outcome.session.blocked_site_snapshot.clone();

        // the caller mutating its list has no effect on the stored snapshot
        let loaded = harness
            .sessions
            .active_for_owner("usr-1")
            .expect("lookup")
            .expect("active");
        assert_eq!(loaded.blocked_site_snapshot, snapshot);
    }

    #[test]
    fn tick_awards_daily_bonus_exactly_once_per_day_window() {
        let harness = harness();
        harness
            .service
            .start_session("usr-1", &sites(), 7)
            .expect("start");
        let base_total = 350;

        // two days in, five consecutive ticks: exactly 20 points, not 100
        harness.clock.advance(Duration::days(2));
        let mut awarded_total = 0;
        for _ in 0..5 {
            match harness.service.tick("usr-1").expect("tick") {
                TickOutcome::BonusGranted { points_awarded, .. } => awarded_total += points_awarded,
                TickOutcome::AlreadyGranted => {}
                other => panic!("unexpected tick outcome {other:?}"),
            }
        }
        assert_eq!(awarded_total, 20);

        let profile = harness.profiles.get("usr-1").expect("get").expect("profile");
        assert_eq!(profile.total_score, base_total + 20);
    }

    #[test]
    fn tick_completes_expired_sessions_instead_of_granting_bonus() {
        let harness = harness();
        harness
            .service
            .start_session("usr-1", &sites(), 3)
            .expect("start");

        harness.clock.advance(Duration::days(3));
        let outcome = harness.service.tick("usr-1").expect("tick");
        let TickOutcome::Completed(completion) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        assert_eq!(completion.days_completed, 3);
        assert_eq!(completion.points_awarded, 300);
        assert!(harness.blocking.installed().is_none());

        let profile = harness.profiles.get("usr-1").expect("get").expect("profile");
        assert_eq!(profile.current_streak, 3);
        assert_eq!(profile.sessions_completed, 1);

        // terminal state allows a fresh start
        harness
            .service
            .start_session("usr-1", &sites(), 5)
            .expect("fresh start");
    }

    #[test]
    fn tick_without_active_session_is_a_no_op() {
        let harness = harness();
        assert!(matches!(
            harness.service.tick("usr-1").expect("tick"),
            TickOutcome::NoActiveSession
        ));
    }

    #[test]
    fn immediate_completion_awards_no_completion_bonus() {
        let harness = harness();
        harness
            .service
            .start_session("usr-1", &sites(), 30)
            .expect("start");

        let completion = harness
            .service
            .complete_naturally("usr-1")
            .expect("complete");
        assert_eq!(completion.days_completed, 0);
        assert_eq!(completion.points_awarded, 0);
        // the start bonus is untouched
        assert_eq!(completion.new_total, 1_500);
    }

    #[test]
    fn emergency_flow_requires_three_attempts_and_a_reason() {
        let harness = harness();
        harness
            .service
            .start_session("usr-1", &sites(), 7)
            .expect("start");
        let total_before = harness
            .profiles
            .get("usr-1")
            .expect("get")
            .expect("profile")
            .total_score;

        // first two attempts return interventions with no score change
        for expected_attempt in 1..=2 {
            let outcome = harness
                .service
                .attempt_emergency_disable("usr-1")
                .expect("attempt");
            assert_eq!(
                outcome,
                EmergencyAttemptOutcome::Intervention {
                    attempts_used: expected_attempt,
                    attempts_remaining: MAX_EMERGENCY_ATTEMPTS - expected_attempt,
                }
            );
        }
        assert!(matches!(
            harness.service.confirm_emergency_disable("usr-1", "I give up"),
            Err(CoreError::EmergencyNotUnlocked { attempts_used: 2, .. })
        ));
        let total_mid = harness
            .profiles
            .get("usr-1")
            .expect("get")
            .expect("profile")
            .total_score;
        assert_eq!(total_mid, total_before);

        let outcome = harness
            .service
            .attempt_emergency_disable("usr-1")
            .expect("third attempt");
        assert_eq!(
            outcome,
            EmergencyAttemptOutcome::ConfirmationUnlocked { attempts_used: 3 }
        );

        assert!(matches!(
            harness.service.confirm_emergency_disable("usr-1", "   "),
            Err(CoreError::MissingReason)
        ));

        let disabled = harness
            .service
            .confirm_emergency_disable("usr-1", "deadline week")
            .expect("confirm");
        assert_eq!(disabled.points_deducted, 500);
        // 350 start points - 500 penalty floors at 0
        assert_eq!(disabled.new_total, 0);
        assert_eq!(disabled.session.status, SessionStatus::EmergencyDisabled);
        assert_eq!(disabled.session.disable_reason.as_deref(), Some("deadline week"));
        assert!(harness.blocking.installed().is_none());

        let profile = harness.profiles.get("usr-1").expect("get").expect("profile");
        assert_eq!(profile.current_streak, 0);

        let events = harness.events.snapshot();
        assert!(events
            .iter()
            .any(|event| matches!(event, CoreEvent::EmergencyDisabled { .. })));
    }

    #[test]
    fn resist_awards_points_while_disable_is_locked() {
        let harness = harness();
        harness
            .service
            .start_session("usr-1", &sites(), 7)
            .expect("start");

        harness
            .service
            .attempt_emergency_disable("usr-1")
            .expect("attempt");
        let (points, total) = harness.service.resist_emergency("usr-1").expect("resist");
        assert_eq!(points, 25);
        assert_eq!(total, 375);

        // still active, attempts untouched by resisting
        let session = harness
            .sessions
            .active_for_owner("usr-1")
            .expect("lookup")
            .expect("active");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.emergency_attempts, 1);
    }

    // Feature: commitments, Property 1: immediate completion awards only the start bonus
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn property1_start_then_complete_awards_start_bonus_only(
            duration in MIN_SESSION_DAYS..=MAX_SESSION_DAYS
        ) {
            let harness = harness();
            let started = harness
                .service
                .start_session("usr-1", &sites(), duration)
                .expect("start");
            prop_assert_eq!(started.points_awarded, duration as i64 * 50);

            let completion = harness
                .service
                .complete_naturally("usr-1")
                .expect("complete");
            prop_assert_eq!(completion.days_completed, 0);
            prop_assert_eq!(completion.points_awarded, 0);
            prop_assert_eq!(completion.new_total, duration as i64 * 50);
        }
    }
}
