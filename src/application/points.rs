use crate::application::point_policy::{self, PointContext};
use crate::application::rate_limiter::RateLimiter;
use crate::domain::models::{ActionType, PointTransaction, UserProfile};
use crate::infrastructure::clock::{system_now_provider, NowProvider};
use crate::infrastructure::error::CoreError;
use crate::infrastructure::events::{CoreEvent, EventSink};
use crate::infrastructure::integrity_log::{
    digest_context, mine_nonce, IntegrityLogRepository, DEFAULT_POW_DIFFICULTY, GENESIS_HASH,
};
use crate::infrastructure::pending_queue::{PendingWrite, PendingWriteQueue};
use crate::infrastructure::profile_repository::ProfileRepository;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct AwardOutcome {
    pub transaction: PointTransaction,
    pub points_awarded: i64,
    pub new_total: i64,
}

pub struct PointEngine<L, P, Q>
where
    L: IntegrityLogRepository,
    P: ProfileRepository,
    Q: PendingWriteQueue,
{
    integrity_log: Arc<L>,
    profiles: Arc<P>,
    pending: Arc<Q>,
    events: Arc<dyn EventSink>,
    rate_limiter: RateLimiter,
    now_provider: NowProvider,
    pow_difficulty: usize,
    // serializes the read-mine-append-upsert sequence per user so the
    // chain never forks and multiplier counts stay in submission order
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<L, P, Q> PointEngine<L, P, Q>
where
    L: IntegrityLogRepository,
    P: ProfileRepository,
    Q: PendingWriteQueue,
{
    pub fn new(
        integrity_log: Arc<L>,
        profiles: Arc<P>,
        pending: Arc<Q>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            integrity_log,
            profiles,
            pending,
            events,
            rate_limiter: RateLimiter::new(),
            now_provider: system_now_provider(),
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_pow_difficulty(mut self, pow_difficulty: usize) -> Self {
        self.pow_difficulty = pow_difficulty;
        self
    }

    pub fn award(
        &self,
        user_id: &str,
        action: ActionType,
        context: PointContext,
        context_payload: &serde_json::Value,
    ) -> Result<AwardOutcome, CoreError> {
        let now = (self.now_provider)();
        if let Err(error) = self.rate_limiter.check_and_record(user_id, action, now) {
            if let CoreError::RateLimitExceeded {
                retry_after_seconds,
                ..
            } = &error
            {
                self.events.emit(CoreEvent::RateLimited {
                    user_id: user_id.to_string(),
                    action,
                    retry_after_seconds: *retry_after_seconds,
                });
            }
            return Err(error);
        }

        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(|error| {
            CoreError::PersistenceUnavailable(format!("point pipeline lock poisoned: {error}"))
        })?;

        let prior_occurrences = self.integrity_log.count_unflagged(user_id, action)?;
        let points = point_policy::award(action, context, prior_occurrences);
        self.record(user_id, action, points, context_payload)
    }

    // Penalties skip the rate limiter and the diminishing-returns table.
    pub fn penalize(
        &self,
        user_id: &str,
        action: ActionType,
        amount: i64,
        context_payload: &serde_json::Value,
    ) -> Result<AwardOutcome, CoreError> {
        let lock = self.user_lock(user_id)?;
        let _guard = lock.lock().map_err(|error| {
            CoreError::PersistenceUnavailable(format!("point pipeline lock poisoned: {error}"))
        })?;
        self.record(user_id, action, -amount.abs(), context_payload)
    }

    fn record(
        &self,
        user_id: &str,
        action: ActionType,
        points: i64,
        context_payload: &serde_json::Value,
    ) -> Result<AwardOutcome, CoreError> {
        let now = (self.now_provider)();
        let context_digest = digest_context(&context_payload.to_string());
        let previous_hash = self
            .integrity_log
            .head_hash(user_id)?
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let (nonce, integrity_hash) = mine_nonce(
            &previous_hash,
            now,
            action,
            points,
            &context_digest,
            self.pow_difficulty,
        );

        let transaction = PointTransaction {
            user_id: user_id.to_string(),
            action_type: action,
            points_awarded: points,
            occurred_at: now,
            context_digest,
            nonce,
            integrity_hash,
            previous_hash,
            flagged: false,
        };
        self.integrity_log.append(&transaction)?;

        let mut profile = self
            .profiles
            .get(user_id)?
            .unwrap_or_else(|| UserProfile::new(user_id, now));
        profile.apply_delta(points, now);
        self.profiles.upsert(&profile)?;

        self.pending.enqueue(&PendingWrite {
            transaction_hash: transaction.integrity_hash.clone(),
            user_id: user_id.to_string(),
            action_type: action,
            points_delta: points,
            occurred_at: now,
        })?;

        tracing::debug!(
            user_id = %user_id,
            action = %action,
            points,
            total = profile.total_score,
            "recorded point transaction"
        );

        Ok(AwardOutcome {
            points_awarded: points,
            new_total: profile.total_score,
            transaction,
        })
    }

    fn user_lock(&self, user_id: &str) -> Result<Arc<Mutex<()>>, CoreError> {
        let mut locks = self.user_locks.lock().map_err(|error| {
            CoreError::PersistenceUnavailable(format!("point pipeline lock poisoned: {error}"))
        })?;
        Ok(Arc::clone(
            locks.entry(user_id.to_string()).or_default(),
        ))
    }
}
