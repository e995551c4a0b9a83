use crate::domain::models::SessionStatus;
use crate::infrastructure::clock::{ensure_within_drift, system_now_provider, NowProvider};
use crate::infrastructure::error::CoreError;
use crate::infrastructure::events::{CoreEvent, EventSink};
use crate::infrastructure::pending_queue::{PendingWrite, PendingWriteQueue};
use crate::infrastructure::profile_repository::ProfileRepository;
use crate::infrastructure::remote_store::{ApplyOutcome, RemoteSnapshot, RemoteStore};
use crate::infrastructure::session_repository::SessionRepository;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration as TokioDuration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub connectivity: ConnectivityState,
    pub applied: usize,
    pub deduplicated: usize,
    pub remaining: usize,
    pub remote_total: Option<i64>,
}

pub struct ReconciliationEngine<R, P, S, Q>
where
    R: RemoteStore,
    P: ProfileRepository,
    S: SessionRepository,
    Q: PendingWriteQueue,
{
    remote: Arc<R>,
    profiles: Arc<P>,
    sessions: Arc<S>,
    pending: Arc<Q>,
    events: Arc<dyn EventSink>,
    retry_policy: RetryPolicy,
    now_provider: NowProvider,
    // None until the first remote round-trip settles it
    state: Mutex<Option<ConnectivityState>>,
}

impl<R, P, S, Q> ReconciliationEngine<R, P, S, Q>
where
    R: RemoteStore,
    P: ProfileRepository,
    S: SessionRepository,
    Q: PendingWriteQueue,
{
    pub fn new(
        remote: Arc<R>,
        profiles: Arc<P>,
        sessions: Arc<S>,
        pending: Arc<Q>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            remote,
            profiles,
            sessions,
            pending,
            events,
            retry_policy: RetryPolicy::default(),
            now_provider: system_now_provider(),
            state: Mutex::new(None),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn connectivity(&self) -> ConnectivityState {
        let guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.unwrap_or(ConnectivityState::Offline)
    }

    fn set_connectivity(&self, next: ConnectivityState, user_id: &str) {
        let previous = {
            let mut guard = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.replace(next)
        };
        if previous != Some(next) && next == ConnectivityState::Offline {
            tracing::warn!(user_id = %user_id, "remote store unreachable, continuing offline");
            self.events.emit(CoreEvent::OfflineModeEntered {
                user_id: user_id.to_string(),
            });
        }
    }

    // Read path: remote snapshot wins, unacknowledged local deltas are
    // replayed on top; any remote failure falls back to the local cache.
    pub async fn initialize(&self, user_id: &str) -> Result<ConnectivityState, CoreError> {
        match self.fetch_snapshot_with_retry(user_id).await {
            Ok(snapshot) => {
                ensure_within_drift((self.now_provider)(), snapshot.server_time)?;
                self.adopt_snapshot(user_id, &snapshot)?;
                self.set_connectivity(ConnectivityState::Online, user_id);
                self.pending
                    .save_sync_state(user_id, (self.now_provider)())?;
                Ok(ConnectivityState::Online)
            }
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "remote snapshot fetch failed");
                self.set_connectivity(ConnectivityState::Offline, user_id);
                Ok(ConnectivityState::Offline)
            }
        }
    }

    // Write path: drain queued deltas in submission order, then push the
    // merged aggregates. Stops at the first remote failure and keeps the
    // remainder queued for the next pass.
    pub async fn sync_now(&self, user_id: &str) -> Result<SyncReport, CoreError> {
        let server_time = match self.server_time_with_retry().await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "connectivity check failed");
                self.set_connectivity(ConnectivityState::Offline, user_id);
                return Ok(SyncReport {
                    connectivity: ConnectivityState::Offline,
                    applied: 0,
                    deduplicated: 0,
                    remaining: self.pending.pending_for_user(user_id)?.len(),
                    remote_total: None,
                });
            }
        };
        ensure_within_drift((self.now_provider)(), server_time)?;

        let (applied, deduplicated) = match self.drain_pending(user_id).await {
            Ok(counts) => counts,
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "pending drain interrupted");
                self.set_connectivity(ConnectivityState::Offline, user_id);
                return Ok(SyncReport {
                    connectivity: ConnectivityState::Offline,
                    applied: 0,
                    deduplicated: 0,
                    remaining: self.pending.pending_for_user(user_id)?.len(),
                    remote_total: None,
                });
            }
        };

        let snapshot = match self.fetch_snapshot_with_retry(user_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(user_id = %user_id, error = %error, "post-drain snapshot fetch failed");
                self.set_connectivity(ConnectivityState::Offline, user_id);
                return Ok(SyncReport {
                    connectivity: ConnectivityState::Offline,
                    applied,
                    deduplicated,
                    remaining: self.pending.pending_for_user(user_id)?.len(),
                    remote_total: None,
                });
            }
        };
        self.adopt_snapshot(user_id, &snapshot)?;
        self.push_local_state(user_id).await?;

        self.set_connectivity(ConnectivityState::Online, user_id);
        self.pending
            .save_sync_state(user_id, (self.now_provider)())?;

        Ok(SyncReport {
            connectivity: ConnectivityState::Online,
            applied,
            deduplicated,
            remaining: self.pending.pending_for_user(user_id)?.len(),
            remote_total: Some(snapshot.profile.total_score),
        })
    }

    async fn drain_pending(&self, user_id: &str) -> Result<(usize, usize), CoreError> {
        let pending = self.pending.pending_for_user(user_id)?;
        let mut applied = 0;
        let mut deduplicated = 0;

        for write in pending {
            match self.apply_transaction_with_retry(&write).await? {
                ApplyOutcome::Applied => {
                    applied += 1;
                    self.pending.remove(&write.transaction_hash)?;
                }
                // the remote has seen this hash before; exactly-once preserved
                ApplyOutcome::AlreadyApplied | ApplyOutcome::StaleVersion => {
                    deduplicated += 1;
                    self.pending.remove(&write.transaction_hash)?;
                }
            }
        }
        Ok((applied, deduplicated))
    }

    fn adopt_snapshot(&self, user_id: &str, snapshot: &RemoteSnapshot) -> Result<(), CoreError> {
        // drop queued deltas the server already holds
        let pending = self.pending.pending_for_user(user_id)?;
        let mut unacknowledged = Vec::new();
        for write in pending {
            if snapshot
                .applied_transaction_hashes
                .contains(&write.transaction_hash)
            {
                self.pending.remove(&write.transaction_hash)?;
            } else {
                unacknowledged.push(write);
            }
        }

        // remote total wins; unacknowledged deltas replay additively
        let mut merged = snapshot.profile.clone();
        for write in &unacknowledged {
            merged.total_score = (merged.total_score + write.points_delta).max(0);
        }
        if !unacknowledged.is_empty() {
            merged.version += 1;
        }
        self.profiles.upsert(&merged)?;

        if let Some(remote_session) = &snapshot.active_session {
            let keep_local = self
                .sessions
                .get(&remote_session.id)?
                .map(|local| local.version > remote_session.version)
                .unwrap_or(false);
            if keep_local {
                tracing::debug!(
                    session_id = %remote_session.id,
                    "local session is newer than remote copy, keeping local"
                );
            } else if self.sessions.get(&remote_session.id)?.is_some() {
                self.sessions.update(remote_session)?;
            } else {
                self.sessions.insert(remote_session)?;
            }
        }
        Ok(())
    }

    // Aggregates are version-checked server-side; a stale push is discarded
    // rather than overwriting newer remote state.
    async fn push_local_state(&self, user_id: &str) -> Result<(), CoreError> {
        if let Some(profile) = self.profiles.get(user_id)? {
            match self.remote.push_profile(&profile).await {
                Ok(ApplyOutcome::StaleVersion) => {
                    tracing::debug!(user_id = %user_id, "profile push discarded as stale");
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(user_id = %user_id, error = %error, "profile push failed");
                }
            }
        }

        for session in self.sessions.list_for_owner(user_id)? {
            if session.status == SessionStatus::Active || session.version > 0 {
                match self.remote.push_session(&session).await {
                    Ok(ApplyOutcome::StaleVersion) => {
                        tracing::debug!(session_id = %session.id, "session push discarded as stale");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        tracing::warn!(session_id = %session.id, error = %error, "session push failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_snapshot_with_retry(&self, user_id: &str) -> Result<RemoteSnapshot, CoreError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.remote.fetch_snapshot(user_id).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) if self.should_retry(&error) && attempt + 1 < max_attempts => {
                    self.backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn apply_transaction_with_retry(
        &self,
        write: &PendingWrite,
    ) -> Result<ApplyOutcome, CoreError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.remote.apply_transaction(write).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) if self.should_retry(&error) && attempt + 1 < max_attempts => {
                    self.backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn server_time_with_retry(&self) -> Result<chrono::DateTime<chrono::Utc>, CoreError> {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt: u8 = 0;

        loop {
            match self.remote.server_time().await {
                Ok(value) => return Ok(value),
                Err(error) if self.should_retry(&error) && attempt + 1 < max_attempts => {
                    self.backoff(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn backoff(&self, attempt: u8) {
        let delay = self
            .retry_policy
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt as u32));
        sleep(TokioDuration::from_millis(delay)).await;
    }

    fn should_retry(&self, error: &CoreError) -> bool {
        match error {
            CoreError::Remote(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("network error")
                    || message.contains("timeout")
                    || message.contains("timed out")
                    || message.contains("temporarily unavailable")
                    || message.contains("connection reset")
            }
            CoreError::PersistenceUnavailable(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ActionType, Session, UserProfile};
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::events::InMemoryEventSink;
    use crate::infrastructure::pending_queue::{InMemoryPendingWriteQueue, PendingWrite};
    use crate::infrastructure::profile_repository::InMemoryProfileRepository;
    use crate::infrastructure::session_repository::InMemorySessionRepository;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    #[derive(Debug, Clone)]
    enum FakeSnapshotResponse {
        Success(RemoteSnapshot),
        NetworkError,
    }

    #[derive(Default)]
    struct FakeRemoteStore {
        snapshot_responses: Mutex<VecDeque<FakeSnapshotResponse>>,
        snapshot_calls: AtomicUsize,
        apply_failures: Mutex<VecDeque<()>>,
        applied: Mutex<Vec<PendingWrite>>,
        applied_hashes: Mutex<HashSet<String>>,
        total: Mutex<i64>,
        server_time: Mutex<Option<DateTime<Utc>>>,
        time_unreachable: Mutex<bool>,
    }

    impl FakeRemoteStore {
        fn with_server_time(time: DateTime<Utc>) -> Self {
            let store = Self::default();
            *store.server_time.lock().expect("server time lock") = Some(time);
            store
        }

        fn push_snapshot(&self, response: FakeSnapshotResponse) {
            self.snapshot_responses
                .lock()
                .expect("snapshot lock")
                .push_back(response);
        }

        fn fail_next_apply(&self) {
            self.apply_failures.lock().expect("apply lock").push_back(());
        }

        fn set_unreachable(&self, unreachable: bool) {
            *self.time_unreachable.lock().expect("time lock") = unreachable;
        }

        fn applied_deltas(&self) -> Vec<i64> {
            self.applied
                .lock()
                .expect("applied lock")
                .iter()
                .map(|write| write.points_delta)
                .collect()
        }

        fn current_snapshot(&self, user_id: &str) -> RemoteSnapshot {
            let server_time = self
                .server_time
                .lock()
                .expect("server time lock")
                .unwrap_or_else(Utc::now);
            let mut profile = UserProfile::new(user_id, server_time);
            profile.total_score = *self.total.lock().expect("total lock");
            RemoteSnapshot {
                profile,
                active_session: None,
                applied_transaction_hashes: self
                    .applied_hashes
                    .lock()
                    .expect("hashes lock")
                    .iter()
                    .cloned()
                    .collect(),
                server_time,
            }
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemoteStore {
        async fn fetch_snapshot(&self, user_id: &str) -> Result<RemoteSnapshot, CoreError> {
            self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self
                .snapshot_responses
                .lock()
                .expect("snapshot lock")
                .pop_front();
            match scripted {
                Some(FakeSnapshotResponse::Success(snapshot)) => Ok(snapshot),
                Some(FakeSnapshotResponse::NetworkError) => Err(CoreError::Remote(
                    "network error while fetching snapshot".to_string(),
                )),
                None => Ok(self.current_snapshot(user_id)),
            }
        }

        async fn apply_transaction(&self, write: &PendingWrite) -> Result<ApplyOutcome, CoreError> {
            if self
                .apply_failures
                .lock()
                .expect("apply lock")
                .pop_front()
                .is_some()
            {
                return Err(CoreError::Remote(
                    "network error while applying transaction".to_string(),
                ));
            }

            let mut hashes = self.applied_hashes.lock().expect("hashes lock");
            if !hashes.insert(write.transaction_hash.clone()) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let mut total = self.total.lock().expect("total lock");
            *total = (*total + write.points_delta).max(0);
            self.applied.lock().expect("applied lock").push(write.clone());
            Ok(ApplyOutcome::Applied)
        }

        async fn push_profile(&self, _profile: &UserProfile) -> Result<ApplyOutcome, CoreError> {
            Ok(ApplyOutcome::Applied)
        }

        async fn push_session(&self, _session: &Session) -> Result<ApplyOutcome, CoreError> {
            Ok(ApplyOutcome::Applied)
        }

        async fn server_time(&self) -> Result<DateTime<Utc>, CoreError> {
            if *self.time_unreachable.lock().expect("time lock") {
                return Err(CoreError::Remote(
                    "network error while fetching server time".to_string(),
                ));
            }
            Ok(self
                .server_time
                .lock()
                .expect("server time lock")
                .unwrap_or_else(Utc::now))
        }
    }

    struct Harness {
        engine: ReconciliationEngine<
            FakeRemoteStore,
            InMemoryProfileRepository,
            InMemorySessionRepository,
            InMemoryPendingWriteQueue,
        >,
        remote: Arc<FakeRemoteStore>,
        profiles: Arc<InMemoryProfileRepository>,
        pending: Arc<InMemoryPendingWriteQueue>,
        events: Arc<InMemoryEventSink>,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(fixed_time("2026-03-02T08:00:00Z"));
        let remote = Arc::new(FakeRemoteStore::with_server_time(clock.now()));
        let profiles = Arc::new(InMemoryProfileRepository::default());
        let sessions = Arc::new(InMemorySessionRepository::default());
        let pending = Arc::new(InMemoryPendingWriteQueue::default());
        let events = Arc::new(InMemoryEventSink::default());

        let engine = ReconciliationEngine::new(
            Arc::clone(&remote),
            Arc::clone(&profiles),
            sessions,
            Arc::clone(&pending),
            Arc::clone(&events) as Arc<dyn EventSink>,
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
        })
        .with_now_provider(clock.provider());

        Harness {
            engine,
            remote,
            profiles,
            pending,
            events,
        }
    }

    fn pending_write(hash: &str, delta: i64) -> PendingWrite {
        PendingWrite {
            transaction_hash: hash.to_string(),
            user_id: "usr-1".to_string(),
            action_type: ActionType::AddSite,
            points_delta: delta,
            occurred_at: fixed_time("2026-03-02T08:00:00Z"),
        }
    }

    #[tokio::test]
    async fn initialize_goes_offline_and_emits_event_when_remote_fails() {
        let harness = harness();
        harness.remote.push_snapshot(FakeSnapshotResponse::NetworkError);
        harness.remote.push_snapshot(FakeSnapshotResponse::NetworkError);

        let state = harness.engine.initialize("usr-1").await.expect("initialize");
        assert_eq!(state, ConnectivityState::Offline);
        assert_eq!(harness.engine.connectivity(), ConnectivityState::Offline);
        assert!(harness
            .events
            .snapshot()
            .iter()
            .any(|event| matches!(event, CoreEvent::OfflineModeEntered { .. })));
    }

    #[tokio::test]
    async fn initialize_retries_transient_failures() {
        let harness = harness();
        harness.remote.push_snapshot(FakeSnapshotResponse::NetworkError);

        let state = harness.engine.initialize("usr-1").await.expect("initialize");
        assert_eq!(state, ConnectivityState::Online);
        assert_eq!(harness.remote.snapshot_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn offline_deltas_apply_exactly_once_on_reconnect() {
        let harness = harness();
        *harness.remote.total.lock().expect("total") = 200;

        // three local awards queued while offline
        for (hash, delta) in [("h1", 10), ("h2", 8), ("h3", 25)] {
            harness.pending.enqueue(&pending_write(hash, delta)).expect("enqueue");
        }

        let report = harness.engine.sync_now("usr-1").await.expect("sync");
        assert_eq!(report.connectivity, ConnectivityState::Online);
        assert_eq!(report.applied, 3);
        assert_eq!(report.remaining, 0);
        assert_eq!(report.remote_total, Some(243));
        assert_eq!(harness.remote.applied_deltas(), vec![10, 8, 25]);

        // a second sync must not re-apply anything
        let report = harness.engine.sync_now("usr-1").await.expect("second sync");
        assert_eq!(report.applied, 0);
        assert_eq!(report.remote_total, Some(243));
    }

    #[tokio::test]
    async fn drain_stops_at_first_failure_and_keeps_remainder_queued() {
        let harness = harness();
        for (hash, delta) in [("h1", 10), ("h2", 8)] {
            harness.pending.enqueue(&pending_write(hash, delta)).expect("enqueue");
        }
        // both retry attempts for the first write fail
        harness.remote.fail_next_apply();
        harness.remote.fail_next_apply();

        let report = harness.engine.sync_now("usr-1").await.expect("sync");
        assert_eq!(report.connectivity, ConnectivityState::Offline);
        assert_eq!(report.remaining, 2);
        assert!(harness.remote.applied_deltas().is_empty());

        // next pass drains everything
        let report = harness.engine.sync_now("usr-1").await.expect("retry sync");
        assert_eq!(report.applied, 2);
        assert_eq!(report.remaining, 0);
    }

    #[tokio::test]
    async fn remote_total_wins_and_pending_deltas_replay_on_top() {
        let harness = harness();
        // local cache thinks 500; remote advanced independently to 900
        let mut local = UserProfile::new("usr-1", fixed_time("2026-03-02T08:00:00Z"));
        local.total_score = 500;
        harness.profiles.upsert(&local).expect("seed local");
        *harness.remote.total.lock().expect("total") = 900;

        harness.pending.enqueue(&pending_write("h1", 25)).expect("enqueue");

        harness.engine.initialize("usr-1").await.expect("initialize");
        let merged = harness.profiles.get("usr-1").expect("get").expect("profile");
        assert_eq!(merged.total_score, 925);
    }

    #[tokio::test]
    async fn already_acknowledged_hashes_are_not_replayed() {
        let harness = harness();
        *harness.remote.total.lock().expect("total") = 100;
        harness
            .remote
            .applied_hashes
            .lock()
            .expect("hashes")
            .insert("h1".to_string());
        harness.pending.enqueue(&pending_write("h1", 10)).expect("enqueue");

        harness.engine.initialize("usr-1").await.expect("initialize");
        let merged = harness.profiles.get("usr-1").expect("get").expect("profile");
        // h1 is already reflected in the remote total
        assert_eq!(merged.total_score, 100);
        assert!(harness.pending.pending_for_user("usr-1").expect("queue").is_empty());
    }

    #[tokio::test]
    async fn unreachable_connectivity_check_reports_offline() {
        let harness = harness();
        harness.remote.set_unreachable(true);
        harness.pending.enqueue(&pending_write("h1", 10)).expect("enqueue");

        let report = harness.engine.sync_now("usr-1").await.expect("sync");
        assert_eq!(report.connectivity, ConnectivityState::Offline);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn clock_drift_beyond_bound_surfaces_distinct_error() {
        let harness = harness();
        *harness
            .remote
            .server_time
            .lock()
            .expect("server time") = Some(fixed_time("2026-03-02T09:00:00Z"));

        let result = harness.engine.sync_now("usr-1").await;
        assert!(matches!(
            result,
            Err(CoreError::ClockDriftTooLarge { skew_seconds: -3600 })
        ));
    }
}
