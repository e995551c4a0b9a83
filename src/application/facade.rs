use crate::application::point_policy::PointContext;
use crate::application::points::PointEngine;
use crate::application::reconciliation::{ConnectivityState, ReconciliationEngine, RetryPolicy, SyncReport};
use crate::application::session_service::{
    CompletionOutcome, EmergencyAttemptOutcome, EmergencyDisableOutcome, SessionService,
    StartSessionOutcome, TickOutcome,
};
use crate::domain::models::{normalize_domain, ActionType, BlockedSite, Session, UserProfile};
use crate::infrastructure::blocking::BlockingEnforcer;
use crate::infrastructure::clock::{system_now_provider, NowProvider};
use crate::infrastructure::config::CoreConfig;
use crate::infrastructure::error::CoreError;
use crate::infrastructure::events::EventSink;
use crate::infrastructure::integrity_log::{
    verify_chain, ChainVerification, IntegrityLogRepository, DEFAULT_POW_DIFFICULTY,
};
use crate::infrastructure::pending_queue::PendingWriteQueue;
use crate::infrastructure::profile_repository::ProfileRepository;
use crate::infrastructure::remote_store::RemoteStore;
use crate::infrastructure::session_repository::SessionRepository;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct CoreOptions {
    pub redirect_target: String,
    pub pow_difficulty: usize,
    pub retry_policy: RetryPolicy,
    pub now_provider: NowProvider,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            redirect_target: "blocked.html".to_string(),
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
            retry_policy: RetryPolicy::default(),
            now_provider: system_now_provider(),
        }
    }
}

impl CoreOptions {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            redirect_target: config.blocking.redirect_target.clone(),
            pow_difficulty: config.integrity.pow_difficulty,
            retry_policy: RetryPolicy {
                max_attempts: config.sync.max_attempts,
                base_delay_ms: config.sync.base_delay_ms,
            },
            now_provider: system_now_provider(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }
}

// The closed message surface the extension talks through; one variant per
// verb, validated before any state is touched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreRequest {
    StartSession {
        user_id: String,
        sites: Vec<String>,
        duration_days: u32,
    },
    Tick {
        user_id: String,
    },
    CompleteSession {
        user_id: String,
    },
    AttemptEmergencyDisable {
        user_id: String,
    },
    ConfirmEmergencyDisable {
        user_id: String,
        reason: String,
    },
    ResistEmergency {
        user_id: String,
    },
    ActivatePanicMode {
        user_id: String,
    },
    AddSite {
        user_id: String,
        domain: String,
    },
    RemoveSite {
        user_id: String,
        domain: String,
    },
    GetStatus {
        user_id: String,
    },
    VerifyIntegrity {
        user_id: String,
    },
    SyncNow {
        user_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub profile: Option<UserProfile>,
    pub active_session: Option<Session>,
    pub blocked_sites: Vec<String>,
    pub connectivity: ConnectivityState,
    pub pending_writes: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreResponse {
    SessionStarted(StartSessionOutcome),
    TickProcessed(TickOutcome),
    SessionCompleted(CompletionOutcome),
    EmergencyAttempted(EmergencyAttemptOutcome),
    EmergencyDisabled(EmergencyDisableOutcome),
    EmergencyResisted {
        points_awarded: i64,
        total_score: i64,
    },
    PanicModeActivated {
        points_awarded: i64,
        total_score: i64,
    },
    SiteAdded {
        domain: String,
        points_awarded: i64,
        total_score: i64,
        snapshot_unchanged: bool,
    },
    SiteRemoved {
        domain: String,
        removed: bool,
        snapshot_unchanged: bool,
    },
    Status(StatusReport),
    IntegrityVerified {
        entries: usize,
    },
    SyncCompleted(SyncReport),
}

pub struct SyncFacade<S, L, P, Q, R>
where
    S: SessionRepository,
    L: IntegrityLogRepository,
    P: ProfileRepository,
    Q: PendingWriteQueue,
    R: RemoteStore,
{
    sessions: SessionService<S, L, P, Q>,
    points: Arc<PointEngine<L, P, Q>>,
    reconciliation: ReconciliationEngine<R, P, S, Q>,
    session_repository: Arc<S>,
    integrity_log: Arc<L>,
    profiles: Arc<P>,
    pending: Arc<Q>,
    now_provider: NowProvider,
    pow_difficulty: usize,
    // all verbs for one user run in submission order; different users in parallel
    user_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S, L, P, Q, R> SyncFacade<S, L, P, Q, R>
where
    S: SessionRepository,
    L: IntegrityLogRepository,
    P: ProfileRepository,
    Q: PendingWriteQueue,
    R: RemoteStore,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_repository: Arc<S>,
        integrity_log: Arc<L>,
        profiles: Arc<P>,
        pending: Arc<Q>,
        remote: Arc<R>,
        blocking: Arc<dyn BlockingEnforcer>,
        events: Arc<dyn EventSink>,
        options: CoreOptions,
    ) -> Self {
        let points = Arc::new(
            PointEngine::new(
                Arc::clone(&integrity_log),
                Arc::clone(&profiles),
                Arc::clone(&pending),
                Arc::clone(&events),
            )
            .with_now_provider(Arc::clone(&options.now_provider))
            .with_pow_difficulty(options.pow_difficulty),
        );
        let sessions = SessionService::new(
            Arc::clone(&session_repository),
            Arc::clone(&points),
            Arc::clone(&profiles),
            blocking,
            Arc::clone(&events),
            options.redirect_target.clone(),
        )
        .with_now_provider(Arc::clone(&options.now_provider));
        let reconciliation = ReconciliationEngine::new(
            remote,
            Arc::clone(&profiles),
            Arc::clone(&session_repository),
            Arc::clone(&pending),
            events,
        )
        .with_retry_policy(options.retry_policy.clone())
        .with_now_provider(Arc::clone(&options.now_provider));

        Self {
            sessions,
            points,
            reconciliation,
            session_repository,
            integrity_log,
            profiles,
            pending,
            now_provider: options.now_provider,
            pow_difficulty: options.pow_difficulty,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, request: CoreRequest) -> Result<CoreResponse, CoreError> {
        match request {
            CoreRequest::StartSession {
                user_id,
                sites,
                duration_days,
            } => self
                .start_session(&user_id, &sites, duration_days)
                .await
                .map(CoreResponse::SessionStarted),
            CoreRequest::Tick { user_id } => {
                self.tick(&user_id).await.map(CoreResponse::TickProcessed)
            }
            CoreRequest::CompleteSession { user_id } => self
                .complete_session(&user_id)
                .await
                .map(CoreResponse::SessionCompleted),
            CoreRequest::AttemptEmergencyDisable { user_id } => self
                .attempt_emergency_disable(&user_id)
                .await
                .map(CoreResponse::EmergencyAttempted),
            CoreRequest::ConfirmEmergencyDisable { user_id, reason } => self
                .confirm_emergency_disable(&user_id, &reason)
                .await
                .map(CoreResponse::EmergencyDisabled),
            CoreRequest::ResistEmergency { user_id } => {
                let (points_awarded, total_score) = self.resist_emergency(&user_id).await?;
                Ok(CoreResponse::EmergencyResisted {
                    points_awarded,
                    total_score,
                })
            }
            CoreRequest::ActivatePanicMode { user_id } => {
                let (points_awarded, total_score) = self.activate_panic_mode(&user_id).await?;
                Ok(CoreResponse::PanicModeActivated {
                    points_awarded,
                    total_score,
                })
            }
            CoreRequest::AddSite { user_id, domain } => self.add_site(&user_id, &domain).await,
            CoreRequest::RemoveSite { user_id, domain } => {
                self.remove_site(&user_id, &domain).await
            }
            CoreRequest::GetStatus { user_id } => {
                self.status(&user_id).await.map(CoreResponse::Status)
            }
            CoreRequest::VerifyIntegrity { user_id } => {
                let entries = self.verify_integrity(&user_id).await?;
                Ok(CoreResponse::IntegrityVerified { entries })
            }
            CoreRequest::SyncNow { user_id } => {
                self.sync_now(&user_id).await.map(CoreResponse::SyncCompleted)
            }
        }
    }

    pub async fn initialize(&self, user_id: &str) -> Result<ConnectivityState, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.reconciliation.initialize(user_id).await
    }

    pub async fn start_session(
        &self,
        user_id: &str,
        sites: &[String],
        duration_days: u32,
    ) -> Result<StartSessionOutcome, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.sessions.start_session(user_id, sites, duration_days)
    }

    pub async fn tick(&self, user_id: &str) -> Result<TickOutcome, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.sessions.tick(user_id)
    }

    pub async fn complete_session(&self, user_id: &str) -> Result<CompletionOutcome, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.sessions.complete_naturally(user_id)
    }

    pub async fn attempt_emergency_disable(
        &self,
        user_id: &str,
    ) -> Result<EmergencyAttemptOutcome, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.sessions.attempt_emergency_disable(user_id)
    }

    pub async fn confirm_emergency_disable(
        &self,
        user_id: &str,
        reason: &str,
    ) -> Result<EmergencyDisableOutcome, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.sessions.confirm_emergency_disable(user_id, reason)
    }

    pub async fn resist_emergency(&self, user_id: &str) -> Result<(i64, i64), CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.sessions.resist_emergency(user_id)
    }

    pub async fn activate_panic_mode(&self, user_id: &str) -> Result<(i64, i64), CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        let award = self.points.award(
            user_id,
            ActionType::PanicMode,
            PointContext::default(),
            &serde_json::json!({}),
        )?;
        Ok((award.points_awarded, award.new_total))
    }

    pub async fn add_site(&self, user_id: &str, raw_domain: &str) -> Result<CoreResponse, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;

        let domain = normalize_domain(raw_domain).ok_or_else(|| {
            CoreError::Validation(format!("'{raw_domain}' is not a valid domain"))
        })?;
        let existing = self.profiles.list_sites(user_id)?;
        if existing.iter().any(|site| site.domain == domain) {
            return Err(CoreError::Validation(format!(
                "domain {domain} is already blocked"
            )));
        }

        let award = self.points.award(
            user_id,
            ActionType::AddSite,
            PointContext::default(),
            &serde_json::json!({ "domain": domain }),
        )?;
        self.profiles.upsert_site(&BlockedSite {
            user_id: user_id.to_string(),
            domain: domain.clone(),
            added_at: (self.now_provider)(),
            removed: false,
        })?;

        // an in-flight session keeps its snapshot; only the live list grows
        let snapshot_unchanged = self.session_repository.active_for_owner(user_id)?.is_some();

        Ok(CoreResponse::SiteAdded {
            domain,
            points_awarded: award.points_awarded,
            total_score: award.new_total,
            snapshot_unchanged,
        })
    }

    pub async fn remove_site(
        &self,
        user_id: &str,
        raw_domain: &str,
    ) -> Result<CoreResponse, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;

        let domain = normalize_domain(raw_domain).ok_or_else(|| {
            CoreError::Validation(format!("'{raw_domain}' is not a valid domain"))
        })?;
        let removed = self.profiles.remove_site(user_id, &domain)?;
        let snapshot_unchanged = self.session_repository.active_for_owner(user_id)?.is_some();

        Ok(CoreResponse::SiteRemoved {
            domain,
            removed,
            snapshot_unchanged,
        })
    }

    pub async fn status(&self, user_id: &str) -> Result<StatusReport, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        Ok(StatusReport {
            profile: self.profiles.get(user_id)?,
            active_session: self.session_repository.active_for_owner(user_id)?,
            blocked_sites: self
                .profiles
                .list_sites(user_id)?
                .into_iter()
                .map(|site| site.domain)
                .collect(),
            connectivity: self.reconciliation.connectivity(),
            pending_writes: self.pending.pending_for_user(user_id)?.len(),
        })
    }

    // Flags the first tampered entry so it no longer feeds the multiplier
    // counts, and surfaces the violation for the administrative layer.
    pub async fn verify_integrity(&self, user_id: &str) -> Result<usize, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;

        let entries = self.integrity_log.list_for_user(user_id)?;
        match verify_chain(&entries, self.pow_difficulty) {
            ChainVerification::Valid => Ok(entries.len()),
            ChainVerification::TamperedAt(index) => {
                if let Some(entry) = entries.get(index) {
                    self.integrity_log
                        .mark_flagged(user_id, &entry.integrity_hash)?;
                }
                tracing::error!(
                    user_id = %user_id,
                    index,
                    "integrity chain verification failed"
                );
                Err(CoreError::IntegrityViolation {
                    user_id: user_id.to_string(),
                    index,
                })
            }
        }
    }

    pub async fn sync_now(&self, user_id: &str) -> Result<SyncReport, CoreError> {
        let _guard = self.user_lock(user_id)?.lock_owned().await;
        self.reconciliation.sync_now(user_id).await
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.reconciliation.connectivity()
    }

    fn user_lock(&self, user_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, CoreError> {
        let mut locks = self.user_locks.lock().map_err(|error| {
            CoreError::PersistenceUnavailable(format!("facade lock poisoned: {error}"))
        })?;
        Ok(Arc::clone(locks.entry(user_id.to_string()).or_default()))
    }
}
