pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::bootstrap::{bootstrap_workspace, BootstrapResult};
pub use application::facade::{CoreOptions, CoreRequest, CoreResponse, StatusReport, SyncFacade};
pub use application::point_policy::PointContext;
pub use application::rate_limiter::{RateLimitRule, RateLimiter};
pub use application::reconciliation::{ConnectivityState, RetryPolicy, SyncReport};
pub use application::session_service::{
    CompletionOutcome, EmergencyAttemptOutcome, EmergencyDisableOutcome, StartSessionOutcome,
    TickOutcome,
};
pub use domain::models::{
    ActionType, BlockedSite, PointTransaction, Session, SessionStatus, UserProfile, UserStatus,
};
pub use infrastructure::clock::{ManualClock, NowProvider};
pub use infrastructure::error::CoreError;
pub use infrastructure::events::{CoreEvent, EventSink};
pub use infrastructure::integrity_log::ChainVerification;
