use crate::domain::models::{Session, UserProfile};
use crate::infrastructure::credential_store::CredentialStore;
use crate::infrastructure::error::CoreError;
use crate::infrastructure::pending_queue::PendingWrite;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const DEFAULT_REMOTE_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
    pub profile: UserProfile,
    pub active_session: Option<Session>,
    pub applied_transaction_hashes: Vec<String>,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    AlreadyApplied,
    StaleVersion,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_snapshot(&self, user_id: &str) -> Result<RemoteSnapshot, CoreError>;
    async fn apply_transaction(&self, write: &PendingWrite) -> Result<ApplyOutcome, CoreError>;
    async fn push_profile(&self, profile: &UserProfile) -> Result<ApplyOutcome, CoreError>;
    async fn push_session(&self, session: &Session) -> Result<ApplyOutcome, CoreError>;
    async fn server_time(&self) -> Result<DateTime<Utc>, CoreError>;
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    profile: UserProfile,
    active_session: Option<Session>,
    #[serde(default)]
    applied_transaction_hashes: Vec<String>,
    server_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct TransactionRequest<'a> {
    transaction_hash: &'a str,
    user_id: &'a str,
    action_type: &'a str,
    points_delta: i64,
    occurred_at: String,
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    outcome: String,
}

#[derive(Debug, Deserialize)]
struct ServerTimeResponse {
    server_time: DateTime<Utc>,
}

impl ApplyResponse {
    fn parse(self) -> Result<ApplyOutcome, CoreError> {
        match self.outcome.as_str() {
            "applied" => Ok(ApplyOutcome::Applied),
            "already_applied" => Ok(ApplyOutcome::AlreadyApplied),
            "stale_version" => Ok(ApplyOutcome::StaleVersion),
            other => Err(CoreError::Remote(format!(
                "unknown apply outcome '{other}' from sync api"
            ))),
        }
    }
}

pub struct ReqwestRemoteStore {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl ReqwestRemoteStore {
    pub fn new(
        base_url: impl Into<String>,
        timeout_seconds: u64,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds.max(1)))
            .build()
            .map_err(|error| CoreError::Remote(format!("failed to build http client: {error}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            credentials,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, CoreError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|error| CoreError::Remote(format!("invalid sync api base url: {error}")))?;
        {
            let mut parts = url
                .path_segments_mut()
                .map_err(|_| CoreError::Remote("sync api base URL cannot be a base".to_string()))?;
            for segment in segments {
                parts.push(segment);
            }
        }
        Ok(url)
    }

    fn bearer_token(&self) -> Result<String, CoreError> {
        let credential = self
            .credentials
            .load()?
            .ok_or_else(|| CoreError::Credential("no sync credential stored".to_string()))?;
        Ok(credential.token)
    }

    fn http_error(status: reqwest::StatusCode, body: &str) -> CoreError {
        let message = if body.trim().is_empty() {
            format!("sync api error: http {}", status.as_u16())
        } else {
            format!("sync api error: http {}; body={body}", status.as_u16())
        };
        CoreError::Remote(message)
    }

    async fn read_success_body(
        response: reqwest::Response,
        context: &str,
    ) -> Result<String, CoreError> {
        let status = response.status();
        let body = response.text().await.map_err(|error| {
            CoreError::Remote(format!("failed reading {context} response: {error}"))
        })?;
        if !status.is_success() {
            return Err(Self::http_error(status, &body));
        }
        Ok(body)
    }

    fn parse_body<T: serde::de::DeserializeOwned>(
        body: &str,
        context: &str,
    ) -> Result<T, CoreError> {
        serde_json::from_str(body).map_err(|error| {
            CoreError::Remote(format!("invalid {context} payload: {error}; body={body}"))
        })
    }
}

#[async_trait]
impl RemoteStore for ReqwestRemoteStore {
    async fn fetch_snapshot(&self, user_id: &str) -> Result<RemoteSnapshot, CoreError> {
        let url = self.endpoint(&["users", user_id, "snapshot"])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer_token()?)
            .send()
            .await
            .map_err(|error| {
                CoreError::Remote(format!("network error while fetching snapshot: {error}"))
            })?;

        let body = Self::read_success_body(response, "snapshot").await?;
        let parsed: SnapshotResponse = Self::parse_body(&body, "snapshot")?;
        Ok(RemoteSnapshot {
            profile: parsed.profile,
            active_session: parsed.active_session,
            applied_transaction_hashes: parsed.applied_transaction_hashes,
            server_time: parsed.server_time,
        })
    }

    async fn apply_transaction(&self, write: &PendingWrite) -> Result<ApplyOutcome, CoreError> {
        let url = self.endpoint(&["transactions"])?;
        let request = TransactionRequest {
            transaction_hash: &write.transaction_hash,
            user_id: &write.user_id,
            action_type: write.action_type.as_str(),
            points_delta: write.points_delta,
            occurred_at: write.occurred_at.to_rfc3339(),
        };
        let response = self
            .client
            .post(url)
            .bearer_auth(self.bearer_token()?)
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                CoreError::Remote(format!("network error while applying transaction: {error}"))
            })?;

        let body = Self::read_success_body(response, "transaction").await?;
        Self::parse_body::<ApplyResponse>(&body, "transaction")?.parse()
    }

    async fn push_profile(&self, profile: &UserProfile) -> Result<ApplyOutcome, CoreError> {
        let url = self.endpoint(&["users", &profile.user_id, "profile"])?;
        let response = self
            .client
            .put(url)
            .bearer_auth(self.bearer_token()?)
            .json(profile)
            .send()
            .await
            .map_err(|error| {
                CoreError::Remote(format!("network error while pushing profile: {error}"))
            })?;

        let body = Self::read_success_body(response, "profile push").await?;
        Self::parse_body::<ApplyResponse>(&body, "profile push")?.parse()
    }

    async fn push_session(&self, session: &Session) -> Result<ApplyOutcome, CoreError> {
        let url = self.endpoint(&["sessions", &session.id])?;
        let response = self
            .client
            .put(url)
            .bearer_auth(self.bearer_token()?)
            .json(session)
            .send()
            .await
            .map_err(|error| {
                CoreError::Remote(format!("network error while pushing session: {error}"))
            })?;

        let body = Self::read_success_body(response, "session push").await?;
        Self::parse_body::<ApplyResponse>(&body, "session push")?.parse()
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, CoreError> {
        let url = self.endpoint(&["time"])?;
        let response = self.client.get(url).send().await.map_err(|error| {
            CoreError::Remote(format!("network error while fetching server time: {error}"))
        })?;

        let body = Self::read_success_body(response, "server time").await?;
        let parsed: ServerTimeResponse = Self::parse_body(&body, "server time")?;
        Ok(parsed.server_time)
    }
}
