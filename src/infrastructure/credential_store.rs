use crate::infrastructure::error::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCredential {
    pub user_id: String,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SyncCredential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        if self.token.trim().is_empty() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }
}

pub trait CredentialStore: Send + Sync {
    fn save(&self, credential: &SyncCredential) -> Result<(), CoreError>;
    fn load(&self) -> Result<Option<SyncCredential>, CoreError>;
    fn delete(&self) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, CoreError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| CoreError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new("blockpact.sync", "default")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save(&self, credential: &SyncCredential) -> Result<(), CoreError> {
        let payload = serde_json::to_string(credential)
            .map_err(|error| CoreError::Credential(error.to_string()))?;
        self.entry()?
            .set_password(&payload)
            .map_err(|error| CoreError::Credential(error.to_string()))
    }

    fn load(&self) -> Result<Option<SyncCredential>, CoreError> {
        let payload = match self.entry()?.get_password() {
            Ok(value) => value,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(error) => return Err(CoreError::Credential(error.to_string())),
        };

        let credential = serde_json::from_str::<SyncCredential>(&payload)
            .map_err(|error| CoreError::Credential(error.to_string()))?;
        Ok(Some(credential))
    }

    fn delete(&self) -> Result<(), CoreError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(CoreError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    credential: Mutex<Option<SyncCredential>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn save(&self, credential: &SyncCredential) -> Result<(), CoreError> {
        let mut guard = self
            .credential
            .lock()
            .map_err(|error| CoreError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = Some(credential.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<SyncCredential>, CoreError> {
        let guard = self
            .credential
            .lock()
            .map_err(|error| CoreError::Credential(format!("in-memory lock poisoned: {error}")))?;
        Ok(guard.clone())
    }

    fn delete(&self) -> Result<(), CoreError> {
        let mut guard = self
            .credential
            .lock()
            .map_err(|error| CoreError::Credential(format!("in-memory lock poisoned: {error}")))?;
        *guard = None;
        Ok(())
    }
}
