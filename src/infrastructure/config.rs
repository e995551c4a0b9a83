use crate::infrastructure::error::CoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CORE_JSON: &str = "core.json";
const SUPPORTED_SCHEMA: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityConfig {
    pub pow_difficulty: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub max_attempts: u8,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockingConfig {
    pub redirect_target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    pub schema: u64,
    pub remote: RemoteConfig,
    pub integrity: IntegrityConfig,
    pub sync: SyncConfig,
    pub blocking: BlockingConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            schema: SUPPORTED_SCHEMA,
            remote: RemoteConfig {
                base_url: "https://sync.blockpact.app/api/v1".to_string(),
                timeout_seconds: 10,
            },
            integrity: IntegrityConfig { pow_difficulty: 2 },
            sync: SyncConfig {
                max_attempts: 3,
                base_delay_ms: 200,
            },
            blocking: BlockingConfig {
                redirect_target: "blocked.html".to_string(),
            },
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.schema != SUPPORTED_SCHEMA {
            return Err(CoreError::InvalidConfig(format!(
                "unsupported schema {} in {CORE_JSON}",
                self.schema
            )));
        }
        if self.remote.base_url.trim().is_empty() {
            return Err(CoreError::InvalidConfig(
                "remote.baseUrl must not be empty".to_string(),
            ));
        }
        if self.remote.timeout_seconds == 0 {
            return Err(CoreError::InvalidConfig(
                "remote.timeoutSeconds must be > 0".to_string(),
            ));
        }
        if self.integrity.pow_difficulty > 8 {
            return Err(CoreError::InvalidConfig(
                "integrity.powDifficulty must be <= 8".to_string(),
            ));
        }
        if self.sync.max_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "sync.maxAttempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn ensure_default_config(config_dir: &Path) -> Result<(), CoreError> {
    let path = config_dir.join(CORE_JSON);
    if !path.exists() {
        let formatted = serde_json::to_string_pretty(&CoreConfig::default())?;
        fs::write(path, format!("{formatted}\n"))?;
    }
    Ok(())
}

pub fn load_config(config_dir: &Path) -> Result<CoreConfig, CoreError> {
    let path = config_dir.join(CORE_JSON);
    let raw = fs::read_to_string(&path)?;
    let parsed: CoreConfig = serde_json::from_str(&raw).map_err(|error| {
        CoreError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })?;
    parsed.validate()?;
    Ok(parsed)
}
